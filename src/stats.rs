use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counter identifies one pipeline statistic.
///
/// The first group is maintained by the capture worker, the second by the
/// ingestion server; both roles share the same tracker type so the snapshot
/// surface is uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Counter {
    // Capture worker side.
    PacketsObserved = 0,
    SessionsPaired = 1,
    ParseErrors = 2,
    PairTimeouts = 3,
    PendingEvicted = 4,
    UnmatchedResponses = 5,
    RecordsSent = 6,
    RecordsDropped = 7,
    Reconnects = 8,
    // Ingestion server side.
    RecordsReceived = 9,
    RecordsProcessed = 10,
    DecodeErrors = 11,
    BackpressureWaits = 12,
    RecordsInserted = 13,
    RecordsUpdated = 14,
    BatchesFlushed = 15,
    BatchesDropped = 16,
    StorageErrors = 17,
    EntitiesPurged = 18,
}

/// Number of counters, used for array sizing.
pub const COUNTER_COUNT: usize = 19;

impl Counter {
    /// Returns the canonical log/status label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PacketsObserved => "packets_observed",
            Self::SessionsPaired => "sessions_paired",
            Self::ParseErrors => "parse_errors",
            Self::PairTimeouts => "pair_timeouts",
            Self::PendingEvicted => "pending_evicted",
            Self::UnmatchedResponses => "unmatched_responses",
            Self::RecordsSent => "records_sent",
            Self::RecordsDropped => "records_dropped",
            Self::Reconnects => "reconnects",
            Self::RecordsReceived => "records_received",
            Self::RecordsProcessed => "records_processed",
            Self::DecodeErrors => "decode_errors",
            Self::BackpressureWaits => "backpressure_waits",
            Self::RecordsInserted => "records_inserted",
            Self::RecordsUpdated => "records_updated",
            Self::BatchesFlushed => "batches_flushed",
            Self::BatchesDropped => "batches_dropped",
            Self::StorageErrors => "storage_errors",
            Self::EntitiesPurged => "entities_purged",
        }
    }

    /// Return all counters in numeric order.
    pub fn all() -> &'static [Self] {
        &[
            Self::PacketsObserved,
            Self::SessionsPaired,
            Self::ParseErrors,
            Self::PairTimeouts,
            Self::PendingEvicted,
            Self::UnmatchedResponses,
            Self::RecordsSent,
            Self::RecordsDropped,
            Self::Reconnects,
            Self::RecordsReceived,
            Self::RecordsProcessed,
            Self::DecodeErrors,
            Self::BackpressureWaits,
            Self::RecordsInserted,
            Self::RecordsUpdated,
            Self::BatchesFlushed,
            Self::BatchesDropped,
            Self::StorageErrors,
            Self::EntitiesPurged,
        ]
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide pipeline counters, safe for concurrent increment from every
/// connection handler and the batch writer.
///
/// All counters are monotonic; `queue_depth` is a gauge reflecting the current
/// shared-queue occupancy (including producers waiting on a full queue).
/// Observability only: nothing reads these to make control decisions.
pub struct PipelineStats {
    counts: [AtomicU64; COUNTER_COUNT],
    queue_depth: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            queue_depth: AtomicU64::new(0),
        }
    }

    /// Increment a counter by one.
    pub fn record(&self, counter: Counter) {
        self.counts[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(&self, counter: Counter, n: u64) {
        self.counts[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Read a single counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter as usize].load(Ordering::Relaxed)
    }

    /// Current shared-queue depth.
    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn depth_inc(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub fn depth_dec(&self) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Returns the current value of every counter without resetting anything,
    /// so external status readers always see monotone values.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        Counter::all()
            .iter()
            .map(|&c| (c, self.get(c)))
            .collect()
    }

    /// Snapshot entries with nonzero counts, for compact log summaries.
    pub fn nonzero(&self) -> Vec<(Counter, u64)> {
        self.snapshot().into_iter().filter(|(_, n)| *n > 0).collect()
    }

    /// One-line rendering of every nonzero counter, e.g.
    /// `packets_observed=12 sessions_paired=5`.
    pub fn format_totals(&self) -> String {
        self.nonzero()
            .iter()
            .map(|(counter, n)| format!("{counter}={n}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that logs nonzero counter totals on an interval.
/// Quiet periods produce no output.
pub fn spawn_stats_reporter(
    stats: Arc<PipelineStats>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let totals = stats.format_totals();
                    if totals.is_empty() {
                        continue;
                    }
                    info!(queue_depth = stats.queue_depth(), %totals, "pipeline stats");
                }
            }
        }
    });
}
