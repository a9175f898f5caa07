//! Capture worker orchestration.
//!
//! A worker wires one packet source through the session pairer into the
//! uplink. Each stage owns its half of a bounded channel, so dropping the
//! source cascades cleanly: the pairer drains its packets, the uplink
//! flushes its records, and [`Worker::join`] returns.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::WorkerConfig;
use crate::pairer::source::PacketSource;
use crate::pairer::SessionPairer;
use crate::stats::{self, PipelineStats};
use crate::transport::RecordSender;

/// Worker orchestrates the capture side: packet source, session pairer, and
/// the record uplink.
pub struct Worker {
    cfg: WorkerConfig,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    source_task: Option<JoinHandle<Result<()>>>,
    pairer_task: Option<JoinHandle<()>>,
    sender_task: Option<JoinHandle<Result<()>>>,
}

impl Worker {
    pub fn new(cfg: WorkerConfig) -> Self {
        Self {
            cfg,
            stats: Arc::new(PipelineStats::new()),
            cancel: CancellationToken::new(),
            source_task: None,
            pairer_task: None,
            sender_task: None,
        }
    }

    /// Counters shared by every stage of this worker.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Start the pipeline with the given packet source.
    pub fn start<S>(&mut self, source: S)
    where
        S: PacketSource + 'static,
    {
        info!(
            interface = %self.cfg.interface,
            source = source.name(),
            ingest = %self.cfg.ingest_addr,
            "starting capture worker",
        );

        let (pkt_tx, pkt_rx) = mpsc::channel(self.cfg.packet_queue_size);
        let (rec_tx, rec_rx) = mpsc::channel(self.cfg.send_queue_size);

        let pairer = SessionPairer::new(
            self.cfg.interface.clone(),
            self.cfg.ntp_port,
            self.cfg.pairing_timeout,
            self.cfg.sweep_interval,
            self.cfg.max_pending,
            Arc::clone(&self.stats),
        );
        let sender = RecordSender::new(
            self.cfg.ingest_addr.clone(),
            self.cfg.reconnect_min,
            self.cfg.reconnect_max,
            self.cfg.max_frame,
            Arc::clone(&self.stats),
        );

        self.source_task = Some(tokio::spawn(source.run(pkt_tx, self.cancel.clone())));
        self.pairer_task = Some(tokio::spawn(pairer.run(pkt_rx, rec_tx, self.cancel.clone())));
        self.sender_task = Some(tokio::spawn(sender.run(rec_rx, self.cancel.clone())));

        stats::spawn_stats_reporter(
            Arc::clone(&self.stats),
            self.cfg.stats_interval,
            self.cancel.clone(),
        );
    }

    /// Wait for the pipeline to finish on its own, which happens once the
    /// packet source drains. Safe to call again after cancellation; already
    /// reaped stages are skipped.
    pub async fn join(&mut self) {
        if let Some(task) = self.source_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "packet source failed"),
                Err(err) => error!(error = %err, "packet source task failed"),
            }
        }
        if let Some(task) = self.pairer_task.take() {
            if let Err(err) = task.await {
                error!(error = %err, "session pairer task failed");
            }
        }
        if let Some(task) = self.sender_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(error = %err, "record uplink failed"),
                Err(err) => error!(error = %err, "record uplink task failed"),
            }
        }
    }

    /// Cancel the pipeline, wait for it to wind down, and log final totals.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.join().await;

        info!(totals = %self.stats.format_totals(), "capture worker stopped");
    }
}
