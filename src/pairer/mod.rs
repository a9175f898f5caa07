//! Session pairing.
//!
//! Matches each NTP client request with the server response that echoes its
//! transmit timestamp, and folds the pair into one [`SessionRecord`] with
//! derived latency metrics. Unmatched requests age out of a bounded pending
//! table; an expired request means the exchange was never completed on the
//! wire and is counted, not treated as an error.

pub mod packet;
pub mod source;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pairer::packet::{PacketKind, RawPacket};
use crate::record::SessionRecord;
use crate::stats::{Counter, PipelineStats};

/// A request is keyed by who sent it and the transmit timestamp the server
/// will echo back as the response's originate timestamp. The float is stored
/// bit-exact; the echo is a verbatim copy, so bit equality is the match.
type PendingKey = (IpAddr, u16, u64);

struct PendingRequest {
    pkt: RawPacket,
    inserted: Instant,
}

/// Pairs captured request and response packets into session records.
pub struct SessionPairer {
    /// Label stamped onto packets that arrive without one.
    interface: String,
    ntp_port: u16,
    timeout: Duration,
    sweep_interval: Duration,
    max_pending: usize,
    pending: HashMap<PendingKey, PendingRequest>,
    stats: Arc<PipelineStats>,
}

impl SessionPairer {
    pub fn new(
        interface: String,
        ntp_port: u16,
        timeout: Duration,
        sweep_interval: Duration,
        max_pending: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            interface,
            ntp_port,
            timeout,
            sweep_interval,
            max_pending: max_pending.max(1),
            pending: HashMap::new(),
            stats,
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Consume packets from `rx` and push completed sessions into `out`.
    ///
    /// The outbound push never blocks: if the transport queue is full the
    /// record is dropped and counted, so a stalled uplink cannot back up
    /// into packet consumption.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RawPacket>,
        out: mpsc::Sender<SessionRecord>,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(pending = self.pending.len(), "session pairer stopping");
                    return;
                }
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                }
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else {
                        info!(pending = self.pending.len(), "packet channel closed, session pairer stopping");
                        return;
                    };
                    if let Some(record) = self.handle_packet(pkt, Instant::now()) {
                        match out.try_send(record) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                self.stats.record(Counter::RecordsDropped);
                                debug!("transport queue full, dropping session record");
                            }
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }
        }
    }

    /// Feed one captured packet through classification and pairing.
    ///
    /// Returns a completed session when `pkt` is a response that matches a
    /// pending request. `now` is passed in so tests can drive time.
    pub fn handle_packet(&mut self, mut pkt: RawPacket, now: Instant) -> Option<SessionRecord> {
        self.stats.record(Counter::PacketsObserved);

        if pkt.interface.is_empty() {
            pkt.interface = self.interface.clone();
        }

        let kind = match pkt.classify(self.ntp_port) {
            Ok(kind) => kind,
            Err(err) => {
                self.stats.record(Counter::ParseErrors);
                debug!(error = %err, src = %pkt.src_ip, "skipping malformed packet");
                return None;
            }
        };

        match kind {
            PacketKind::Request => {
                let key = (pkt.src_ip, pkt.src_port, pkt.transmit_ts.to_bits());
                // A retransmitted request overwrites its predecessor; only
                // genuinely new keys can push the table over capacity.
                if self.pending.len() >= self.max_pending && !self.pending.contains_key(&key) {
                    self.evict_oldest();
                }
                self.pending.insert(
                    key,
                    PendingRequest {
                        pkt,
                        inserted: now,
                    },
                );
                None
            }
            PacketKind::Response => {
                let key = (pkt.dst_ip, pkt.dst_port, pkt.originate_ts.to_bits());
                match self.pending.remove(&key) {
                    Some(req) => {
                        self.stats.record(Counter::SessionsPaired);
                        Some(build_record(req.pkt, pkt))
                    }
                    None => {
                        self.stats.record(Counter::UnmatchedResponses);
                        debug!(
                            client = %pkt.dst_ip,
                            "response without a pending request"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Drop pending requests older than the pairing timeout. Returns how
    /// many were expired.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending
            .retain(|_, req| now.duration_since(req.inserted) < timeout);
        let expired = before - self.pending.len();
        if expired > 0 {
            self.stats.add(Counter::PairTimeouts, expired as u64);
            debug!(expired, remaining = self.pending.len(), "expired unanswered requests");
        }
        expired
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(_, req)| req.inserted)
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            self.pending.remove(&key);
            self.stats.record(Counter::PendingEvicted);
        }
    }
}

/// Difference `a - b` of two NTP-format timestamps, or None when either is
/// the wire's "unset" zero or the clock step would make it negative.
fn delta_seconds(a: f64, b: f64) -> Option<f64> {
    if a == 0.0 || b == 0.0 {
        return None;
    }
    let d = a - b;
    (d >= 0.0).then_some(d)
}

/// Fold a matched request/response pair into a session record.
///
/// Protocol description fields come from the response, which is where the
/// server's stratum, reference and root values actually live; a client
/// request carries zeros there.
fn build_record(req: RawPacket, resp: RawPacket) -> SessionRecord {
    let client_to_server = delta_seconds(resp.receive_ts, req.transmit_ts);
    let server_processing = delta_seconds(resp.transmit_ts, resp.receive_ts);
    let total_process = resp
        .captured_at
        .signed_duration_since(req.captured_at)
        .num_nanoseconds()
        .and_then(|n| (n >= 0).then_some(n as f64 / 1e9));

    SessionRecord {
        client_ip: req.src_ip,
        client_port: req.src_port,
        server_ip: resp.src_ip,
        server_port: resp.src_port,
        interface: req.interface,
        version: resp.version,
        stratum: resp.stratum,
        leap: resp.leap,
        poll: resp.poll,
        precision: resp.precision,
        root_delay: resp.root_delay,
        root_dispersion: resp.root_dispersion,
        reference_id: resp.reference_id,
        reference_ts: resp.reference_ts,
        originate_ts: resp.originate_ts,
        receive_ts: resp.receive_ts,
        transmit_ts: resp.transmit_ts,
        client_to_server_latency: client_to_server,
        server_processing_time: server_processing,
        total_process_time: total_process,
        packet_length: resp.length,
        session_ts: resp.captured_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairer::packet::NTP_PORT;
    use chrono::{DateTime, TimeZone, Utc};

    const CLIENT_XMIT: f64 = 3_912_000_000.125;

    fn capture_time(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_756_000_000, 0).unwrap() + chrono::Duration::milliseconds(offset_ms)
    }

    fn request(client_port: u16, transmit_ts: f64) -> RawPacket {
        RawPacket {
            captured_at: capture_time(0),
            interface: "eth0".to_string(),
            src_ip: "10.1.2.3".parse().unwrap(),
            src_port: client_port,
            dst_ip: "10.1.2.1".parse().unwrap(),
            dst_port: NTP_PORT,
            version: 4,
            leap: 0,
            stratum: 0,
            poll: 6,
            precision: -20,
            root_delay: 0.0,
            root_dispersion: 0.0,
            reference_id: String::new(),
            reference_ts: 0.0,
            originate_ts: 0.0,
            receive_ts: 0.0,
            transmit_ts,
            length: 48,
        }
    }

    fn response(client_port: u16, originate_ts: f64) -> RawPacket {
        RawPacket {
            captured_at: capture_time(10),
            interface: "eth0".to_string(),
            src_ip: "10.1.2.1".parse().unwrap(),
            src_port: NTP_PORT,
            dst_ip: "10.1.2.3".parse().unwrap(),
            dst_port: client_port,
            version: 4,
            leap: 0,
            stratum: 2,
            poll: 6,
            precision: -23,
            root_delay: 0.015,
            root_dispersion: 0.031,
            reference_id: "GPS".to_string(),
            reference_ts: originate_ts - 5.0,
            originate_ts,
            receive_ts: originate_ts + 0.003,
            transmit_ts: originate_ts + 0.004,
            length: 48,
        }
    }

    fn pairer(max_pending: usize) -> (SessionPairer, Arc<PipelineStats>) {
        let stats = Arc::new(PipelineStats::new());
        let pairer = SessionPairer::new(
            "eth0".to_string(),
            NTP_PORT,
            Duration::from_secs(2),
            Duration::from_secs(1),
            max_pending,
            stats.clone(),
        );
        (pairer, stats)
    }

    #[test]
    fn test_request_then_response_emits_session() {
        let (mut pairer, stats) = pairer(64);
        let t0 = Instant::now();

        assert!(pairer.handle_packet(request(40000, CLIENT_XMIT), t0).is_none());
        assert_eq!(pairer.pending_len(), 1);

        let record = pairer
            .handle_packet(response(40000, CLIENT_XMIT), t0 + Duration::from_millis(10))
            .unwrap();

        assert_eq!(record.client_port, 40000);
        assert_eq!(record.server_port, NTP_PORT);
        assert_eq!(record.stratum, 2);
        assert_eq!(record.reference_id, "GPS");
        // NTP-era timestamps sit near 2^32, so the differences carry about
        // half a microsecond of f64 rounding.
        assert!((record.client_to_server_latency.unwrap() - 0.003).abs() < 1e-6);
        assert!((record.server_processing_time.unwrap() - 0.001).abs() < 1e-6);
        assert!((record.total_process_time.unwrap() - 0.010).abs() < 1e-6);
        assert_eq!(record.session_ts, capture_time(10));

        assert_eq!(pairer.pending_len(), 0);
        assert_eq!(stats.get(Counter::SessionsPaired), 1);
        assert_eq!(stats.get(Counter::PacketsObserved), 2);
    }

    #[test]
    fn test_expired_request_counts_timeout_not_error() {
        let (mut pairer, stats) = pairer(64);
        let t0 = Instant::now();

        pairer.handle_packet(request(40000, CLIENT_XMIT), t0);
        assert_eq!(pairer.sweep(t0 + Duration::from_secs(1)), 0);
        assert_eq!(pairer.sweep(t0 + Duration::from_secs(3)), 1);

        assert_eq!(pairer.pending_len(), 0);
        assert_eq!(stats.get(Counter::PairTimeouts), 1);
        assert_eq!(stats.get(Counter::ParseErrors), 0);

        // The late response now finds nothing to match.
        let got = pairer.handle_packet(response(40000, CLIENT_XMIT), t0 + Duration::from_secs(4));
        assert!(got.is_none());
        assert_eq!(stats.get(Counter::UnmatchedResponses), 1);
    }

    #[test]
    fn test_retransmit_overwrites_pending_entry() {
        let (mut pairer, stats) = pairer(64);
        let t0 = Instant::now();

        let mut first = request(40000, CLIENT_XMIT);
        first.precision = -10;
        pairer.handle_packet(first, t0);

        let mut again = request(40000, CLIENT_XMIT);
        again.precision = -18;
        pairer.handle_packet(again, t0 + Duration::from_millis(500));

        assert_eq!(pairer.pending_len(), 1);
        assert_eq!(stats.get(Counter::PendingEvicted), 0);

        // One response consumes the (single) entry.
        let record = pairer.handle_packet(response(40000, CLIENT_XMIT), t0 + Duration::from_secs(1));
        assert!(record.is_some());
        assert_eq!(pairer.pending_len(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest_request() {
        let (mut pairer, stats) = pairer(2);
        let t0 = Instant::now();

        pairer.handle_packet(request(40001, CLIENT_XMIT), t0);
        pairer.handle_packet(request(40002, CLIENT_XMIT), t0 + Duration::from_millis(1));
        pairer.handle_packet(request(40003, CLIENT_XMIT), t0 + Duration::from_millis(2));

        assert_eq!(pairer.pending_len(), 2);
        assert_eq!(stats.get(Counter::PendingEvicted), 1);

        // The first request was the victim.
        let gone = pairer.handle_packet(response(40001, CLIENT_XMIT), t0 + Duration::from_millis(3));
        assert!(gone.is_none());
        let kept = pairer.handle_packet(response(40003, CLIENT_XMIT), t0 + Duration::from_millis(4));
        assert!(kept.is_some());
    }

    #[test]
    fn test_malformed_packet_counts_parse_error() {
        let (mut pairer, stats) = pairer(64);
        let mut pkt = request(40000, CLIENT_XMIT);
        pkt.version = 9;

        assert!(pairer.handle_packet(pkt, Instant::now()).is_none());
        assert_eq!(stats.get(Counter::ParseErrors), 1);
        assert_eq!(pairer.pending_len(), 0);
    }

    #[test]
    fn test_clock_step_yields_unset_metrics() {
        let (mut pairer, _stats) = pairer(64);
        let t0 = Instant::now();

        pairer.handle_packet(request(40000, CLIENT_XMIT), t0);

        // Server clock behind the client: receive precedes the echoed
        // transmit, and the processing delta is inverted too.
        let mut resp = response(40000, CLIENT_XMIT);
        resp.receive_ts = CLIENT_XMIT - 0.5;
        resp.transmit_ts = CLIENT_XMIT - 0.6;
        let record = pairer.handle_packet(resp, t0 + Duration::from_millis(5)).unwrap();

        assert!(record.client_to_server_latency.is_none());
        assert!(record.server_processing_time.is_none());
        assert!(record.total_process_time.is_some());
    }

    #[test]
    fn test_unlabelled_packet_gets_worker_interface() {
        let (mut pairer, _stats) = pairer(64);
        let t0 = Instant::now();

        let mut req = request(40000, CLIENT_XMIT);
        req.interface = String::new();
        pairer.handle_packet(req, t0);

        let record = pairer
            .handle_packet(response(40000, CLIENT_XMIT), t0 + Duration::from_millis(5))
            .unwrap();
        assert_eq!(record.interface, "eth0");
    }

    #[test]
    fn test_different_clients_do_not_cross_match() {
        let (mut pairer, stats) = pairer(64);
        let t0 = Instant::now();

        let mut other = request(40000, CLIENT_XMIT);
        other.src_ip = "10.9.9.9".parse().unwrap();
        pairer.handle_packet(other, t0);

        // Response addressed to a different client IP must not consume it.
        let got = pairer.handle_packet(response(40000, CLIENT_XMIT), t0 + Duration::from_millis(1));
        assert!(got.is_none());
        assert_eq!(stats.get(Counter::UnmatchedResponses), 1);
        assert_eq!(pairer.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_pairs_and_forwards_records() {
        let (pairer, stats) = pairer(64);
        let (pkt_tx, pkt_rx) = mpsc::channel(16);
        let (rec_tx, mut rec_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(pairer.run(pkt_rx, rec_tx, cancel.clone()));

        pkt_tx.send(request(40000, CLIENT_XMIT)).await.unwrap();
        pkt_tx.send(response(40000, CLIENT_XMIT)).await.unwrap();

        let record = rec_rx.recv().await.unwrap();
        assert_eq!(record.client_port, 40000);
        assert_eq!(stats.get(Counter::SessionsPaired), 1);

        drop(pkt_tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drops_record_when_uplink_queue_full() {
        let (pairer, stats) = pairer(64);
        let (pkt_tx, pkt_rx) = mpsc::channel(16);
        // Capacity 1 and nobody consuming: the second record has nowhere to go.
        let (rec_tx, rec_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(pairer.run(pkt_rx, rec_tx, cancel.clone()));

        for port in [40000u16, 40001] {
            pkt_tx.send(request(port, CLIENT_XMIT)).await.unwrap();
            pkt_tx.send(response(port, CLIENT_XMIT)).await.unwrap();
        }
        drop(pkt_tx);
        handle.await.unwrap();

        assert_eq!(stats.get(Counter::SessionsPaired), 2);
        assert_eq!(stats.get(Counter::RecordsDropped), 1);
        drop(rec_rx);
    }
}
