//! Worker-to-server record uplink.
//!
//! One persistent TCP connection per worker, re-established with capped
//! exponential backoff when it drops. Delivery is fire-and-forget: the
//! server never acknowledges frames, and records produced while the link is
//! down are dropped and counted rather than spooled.

pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::record::SessionRecord;
use crate::stats::{Counter, PipelineStats};

enum IdleOutcome {
    Retry,
    Cancelled,
    SourceClosed,
}

/// Streams session records to the ingestion server.
pub struct RecordSender {
    addr: String,
    reconnect_min: Duration,
    reconnect_max: Duration,
    max_frame: usize,
    stats: Arc<PipelineStats>,
}

impl RecordSender {
    pub fn new(
        addr: String,
        reconnect_min: Duration,
        reconnect_max: Duration,
        max_frame: usize,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            addr,
            reconnect_min,
            reconnect_max,
            max_frame,
            stats,
        }
    }

    /// Ship records from `rx` until the channel closes or `cancel` fires.
    /// On shutdown, whatever is already queued is flushed best-effort over
    /// the live connection.
    pub async fn run(self, mut rx: mpsc::Receiver<SessionRecord>, cancel: CancellationToken) -> Result<()> {
        let mut backoff = self.reconnect_min;
        let mut connected_before = false;

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                res = TcpStream::connect(&self.addr) => res,
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(addr = %self.addr, error = %err, retry_in = ?backoff, "ingestion server unreachable");
                    match self.idle_drop(&mut rx, &cancel, backoff).await {
                        IdleOutcome::Retry => {
                            backoff = (backoff * 2).min(self.reconnect_max);
                            continue;
                        }
                        IdleOutcome::Cancelled | IdleOutcome::SourceClosed => return Ok(()),
                    }
                }
            };

            info!(addr = %self.addr, "connected to ingestion server");
            if connected_before {
                self.stats.record(Counter::Reconnects);
            }
            connected_before = true;
            backoff = self.reconnect_min;

            let mut framed = FramedWrite::new(stream, frame::codec(self.max_frame));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.drain(&mut rx, &mut framed).await;
                        return Ok(());
                    }
                    rec = rx.recv() => {
                        let Some(rec) = rec else {
                            let _ = framed.flush().await;
                            return Ok(());
                        };
                        if self.send_one(&mut framed, &rec).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Fall through to reconnect.
        }
    }

    async fn send_one(
        &self,
        framed: &mut FramedWrite<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
        rec: &SessionRecord,
    ) -> std::io::Result<()> {
        let payload = match frame::encode_record(rec) {
            Ok(payload) => payload,
            Err(err) => {
                // Our own record failing to serialize is a bug, not a link
                // problem; drop it and keep the connection.
                self.stats.record(Counter::RecordsDropped);
                warn!(error = %err, "unserializable session record dropped");
                return Ok(());
            }
        };
        match framed.send(payload).await {
            Ok(()) => {
                self.stats.record(Counter::RecordsSent);
                Ok(())
            }
            Err(err) => {
                self.stats.record(Counter::RecordsDropped);
                warn!(error = %err, "uplink write failed, reconnecting");
                Err(err)
            }
        }
    }

    /// Wait out one backoff interval, dropping any records produced in the
    /// meantime so the pairer never sees uplink pressure.
    async fn idle_drop(
        &self,
        rx: &mut mpsc::Receiver<SessionRecord>,
        cancel: &CancellationToken,
        backoff: Duration,
    ) -> IdleOutcome {
        let deadline = tokio::time::Instant::now() + backoff;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return IdleOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return IdleOutcome::Retry,
                rec = rx.recv() => match rec {
                    Some(_) => {
                        self.stats.record(Counter::RecordsDropped);
                        debug!("uplink down, dropping session record");
                    }
                    None => return IdleOutcome::SourceClosed,
                },
            }
        }
    }

    /// Best-effort flush of already-queued records during shutdown.
    async fn drain(
        &self,
        rx: &mut mpsc::Receiver<SessionRecord>,
        framed: &mut FramedWrite<TcpStream, tokio_util::codec::LengthDelimitedCodec>,
    ) {
        while let Ok(rec) = rx.try_recv() {
            if self.send_one(framed, &rec).await.is_err() {
                return;
            }
        }
        let _ = framed.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn sample_record(client_port: u16) -> SessionRecord {
        SessionRecord {
            client_ip: "10.1.2.3".parse().unwrap(),
            client_port,
            server_ip: "10.1.2.1".parse().unwrap(),
            server_port: 123,
            interface: "eth0".to_string(),
            version: 4,
            stratum: 2,
            leap: 0,
            poll: 6,
            precision: -23,
            root_delay: 0.015,
            root_dispersion: 0.031,
            reference_id: "GPS".to_string(),
            reference_ts: 3_911_999_995.0,
            originate_ts: 3_912_000_000.125,
            receive_ts: 3_912_000_000.128,
            transmit_ts: 3_912_000_000.129,
            client_to_server_latency: Some(0.003),
            server_processing_time: Some(0.001),
            total_process_time: Some(0.010),
            packet_length: 48,
            session_ts: Utc.timestamp_opt(1_756_000_000, 0).unwrap(),
        }
    }

    fn sender(addr: String, stats: Arc<PipelineStats>) -> RecordSender {
        RecordSender::new(
            addr,
            Duration::from_millis(10),
            Duration::from_millis(40),
            frame::DEFAULT_MAX_FRAME,
            stats,
        )
    }

    #[tokio::test]
    async fn test_delivers_records_over_live_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let run = tokio::spawn(sender(addr, stats.clone()).run(rx, cancel));

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = FramedRead::new(stream, frame::codec(frame::DEFAULT_MAX_FRAME));

        for port in [40001u16, 40002, 40003] {
            tx.send(sample_record(port)).await.unwrap();
        }

        let mut ports = Vec::new();
        for _ in 0..3 {
            let frame_bytes = reader.next().await.unwrap().unwrap();
            ports.push(frame::decode_record(&frame_bytes).unwrap().client_port);
        }
        assert_eq!(ports, vec![40001, 40002, 40003]);

        drop(tx);
        run.await.unwrap().unwrap();
        assert_eq!(stats.get(Counter::RecordsSent), 3);
        assert_eq!(stats.get(Counter::RecordsDropped), 0);
    }

    #[tokio::test]
    async fn test_drops_records_while_unreachable() {
        // Reserve a port, then free it so nothing is listening there.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap().to_string();
        drop(probe);

        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let run = tokio::spawn(sender(addr, stats.clone()).run(rx, cancel.clone()));

        tx.send(sample_record(40001)).await.unwrap();
        tx.send(sample_record(40002)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stats.get(Counter::RecordsDropped) < 2 {
            assert!(tokio::time::Instant::now() < deadline, "records were not dropped");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(stats.get(Counter::RecordsSent), 0);
    }

    #[tokio::test]
    async fn test_connects_once_server_appears() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let run = tokio::spawn(sender(addr.to_string(), stats.clone()).run(rx, cancel.clone()));

        // Let a few connection attempts fail, then start listening.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let listener = TcpListener::bind(addr).await.unwrap();

        // Keep offering records until one makes it through the new link.
        let feeder = tokio::spawn(async move {
            for port in 41000u16.. {
                if tx.send(sample_record(port)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut reader = FramedRead::new(stream, frame::codec(frame::DEFAULT_MAX_FRAME));
        let frame_bytes = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let record = frame::decode_record(&frame_bytes).unwrap();
        assert_eq!(record.interface, "eth0");

        cancel.cancel();
        feeder.abort();
        run.await.unwrap().unwrap();
        assert!(stats.get(Counter::RecordsSent) >= 1);
    }

    #[tokio::test]
    async fn test_queued_records_flushed_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stats = Arc::new(PipelineStats::new());
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let run = tokio::spawn(sender(addr, stats.clone()).run(rx, cancel.clone()));
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = FramedRead::new(stream, frame::codec(frame::DEFAULT_MAX_FRAME));

        for port in [40001u16, 40002, 40003] {
            tx.send(sample_record(port)).await.unwrap();
        }
        cancel.cancel();
        run.await.unwrap().unwrap();

        let mut seen = 0;
        while let Some(Ok(frame_bytes)) = reader.next().await {
            frame::decode_record(&frame_bytes).unwrap();
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert_eq!(stats.get(Counter::RecordsSent), 3);
    }
}
