use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::mpsc;

use chronoor::config::{ServerConfig, WorkerConfig};
use chronoor::pairer::packet::{RawPacket, NTP_PORT};
use chronoor::pairer::source::ChannelSource;
use chronoor::record::ClientKey;
use chronoor::server::Server;
use chronoor::stats::Counter;
use chronoor::storage::sqlite::SqliteStore;
use chronoor::worker::Worker;

fn capture_time(ms_offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_756_000_000, 0).unwrap() + ChronoDuration::milliseconds(ms_offset)
}

fn request(client_ip: &str, client_port: u16, transmit_ts: f64, captured_ms: i64) -> RawPacket {
    RawPacket {
        captured_at: capture_time(captured_ms),
        interface: String::new(),
        src_ip: client_ip.parse().unwrap(),
        src_port: client_port,
        dst_ip: "192.168.1.1".parse().unwrap(),
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

#[allow(clippy::too_many_arguments)]
fn response(
    client_ip: &str,
    client_port: u16,
    originate_ts: f64,
    captured_ms: i64,
    recv_offset: f64,
    xmit_offset: f64,
    stratum: u8,
) -> RawPacket {
    RawPacket {
        captured_at: capture_time(captured_ms),
        interface: String::new(),
        src_ip: "192.168.1.1".parse().unwrap(),
        src_port: NTP_PORT,
        dst_ip: client_ip.parse().unwrap(),
        dst_port: client_port,
        version: 4,
        leap: 0,
        stratum,
        poll: 6,
        precision: -23,
        root_delay: 0.015,
        root_dispersion: 0.031,
        reference_id: "GPS".to_string(),
        reference_ts: originate_ts - 5.0,
        originate_ts,
        receive_ts: originate_ts + recv_offset,
        transmit_ts: originate_ts + xmit_offset,
        length: 48,
    }
}

fn worker_config(ingest_addr: String) -> WorkerConfig {
    WorkerConfig {
        interface: "eth0".to_string(),
        ntp_port: NTP_PORT,
        pairing_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(50),
        max_pending: 256,
        packet_queue_size: 64,
        send_queue_size: 64,
        ingest_addr,
        reconnect_min: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(80),
        max_frame: 64 * 1024,
        stats_interval: Duration::from_secs(3600),
    }
}

fn server_config(db_path: std::path::PathBuf) -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        db_path,
        queue_size: 64,
        batch_max_size: 100,
        batch_max_interval: Duration::from_millis(100),
        max_frame: 64 * 1024,
        flush_retries: 2,
        retry_backoff: Duration::from_millis(20),
        retention: None,
        purge_interval: Duration::from_secs(3600),
        stats_interval: Duration::from_secs(3600),
    }
}

fn key(client_ip: &str) -> ClientKey {
    ClientKey {
        client_ip: client_ip.parse().unwrap(),
        interface: "eth0".to_string(),
    }
}

const XMIT_A1: f64 = 3_912_000_000.125;
const XMIT_A2: f64 = 3_912_000_060.125;
const XMIT_B: f64 = 3_912_000_001.250;

/// Drives captured packets through a real worker, over loopback TCP, into a
/// real server backed by SQLite, and checks the persisted per-client state.
#[tokio::test]
async fn pipeline_persists_merged_client_state() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("clients.sqlite3");

    let mut server = Server::new(server_config(db_path.clone()));
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap().to_string();

    let (feed_tx, feed_rx) = mpsc::channel(16);
    let mut worker = Worker::new(worker_config(addr));
    worker.start(ChannelSource::new(feed_rx));

    // Client A completes two exchanges a minute apart, client B one.
    let packets = vec![
        request("192.168.1.20", 41000, XMIT_A1, 0),
        response("192.168.1.20", 41000, XMIT_A1, 10, 0.003, 0.004, 2),
        request("192.168.1.21", 42000, XMIT_B, 1_000),
        response("192.168.1.21", 42000, XMIT_B, 1_010, 0.003, 0.004, 2),
        request("192.168.1.20", 41000, XMIT_A2, 60_000),
        response("192.168.1.20", 41000, XMIT_A2, 60_012, 0.005, 0.0065, 3),
    ];
    for pkt in packets {
        feed_tx.send(pkt).await.unwrap();
    }

    // Closing the feed drains the worker end to end; the uplink flushes
    // everything it queued before disconnecting.
    drop(feed_tx);
    tokio::time::timeout(Duration::from_secs(5), worker.join())
        .await
        .expect("worker did not drain");

    let store = SqliteStore::connect(&db_path).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while store.count().await.unwrap() < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "sessions never reached the store"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Client A: one row carrying the newest session's values with the
    // session count and seen-range accumulated across both exchanges.
    let a = store.find_by_key(&key("192.168.1.20")).await.unwrap().unwrap();
    assert_eq!(a.client_ip, "192.168.1.20".parse::<IpAddr>().unwrap());
    assert_eq!(a.client_port, 41000);
    assert_eq!(a.server_port, NTP_PORT);
    assert_eq!(a.interface, "eth0");
    assert_eq!(a.session_count, 2);
    assert_eq!(a.stratum, 3);
    assert_eq!(a.reference_id, "GPS");
    assert_eq!(a.first_seen, capture_time(10));
    assert_eq!(a.last_seen, capture_time(60_012));
    assert_eq!(a.session_ts, capture_time(60_012));
    assert!((a.client_to_server_latency.unwrap() - 0.005).abs() < 1e-6);
    assert!((a.server_processing_time.unwrap() - 0.0015).abs() < 1e-6);
    assert!((a.total_process_time.unwrap() - 0.012).abs() < 1e-6);

    // Client B: a single session, seen-range collapsed to one instant.
    let b = store.find_by_key(&key("192.168.1.21")).await.unwrap().unwrap();
    assert_eq!(b.session_count, 1);
    assert_eq!(b.stratum, 2);
    assert_eq!(b.first_seen, capture_time(1_010));
    assert_eq!(b.last_seen, capture_time(1_010));
    assert!((b.client_to_server_latency.unwrap() - 0.003).abs() < 1e-6);

    let worker_stats = worker.stats();
    assert_eq!(worker_stats.get(Counter::PacketsObserved), 6);
    assert_eq!(worker_stats.get(Counter::SessionsPaired), 3);
    assert_eq!(worker_stats.get(Counter::RecordsSent), 3);
    assert_eq!(worker_stats.get(Counter::RecordsDropped), 0);
    assert_eq!(worker_stats.get(Counter::ParseErrors), 0);

    server.stop().await.unwrap();
    let server_stats = server.stats();
    assert_eq!(server_stats.get(Counter::RecordsReceived), 3);
    assert_eq!(server_stats.get(Counter::RecordsProcessed), 3);
    // Each key is inserted exactly once however the records were batched.
    assert_eq!(server_stats.get(Counter::RecordsInserted), 2);
    assert!(server_stats.get(Counter::RecordsUpdated) <= 1);
    assert_eq!(server_stats.get(Counter::DecodeErrors), 0);
    assert_eq!(server_stats.get(Counter::BatchesDropped), 0);
    assert_eq!(server_stats.queue_depth(), 0);
}

/// An unanswered request must age out as a timeout, and its late response
/// must count as unmatched; neither produces a record downstream.
#[tokio::test]
async fn unanswered_request_times_out_without_emitting() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (feed_tx, feed_rx) = mpsc::channel(16);
    let mut cfg = worker_config(addr);
    cfg.pairing_timeout = Duration::from_millis(100);
    let mut worker = Worker::new(cfg);
    worker.start(ChannelSource::new(feed_rx));
    let stats = worker.stats();

    // Hold the accepted uplink open so nothing churns on reconnects.
    let (_uplink, _) = listener.accept().await.unwrap();

    feed_tx
        .send(request("192.168.1.20", 41000, XMIT_A1, 0))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.get(Counter::PairTimeouts) < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pending request never timed out"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    feed_tx
        .send(response("192.168.1.20", 41000, XMIT_A1, 500, 0.003, 0.004, 2))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while stats.get(Counter::UnmatchedResponses) < 1 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "late response was not counted as unmatched"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    drop(feed_tx);
    tokio::time::timeout(Duration::from_secs(5), worker.join())
        .await
        .expect("worker did not drain");

    assert_eq!(stats.get(Counter::SessionsPaired), 0);
    assert_eq!(stats.get(Counter::RecordsSent), 0);
    assert_eq!(stats.get(Counter::ParseErrors), 0);
}
