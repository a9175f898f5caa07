use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SessionRecord is one matched request/response exchange, emitted by the
/// session pairer and immutable from then on. Transport and storage never
/// mutate a record, only merge it into prior per-client state.
///
/// Protocol fields carry the server response's values. The four protocol
/// timestamps are seconds since the NTP epoch (1900-01-01). Derived metrics
/// are seconds, present only when computable from consistent clocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    /// Interface the exchange was captured on.
    pub interface: String,

    pub version: u8,
    pub stratum: u8,
    /// Leap indicator code (0..=3).
    pub leap: u8,
    /// Poll interval exponent (log2 seconds).
    pub poll: i8,
    /// Clock precision exponent (log2 seconds).
    pub precision: i8,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub reference_id: String,

    pub reference_ts: f64,
    pub originate_ts: f64,
    pub receive_ts: f64,
    pub transmit_ts: f64,

    /// response.receive_ts - request.transmit_ts, absent if negative.
    pub client_to_server_latency: Option<f64>,
    /// response.transmit_ts - response.receive_ts, absent if negative.
    pub server_processing_time: Option<f64>,
    /// Capture-clock delta between response and request arrival.
    pub total_process_time: Option<f64>,

    /// Response payload length in bytes.
    pub packet_length: u32,
    /// Wall-clock time the pairing completed.
    pub session_ts: DateTime<Utc>,
}

impl SessionRecord {
    pub fn key(&self) -> ClientKey {
        ClientKey {
            client_ip: self.client_ip,
            interface: self.interface.clone(),
        }
    }
}

/// Durable identity of a client entity: one row per client IP per monitored
/// interface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub client_ip: IpAddr,
    pub interface: String,
}

/// Accumulated view of every same-key record in one flush batch, folded in
/// session-timestamp order so a key gets exactly one storage write per flush.
#[derive(Debug, Clone)]
pub struct ClientUpdate {
    /// The record with the greatest session timestamp seen so far.
    pub latest: SessionRecord,
    /// Earliest session timestamp in the batch for this key.
    pub first_ts: DateTime<Utc>,
    /// Latest session timestamp in the batch for this key.
    pub last_ts: DateTime<Utc>,
    /// Number of records folded in.
    pub sessions: u32,
}

impl ClientUpdate {
    pub fn from_record(record: SessionRecord) -> Self {
        let ts = record.session_ts;
        Self {
            latest: record,
            first_ts: ts,
            last_ts: ts,
            sessions: 1,
        }
    }

    /// Fold another same-key record in. Records may arrive out of order;
    /// the latest-by-session-timestamp record supplies the field values,
    /// with arrival order breaking exact ties.
    pub fn absorb(&mut self, record: SessionRecord) {
        self.sessions += 1;
        if record.session_ts < self.first_ts {
            self.first_ts = record.session_ts;
        }
        if record.session_ts >= self.last_ts {
            self.last_ts = record.session_ts;
            self.latest = record;
        }
    }
}

/// ClientEntity is the durable, deduplicated state for one (client IP,
/// interface) key: latest-known protocol/metric fields plus first/last seen
/// bookkeeping and a monotone session count.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEntity {
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    pub interface: String,

    pub version: u8,
    pub stratum: u8,
    pub leap: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: f64,
    pub root_dispersion: f64,
    pub reference_id: String,

    pub reference_ts: f64,
    pub originate_ts: f64,
    pub receive_ts: f64,
    pub transmit_ts: f64,

    pub client_to_server_latency: Option<f64>,
    pub server_processing_time: Option<f64>,
    pub total_process_time: Option<f64>,

    pub packet_length: u32,
    pub session_ts: DateTime<Utc>,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub session_count: i64,
}

impl ClientEntity {
    /// Build a fresh entity from the first batch update for a key.
    pub fn from_update(update: &ClientUpdate) -> Self {
        let rec = &update.latest;
        Self {
            client_ip: rec.client_ip,
            client_port: rec.client_port,
            server_ip: rec.server_ip,
            server_port: rec.server_port,
            interface: rec.interface.clone(),
            version: rec.version,
            stratum: rec.stratum,
            leap: rec.leap,
            poll: rec.poll,
            precision: rec.precision,
            root_delay: rec.root_delay,
            root_dispersion: rec.root_dispersion,
            reference_id: rec.reference_id.clone(),
            reference_ts: rec.reference_ts,
            originate_ts: rec.originate_ts,
            receive_ts: rec.receive_ts,
            transmit_ts: rec.transmit_ts,
            client_to_server_latency: rec.client_to_server_latency,
            server_processing_time: rec.server_processing_time,
            total_process_time: rec.total_process_time,
            packet_length: rec.packet_length,
            session_ts: rec.session_ts,
            first_seen: update.first_ts,
            last_seen: update.last_ts,
            session_count: i64::from(update.sessions),
        }
    }

    /// Merge a batch update into existing state: every latest-value field is
    /// overwritten by the update's newest record, last_seen only ever moves
    /// forward, and the session count grows by the number of folded records.
    /// first_seen is fixed at creation time.
    pub fn apply(&mut self, update: &ClientUpdate) {
        let rec = &update.latest;
        self.client_port = rec.client_port;
        self.server_ip = rec.server_ip;
        self.server_port = rec.server_port;
        self.version = rec.version;
        self.stratum = rec.stratum;
        self.leap = rec.leap;
        self.poll = rec.poll;
        self.precision = rec.precision;
        self.root_delay = rec.root_delay;
        self.root_dispersion = rec.root_dispersion;
        self.reference_id = rec.reference_id.clone();
        self.reference_ts = rec.reference_ts;
        self.originate_ts = rec.originate_ts;
        self.receive_ts = rec.receive_ts;
        self.transmit_ts = rec.transmit_ts;
        self.client_to_server_latency = rec.client_to_server_latency;
        self.server_processing_time = rec.server_processing_time;
        self.total_process_time = rec.total_process_time;
        self.packet_length = rec.packet_length;
        self.session_ts = rec.session_ts;

        if update.last_ts > self.last_seen {
            self.last_seen = update.last_ts;
        }
        self.session_count += i64::from(update.sessions);
    }
}
