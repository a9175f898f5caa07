//! Raw packet model for the capture boundary.
//!
//! The capture mechanism itself is external; it hands over already-parsed,
//! timestamped NTP datagrams. This module validates them and classifies each
//! as a client request or a server response by its port pair.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known NTP server port, the default for classification.
pub const NTP_PORT: u16 = 123;

/// One captured NTP datagram with its protocol header fields. Ephemeral:
/// owned by the session pairer and never persisted individually.
///
/// Protocol timestamps are seconds since the NTP epoch (1900-01-01). Fields
/// that are meaningless for the packet's mode (e.g. stratum in a client
/// request) are carried as the zeros the sender put on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    /// Capture timestamp from the capture mechanism's clock.
    pub captured_at: DateTime<Utc>,
    /// Interface the packet was seen on; empty means "whatever interface the
    /// worker monitors" and is stamped by the worker.
    #[serde(default)]
    pub interface: String,

    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,

    pub version: u8,
    pub leap: u8,
    pub stratum: u8,
    pub poll: i8,
    pub precision: i8,
    pub root_delay: f64,
    pub root_dispersion: f64,
    #[serde(default)]
    pub reference_id: String,

    pub reference_ts: f64,
    pub originate_ts: f64,
    pub receive_ts: f64,
    pub transmit_ts: f64,

    /// UDP payload length in bytes.
    pub length: u32,
}

/// Direction of a validated packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Client request: destination on the server port, source elsewhere.
    Request,
    /// Server response: source on the server port.
    Response,
}

/// Validation failures for captured datagrams. All of these are skipped and
/// counted, never propagated as fatal.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("neither side on the time port: {src_port} -> {dst_port}")]
    NotTimeProtocol { src_port: u16, dst_port: u16 },

    #[error("invalid protocol version: {raw}")]
    InvalidVersion { raw: u8 },

    #[error("invalid leap indicator: {raw}")]
    InvalidLeap { raw: u8 },

    #[error("request carries no transmit timestamp")]
    MissingCorrelation,

    #[error("response carries no originate timestamp")]
    MissingOriginate,
}

impl RawPacket {
    /// Validate header fields and classify the packet by its port pair
    /// against the monitored server port.
    ///
    /// A zero transmit (request) or originate (response) timestamp makes the
    /// packet uncorrelatable, so it is rejected rather than silently ignored.
    pub fn classify(&self, ntp_port: u16) -> Result<PacketKind, PacketError> {
        if self.version == 0 || self.version > 7 {
            return Err(PacketError::InvalidVersion { raw: self.version });
        }
        if self.leap > 3 {
            return Err(PacketError::InvalidLeap { raw: self.leap });
        }

        if self.src_port == ntp_port {
            if self.originate_ts == 0.0 {
                return Err(PacketError::MissingOriginate);
            }
            return Ok(PacketKind::Response);
        }

        if self.dst_port == ntp_port {
            if self.transmit_ts == 0.0 {
                return Err(PacketError::MissingCorrelation);
            }
            return Ok(PacketKind::Request);
        }

        Err(PacketError::NotTimeProtocol {
            src_port: self.src_port,
            dst_port: self.dst_port,
        })
    }
}
