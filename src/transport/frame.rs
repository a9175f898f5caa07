//! Wire format for worker-to-server record streaming.
//!
//! Frames are a 4-byte big-endian length prefix followed by one
//! JSON-serialized [`SessionRecord`]. The length codec enforces an upper
//! bound so a corrupt prefix cannot make the receiver buffer gigabytes.

use bytes::Bytes;
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

use crate::record::SessionRecord;

/// Frames larger than this are treated as stream corruption.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("failed to serialize session record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode session record from {len} byte frame: {source}")]
    Decode {
        len: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Length codec shared by both ends of the stream.
pub fn codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_type::<u32>()
        .big_endian()
        .max_frame_length(max_frame)
        .new_codec()
}

/// Serialize one record into a frame payload.
pub fn encode_record(record: &SessionRecord) -> Result<Bytes, FrameError> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(FrameError::Encode)
}

/// Deserialize one frame payload back into a record.
pub fn decode_record(payload: &[u8]) -> Result<SessionRecord, FrameError> {
    serde_json::from_slice(payload).map_err(|source| FrameError::Decode {
        len: payload.len(),
        source,
    })
}
