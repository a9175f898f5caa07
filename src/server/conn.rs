use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::record::SessionRecord;
use crate::stats::{Counter, PipelineStats};
use crate::transport::frame;

/// Reads length-prefixed session records from one worker connection and
/// feeds them into the shared record queue.
///
/// Any framing or decode failure abandons the connection; the worker is
/// expected to reconnect with a clean stream. A full queue blocks only this
/// handler, never the accept loop or other connections.
pub async fn handle_connection<R>(
    io: R,
    peer: String,
    max_frame: usize,
    queue: mpsc::Sender<SessionRecord>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(io, frame::codec(max_frame));

    loop {
        let frame_bytes = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer, "connection handler stopping");
                return;
            }
            next = framed.next() => match next {
                Some(Ok(frame_bytes)) => frame_bytes,
                Some(Err(err)) => {
                    stats.record(Counter::DecodeErrors);
                    warn!(peer = %peer, error = %err, "bad frame, closing connection");
                    return;
                }
                None => {
                    debug!(peer = %peer, "worker disconnected");
                    return;
                }
            },
        };

        let record = match frame::decode_record(&frame_bytes) {
            Ok(record) => record,
            Err(err) => {
                stats.record(Counter::DecodeErrors);
                warn!(peer = %peer, error = %err, "undecodable record, closing connection");
                return;
            }
        };

        stats.record(Counter::RecordsReceived);

        // Gauge first so the writer's decrement can never race it below zero.
        stats.depth_inc();
        match queue.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                stats.record(Counter::BackpressureWaits);
                if queue.send(record).await.is_err() {
                    stats.depth_dec();
                    return;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                stats.depth_dec();
                return;
            }
        }
    }
}
