//! Packet sources feeding the session pairer.
//!
//! A source owns wherever packets come from and pushes them into the pairer's
//! channel until it runs dry or the worker shuts down. The default source
//! reads one JSON-encoded [`RawPacket`] per line from stdin, which keeps the
//! capture mechanism external and the worker testable.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pairer::packet::RawPacket;
use crate::stats::{Counter, PipelineStats};

/// Produces captured packets for the pairer.
pub trait PacketSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Push packets into `tx` until exhausted or cancelled. Returning Ok
    /// means the source drained cleanly; the worker treats that as a request
    /// to shut down.
    fn run(
        self,
        tx: mpsc::Sender<RawPacket>,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Reads newline-delimited JSON packets from standard input.
pub struct StdinSource {
    stats: Arc<PipelineStats>,
}

impl StdinSource {
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self { stats }
    }
}

impl PacketSource for StdinSource {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn run(self, tx: mpsc::Sender<RawPacket>, cancel: CancellationToken) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("packet input reached end of stream");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RawPacket>(&line) {
                        Ok(pkt) => {
                            if tx.send(pkt).await.is_err() {
                                // Pairer is gone; the worker is stopping.
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            self.stats.record(Counter::ParseErrors);
                            debug!(error = %err, "skipping undecodable packet line");
                        }
                    }
                }
            }
        }
    }
}

/// Forwards packets from an in-process channel. Used where another task
/// already owns the capture path, and by end-to-end tests.
pub struct ChannelSource {
    rx: mpsc::Receiver<RawPacket>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<RawPacket>) -> Self {
        Self { rx }
    }
}

impl PacketSource for ChannelSource {
    fn name(&self) -> &str {
        "channel"
    }

    async fn run(mut self, tx: mpsc::Sender<RawPacket>, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                pkt = self.rx.recv() => {
                    let Some(pkt) = pkt else { return Ok(()) };
                    if tx.send(pkt).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
