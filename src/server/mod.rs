//! Central ingestion server.
//!
//! Accepts persistent worker connections, decodes framed session records
//! into a shared bounded queue, and batch-writes merged client state to the
//! store. The accept loop never touches the queue or storage itself, so a
//! slow flush can stall at most the handlers that are actively enqueuing.

pub mod conn;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::record::SessionRecord;
use crate::stats::{self, Counter, PipelineStats};
use crate::storage::sqlite::SqliteStore;
use crate::storage::ClientStore;
use crate::writer::BatchWriter;

/// Server orchestrates the ingestion side: storage, batch writer, the accept
/// loop, and background sweeps.
pub struct Server {
    cfg: ServerConfig,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    local_addr: Option<SocketAddr>,
    writer_task: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            cfg,
            stats: Arc::new(PipelineStats::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            local_addr: None,
            writer_task: None,
        }
    }

    /// Counters shared by every component of this server.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Bound listen address, available after start. With a ":0" listen
    /// config this carries the kernel-assigned port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start all components and begin accepting workers.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Open the client store.
        let store = SqliteStore::connect(&self.cfg.db_path)
            .await
            .context("opening client store")?;
        info!(
            path = %self.cfg.db_path.display(),
            backend = store.name(),
            "client store ready",
        );

        // 2. Start the batch writer on the shared record queue.
        let (queue_tx, queue_rx) = mpsc::channel(self.cfg.queue_size);
        let writer = BatchWriter::new(
            store.clone(),
            self.cfg.batch_max_size,
            self.cfg.batch_max_interval,
            self.cfg.flush_retries,
            self.cfg.retry_backoff,
            Arc::clone(&self.stats),
        );
        self.writer_task = Some(tokio::spawn(writer.run(queue_rx)));

        // 3. Bind and start the accept loop.
        let listener = TcpListener::bind(&self.cfg.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.cfg.listen_addr))?;
        let local_addr = listener.local_addr().context("resolving listen address")?;
        self.local_addr = Some(local_addr);
        info!(addr = %local_addr, "listening for workers");

        self.spawn_accept_loop(listener, queue_tx);

        // 4. Background sweeps.
        if let Some(retention) = self.cfg.retention {
            self.spawn_purge_sweeper(store, retention)?;
        }
        stats::spawn_stats_reporter(
            Arc::clone(&self.stats),
            self.cfg.stats_interval,
            self.cancel.clone(),
        );

        info!("ingestion server started");

        Ok(())
    }

    /// Gracefully stop: close the listener, let in-flight connections wind
    /// down, then drain whatever reached the queue into one final flush.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // Handlers exit on cancellation; once they and the accept loop are
        // gone, every queue sender is dropped and the writer flushes out.
        self.tracker.close();
        self.tracker.wait().await;

        if let Some(task) = self.writer_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "batch writer task failed");
            }
        }

        info!(totals = %self.stats.format_totals(), "ingestion server stopped");

        Ok(())
    }

    /// Spawn the accept loop. It owns the queue sender, so once it and every
    /// per-connection handler exit, the writer sees the channel close.
    fn spawn_accept_loop(&self, listener: TcpListener, queue_tx: mpsc::Sender<SessionRecord>) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let tracker = self.tracker.clone();
        let max_frame = self.cfg.max_frame;

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("accept loop stopping");
                        return;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "worker connected");
                            tracker.spawn(conn::handle_connection(
                                stream,
                                peer.to_string(),
                                max_frame,
                                queue_tx.clone(),
                                Arc::clone(&stats),
                                cancel.clone(),
                            ));
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    },
                }
            }
        });
    }

    /// Spawn the retention sweeper, deleting client rows whose last activity
    /// predates the retention window.
    fn spawn_purge_sweeper(&self, store: SqliteStore, retention: Duration) -> Result<()> {
        let retention = chrono::Duration::from_std(retention).context("retention out of range")?;
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let sweep = self.cfg.purge_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match store.purge_older_than(Utc::now() - retention).await {
                            Ok(0) => {}
                            Ok(n) => {
                                stats.add(Counter::EntitiesPurged, n);
                                info!(purged = n, "stale client rows removed");
                            }
                            Err(err) => {
                                warn!(error = %err, "retention sweep failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}
