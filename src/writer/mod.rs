//! Batch writer.
//!
//! Single consumer of the server's record queue. Records accumulate until
//! the batch is full or the oldest queued record has waited out the flush
//! interval, then the whole batch is merged per client key and written in
//! one storage transaction. A failed flush is retried a bounded number of
//! times and then abandoned; the store is never left with a partial batch.

pub mod merge;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::record::{ClientEntity, ClientKey, ClientUpdate, SessionRecord};
use crate::stats::{Counter, PipelineStats};
use crate::storage::{BatchOutcome, ClientStore, ClientTx, StorageError};

/// Drains the record queue into a [`ClientStore`] in merged batches.
pub struct BatchWriter<S: ClientStore> {
    store: S,
    max_size: usize,
    max_interval: Duration,
    flush_retries: u32,
    retry_backoff: Duration,
    stats: Arc<PipelineStats>,
}

impl<S: ClientStore> BatchWriter<S> {
    pub fn new(
        store: S,
        max_size: usize,
        max_interval: Duration,
        flush_retries: u32,
        retry_backoff: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            store,
            max_size: max_size.max(1),
            max_interval,
            flush_retries,
            retry_backoff,
            stats,
        }
    }

    /// Consume records until the queue closes, then flush what remains.
    ///
    /// Closure of the queue is the shutdown signal: once every producer
    /// handle is gone the final partial batch is written out and the
    /// writer returns.
    pub async fn run(self, mut rx: mpsc::Receiver<SessionRecord>) {
        let mut batch: Vec<SessionRecord> = Vec::with_capacity(self.max_size);
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                rec = rx.recv() => {
                    let Some(rec) = rec else {
                        self.flush(&mut batch, &mut deadline).await;
                        info!("record queue closed, batch writer stopping");
                        return;
                    };
                    self.stats.depth_dec();
                    batch.push(rec);
                    if batch.len() == 1 {
                        deadline = Some(Instant::now() + self.max_interval);
                    }
                    // Opportunistically take whatever else is already queued.
                    while batch.len() < self.max_size {
                        match rx.try_recv() {
                            Ok(rec) => {
                                self.stats.depth_dec();
                                batch.push(rec);
                            }
                            Err(_) => break,
                        }
                    }
                    if batch.len() >= self.max_size {
                        self.flush(&mut batch, &mut deadline).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => {
                    self.flush(&mut batch, &mut deadline).await;
                }
            }
        }
    }

    /// Write one batch, retrying on storage failure. An exhausted batch is
    /// dropped with a single storage error counted.
    async fn flush(&self, batch: &mut Vec<SessionRecord>, deadline: &mut Option<Instant>) {
        *deadline = None;
        if batch.is_empty() {
            return;
        }

        let records = std::mem::replace(batch, Vec::with_capacity(self.max_size));
        let count = records.len() as u64;
        let merged = merge::merge_batch(records);
        let keys = merged.len();

        let mut attempt = 0;
        loop {
            match write_batch(&self.store, &merged).await {
                Ok(outcome) => {
                    self.stats.add(Counter::RecordsProcessed, count);
                    self.stats.add(Counter::RecordsInserted, outcome.inserted);
                    self.stats.add(Counter::RecordsUpdated, outcome.updated);
                    self.stats.record(Counter::BatchesFlushed);
                    debug!(
                        records = count,
                        keys,
                        inserted = outcome.inserted,
                        updated = outcome.updated,
                        "batch flushed"
                    );
                    return;
                }
                Err(err) if attempt < self.flush_retries => {
                    attempt += 1;
                    warn!(
                        error = %err,
                        attempt,
                        retries = self.flush_retries,
                        "batch flush failed, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(err) => {
                    self.stats.record(Counter::StorageErrors);
                    self.stats.record(Counter::BatchesDropped);
                    self.stats.add(Counter::RecordsDropped, count);
                    error!(
                        error = %err,
                        records = count,
                        attempts = attempt + 1,
                        "batch abandoned"
                    );
                    return;
                }
            }
        }
    }
}

/// One transaction per batch: look up each merged key, insert or update,
/// commit at the end. Any failure rolls the whole flush back.
async fn write_batch<S: ClientStore>(
    store: &S,
    merged: &HashMap<ClientKey, ClientUpdate>,
) -> Result<BatchOutcome, StorageError> {
    let mut tx = store.begin().await?;
    match stage_updates(&mut tx, merged).await {
        Ok(outcome) => {
            tx.commit().await?;
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rb_err) = tx.rollback().await {
                warn!(error = %rb_err, "rollback after failed flush also failed");
            }
            Err(err)
        }
    }
}

async fn stage_updates<T: ClientTx>(
    tx: &mut T,
    merged: &HashMap<ClientKey, ClientUpdate>,
) -> Result<BatchOutcome, StorageError> {
    let mut outcome = BatchOutcome::default();
    for (key, update) in merged {
        match tx.find_by_key(key).await? {
            None => {
                tx.insert(&ClientEntity::from_update(update)).await?;
                outcome.inserted += 1;
            }
            Some(mut entity) => {
                entity.apply(update);
                tx.update(&entity).await?;
                outcome.updated += 1;
            }
        }
    }
    Ok(outcome)
}
