//! Storage engines for per-client NTP state.
//!
//! The batch writer is generic over [`ClientStore`]; an engine hands out
//! transactions and the writer drives find/insert/update inside them. A
//! transaction either commits as a whole or leaves no trace.

pub mod sqlite;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::record::{ClientEntity, ClientKey};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt row for {key}: {reason}")]
    CorruptRow { key: String, reason: String },
}

/// Per-flush write accounting, reported by the batch writer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub updated: u64,
}

/// A storage engine that can persist client entities transactionally.
pub trait ClientStore: Send + Sync {
    type Tx: ClientTx;

    /// Returns the engine's name for logging.
    fn name(&self) -> &str;

    /// Open a transaction covering one batch flush.
    fn begin(&self) -> impl std::future::Future<Output = Result<Self::Tx, StorageError>> + Send;

    /// Delete entities whose last activity predates `cutoff`. Returns how
    /// many rows went away.
    fn purge_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, StorageError>> + Send;
}

/// One open transaction. Dropping it without [`ClientTx::commit`] must
/// behave like a rollback.
pub trait ClientTx: Send {
    fn find_by_key(
        &mut self,
        key: &ClientKey,
    ) -> impl std::future::Future<Output = Result<Option<ClientEntity>, StorageError>> + Send;

    fn insert(
        &mut self,
        entity: &ClientEntity,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn update(
        &mut self,
        entity: &ClientEntity,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn commit(self) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    fn rollback(self) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}
