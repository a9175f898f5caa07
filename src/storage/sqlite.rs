//! SQLite-backed client store.
//!
//! One row per (client IP, interface) key, enforced by a unique index.
//! Timestamps are stored as RFC 3339 TEXT in UTC, which keeps lexicographic
//! and chronological order in agreement for range scans and purges.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};

use crate::record::{ClientEntity, ClientKey};
use crate::storage::{ClientStore, ClientTx, StorageError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ntp_clients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        client_ip TEXT NOT NULL,
        client_port INTEGER NOT NULL,
        server_ip TEXT NOT NULL,
        server_port INTEGER NOT NULL,
        interface TEXT NOT NULL,
        version INTEGER NOT NULL,
        stratum INTEGER NOT NULL,
        leap INTEGER NOT NULL,
        poll INTEGER NOT NULL,
        precision INTEGER NOT NULL,
        root_delay REAL NOT NULL,
        root_dispersion REAL NOT NULL,
        reference_id TEXT NOT NULL,
        reference_ts REAL NOT NULL,
        originate_ts REAL NOT NULL,
        receive_ts REAL NOT NULL,
        transmit_ts REAL NOT NULL,
        client_to_server_latency REAL,
        server_processing_time REAL,
        total_process_time REAL,
        packet_length INTEGER NOT NULL,
        session_ts TEXT NOT NULL,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        session_count INTEGER NOT NULL,
        UNIQUE(client_ip, interface)
    );",
    "CREATE INDEX IF NOT EXISTS idx_clients_last_seen ON ntp_clients(last_seen);",
    "CREATE INDEX IF NOT EXISTS idx_clients_interface_last_seen
        ON ntp_clients(interface, last_seen);",
];

const COLUMNS: &str = "client_ip, client_port, server_ip, server_port, interface,
    version, stratum, leap, poll, precision, root_delay, root_dispersion,
    reference_id, reference_ts, originate_ts, receive_ts, transmit_ts,
    client_to_server_latency, server_processing_time, total_process_time,
    packet_length, session_ts, first_seen, last_seen, session_count";

// Row mapping kept separate from the domain type so sqlx never needs to
// know about IpAddr or DateTime encodings.
#[derive(Debug, sqlx::FromRow)]
struct ClientRow {
    client_ip: String,
    client_port: i64,
    server_ip: String,
    server_port: i64,
    interface: String,
    version: i64,
    stratum: i64,
    leap: i64,
    poll: i64,
    precision: i64,
    root_delay: f64,
    root_dispersion: f64,
    reference_id: String,
    reference_ts: f64,
    originate_ts: f64,
    receive_ts: f64,
    transmit_ts: f64,
    client_to_server_latency: Option<f64>,
    server_processing_time: Option<f64>,
    total_process_time: Option<f64>,
    packet_length: i64,
    session_ts: String,
    first_seen: String,
    last_seen: String,
    session_count: i64,
}

impl ClientRow {
    fn into_entity(self) -> Result<ClientEntity, StorageError> {
        let corrupt = |reason: String| StorageError::CorruptRow {
            key: format!("{}%{}", self.client_ip, self.interface),
            reason,
        };
        let parse_ts = |field: &str, raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| corrupt(format!("{field}: {err}")))
        };

        Ok(ClientEntity {
            client_ip: self
                .client_ip
                .parse()
                .map_err(|err| corrupt(format!("client_ip: {err}")))?,
            client_port: self.client_port as u16,
            server_ip: self
                .server_ip
                .parse()
                .map_err(|err| corrupt(format!("server_ip: {err}")))?,
            server_port: self.server_port as u16,
            interface: self.interface.clone(),
            version: self.version as u8,
            stratum: self.stratum as u8,
            leap: self.leap as u8,
            poll: self.poll as i8,
            precision: self.precision as i8,
            root_delay: self.root_delay,
            root_dispersion: self.root_dispersion,
            reference_id: self.reference_id.clone(),
            reference_ts: self.reference_ts,
            originate_ts: self.originate_ts,
            receive_ts: self.receive_ts,
            transmit_ts: self.transmit_ts,
            client_to_server_latency: self.client_to_server_latency,
            server_processing_time: self.server_processing_time,
            total_process_time: self.total_process_time,
            packet_length: self.packet_length as u32,
            session_ts: parse_ts("session_ts", &self.session_ts)?,
            first_seen: parse_ts("first_seen", &self.first_seen)?,
            last_seen: parse_ts("last_seen", &self.last_seen)?,
            session_count: self.session_count,
        })
    }
}

/// Client store persisting to a local SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open or create the database file and bootstrap the schema.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StorageError::Unavailable(format!("{}: {err}", parent.display())))?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Pool-level read outside any batch transaction.
    pub async fn find_by_key(&self, key: &ClientKey) -> Result<Option<ClientEntity>, StorageError> {
        let row = sqlx::query_as::<_, ClientRow>(&format!(
            "SELECT {COLUMNS} FROM ntp_clients WHERE client_ip = ?1 AND interface = ?2"
        ))
        .bind(key.client_ip.to_string())
        .bind(&key.interface)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ClientRow::into_entity).transpose()
    }

    /// Total number of client rows.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ntp_clients")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

impl ClientStore for SqliteStore {
    type Tx = SqliteTx;

    fn name(&self) -> &str {
        "sqlite"
    }

    async fn begin(&self) -> Result<SqliteTx, StorageError> {
        let tx = self.pool.begin().await?;
        Ok(SqliteTx { tx })
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let done = sqlx::query("DELETE FROM ntp_clients WHERE last_seen < ?1")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

/// One open write transaction. Dropping it rolls back.
pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

impl ClientTx for SqliteTx {
    async fn find_by_key(&mut self, key: &ClientKey) -> Result<Option<ClientEntity>, StorageError> {
        let row = sqlx::query_as::<_, ClientRow>(&format!(
            "SELECT {COLUMNS} FROM ntp_clients WHERE client_ip = ?1 AND interface = ?2"
        ))
        .bind(key.client_ip.to_string())
        .bind(&key.interface)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(ClientRow::into_entity).transpose()
    }

    async fn insert(&mut self, entity: &ClientEntity) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "INSERT INTO ntp_clients ({COLUMNS}) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25
            )"
        ))
        .bind(entity.client_ip.to_string())
        .bind(i64::from(entity.client_port))
        .bind(entity.server_ip.to_string())
        .bind(i64::from(entity.server_port))
        .bind(&entity.interface)
        .bind(i64::from(entity.version))
        .bind(i64::from(entity.stratum))
        .bind(i64::from(entity.leap))
        .bind(i64::from(entity.poll))
        .bind(i64::from(entity.precision))
        .bind(entity.root_delay)
        .bind(entity.root_dispersion)
        .bind(&entity.reference_id)
        .bind(entity.reference_ts)
        .bind(entity.originate_ts)
        .bind(entity.receive_ts)
        .bind(entity.transmit_ts)
        .bind(entity.client_to_server_latency)
        .bind(entity.server_processing_time)
        .bind(entity.total_process_time)
        .bind(i64::from(entity.packet_length))
        .bind(entity.session_ts.to_rfc3339())
        .bind(entity.first_seen.to_rfc3339())
        .bind(entity.last_seen.to_rfc3339())
        .bind(entity.session_count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update(&mut self, entity: &ClientEntity) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE ntp_clients SET
                client_port = ?1, server_ip = ?2, server_port = ?3,
                version = ?4, stratum = ?5, leap = ?6, poll = ?7, precision = ?8,
                root_delay = ?9, root_dispersion = ?10, reference_id = ?11,
                reference_ts = ?12, originate_ts = ?13, receive_ts = ?14, transmit_ts = ?15,
                client_to_server_latency = ?16, server_processing_time = ?17,
                total_process_time = ?18, packet_length = ?19, session_ts = ?20,
                last_seen = ?21, session_count = ?22
             WHERE client_ip = ?23 AND interface = ?24",
        )
        .bind(i64::from(entity.client_port))
        .bind(entity.server_ip.to_string())
        .bind(i64::from(entity.server_port))
        .bind(i64::from(entity.version))
        .bind(i64::from(entity.stratum))
        .bind(i64::from(entity.leap))
        .bind(i64::from(entity.poll))
        .bind(i64::from(entity.precision))
        .bind(entity.root_delay)
        .bind(entity.root_dispersion)
        .bind(&entity.reference_id)
        .bind(entity.reference_ts)
        .bind(entity.originate_ts)
        .bind(entity.receive_ts)
        .bind(entity.transmit_ts)
        .bind(entity.client_to_server_latency)
        .bind(entity.server_processing_time)
        .bind(entity.total_process_time)
        .bind(i64::from(entity.packet_length))
        .bind(entity.session_ts.to_rfc3339())
        .bind(entity.last_seen.to_rfc3339())
        .bind(entity.session_count)
        .bind(entity.client_ip.to_string())
        .bind(&entity.interface)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
