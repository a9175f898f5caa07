use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration, shared by both roles. A worker process reads the
/// `worker` section, a server process the `server` section; carrying both in
/// one file lets a fleet ship a single config.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Capture worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Ingestion server configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Capture worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Interface this worker monitors; stamped onto records. Default: "eth0".
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Server port used to classify requests and responses. Default: 123.
    #[serde(default = "default_ntp_port")]
    pub ntp_port: u16,

    /// How long an unanswered request stays pending. Default: 2s.
    #[serde(default = "default_pairing_timeout", with = "humantime_serde")]
    pub pairing_timeout: Duration,

    /// How often expired pending requests are swept. Default: 1s.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Upper bound on pending unanswered requests. Default: 4096.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Capture-to-pairer channel capacity. Default: 1024.
    #[serde(default = "default_packet_queue_size")]
    pub packet_queue_size: usize,

    /// Pairer-to-uplink channel capacity; overflow drops records. Default: 1024.
    #[serde(default = "default_send_queue_size")]
    pub send_queue_size: usize,

    /// Ingestion server address (host:port). Default: "127.0.0.1:9123".
    #[serde(default = "default_ingest_addr")]
    pub ingest_addr: String,

    /// Initial reconnect backoff. Default: 1s.
    #[serde(default = "default_reconnect_min", with = "humantime_serde")]
    pub reconnect_min: Duration,

    /// Backoff cap after repeated failures. Default: 30s.
    #[serde(default = "default_reconnect_max", with = "humantime_serde")]
    pub reconnect_max: Duration,

    /// Largest frame the uplink will emit, in bytes. Default: 64KiB.
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,

    /// How often counter totals are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Ingestion server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address for worker connections. Default: "0.0.0.0:9123".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// SQLite database file. Default: "chronoor.sqlite3".
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Shared record queue capacity; a full queue blocks producers. Default: 1000.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Records per batch before an immediate flush. Default: 100.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,

    /// Longest a queued record waits before its batch flushes. Default: 5s.
    #[serde(default = "default_batch_max_interval", with = "humantime_serde")]
    pub batch_max_interval: Duration,

    /// Largest frame accepted from a worker, in bytes. Default: 64KiB.
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,

    /// Retries before a failing batch is abandoned. Default: 3.
    #[serde(default = "default_flush_retries")]
    pub flush_retries: u32,

    /// Pause between flush retries. Default: 500ms.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Drop client rows idle longer than this. Unset disables purging.
    #[serde(default, with = "humantime_serde")]
    pub retention: Option<Duration>,

    /// How often the retention sweep runs. Default: 1h.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,

    /// How often counter totals are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

fn default_ntp_port() -> u16 {
    123
}

fn default_pairing_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_pending() -> usize {
    4096
}

fn default_packet_queue_size() -> usize {
    1024
}

fn default_send_queue_size() -> usize {
    1024
}

fn default_ingest_addr() -> String {
    "127.0.0.1:9123".to_string()
}

fn default_reconnect_min() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(30)
}

fn default_max_frame() -> usize {
    64 * 1024
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_listen_addr() -> String {
    "0.0.0.0:9123".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("chronoor.sqlite3")
}

fn default_queue_size() -> usize {
    1000
}

fn default_batch_max_size() -> usize {
    100
}

fn default_batch_max_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_flush_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            worker: WorkerConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            ntp_port: default_ntp_port(),
            pairing_timeout: default_pairing_timeout(),
            sweep_interval: default_sweep_interval(),
            max_pending: default_max_pending(),
            packet_queue_size: default_packet_queue_size(),
            send_queue_size: default_send_queue_size(),
            ingest_addr: default_ingest_addr(),
            reconnect_min: default_reconnect_min(),
            reconnect_max: default_reconnect_max(),
            max_frame: default_max_frame(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
            queue_size: default_queue_size(),
            batch_max_size: default_batch_max_size(),
            batch_max_interval: default_batch_max_interval(),
            max_frame: default_max_frame(),
            flush_retries: default_flush_retries(),
            retry_backoff: default_retry_backoff(),
            retention: None,
            purge_interval: default_purge_interval(),
            stats_interval: default_stats_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.worker.interface.is_empty() {
            bail!("worker.interface is required");
        }
        if self.worker.ingest_addr.is_empty() {
            bail!("worker.ingest_addr is required");
        }
        if self.worker.pairing_timeout.is_zero() {
            bail!("worker.pairing_timeout must be positive");
        }
        if self.worker.sweep_interval.is_zero() {
            bail!("worker.sweep_interval must be positive");
        }
        if self.worker.max_pending == 0 {
            bail!("worker.max_pending must be positive");
        }
        if self.worker.packet_queue_size == 0 {
            bail!("worker.packet_queue_size must be positive");
        }
        if self.worker.send_queue_size == 0 {
            bail!("worker.send_queue_size must be positive");
        }
        if self.worker.max_frame == 0 {
            bail!("worker.max_frame must be positive");
        }
        if self.worker.reconnect_min.is_zero() {
            bail!("worker.reconnect_min must be positive");
        }
        if self.worker.reconnect_max < self.worker.reconnect_min {
            bail!("worker.reconnect_max must be at least worker.reconnect_min");
        }

        if self.server.listen_addr.is_empty() {
            bail!("server.listen_addr is required");
        }
        if self.server.db_path.as_os_str().is_empty() {
            bail!("server.db_path is required");
        }
        if self.server.queue_size == 0 {
            bail!("server.queue_size must be positive");
        }
        if self.server.batch_max_size == 0 {
            bail!("server.batch_max_size must be positive");
        }
        if self.server.batch_max_interval.is_zero() {
            bail!("server.batch_max_interval must be positive");
        }
        if self.server.max_frame == 0 {
            bail!("server.max_frame must be positive");
        }
        if let Some(retention) = self.server.retention {
            if retention.is_zero() {
                bail!("server.retention must be positive when set");
            }
            if self.server.purge_interval.is_zero() {
                bail!("server.purge_interval must be positive");
            }
        }

        Ok(())
    }
}
