//! Layered configuration for the agent and the server.
//!
//! Values come from a TOML file (default `$HOME/.opsfabric/config.toml`),
//! overlaid with `OPSFABRIC_*` environment variables. [`manager`] adds a
//! hot-reload holder with subscriber callbacks.

pub mod manager;

pub use manager::ConfigManager;

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{FabricError, Result};

/// Session endpoints and reconnect backoff bounds (agent side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub server_url: String,
    pub backup_url: String,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_retries: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080".into(),
            backup_url: String::new(),
            backoff_initial_ms: 1000,
            backoff_max_ms: 30_000,
            max_retries: 6,
        }
    }
}

/// Agent identity used at registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub agent_name: String,
    pub agent_token: String,
    pub host_id: i64,
    pub labels: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub level: String,
    /// Per-line log frames batched up to this size when flushing the outbox.
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            level: "info".into(),
            batch_size: 200,
            flush_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub heartbeat_interval_sec: u64,
    pub max_concurrent_tasks: usize,
    pub max_execution_time_sec: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_sec: 10,
            max_concurrent_tasks: 5,
            max_execution_time_sec: 7200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    /// Global download cap in MB/s, 0 means unlimited.
    pub bandwidth_limit_mb_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub max_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { max_size: 2000 }
    }
}

/// Server listener and registry bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_timeout_sec: u64,
    pub max_connections: usize,
    pub task_queue_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            heartbeat_timeout_sec: 60,
            max_connections: 1000,
            task_queue_size: 100,
        }
    }
}

/// Per-connection log ingest bounds (server side).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStreamConfig {
    pub buffer_size: usize,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            batch_size: 50,
            flush_interval_ms: 2000,
        }
    }
}

/// Event-bus stream names and result trim bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    pub log_key: String,
    pub result_key: String,
    pub status_key: String,
    pub task_stats_key: String,
    pub result_maxlen: usize,
    pub stats_push_interval_sec: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            log_key: "agent_logs".into(),
            result_key: "agent_results".into(),
            status_key: "agent_status".into(),
            task_stats_key: "agent_task_stats".into(),
            result_maxlen: 10_000,
            stats_push_interval_sec: 30,
        }
    }
}

/// Pending-store backend. Empty `redis_url` selects memory-only mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingConfig {
    pub redis_url: String,
    pub op_timeout_sec: u64,
    pub max_retries: u32,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            op_timeout_sec: 5,
            max_retries: 3,
        }
    }
}

/// Optional HMAC signing of control-plane requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub shared_secret: String,
    pub clock_skew_sec: u64,
    pub require_signature: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            shared_secret: String::new(),
            clock_skew_sec: 300,
            require_signature: false,
        }
    }
}

/// Complete configuration. Agent and server read different sections of the
/// same document so a host can run either role from one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub identity: IdentityConfig,
    pub logging: LoggingConfig,
    pub task: TaskConfig,
    pub resource_limit: ResourceLimitConfig,
    pub outbox: OutboxConfig,
    pub server: ServerConfig,
    pub log_stream: LogStreamConfig,
    pub streams: StreamsConfig,
    pub pending: PendingConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Default config path: `$HOME/.opsfabric/config.toml`.
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| FabricError::Config {
            message: "could not determine home directory".into(),
        })?;
        Ok(home.join(".opsfabric").join("config.toml"))
    }

    /// Load from a file (missing file yields defaults), then overlay
    /// environment variables and validate.
    pub fn load(path: &std::path::Path) -> Result<Config> {
        let mut cfg = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| FabricError::ConfigInvalid {
                message: e.to_string(),
            })?
        } else {
            Config::default()
        };
        cfg.apply_env();
        cfg.fill_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlay recognised `OPSFABRIC_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("OPSFABRIC_SERVER_URL") {
            self.connection.server_url = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_BACKUP_URL") {
            self.connection.backup_url = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_AGENT_NAME") {
            self.identity.agent_name = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_AGENT_TOKEN") {
            self.identity.agent_token = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_HOST_ID") {
            if let Ok(id) = v.parse() {
                self.identity.host_id = id;
            }
        }
        if let Ok(v) = env::var("OPSFABRIC_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_LOG_DIR") {
            self.logging.dir = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_REDIS_URL") {
            self.pending.redis_url = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_SHARED_SECRET") {
            self.auth.shared_secret = v;
        }
        if let Ok(v) = env::var("OPSFABRIC_SERVER_PORT") {
            if let Ok(port) = v.parse() {
                self.server.port = port;
            }
        }
    }

    fn fill_defaults(&mut self) {
        if self.identity.agent_name.is_empty() {
            self.identity.agent_name = hostname();
        }
        if self.task.heartbeat_interval_sec == 0 {
            self.task.heartbeat_interval_sec = 10;
        }
        if self.task.max_concurrent_tasks == 0 {
            self.task.max_concurrent_tasks = 5;
        }
        if self.task.max_execution_time_sec == 0 {
            self.task.max_execution_time_sec = 7200;
        }
        if self.outbox.max_size == 0 {
            self.outbox.max_size = 2000;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection.server_url.is_empty() {
            return Err(FabricError::ConfigInvalid {
                message: "connection.server_url must not be empty".into(),
            });
        }
        if self.connection.backoff_initial_ms == 0 {
            return Err(FabricError::ConfigInvalid {
                message: "connection.backoff_initial_ms must be greater than 0".into(),
            });
        }
        if self.connection.backoff_max_ms < self.connection.backoff_initial_ms {
            return Err(FabricError::ConfigInvalid {
                message: "connection.backoff_max_ms must be >= backoff_initial_ms".into(),
            });
        }
        if self.log_stream.buffer_size == 0 || self.log_stream.batch_size == 0 {
            return Err(FabricError::ConfigInvalid {
                message: "log_stream buffer_size and batch_size must be greater than 0".into(),
            });
        }
        if self.log_stream.batch_size > self.log_stream.buffer_size {
            return Err(FabricError::ConfigInvalid {
                message: "log_stream.batch_size must not exceed buffer_size".into(),
            });
        }
        if self.server.task_queue_size == 0 {
            return Err(FabricError::ConfigInvalid {
                message: "server.task_queue_size must be greater than 0".into(),
            });
        }
        if self.auth.require_signature && self.auth.shared_secret.is_empty() {
            return Err(FabricError::ConfigInvalid {
                message: "auth.require_signature set but shared_secret is empty".into(),
            });
        }
        Ok(())
    }
}

fn hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-agent".into())
}
