//! Configuration for the brain server and worker
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority, `BRAIN_*`)
//! 2. Config file (~/.config/brain/config.toml, or `$BRAIN_CONFIG`)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;


/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration, shared by the server and worker processes.
/// Both must point at the same `data_dir`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the store file and the execution log directory
    pub data_dir: PathBuf,

    /// Steady-state upper bound on hot-tier memory rows
    pub hot_capacity: usize,

    /// Inactive sessions older than this are reaped
    pub session_timeout_hours: u64,

    /// Claim-loop slots per worker process (min..=max)
    pub worker: WorkerLimits,

    /// SIGTERM/SIGKILL wall-clock deadline per execution
    pub execution_timeout_secs: u64,

    /// Per-stream byte cap before the truncation flag
    pub inline_output_cap: u64,

    /// Bind address of the monitoring API
    pub monitor_addr: SocketAddr,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker concurrency bounds.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    pub min: usize,
    pub max: usize,
}

impl WorkerLimits {
    /// Clamp a requested slot count into the configured range.
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.min).clamp(self.min.max(1), self.max.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level filter when RUST_LOG is unset: trace, debug, info, warn, error
    pub level: String,
    /// Also write logs to a daily-rotated file under `dir`
    pub file_enabled: bool,
    /// Log file directory (defaults to <data_dir>/logs)
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            dir: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("brain");
        Self {
            data_dir,
            hot_capacity: 300,
            session_timeout_hours: 24,
            worker: WorkerLimits { min: 1, max: 4 },
            execution_timeout_secs: 300,
            inline_output_cap: 1024 * 1024,
            monitor_addr: "127.0.0.1:7741".parse().unwrap(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    // ── Derived paths ─────────────────────────────────────────────────────

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("brain.db")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.data_dir.join("executions")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.data_dir.join("workers")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// A claim older than twice the execution deadline whose worker has no
    /// heartbeat is stale.
    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs * 2)
    }

    // ── Loading ───────────────────────────────────────────────────────────

    /// Path of the config file (`$BRAIN_CONFIG` overrides the default).
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("BRAIN_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("brain").join("config.toml"))
    }

    /// Load configuration: defaults, then the config file, then `BRAIN_*`
    /// environment variables.
    pub fn load() -> Self {
        let mut config = Config::default();

        if let Some(path) = Self::config_path() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<FileConfig>(&contents) {
                    Ok(file) => config.apply_file(file),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "config file invalid, using defaults")
                    }
                },
                Err(_) => {} // missing file is fine
            }
        }

        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(dir) = file.data_dir {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = file.hot_capacity {
            self.hot_capacity = v;
        }
        if let Some(v) = file.session_timeout_hours {
            self.session_timeout_hours = v;
        }
        if let Some(worker) = file.worker {
            if let Some(v) = worker.min {
                self.worker.min = v;
            }
            if let Some(v) = worker.max {
                self.worker.max = v;
            }
        }
        if let Some(v) = file.execution_timeout_secs {
            self.execution_timeout_secs = v;
        }
        if let Some(v) = file.inline_output_cap {
            self.inline_output_cap = v;
        }
        if let Some(addr) = file.monitor_addr {
            match addr.parse() {
                Ok(addr) => self.monitor_addr = addr,
                Err(e) => tracing::warn!(addr, error = %e, "invalid monitor_addr in config file"),
            }
        }
        if let Some(logging) = file.logging {
            if let Some(v) = logging.level {
                self.logging.level = v;
            }
            if let Some(v) = logging.file_enabled {
                self.logging.file_enabled = v;
            }
            if let Some(v) = logging.dir {
                self.logging.dir = Some(PathBuf::from(v));
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("BRAIN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(v) = env_parse("BRAIN_HOT_CAPACITY") {
            self.hot_capacity = v;
        }
        if let Some(v) = env_parse("BRAIN_SESSION_TIMEOUT_HOURS") {
            self.session_timeout_hours = v;
        }
        if let Some(v) = env_parse("BRAIN_WORKER_MIN") {
            self.worker.min = v;
        }
        if let Some(v) = env_parse("BRAIN_WORKER_MAX") {
            self.worker.max = v;
        }
        if let Some(v) = env_parse("BRAIN_EXECUTION_TIMEOUT_SECS") {
            self.execution_timeout_secs = v;
        }
        if let Some(v) = env_parse("BRAIN_INLINE_OUTPUT_CAP") {
            self.inline_output_cap = v;
        }
        if let Some(v) = env_parse("BRAIN_MONITOR_ADDR") {
            self.monitor_addr = v;
        }
        if let Ok(level) = std::env::var("BRAIN_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    // ── Template ──────────────────────────────────────────────────────────

    /// Serialize the effective configuration as a commented TOML template.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# Brain configuration
# Values here are overridden by BRAIN_* environment variables.

# Location of the store file and execution logs
data_dir = {data_dir:?}

# Steady-state cap on hot-tier memory rows
hot_capacity = {hot_capacity}

# Inactive sessions older than this are reaped
session_timeout_hours = {session_timeout_hours}

# SIGTERM/SIGKILL wall-clock deadline per execution
execution_timeout_secs = {execution_timeout_secs}

# Per-stream output byte cap before truncation
inline_output_cap = {inline_output_cap}

# Monitoring API bind address (localhost only by default)
monitor_addr = "{monitor_addr}"

[worker]
# Claim-loop slots per worker process
min = {worker_min}
max = {worker_max}

[logging]
# trace, debug, info, warn, error
level = "{level}"
# Also write logs to a daily-rotated file
file_enabled = {file_enabled}
"#,
            data_dir = self.data_dir.to_string_lossy(),
            hot_capacity = self.hot_capacity,
            session_timeout_hours = self.session_timeout_hours,
            execution_timeout_secs = self.execution_timeout_secs,
            inline_output_cap = self.inline_output_cap,
            monitor_addr = self.monitor_addr,
            worker_min = self.worker.min,
            worker_max = self.worker.max,
            level = self.logging.level,
            file_enabled = self.logging.file_enabled,
        )
    }

    /// Write the template on first run so users can discover the knobs.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        if std::fs::write(&path, Config::default().to_toml()).is_ok() {
            tracing::info!(path = %path.display(), "wrote config template");
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (everything optional; absent keys keep defaults)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub data_dir: Option<String>,
    pub hot_capacity: Option<usize>,
    pub session_timeout_hours: Option<u64>,
    pub worker: Option<FileWorkerLimits>,
    pub execution_timeout_secs: Option<u64>,
    pub inline_output_cap: Option<u64>,
    pub monitor_addr: Option<String>,
    pub logging: Option<FileLoggingConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileWorkerLimits {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLoggingConfig {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub dir: Option<String>,
}
