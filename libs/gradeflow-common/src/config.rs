use crate::paths::FileStore;
use crate::queue::QueueTopology;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub archive: ArchiveConfig,
    pub paths: PathsConfig,
    pub email: EmailConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
    pub topology: QueueTopology,
    pub max_redeliveries: u32,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub instances: usize,
    pub name: String,
    pub workdir: PathBuf,
    /// Parse and acknowledge only, never run containers
    pub void: bool,
    pub docker_memory_bytes: i64,
    pub docker_timeout: Duration,
    pub http_timeout: Duration,
    pub health_addr: String,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub interval: Duration,
    /// Zero disables orphaned-lock reconciliation
    pub stale_lock_after: Duration,
    pub catalog_path: PathBuf,
    pub health_addr: String,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    pub uploads: PathBuf,
    pub generated_files: PathBuf,
}

impl PathsConfig {
    pub fn file_store(&self) -> FileStore {
        FileStore::new(&self.uploads, &self.generated_files)
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub send: bool,
    pub from: String,
    pub sendmail_binary: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

pub const DEFAULT_DOCKER_MEMORY: i64 = 200 * 1024 * 1024;

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Default worker name: first non-blank host name, else `worker`.
/// Consumer tags derived from it must be unique per process.
fn host_name(from_env: Option<String>, from_file: Option<String>) -> String {
    [from_env, from_file]
        .into_iter()
        .flatten()
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs_or(key: &str, default: u64) -> Duration {
    Duration::from_secs(parse_or(key, default))
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            broker: BrokerConfig::from_env(),
            worker: WorkerConfig::from_env(),
            archive: ArchiveConfig::from_env(),
            paths: PathsConfig::from_env(),
            email: EmailConfig::from_env(),
            log: LogConfig::from_env(),
        }
    }

    /// Read `.env` (if any) before the environment
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_env()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            topology: QueueTopology {
                exchange: var_or("BROKER_EXCHANGE", "infomark-worker-exchange"),
                queue: var_or("BROKER_QUEUE", "infomark-worker-submissions"),
                routing_key: var_or("BROKER_ROUTING_KEY", "submissions"),
            },
            max_redeliveries: parse_or("BROKER_MAX_REDELIVERIES", 3),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            instances: parse_or("WORKER_INSTANCES", 1usize).max(1),
            name: env::var("WORKER_NAME").unwrap_or_else(|_| {
                host_name(
                    env::var("HOSTNAME").ok(),
                    std::fs::read_to_string("/etc/hostname").ok(),
                )
            }),
            workdir: env::var("WORKER_WORKDIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir()),
            void: parse_or("WORKER_VOID", false),
            docker_memory_bytes: env::var("DOCKER_MEMORY")
                .ok()
                .and_then(|v| parse_byte_size(&v))
                .unwrap_or(DEFAULT_DOCKER_MEMORY),
            docker_timeout: secs_or("DOCKER_TIMEOUT_SECS", 300),
            http_timeout: secs_or("HTTP_TIMEOUT_SECS", 30),
            health_addr: var_or("WORKER_HEALTH_ADDR", "0.0.0.0:9100"),
        }
    }
}

impl ArchiveConfig {
    pub fn from_env() -> Self {
        Self {
            interval: secs_or("ARCHIVE_INTERVAL_SECS", 300),
            stale_lock_after: secs_or("ARCHIVE_STALE_LOCK_AFTER_SECS", 1800),
            catalog_path: PathBuf::from(var_or("ARCHIVE_CATALOG", "generated_files/catalog.json")),
            health_addr: var_or("ARCHIVE_HEALTH_ADDR", "0.0.0.0:9101"),
        }
    }
}

impl PathsConfig {
    pub fn from_env() -> Self {
        Self {
            uploads: PathBuf::from(var_or("UPLOADS_DIR", "uploads")),
            generated_files: PathBuf::from(var_or("GENERATED_FILES_DIR", "generated_files")),
        }
    }
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            send: parse_or("EMAIL_SEND", false),
            from: var_or("EMAIL_FROM", "no-reply@localhost"),
            sendmail_binary: PathBuf::from(var_or("SENDMAIL_BINARY", "/usr/sbin/sendmail")),
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            level: var_or("LOG_LEVEL", "info"),
            json: var_or("LOG_FORMAT", "text").eq_ignore_ascii_case("json"),
            file: env::var("LOG_FILE").ok().filter(|v| !v.is_empty()).map(PathBuf::from),
        }
    }
}

/// Parse sizes like `200MiB`, `1.5G`, `512k` or plain byte counts.
/// Decimal suffixes (`KB`, `MB`, `GB`) and bare letters are treated as
/// binary multiples, as container runtimes do.
pub fn parse_byte_size(input: &str) -> Option<i64> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" | "KIB" => 1024.0,
        "M" | "MB" | "MIB" => 1024.0 * 1024.0,
        "G" | "GB" | "GIB" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes < 1.0 || bytes > i64::MAX as f64 {
        return None;
    }
    Some(bytes as i64)
}
