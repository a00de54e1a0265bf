use std::path::PathBuf;
use std::time::Duration;

/// Process configuration, read once from `PARKD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// Session users that act as administrators.
    pub admins: Vec<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tick: Duration,
    pub job_timeout: Duration,
    pub backup_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    match var(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring unparseable {name}={raw:?}");
            default
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(var("PARKD_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let backup_dir = var("PARKD_BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("backups"));
        Self {
            bind: var("PARKD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed("PARKD_PORT", 5433),
            data_dir,
            password: var("PARKD_PASSWORD").unwrap_or_else(|| "parkd".into()),
            admins: split_list(&var("PARKD_ADMINS").unwrap_or_else(|| "admin".into())),
            max_connections: parsed("PARKD_MAX_CONNECTIONS", 256),
            compact_threshold: parsed("PARKD_COMPACT_THRESHOLD", 1000),
            tick: Duration::from_secs(parsed("PARKD_TICK_SECS", 600u64).max(1)),
            job_timeout: Duration::from_secs(parsed("PARKD_JOB_TIMEOUT_SECS", 120u64).max(1)),
            backup_dir,
            metrics_port: var("PARKD_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls_cert: var("PARKD_TLS_CERT"),
            tls_key: var("PARKD_TLS_KEY"),
        }
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == user)
    }
}
