//! Configuration for the enrollment engine.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (ENROLLSYNC_HOME, ENROLLSYNC_DATABASE)
//! 2. Config file (.enrollsync/config.yaml)
//! 3. Defaults (~/.enrollsync)
//!
//! Config file discovery:
//! - Searches current directory and parents for .enrollsync/config.yaml
//! - Paths in config file are relative to the .enrollsync/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .enrollsync/)
    pub home: Option<String>,
    /// SQLite database file (relative to .enrollsync/)
    pub database: Option<String>,
}

/// Engine section of the config file; every field is optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    pub lock_timeout_ms: Option<u64>,
    pub lock_poll_interval_ms: Option<u64>,
    pub lock_lease_seconds: Option<u64>,
    pub idempotency_ttl_hours: Option<u64>,
    pub failure_policy: Option<FailurePolicy>,
    pub legacy_mirror: Option<bool>,
    pub busy_timeout_ms: Option<u64>,
}

/// What to do when the lock or idempotency subsystem errors.
///
/// `FailOpen` keeps the operation available without that guarantee;
/// `FailClosed` surfaces a retryable infrastructure error instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailOpen,
    FailClosed,
}

/// Tunables of the operation pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSettings {
    /// Maximum wait for an operation lock (0 = try once)
    pub lock_timeout_ms: u64,

    /// Initial polling interval while waiting for a lock
    pub lock_poll_interval_ms: u64,

    /// Lease after which an abandoned lock may be reclaimed by others
    pub lock_lease_seconds: u64,

    /// How long completed results are replayed
    pub idempotency_ttl_hours: u64,

    pub failure_policy: FailurePolicy,

    /// Keep writing the legacy progress table
    pub legacy_mirror: bool,

    /// SQLite busy timeout for cross-process contention
    pub busy_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            lock_poll_interval_ms: 25,
            lock_lease_seconds: 300,
            idempotency_ttl_hours: 24,
            failure_policy: FailurePolicy::FailOpen,
            legacy_mirror: true,
            busy_timeout_ms: 5_000,
        }
    }
}

impl EngineSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_seconds)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_hours * 3600)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Overlay values present in the config file onto these settings
    fn apply(mut self, overrides: &EngineConfig) -> Self {
        if let Some(v) = overrides.lock_timeout_ms {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = overrides.lock_poll_interval_ms {
            self.lock_poll_interval_ms = v;
        }
        if let Some(v) = overrides.lock_lease_seconds {
            self.lock_lease_seconds = v;
        }
        if let Some(v) = overrides.idempotency_ttl_hours {
            self.idempotency_ttl_hours = v;
        }
        if let Some(v) = overrides.failure_policy {
            self.failure_policy = v;
        }
        if let Some(v) = overrides.legacy_mirror {
            self.legacy_mirror = v;
        }
        if let Some(v) = overrides.busy_timeout_ms {
            self.busy_timeout_ms = v;
        }
        self
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Pipeline settings
    pub engine: EngineSettings,
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".enrollsync").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to a base directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".enrollsync");

    let config_file = find_config_file();
    let parsed = config_file
        .as_deref()
        .map(load_config_file)
        .transpose()?;

    // Paths in the file are relative to the .enrollsync/ directory
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Ok(env_home) = std::env::var("ENROLLSYNC_HOME") {
        PathBuf::from(env_home)
    } else if let Some(home) = parsed.as_ref().and_then(|c| c.paths.home.as_deref()) {
        resolve_path(config_dir, home)
    } else {
        default_home
    };

    let database = if let Ok(env_db) = std::env::var("ENROLLSYNC_DATABASE") {
        PathBuf::from(env_db)
    } else if let Some(db) = parsed.as_ref().and_then(|c| c.paths.database.as_deref()) {
        resolve_path(config_dir, db)
    } else {
        home.join("enrollsync.db")
    };

    let engine = match parsed.as_ref().and_then(|c| c.engine.as_ref()) {
        Some(overrides) => EngineSettings::default().apply(overrides),
        None => EngineSettings::default(),
    };

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        engine,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the SQLite database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(".enrollsync");
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  database: ./state/engine.db
engine:
  lock_timeout_ms: 250
  failure_policy: fail_closed
  legacy_mirror: false
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.paths.database, Some("./state/engine.db".to_string()));

        let engine = EngineSettings::default().apply(config.engine.as_ref().unwrap());
        assert_eq!(engine.lock_timeout_ms, 250);
        assert_eq!(engine.failure_policy, FailurePolicy::FailClosed);
        assert!(!engine.legacy_mirror);
        // Unset values keep their defaults
        assert_eq!(engine.idempotency_ttl_hours, 24);
    }

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(settings.lock_timeout(), Duration::from_secs(5));
        assert_eq!(settings.idempotency_ttl(), Duration::from_secs(24 * 3600));
        assert!(settings.legacy_mirror);
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/srv/app/.enrollsync");

        assert_eq!(
            resolve_path(&base, "engine.db"),
            PathBuf::from("/srv/app/.enrollsync/engine.db")
        );
        assert_eq!(
            resolve_path(&base, "/var/lib/enrollsync.db"),
            PathBuf::from("/var/lib/enrollsync.db")
        );
    }
}
