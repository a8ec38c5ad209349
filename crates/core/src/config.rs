//! Service configuration
//!
//! Loaded from TOML, then overridden by `SNAPWATCH_*` environment variables,
//! then by command-line flags (applied by the CLI).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "SNAPWATCH_";

/// Default file name looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "snapwatch.toml";

/// Upper bound for every `*_seconds` setting (one year)
pub const MAX_INTERVAL_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Upper bound for `retention_days` (one hundred years)
pub const MAX_RETENTION_DAYS: u64 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Retention policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    /// Keep the newest `max_snapshots`
    #[default]
    Count,
    /// Keep snapshots younger than `retention_days`
    Time,
}

impl std::str::FromStr for CleanupMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(CleanupMode::Count),
            "time" => Ok(CleanupMode::Time),
            other => Err(ConfigError::Invalid(format!(
                "cleanup_mode must be 'count' or 'time', got '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupMode::Count => f.write_str("count"),
            CleanupMode::Time => f.write_str("time"),
        }
    }
}

/// Snapwatch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Subvolume to watch and snapshot
    pub watch_dir: PathBuf,
    /// Directory snapshots are created in
    pub snapshot_dir: PathBuf,
    /// Count-mode retention threshold
    pub max_snapshots: usize,
    /// Retention policy selector
    pub cleanup_mode: CleanupMode,
    /// Age-mode retention threshold
    pub retention_days: u64,
    /// Minimum spacing between automatic snapshots
    pub cooldown_seconds: u64,
    /// Quiet period after the last change before a batch fires
    pub debounce_seconds: u64,
    /// Force a batch to fire after this long even if writes never pause
    /// (default: 10 x debounce_seconds)
    pub max_batch_age_seconds: Option<u64>,
    /// Plain directory copies instead of the privileged tool
    pub test_mode: bool,
    /// Gitignore-style patterns the watcher drops
    pub exclude_patterns: Vec<String>,
    /// Volume management tool binary
    pub tool_path: PathBuf,
    /// Upper bound for a single tool invocation
    pub tool_timeout_seconds: u64,
    /// Free space required on the snapshot volume before creating
    pub min_free_bytes: u64,
    /// Watch re-arm attempts before giving up
    pub watch_retry_attempts: u32,
    /// Initial re-arm backoff, doubled per attempt
    pub watch_retry_backoff_ms: u64,
    /// Optional log file (rotated daily)
    pub log_file: Option<PathBuf>,
    /// Default log level when RUST_LOG is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::from("/data/mydir"),
            snapshot_dir: PathBuf::from("/data/snapshots"),
            max_snapshots: 50,
            cleanup_mode: CleanupMode::Count,
            retention_days: 7,
            cooldown_seconds: 60,
            debounce_seconds: 5,
            max_batch_age_seconds: None,
            test_mode: false,
            exclude_patterns: Vec::new(),
            tool_path: PathBuf::from("btrfs"),
            tool_timeout_seconds: 120,
            min_free_bytes: 1024 * 1024 * 1024,
            watch_retry_attempts: 5,
            watch_retry_backoff_ms: 1000,
            log_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Discover, parse, override from the environment and validate
    ///
    /// Returns the configuration and the file it came from, if any.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let source = Self::discover(explicit);

        let mut config = match &source {
            Some(path) => {
                let config = Self::from_file(path)?;
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            None => {
                info!("No config file found, using default configuration");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok((config, source))
    }

    /// Candidate config locations, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from(CONFIG_FILE_NAME),
            PathBuf::from("/etc/snapwatch/config.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("snapwatch").join("config.toml"));
        }
        paths
    }

    /// Find the config file to use
    ///
    /// A missing explicit path is reported and discovery continues with the
    /// default locations.
    pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Some(path.to_path_buf());
            }
            warn!(path = %path.display(), "Config file not found");
        }

        Self::search_paths().into_iter().find(|p| p.exists())
    }

    /// Parse a config file without applying overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `SNAPWATCH_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (used by tests)
    ///
    /// Unparseable integers are logged and skipped.
    pub fn apply_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key)
                .filter(|v| !v.is_empty())
                .map(|v| (key, v))
        };

        if let Some((key, v)) = get("WATCH_DIR") {
            debug!(%key, "Override from environment");
            self.watch_dir = PathBuf::from(v);
        }
        if let Some((key, v)) = get("SNAPSHOT_DIR") {
            debug!(%key, "Override from environment");
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Some((key, v)) = get("CLEANUP_MODE") {
            match v.parse() {
                Ok(mode) => self.cleanup_mode = mode,
                Err(e) => warn!(%key, error = %e, "Ignoring invalid override"),
            }
        }
        if let Some((key, v)) = get("LOG_FILE") {
            debug!(%key, "Override from environment");
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some((key, v)) = get("LOG_LEVEL") {
            debug!(%key, "Override from environment");
            self.log_level = v;
        }

        override_int(get("MAX_SNAPSHOTS"), &mut self.max_snapshots);
        override_int(get("RETENTION_DAYS"), &mut self.retention_days);
        override_int(get("COOLDOWN_SECONDS"), &mut self.cooldown_seconds);
        override_int(get("DEBOUNCE_SECONDS"), &mut self.debounce_seconds);
    }

    /// Check field ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("watch_dir is required".into()));
        }
        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("snapshot_dir is required".into()));
        }
        if self.max_snapshots < 1 {
            return Err(ConfigError::Invalid("max_snapshots must be at least 1".into()));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(ConfigError::Invalid(format!(
                "retention_days must be between 1 and {}",
                MAX_RETENTION_DAYS
            )));
        }
        for (name, value) in [
            ("cooldown_seconds", Some(self.cooldown_seconds)),
            ("debounce_seconds", Some(self.debounce_seconds)),
            ("max_batch_age_seconds", self.max_batch_age_seconds),
            ("tool_timeout_seconds", Some(self.tool_timeout_seconds)),
            ("watch_retry_backoff_ms", Some(self.watch_retry_backoff_ms / 1000)),
        ] {
            if value.is_some_and(|v| v > MAX_INTERVAL_SECONDS) {
                return Err(ConfigError::Invalid(format!(
                    "{} exceeds the maximum of {} seconds",
                    name, MAX_INTERVAL_SECONDS
                )));
            }
        }
        if self.debounce_seconds < 1 {
            return Err(ConfigError::Invalid("debounce_seconds must be at least 1".into()));
        }
        if let Some(age) = self.max_batch_age_seconds {
            if age < self.debounce_seconds {
                return Err(ConfigError::Invalid(format!(
                    "max_batch_age_seconds ({}) must be >= debounce_seconds ({})",
                    age, self.debounce_seconds
                )));
            }
        }
        if self.tool_timeout_seconds < 1 {
            return Err(ConfigError::Invalid("tool_timeout_seconds must be at least 1".into()));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_seconds)
    }

    /// Starvation cap for a debounce batch
    pub fn max_batch_age(&self) -> Duration {
        let secs = self
            .max_batch_age_seconds
            .unwrap_or(self.debounce_seconds.saturating_mul(10));
        Duration::from_secs(secs.min(MAX_INTERVAL_SECONDS))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn watch_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.watch_retry_backoff_ms)
    }

    /// Age-mode retention window
    pub fn retention_age(&self) -> chrono::Duration {
        let days = self.retention_days.min(MAX_RETENTION_DAYS);
        chrono::Duration::days(i64::try_from(days).unwrap_or(i64::MAX))
    }

    /// Commented example configuration
    pub fn example_toml() -> String {
        let body = toml::to_string_pretty(&Config {
            exclude_patterns: vec![
                "*.tmp".to_string(),
                "*.swp".to_string(),
                ".git/".to_string(),
                "__pycache__/".to_string(),
            ],
            log_file: Some(PathBuf::from("/var/log/snapwatch/snapwatch.log")),
            ..Config::default()
        })
        .unwrap_or_default();

        format!(
            "# Snapwatch configuration\n\
             #\n\
             # cleanup_mode: \"count\" or \"time\"\n\
             #   - count: keep the newest max_snapshots snapshots\n\
             #   - time:  keep snapshots younger than retention_days days\n\
             #\n\
             # cooldown_seconds: minimum time between automatic snapshots\n\
             # debounce_seconds: quiet period after a change before snapshotting\n\
             # max_batch_age_seconds: snapshot anyway after this long under constant writes\n\
             #                        (defaults to 10 x debounce_seconds)\n\
             \n{}",
            body
        )
    }
}

fn override_int<T: std::str::FromStr>(entry: Option<(String, String)>, slot: &mut T) {
    if let Some((key, value)) = entry {
        match value.trim().parse() {
            Ok(v) => {
                debug!(%key, "Override from environment");
                *slot = v;
            }
            Err(_) => warn!(%key, %value, "Invalid integer value in environment, ignoring"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_service_defaults() {
        let config = Config::default();
        assert_eq!(config.max_snapshots, 50);
        assert_eq!(config.cleanup_mode, CleanupMode::Count);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.cooldown(), Duration::from_secs(60));
        assert_eq!(config.debounce(), Duration::from_secs(5));
        assert_eq!(config.max_batch_age(), Duration::from_secs(50));
        assert!(!config.test_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            watch_dir = "/srv/data"
            snapshot_dir = "/srv/snaps"
            cleanup_mode = "time"
            retention_days = 3
            exclude_patterns = ["*.log"]
            "#,
        )
        .unwrap();

        assert_eq!(config.watch_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.cleanup_mode, CleanupMode::Time);
        assert_eq!(config.retention_age(), chrono::Duration::days(3));
        assert_eq!(config.exclude_patterns, vec!["*.log".to_string()]);
        assert_eq!(config.max_snapshots, 50);
        assert_eq!(config.cooldown_seconds, 60);
    }

    #[test]
    fn test_unknown_cleanup_mode_rejected() {
        let parsed: Result<Config, _> = toml::from_str(r#"cleanup_mode = "weekly""#);
        assert!(parsed.is_err());
        assert!("weekly".parse::<CleanupMode>().is_err());
        assert_eq!("TIME".parse::<CleanupMode>().unwrap(), CleanupMode::Time);
    }

    #[test]
    fn test_validation_ranges() {
        let mut config = Config::default();
        config.max_snapshots = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retention_days = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_batch_age_seconds = Some(2);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.watch_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_upper_bounds() {
        let mut config = Config::default();
        config.retention_days = 1_000_000_000;
        assert!(config.validate().is_err());
        config.retention_days = MAX_RETENTION_DAYS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.cooldown_seconds = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cooldown_seconds"));

        let mut config = Config::default();
        config.debounce_seconds = MAX_INTERVAL_SECONDS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_batch_age_seconds = Some(u64::MAX);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tool_timeout_seconds = u64::MAX;
        assert!(config.validate().is_err());

        // Derived durations never wrap even on an unvalidated config
        let config = Config {
            retention_days: u64::MAX,
            debounce_seconds: u64::MAX,
            ..Config::default()
        };
        assert_eq!(config.retention_age(), chrono::Duration::days(MAX_RETENTION_DAYS as i64));
        assert_eq!(config.max_batch_age(), Duration::from_secs(MAX_INTERVAL_SECONDS));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SNAPWATCH_WATCH_DIR", "/mnt/vol"),
            ("SNAPWATCH_MAX_SNAPSHOTS", "12"),
            ("SNAPWATCH_COOLDOWN_SECONDS", "not-a-number"),
            ("SNAPWATCH_CLEANUP_MODE", "time"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.watch_dir, PathBuf::from("/mnt/vol"));
        assert_eq!(config.max_snapshots, 12);
        assert_eq!(config.cooldown_seconds, 60); // invalid value ignored
        assert_eq!(config.cleanup_mode, CleanupMode::Time);
    }

    #[test]
    fn test_from_file_and_discover_explicit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.toml");
        std::fs::write(&path, "max_snapshots = 3\ndebounce_seconds = 2\n").unwrap();

        assert_eq!(Config::discover(Some(&path)), Some(path.clone()));

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_snapshots, 3);
        assert_eq!(config.max_batch_age(), Duration::from_secs(20));
    }

    #[test]
    fn test_parse_error_reports_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "max_snapshots = [").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_example_round_trips() {
        let example = Config::example_toml();
        assert!(example.starts_with("# Snapwatch configuration"));
        let parsed: Config = toml::from_str(&example).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.exclude_patterns.len(), 4);
    }
}
