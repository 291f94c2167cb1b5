//! Configuration for mailjudge
//!
//! Settings are layered: serde defaults, then an optional TOML settings
//! file, then `MAILJUDGE_*` environment variables (`__` separates nested
//! keys, e.g. `MAILJUDGE_JUDGE__BATCH_SIZE=50`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Rule source (accounts and their rules)
    #[serde(default = "default_rules_file")]
    pub rules_file: PathBuf,

    /// Sweep configuration
    #[serde(default)]
    pub judge: JudgeConfig,

    /// IMAP client configuration
    #[serde(default)]
    pub imap: ImapConfig,

    /// Statistics persistence
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
            judge: JudgeConfig::default(),
            imap: ImapConfig::default(),
            stats: StatsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_rules_file() -> PathBuf {
    PathBuf::from("rules.toml")
}

/// Sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Number of message ids judged per round
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of ids per FETCH command; results are committed to the round
    /// each time this many have been retrieved
    #[serde(default = "default_commit_threshold")]
    pub commit_threshold: usize,

    /// Judge every message instead of only those not flagged as deleted
    #[serde(default)]
    pub full: bool,

    /// Log intended actions without touching the mailbox
    #[serde(default)]
    pub dry_run: bool,

    /// Maximum number of accounts judged concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// FETCH data item used to retrieve messages; must not set \Seen
    #[serde(default = "default_fetch_pattern")]
    pub fetch_pattern: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            commit_threshold: default_commit_threshold(),
            full: false,
            dry_run: false,
            max_concurrency: default_max_concurrency(),
            fetch_pattern: default_fetch_pattern(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_commit_threshold() -> usize {
    25
}

fn default_max_concurrency() -> usize {
    4
}

fn default_fetch_pattern() -> String {
    "BODY.PEEK[]".to_string()
}

/// IMAP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Use implicit TLS (port 993) instead of plain text (port 143)
    #[serde(default = "default_secure")]
    pub secure: bool,

    /// TCP connect, TLS handshake and login timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-command timeout in seconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// PEM bundle of trusted root certificates
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,

    /// Largest `{n}` literal accepted from the server, in bytes
    #[serde(default = "default_max_literal_bytes")]
    pub max_literal_bytes: usize,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            secure: default_secure(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            ca_file: default_ca_file(),
            max_literal_bytes: default_max_literal_bytes(),
        }
    }
}

impl ImapConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

fn default_secure() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    120
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/ca-certificates.crt")
}

fn default_max_literal_bytes() -> usize {
    64 * 1024 * 1024
}

/// Statistics persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Stats backend: "sqlite" or "log"
    #[serde(default = "default_stats_backend")]
    pub backend: String,

    /// Database path (for sqlite)
    #[serde(default = "default_stats_path")]
    pub path: PathBuf,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            backend: default_stats_backend(),
            path: default_stats_path(),
        }
    }
}

fn default_stats_backend() -> String {
    "sqlite".to_string()
}

fn default_stats_path() -> PathBuf {
    PathBuf::from("statistics.db")
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from an explicit settings file, or from the first
    /// default location that exists, layered with the environment
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let (file, required) = match path {
            Some(path) => (Some(path.to_path_buf()), true),
            None => {
                let paths = [
                    PathBuf::from("./mailjudge.toml"),
                    PathBuf::from("/etc/mailjudge/config.toml"),
                ];
                (paths.into_iter().find(|p| p.exists()), false)
            }
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(
                config::File::new(&file.to_string_lossy(), config::FileFormat::Toml)
                    .required(required),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MAILJUDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| crate::Error::Config(format!("Failed to load settings: {}", e)))?;

        config.apply_debug_toggle(std::env::var("DEBUG").ok().as_deref());
        config.validate()?;
        Ok(config)
    }

    /// The `DEBUG` environment toggle turns any run into a dry run
    pub fn apply_debug_toggle(&mut self, value: Option<&str>) {
        if value.is_some_and(|v| !v.is_empty()) {
            self.judge.dry_run = true;
        }
    }

    /// Reject settings that would make a sweep impossible
    pub fn validate(&self) -> crate::Result<()> {
        if self.judge.batch_size == 0 {
            return Err(crate::Error::Config("judge.batch_size must be at least 1".to_string()));
        }
        if self.judge.commit_threshold == 0 {
            return Err(crate::Error::Config(
                "judge.commit_threshold must be at least 1".to_string(),
            ));
        }
        if self.judge.max_concurrency == 0 {
            return Err(crate::Error::Config(
                "judge.max_concurrency must be at least 1".to_string(),
            ));
        }
        if !self.judge.fetch_pattern.to_uppercase().contains(".PEEK") {
            return Err(crate::Error::Config(format!(
                "judge.fetch_pattern {:?} would mark messages as seen",
                self.judge.fetch_pattern
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rules_file, PathBuf::from("rules.toml"));
        assert_eq!(config.judge.batch_size, 100);
        assert_eq!(config.judge.fetch_pattern, "BODY.PEEK[]");
        assert!(config.imap.secure);
        assert_eq!(config.stats.backend, "sqlite");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_settings_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
rules_file = "/etc/mailjudge/rules.toml"

[judge]
batch_size = 10
max_concurrency = 2

[imap]
secure = false

[stats]
backend = "log"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.rules_file, PathBuf::from("/etc/mailjudge/rules.toml"));
        assert_eq!(config.judge.batch_size, 10);
        assert_eq!(config.judge.max_concurrency, 2);
        assert_eq!(config.judge.commit_threshold, 25);
        assert!(!config.imap.secure);
        assert_eq!(config.stats.backend, "log");
    }

    #[test]
    fn test_missing_settings_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/mailjudge.toml"))).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_debug_toggle_enables_dry_run() {
        let mut config = Config::default();
        config.apply_debug_toggle(None);
        assert!(!config.judge.dry_run);
        config.apply_debug_toggle(Some(""));
        assert!(!config.judge.dry_run);
        config.apply_debug_toggle(Some("1"));
        assert!(config.judge.dry_run);
    }

    #[test]
    fn test_validate_rejects_seen_setting_fetch() {
        let mut config = Config::default();
        config.judge.fetch_pattern = "BODY[]".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.judge.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
