//! QueueDaemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bulk::BulkConfig;
use crate::operations::{
    DEFAULT_COMMAND_TIMEOUT, ExternalCommand, ExtractArticlesOperation, OcrOperation, OperationDispatcher,
    SegmentOperation,
};
use crate::scheduler::SchedulerConfig;

/// Main QueueDaemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    pub scheduler: SchedulerConfig,

    pub storage: StorageConfig,

    pub bulk: BulkConfig,

    /// External commands backing the built-in operations
    pub operations: OperationsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .queuedaemon.yml
        let local_config = PathBuf::from(".queuedaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/queuedaemon/queuedaemon.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("queuedaemon").join("queuedaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for logs and the event log
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    /// SQLite database; defaults to `<data-dir>/queue.db`
    #[serde(rename = "db-path")]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| self.data_dir.join("queue.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/queuedaemon on Linux)
        let data_dir = dirs::data_dir()
            .map(|d| d.join("queuedaemon"))
            .unwrap_or_else(|| PathBuf::from(".queuedaemon"));

        Self { data_dir, db_path: None }
    }
}

/// Command template for one external tool
///
/// `args` may contain `{input}`, `{subject}` and, for OCR, `{language}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandConfig {
    pub fn to_command(&self, timeout: Duration) -> ExternalCommand {
        ExternalCommand::new(self.program.clone(), self.args.clone()).with_timeout(timeout)
    }
}

/// External commands for the built-in operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// Per-command timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    pub ocr: Option<CommandConfig>,

    pub segment: Option<CommandConfig>,

    #[serde(rename = "extract-articles", alias = "extract_articles")]
    pub extract_articles: Option<CommandConfig>,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            ocr: None,
            segment: None,
            extract_articles: None,
        }
    }
}

impl OperationsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Dispatcher with a handler for every configured command
    pub fn build_dispatcher(&self) -> OperationDispatcher {
        let timeout = self.timeout();
        let mut dispatcher = OperationDispatcher::new();
        if let Some(ocr) = &self.ocr {
            dispatcher.register(OcrOperation::NAME, OcrOperation::new(Arc::new(ocr.to_command(timeout))));
        }
        if let Some(segment) = &self.segment {
            dispatcher.register(
                SegmentOperation::NAME,
                SegmentOperation::new(Arc::new(segment.to_command(timeout))),
            );
        }
        if let Some(extract) = &self.extract_articles {
            dispatcher.register(
                ExtractArticlesOperation::NAME,
                ExtractArticlesOperation::new(Arc::new(extract.to_command(timeout))),
            );
        }
        dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.log_level.is_none());
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.bulk.message_log_limit, 100);
        assert_eq!(config.storage.db_path(), config.storage.data_dir.join("queue.db"));
        assert!(config.operations.build_dispatcher().operations().is_empty());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

scheduler:
  max-concurrency: 2
  max-retries: 5
  batch-mode: true

storage:
  data-dir: /var/lib/qd
  db-path: /tmp/queue.db

bulk:
  message-log-limit: 20

operations:
  timeout-ms: 1000
  ocr:
    program: tesseract
    args: ["{input}", "stdout", "-l", "{language}"]
  extract_articles:
    program: extract
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.scheduler.max_retries, 5);
        assert!(config.scheduler.batch_mode);
        assert_eq!(config.scheduler.retry_delay_ms, 5000);
        assert_eq!(config.storage.db_path(), PathBuf::from("/tmp/queue.db"));
        assert_eq!(config.storage.log_dir(), PathBuf::from("/var/lib/qd/logs"));
        assert_eq!(config.bulk.message_log_limit, 20);
        assert!(config.bulk.persist);
        assert_eq!(config.operations.timeout(), Duration::from_secs(1));
        assert_eq!(config.operations.ocr.as_ref().unwrap().program, "tesseract");
        assert!(config.operations.segment.is_none());

        let dispatcher = config.operations.build_dispatcher();
        assert_eq!(dispatcher.operations(), vec!["extract_articles", "ocr"]);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("scheduler:\n  max-retries: 1\n").unwrap();

        assert_eq!(config.scheduler.max_retries, 1);
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.operations.timeout_ms, 300_000);
        assert!(config.bulk.persist);
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("qd.yml");
        fs::write(&path, "log-level: trace\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("trace"));
    }

    #[test]
    fn test_load_missing_explicit_path_errors() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("absent.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    #[serial]
    fn test_load_project_local_config() {
        let temp = tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        fs::write(temp.path().join(".queuedaemon.yml"), "bulk:\n  persist: false\n").unwrap();

        std::env::set_current_dir(temp.path()).unwrap();
        let config = Config::load(None);
        std::env::set_current_dir(original).unwrap();

        assert!(!config.unwrap().bulk.persist);
    }
}
