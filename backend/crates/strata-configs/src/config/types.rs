use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::defaults::*;

/// Root configuration, loaded from `server.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Backup/restore orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// How often the driver advances every active job (default: 3000ms)
    #[serde(default = "default_driver_interval_ms")]
    pub driver_interval_ms: u64,

    /// How long a finished or cancelled job is retained before expiry
    /// (default: 7 days)
    #[serde(default = "default_history_job_keep_max_secs")]
    pub history_job_keep_max_secs: u64,

    /// Bounded wait for the sequencing lock before a submission is rejected
    /// as retryable (default: 10s)
    #[serde(default = "default_seq_lock_timeout_ms")]
    pub seq_lock_timeout_ms: u64,

    /// Job timeout used when a request does not carry one (default: 1 day)
    #[serde(default = "default_job_timeout_ms")]
    pub default_job_timeout_ms: u64,

    /// Maximum tablets grouped into a single upload or download task
    #[serde(default = "default_max_upload_tablets_per_task")]
    pub max_upload_tablets_per_task: usize,

    /// How often the driver loop writes a full image (0 disables)
    #[serde(default = "default_image_interval_secs")]
    pub image_interval_secs: u64,

    /// Directory of the file journal (edit log + image blocks)
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            driver_interval_ms: default_driver_interval_ms(),
            history_job_keep_max_secs: default_history_job_keep_max_secs(),
            seq_lock_timeout_ms: default_seq_lock_timeout_ms(),
            default_job_timeout_ms: default_job_timeout_ms(),
            max_upload_tablets_per_task: default_max_upload_tablets_per_task(),
            image_interval_secs: default_image_interval_secs(),
            journal_dir: default_journal_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for log files (default: "./logs")
    #[serde(default = "default_logs_path")]
    pub logs_path: String,
    #[serde(default = "default_true")]
    pub log_to_console: bool,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Optional per-target log level overrides
    /// [logging.targets]
    /// strata_backup = "debug"
    #[serde(default)]
    pub targets: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            logs_path: default_logs_path(),
            log_to_console: default_true(),
            format: default_log_format(),
            targets: HashMap::new(),
        }
    }
}
