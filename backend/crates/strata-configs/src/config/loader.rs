use super::types::ServerConfig;
use std::env;
use std::fs;
use std::path::Path;

const VALID_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl ServerConfig {
    /// Load configuration from a TOML file
    ///
    /// Environment overrides are applied separately via `apply_env_overrides()`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let mut config: ServerConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;

        config.finalize()?;

        Ok(config)
    }

    /// Apply `STRATA_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(level) = env::var("STRATA_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("STRATA_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(dir) = env::var("STRATA_BACKUP_JOURNAL_DIR") {
            self.backup.journal_dir = dir;
        }

        if let Ok(secs) = env::var("STRATA_BACKUP_HISTORY_KEEP_SECS") {
            self.backup.history_job_keep_max_secs = secs.parse().map_err(|_| {
                anyhow::anyhow!("Invalid STRATA_BACKUP_HISTORY_KEEP_SECS value: {}", secs)
            })?;
        }

        if let Ok(ms) = env::var("STRATA_BACKUP_DRIVER_INTERVAL_MS") {
            self.backup.driver_interval_ms = ms.parse().map_err(|_| {
                anyhow::anyhow!("Invalid STRATA_BACKUP_DRIVER_INTERVAL_MS value: {}", ms)
            })?;
        }

        Ok(())
    }

    /// Normalize and validate configuration.
    ///
    /// Call this after applying environment overrides.
    pub fn finalize(&mut self) -> anyhow::Result<()> {
        self.logging.level = self.logging.level.to_lowercase();
        self.logging.format = self.logging.format.to_lowercase();
        self.validate()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> anyhow::Result<()> {
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            ));
        }

        let valid_formats = ["compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        for (target, level) in &self.logging.targets {
            if !VALID_LEVELS.contains(&level.as_str()) {
                return Err(anyhow::anyhow!(
                    "Invalid log level '{}' for target '{}'. Must be one of: {}",
                    level,
                    target,
                    VALID_LEVELS.join(", ")
                ));
            }
        }

        if self.backup.driver_interval_ms == 0 {
            return Err(anyhow::anyhow!("driver_interval_ms cannot be 0"));
        }

        if self.backup.seq_lock_timeout_ms == 0 {
            return Err(anyhow::anyhow!("seq_lock_timeout_ms cannot be 0"));
        }

        if self.backup.default_job_timeout_ms == 0 {
            return Err(anyhow::anyhow!("default_job_timeout_ms cannot be 0"));
        }

        if self.backup.max_upload_tablets_per_task == 0 {
            return Err(anyhow::anyhow!("max_upload_tablets_per_task cannot be 0"));
        }

        if self.backup.journal_dir.trim().is_empty() {
            return Err(anyhow::anyhow!("journal_dir cannot be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backup.seq_lock_timeout_ms, 10_000);
        assert_eq!(config.backup.history_job_keep_max_secs, 7 * 24 * 3600);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ServerConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_driver_interval_rejected() {
        let mut config = ServerConfig::default();
        config.backup.driver_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[backup]\nhistory_job_keep_max_secs = 60\n\n[logging]\nlevel = \"DEBUG\"\n\n[logging.targets]\nstrata_backup = \"trace\""
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.backup.history_job_keep_max_secs, 60);
        assert_eq!(config.backup.driver_interval_ms, 3_000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.targets.get("strata_backup").unwrap(), "trace");
    }

    #[test]
    fn test_from_file_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[backup\nbroken").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }
}
