// Default value functions

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_log_format() -> String {
    "compact".to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_logs_path() -> String {
    "./logs".to_string()
}

pub fn default_driver_interval_ms() -> u64 {
    3_000 // driver tick
}

pub fn default_history_job_keep_max_secs() -> u64 {
    7 * 24 * 3600 // one week
}

pub fn default_seq_lock_timeout_ms() -> u64 {
    10_000
}

pub fn default_job_timeout_ms() -> u64 {
    86_400_000 // one day
}

pub fn default_max_upload_tablets_per_task() -> usize {
    10
}

pub fn default_image_interval_secs() -> u64 {
    600 // 10 minutes
}

pub fn default_journal_dir() -> String {
    "./data/backup-journal".to_string()
}
