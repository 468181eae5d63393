pub mod defaults;
mod loader;
mod types;

pub use types::{BackupSettings, LoggingSettings, ServerConfig};
