//! strata-configs
//!
//! Server configuration types and loader for the Strata backup control plane.

pub mod config;

pub use config::defaults;
pub use config::*;
