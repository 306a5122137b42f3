//! Source-tagged logging facade.
//!
//! Call sites use `logger::info("failover", ...)` style; emission goes
//! through `tracing` with the minimum level taken from the config.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Install the global subscriber. Unknown levels fall back to `info`.
/// Safe to call more than once; later calls are ignored.
pub fn init(level: &str) {
    let level = LogLevel::from_str(level).unwrap_or(LogLevel::Info);
    let filter = EnvFilter::new(level.as_str());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn debug(source: &str, message: &str) {
    tracing::debug!(source = source, "{}", message);
}

pub fn info(source: &str, message: &str) {
    tracing::info!(source = source, "{}", message);
}

pub fn warn(source: &str, message: &str) {
    tracing::warn!(source = source, "{}", message);
}

pub fn error(source: &str, message: &str) {
    tracing::error!(source = source, "{}", message);
}
