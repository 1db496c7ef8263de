//! Logging initialization built on tracing-subscriber

use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive, e.g. "info" or "arbordb=debug"
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(&config.filter)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };

    // A subscriber may already be installed (tests, embedding hosts).
    let _ = result;
}

/// Initialize logging from `RUST_LOG`, defaulting to "info".
pub fn init_from_env() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    init_logging(&LogConfig {
        filter,
        json: false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging(&LogConfig::default());
        init_logging(&LogConfig {
            filter: "debug".into(),
            json: true,
        });
        init_from_env();
    }
}
