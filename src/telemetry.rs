//! Tracing subscriber setup for hosts that do not install their own.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Result, SlidegateError};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| SlidegateError::Config(format!("invalid log level: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| SlidegateError::Config(format!("failed to install subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_fails() {
        let config = LoggingConfig::default();
        // Another test may already have installed a subscriber, so only the
        // second call is guaranteed to fail.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_invalid_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "slidegate=notalevel".to_string(),
            json: false,
        };
        assert!(matches!(init_tracing(&config), Err(SlidegateError::Config(_))));
    }
}
