// logging.rs — tracing-subscriber setup for embedding applications.
//
// Logs go to stderr. `RUST_LOG` takes precedence over the configured filter.
// Library code never installs a subscriber itself; applications call
// `init_logging` once at startup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::PolicyError;

/// Filter from `RUST_LOG` when set and valid, otherwise from `config`.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, PolicyError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter).map_err(|e| PolicyError::Logging(e.to_string()))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), PolicyError> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| PolicyError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails() {
        let config = LoggingConfig {
            filter: "warden=debug".to_string(),
            json: false,
        };
        assert!(build_filter(&config).is_ok());
        assert!(init_logging(&config).is_ok());
        assert!(matches!(
            init_logging(&config),
            Err(PolicyError::Logging(_))
        ));
    }
}
