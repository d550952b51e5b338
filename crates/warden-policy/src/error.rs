// error.rs — Error types for policy loading and declaration.

use std::path::PathBuf;

use thiserror::Error;
use warden_security::SecurityError;

/// Errors that can occur while configuring security.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The config file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The file extension is not one we know how to parse.
    #[error("unsupported config format for '{}' (expected .toml, .yaml or .yml)", path.display())]
    UnsupportedFormat { path: PathBuf },

    /// A permission pattern is malformed and cannot be parsed as a glob.
    #[error("invalid permission pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A protection declaration that names nothing to protect.
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    #[error("failed to initialize logging: {0}")]
    Logging(String),

    /// The registry rejected a declaration.
    #[error(transparent)]
    Security(#[from] SecurityError),
}
