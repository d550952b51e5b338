// config.rs — Security configuration loaded from TOML or YAML.
//
// Example (TOML):
//
//   [checkers]
//   verbosity = "decisions"
//   available_by_default = ["summary"]
//
//   [policy]
//   kind = "grants"
//
//   [[policy.grants]]
//   principal = "alice"
//   permissions = ["content.*"]
//
//   [logging]
//   filter = "warden=debug"
//   json = false
//
// The WARDEN_WATCH_CHECKERS environment variable (0, 1 or 2) overrides
// `checkers.verbosity` when set.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use warden_security::{ParanoidPolicy, PermissivePolicy, Registry, SecurityPolicy, Verbosity};

use crate::error::PolicyError;
use crate::grants::GrantPolicy;

/// Environment variable overriding checker verbosity.
pub const WATCH_CHECKERS_ENV: &str = "WARDEN_WATCH_CHECKERS";

/// Top-level security configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub checkers: CheckersConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Registry-wide checker settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckersConfig {
    /// Verbosity of checkers built after the config is applied.
    #[serde(default)]
    pub verbosity: Verbosity,

    /// Extra names added to the allow-list.
    #[serde(default)]
    pub available_by_default: Vec<String>,
}

/// Which permission-granting strategy interactions use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    #[default]
    Paranoid,
    Permissive,
    Grants,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub kind: PolicyKind,

    /// Only used when `kind = "grants"`.
    #[serde(default)]
    pub grants: Vec<GrantConfig>,
}

/// Permission patterns granted to one principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantConfig {
    pub principal: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives. `RUST_LOG` wins when set.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

fn default_filter() -> String {
    "info".to_string()
}

impl SecurityConfig {
    /// Load from a `.toml`, `.yaml` or `.yml` file, then apply environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let content = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let mut config = match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)?,
            _ => {
                return Err(PolicyError::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        };
        config.apply_env_overrides();
        debug!(path = %path.display(), "security config loaded");
        Ok(config)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, PolicyError> {
        if path.exists() {
            Self::load(path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, PolicyError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `WARDEN_WATCH_CHECKERS` if it is set.
    pub fn apply_env_overrides(&mut self) {
        let raw = std::env::var(WATCH_CHECKERS_ENV).ok();
        self.apply_watch_level(raw.as_deref());
    }

    fn apply_watch_level(&mut self, raw: Option<&str>) {
        let Some(raw) = raw else {
            return;
        };
        match raw.trim().parse::<u8>() {
            Ok(level) => self.checkers.verbosity = Verbosity::from_level(level),
            Err(_) => warn!(
                variable = WATCH_CHECKERS_ENV,
                value = raw,
                "ignoring checker verbosity override: expected 0, 1 or 2"
            ),
        }
    }

    /// Push checker settings into `registry`.
    pub fn apply(&self, registry: &Registry) {
        registry.set_verbosity(self.checkers.verbosity);
        for name in &self.checkers.available_by_default {
            registry.allow_by_default(name.clone());
        }
    }

    /// Build the configured permission-granting strategy.
    pub fn build_policy(&self) -> Result<Arc<dyn SecurityPolicy>, PolicyError> {
        let policy: Arc<dyn SecurityPolicy> = match self.policy.kind {
            PolicyKind::Paranoid => Arc::new(ParanoidPolicy),
            PolicyKind::Permissive => Arc::new(PermissivePolicy),
            PolicyKind::Grants => {
                let policy = GrantPolicy::new();
                for grant in &self.policy.grants {
                    for pattern in &grant.permissions {
                        policy.grant(&grant.principal, pattern)?;
                    }
                }
                Arc::new(policy)
            }
        };
        Ok(policy)
    }
}
