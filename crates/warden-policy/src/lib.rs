//! # warden-policy
//!
//! Configuration layer for `warden-security`.
//!
//! - [`GrantPolicy`]: a [`SecurityPolicy`](warden_security::SecurityPolicy)
//!   backed by per-principal glob grants over permission ids.
//! - [`declare`]: typed protection declarations applied to a
//!   [`Registry`](warden_security::Registry) through its protect API.
//! - [`SecurityConfig`]: checker settings, policy choice and logging, loaded
//!   from TOML or YAML.
//! - [`init_logging`]: tracing-subscriber setup for applications.
//!
//! ## Key invariants
//!
//! - **Validate first**: a batch of declarations with an empty entry is
//!   rejected before any of it reaches the registry.
//! - **Every participant**: a grant policy grants a permission only if each
//!   participant of the interaction holds it.

pub mod config;
pub mod declare;
pub mod error;
pub mod grants;
pub mod logging;

pub use config::{
    CheckersConfig, GrantConfig, LoggingConfig, PolicyConfig, PolicyKind, SecurityConfig,
    WATCH_CHECKERS_ENV,
};
pub use declare::{declare, Declaration};
pub use error::PolicyError;
pub use grants::{GrantPolicy, ANONYMOUS_PRINCIPAL_ID};
pub use logging::{build_filter, init_logging};
