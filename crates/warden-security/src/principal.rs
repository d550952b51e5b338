// principal.rs — Principals and the system principal.

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Id carried by the system principal. Matching this id does not make a
/// principal the system principal; only identity does.
pub const SYSTEM_PRINCIPAL_ID: &str = "warden.system";

/// An authenticated actor taking part in an interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl Principal {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

static SYSTEM: Lazy<Arc<Principal>> = Lazy::new(|| {
    Arc::new(
        Principal::new(SYSTEM_PRINCIPAL_ID, "System")
            .with_description("Trusted principal for work done by the process itself"),
    )
});

/// The process-wide system principal.
pub fn system_principal() -> Arc<Principal> {
    SYSTEM.clone()
}

/// True only for the [`system_principal`] instance itself.
pub fn is_system(principal: &Arc<Principal>) -> bool {
    Arc::ptr_eq(principal, &SYSTEM)
}
