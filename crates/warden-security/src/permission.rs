// permission.rs — Permission identifiers.
//
// A permission is an opaque capability name. The core never interprets
// named permissions; it only hands them to the active interaction's policy.
// `Public` is the one reserved value: it is always granted and the policy is
// never consulted for it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Textual id that maps to [`Permission::Public`] when parsed.
pub const PUBLIC_PERMISSION_ID: &str = "warden.Public";

/// A permission required to perform an operation.
///
/// Serialized as its id string, so `"warden.Public"` round-trips to `Public`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    /// Always granted; no policy consultation.
    Public,
    /// A named permission checked against the active interaction.
    Named(Arc<str>),
}

impl Permission {
    /// Build a permission from its id. `warden.Public` yields `Public`.
    pub fn named(id: impl AsRef<str>) -> Self {
        let id = id.as_ref();
        if id == PUBLIC_PERMISSION_ID {
            Permission::Public
        } else {
            Permission::Named(Arc::from(id))
        }
    }

    /// The textual id of this permission.
    pub fn id(&self) -> &str {
        match self {
            Permission::Public => PUBLIC_PERMISSION_ID,
            Permission::Named(id) => id,
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Permission::Public)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl From<&str> for Permission {
    fn from(id: &str) -> Self {
        Permission::named(id)
    }
}

impl From<String> for Permission {
    fn from(id: String) -> Self {
        Permission::named(id)
    }
}

impl From<Permission> for String {
    fn from(permission: Permission) -> Self {
        permission.id().to_string()
    }
}
