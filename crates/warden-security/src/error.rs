// error.rs — Error types for the security subsystem.
//
// `SecurityError` covers access decisions, interaction lifecycle misuse and
// registry misuse. `ObjectError` covers failures of the underlying value
// itself (missing attribute, unsupported operator, bad key) and is wrapped by
// `SecurityError::Object` when it surfaces through a guarded handle.
//
// Errors never carry the target value, only its type name, so a denial can
// not be used to smuggle a raw value past its guard.

use thiserror::Error;

use crate::permission::Permission;

/// Errors that can occur during security operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SecurityError {
    /// The operation is governed by a permission the current actor lacks.
    #[error("unauthorized: '{operation}' on {target} requires permission '{permission}'")]
    Unauthorized {
        target: String,
        operation: String,
        permission: Permission,
    },

    /// The operation is not part of the protected surface at all.
    #[error("forbidden: '{operation}' is not part of the protected surface of {target}")]
    Forbidden { target: String, operation: String },

    /// `begin` was called while an interaction is already active in this task.
    #[error("an interaction is already active in this task")]
    AlreadyActive,

    /// A permission check needed an interaction but none is active.
    #[error("no interaction is active in this task")]
    NoActiveInteraction,

    /// A registry entry already exists for this type.
    #[error("a checker is already registered for type {type_name}")]
    DuplicateRegistration { type_name: String },

    /// No registry entry exists for this type.
    #[error("no checker is registered for type {type_name}")]
    NotFound { type_name: String },

    /// Two declarations bind the same name to different permissions.
    #[error("'{name}' is declared with conflicting permissions '{existing}' and '{requested}'")]
    DuplicateBinding {
        name: String,
        existing: Permission,
        requested: Permission,
    },

    /// An attempt to re-guard an already guarded value with a different checker.
    #[error("refusing to replace the checker of an already guarded value")]
    CheckerConflict,

    /// A protection request that cannot be applied to the registry.
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),

    /// The underlying value rejected the operation.
    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl SecurityError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SecurityError::Unauthorized { .. })
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, SecurityError::Forbidden { .. })
    }

    /// True for the two access-decision kinds (`Unauthorized`, `Forbidden`).
    pub fn is_denial(&self) -> bool {
        self.is_unauthorized() || self.is_forbidden()
    }
}

/// Failures raised by a value's own implementation of an operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ObjectError {
    #[error("{type_name} has no attribute '{name}'")]
    NoAttribute { type_name: String, name: String },

    #[error("attribute '{name}' of {type_name} is read-only")]
    ReadOnly { type_name: String, name: String },

    #[error("{type_name} does not support '{operation}'")]
    Unsupported {
        type_name: String,
        operation: String,
    },

    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("{0}")]
    Custom(String),
}

impl ObjectError {
    pub fn unsupported(type_name: impl Into<String>, operation: impl Into<String>) -> Self {
        ObjectError::Unsupported {
            type_name: type_name.into(),
            operation: operation.into(),
        }
    }

    pub fn no_attribute(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        ObjectError::NoAttribute {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denial_messages_name_operation_not_value() {
        let err = SecurityError::Unauthorized {
            target: "Document".to_string(),
            operation: "title".to_string(),
            permission: Permission::named("content.View"),
        };
        assert_eq!(
            err.to_string(),
            "unauthorized: 'title' on Document requires permission 'content.View'"
        );
        assert!(err.is_unauthorized());
        assert!(err.is_denial());

        let err = SecurityError::Forbidden {
            target: "Document".to_string(),
            operation: "secret".to_string(),
        };
        assert!(err.is_forbidden());
        assert!(!err.is_unauthorized());
    }

    #[test]
    fn object_errors_convert_transparently() {
        let err: SecurityError = ObjectError::no_attribute("Document", "missing").into();
        assert_eq!(err.to_string(), "Document has no attribute 'missing'");
        assert!(!err.is_denial());
    }
}
