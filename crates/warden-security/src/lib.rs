//! # warden-security
//!
//! Object-level access control for dynamic values.
//!
//! A [`Guarded`] handle wraps a [`Value`] together with a [`SecurityChecker`].
//! Every attribute read, attribute write, item access, call and operator on
//! the handle is checked before it reaches the value, and every value coming
//! back out is wrapped again, so protection is transitive.
//!
//! Checkers map operation names to [`Permission`]s. Whether the current actor
//! holds a permission is decided by the [`SecurityPolicy`] of the active
//! [`Interaction`], a task-scoped context managed by the [`interaction`]
//! module. The [`Registry`] chooses a checker for a value from its type.
//!
//! ## Key invariants
//!
//! - **Closed by default**: a name a checker does not declare is `Forbidden`
//!   unless it is on the registry's allow-list; undeclared types get a checker
//!   with no bindings.
//! - **Transitive**: results leaving a handle are wrapped by the registry.
//! - **No leakage**: errors carry the target's type name, never the target.
//! - **Exempt**: comparison, hashing and truthiness never consult a checker.

pub mod checker;
pub mod combined;
pub mod error;
pub mod guarded;
pub mod interaction;
pub mod interface;
pub mod operation;
pub mod permission;
pub mod policy;
pub mod principal;
pub mod registry;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use checker::{
    same_checker, Checker, CheckerBuilder, SecurityChecker, Verbosity, STANDARD_ALLOWED,
};
pub use combined::CombinedChecker;
pub use error::{ObjectError, SecurityError};
pub use guarded::{
    can_read, can_write, get_checker, guard_with, is_guarded, remove_guard, Guarded,
};
pub use interaction::{Interaction, InteractionGuard, Participation};
pub use interface::Interface;
pub use operation::{BinaryOp, CompareOp, Operation, UnaryOp};
pub use permission::{Permission, PUBLIC_PERMISSION_ID};
pub use policy::{ParanoidPolicy, PermissivePolicy, SecurityPolicy};
pub use principal::{is_system, system_principal, Principal, SYSTEM_PRINCIPAL_ID};
pub use registry::{Entry, Factory, Registry, Resolution};
pub use value::{List, Map, Object, TypeKey, Value, MAX_REPEAT_LEN};
