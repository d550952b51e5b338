// policy.rs — Permission-granting strategies.
//
// The core never decides whether a principal holds a named permission; it
// asks the `SecurityPolicy` of the active interaction. Two strategies ship
// with the core: `ParanoidPolicy` (only the system principal) and
// `PermissivePolicy` (everything). Grant-table policies live in
// `warden-policy`.

use std::fmt;

use crate::interaction::Participation;
use crate::permission::Permission;
use crate::principal::is_system;
use crate::value::Value;

/// Decides whether the participants of an interaction hold a permission.
pub trait SecurityPolicy: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether `permission` is granted on `object` to the participants.
    /// Never called for `Permission::Public`.
    fn check_permission(
        &self,
        permission: &Permission,
        object: &Value,
        participations: &[Participation],
    ) -> bool;
}

/// Grants a permission only when every participant is the system principal.
///
/// An interaction without participants acts for the system. A participation
/// without a principal counts as an unknown user.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParanoidPolicy;

impl SecurityPolicy for ParanoidPolicy {
    fn name(&self) -> &str {
        "paranoid"
    }

    fn check_permission(
        &self,
        permission: &Permission,
        _object: &Value,
        participations: &[Participation],
    ) -> bool {
        permission.is_public()
            || participations
                .iter()
                .all(|p| p.principal.as_ref().is_some_and(is_system))
    }
}

/// Grants everything. For tests and trusted tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissivePolicy;

impl SecurityPolicy for PermissivePolicy {
    fn name(&self) -> &str {
        "permissive"
    }

    fn check_permission(&self, _: &Permission, _: &Value, _: &[Participation]) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::{system_principal, Principal};
    use std::sync::Arc;

    #[test]
    fn paranoid_trusts_only_the_system_principal() {
        let view = Permission::named("content.View");
        let object = Value::None;
        let policy = ParanoidPolicy;

        let system = Participation::new(Some(system_principal()));
        let alice = Participation::new(Some(Arc::new(Principal::new("alice", "Alice"))));
        let anonymous = Participation::new(None);

        assert!(policy.check_permission(&view, &object, &[]));
        assert!(policy.check_permission(&view, &object, &[system.clone()]));
        assert!(!policy.check_permission(&view, &object, &[system, alice]));
        assert!(!policy.check_permission(&view, &object, &[anonymous]));
    }

    #[test]
    fn permissive_grants_everything() {
        let alice = Participation::new(Some(Arc::new(Principal::new("alice", "Alice"))));
        assert!(PermissivePolicy.check_permission(
            &Permission::named("anything"),
            &Value::Int(1),
            &[alice]
        ));
    }
}
