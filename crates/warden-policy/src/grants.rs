// grants.rs — Grant-table security policy.
//
// `GrantPolicy` holds, per principal id, a list of glob patterns over
// permission ids ("content.*", "admin.Users"). A permission is granted to an
// interaction when every participant holds a matching grant:
//
// - the system principal is always trusted;
// - a participation without a principal is checked as `warden.anonymous`;
// - an interaction without participants is denied.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use glob::Pattern;
use tracing::debug;
use warden_security::{is_system, Participation, Permission, SecurityPolicy, Value};

use crate::error::PolicyError;

/// Principal id used for unauthenticated participants.
pub const ANONYMOUS_PRINCIPAL_ID: &str = "warden.anonymous";

/// Policy backed by per-principal glob grants.
#[derive(Debug, Default)]
pub struct GrantPolicy {
    grants: RwLock<HashMap<String, Vec<Pattern>>>,
}

impl GrantPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `principal_id` every permission matching `pattern`.
    pub fn grant(&self, principal_id: &str, pattern: &str) -> Result<(), PolicyError> {
        let compiled = Pattern::new(pattern).map_err(|e| PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        let patterns = grants.entry(principal_id.to_string()).or_default();
        if !patterns.iter().any(|p| p.as_str() == pattern) {
            patterns.push(compiled);
            debug!(principal = principal_id, pattern, "permission granted");
        }
        Ok(())
    }

    /// Remove one grant. Returns whether it existed.
    pub fn revoke(&self, principal_id: &str, pattern: &str) -> bool {
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        let Some(patterns) = grants.get_mut(principal_id) else {
            return false;
        };
        let before = patterns.len();
        patterns.retain(|p| p.as_str() != pattern);
        let removed = patterns.len() != before;
        if patterns.is_empty() {
            grants.remove(principal_id);
        }
        if removed {
            debug!(principal = principal_id, pattern, "permission revoked");
        }
        removed
    }

    /// Remove every grant of a principal. Returns whether it had any.
    pub fn revoke_all(&self, principal_id: &str) -> bool {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(principal_id)
            .is_some()
    }

    /// The grant patterns of a principal, in grant order.
    pub fn grants_for(&self, principal_id: &str) -> Vec<String> {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(principal_id)
            .map(|patterns| patterns.iter().map(|p| p.as_str().to_string()).collect())
            .unwrap_or_default()
    }

    /// Whether `principal_id` holds `permission` directly.
    pub fn is_granted(&self, principal_id: &str, permission: &Permission) -> bool {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(principal_id)
            .is_some_and(|patterns| patterns.iter().any(|p| p.matches(permission.id())))
    }

    fn participant_granted(&self, participation: &Participation, permission: &Permission) -> bool {
        match &participation.principal {
            Some(principal) if is_system(principal) => true,
            Some(principal) => self.is_granted(&principal.id, permission),
            None => self.is_granted(ANONYMOUS_PRINCIPAL_ID, permission),
        }
    }
}

impl SecurityPolicy for GrantPolicy {
    fn name(&self) -> &str {
        "grants"
    }

    fn check_permission(
        &self,
        permission: &Permission,
        _object: &Value,
        participations: &[Participation],
    ) -> bool {
        if permission.is_public() {
            return true;
        }
        !participations.is_empty()
            && participations
                .iter()
                .all(|p| self.participant_granted(p, permission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warden_security::{system_principal, Principal};

    fn user(id: &str) -> Participation {
        Participation::new(Some(Arc::new(Principal::new(id, id))))
    }

    #[test]
    fn glob_grants_match_permission_ids() {
        let policy = GrantPolicy::new();
        policy.grant("alice", "content.*").unwrap();

        let view = Permission::named("content.View");
        let admin = Permission::named("admin.Users");
        assert!(policy.check_permission(&view, &Value::None, &[user("alice")]));
        assert!(!policy.check_permission(&admin, &Value::None, &[user("alice")]));
        assert!(!policy.check_permission(&view, &Value::None, &[user("bob")]));
    }

    #[test]
    fn every_participant_must_hold_the_permission() {
        let policy = GrantPolicy::new();
        policy.grant("alice", "content.View").unwrap();
        let view = Permission::named("content.View");

        assert!(!policy.check_permission(&view, &Value::None, &[user("alice"), user("bob")]));
        let system = Participation::new(Some(system_principal()));
        assert!(policy.check_permission(&view, &Value::None, &[user("alice"), system]));
        assert!(!policy.check_permission(&view, &Value::None, &[]));
    }

    #[test]
    fn anonymous_participants_use_the_anonymous_grants() {
        let policy = GrantPolicy::new();
        let view = Permission::named("content.View");
        let anonymous = Participation::new(None);
        assert!(!policy.check_permission(&view, &Value::None, &[anonymous.clone()]));

        policy.grant(ANONYMOUS_PRINCIPAL_ID, "content.View").unwrap();
        assert!(policy.check_permission(&view, &Value::None, &[anonymous]));
    }

    #[test]
    fn revoke_and_listing() {
        let policy = GrantPolicy::new();
        policy.grant("alice", "a.*").unwrap();
        policy.grant("alice", "b.View").unwrap();
        policy.grant("alice", "a.*").unwrap();
        assert_eq!(policy.grants_for("alice"), vec!["a.*", "b.View"]);

        assert!(policy.revoke("alice", "a.*"));
        assert!(!policy.revoke("alice", "a.*"));
        assert!(!policy.is_granted("alice", &Permission::named("a.View")));

        assert!(policy.revoke_all("alice"));
        assert!(!policy.revoke_all("alice"));
        assert!(policy.grants_for("alice").is_empty());
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        let policy = GrantPolicy::new();
        let err = policy.grant("alice", "content.[").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern { .. }));
    }
}
