// interaction.rs — The task-scoped security context.
//
// An interaction records who is acting (participations) and which policy
// decides their permissions. Exactly zero or one interaction is active per
// task: inside `scope(..)` the slot is tokio task-local, elsewhere it is
// thread-local. Checkers reach the active interaction through
// `check_permission`, never through an explicit argument.
//
// Lifecycle:
//   begin   → active (fails with AlreadyActive if one is active)
//   end     → active moves to "previous" (no-op when nothing is active)
//   restore → previous becomes active again (or the slot is cleared)

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::SecurityError;
use crate::permission::Permission;
use crate::policy::SecurityPolicy;
use crate::principal::{system_principal, Principal};
use crate::value::Value;

/// One actor's part in an interaction.
#[derive(Debug, Clone)]
pub struct Participation {
    pub id: Uuid,
    /// `None` for an unauthenticated participant.
    pub principal: Option<Arc<Principal>>,
    /// Where the participation comes from (request metadata and the like).
    pub context: serde_json::Value,
}

impl Participation {
    pub fn new(principal: Option<Arc<Principal>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal,
            context: serde_json::Value::Null,
        }
    }

    pub fn system() -> Self {
        Self::new(Some(system_principal()))
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A security context: participants plus the policy that judges them.
pub struct Interaction {
    id: Uuid,
    started_at: DateTime<Utc>,
    policy: Arc<dyn SecurityPolicy>,
    participations: RwLock<Vec<Participation>>,
}

impl Interaction {
    pub fn new(policy: Arc<dyn SecurityPolicy>, participations: Vec<Participation>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            policy,
            participations: RwLock::new(participations),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn policy(&self) -> &Arc<dyn SecurityPolicy> {
        &self.policy
    }

    /// Copy of the current participations.
    pub fn participations(&self) -> Vec<Participation> {
        self.participations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_participation(&self, participation: Participation) {
        debug!(interaction = %self.id, participation = %participation.id, "participation added");
        self.participations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(participation);
    }

    pub fn remove_participation(&self, id: Uuid) -> Option<Participation> {
        let mut participations = self
            .participations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let pos = participations.iter().position(|p| p.id == id)?;
        debug!(interaction = %self.id, participation = %id, "participation removed");
        Some(participations.remove(pos))
    }

    /// Ask this interaction's policy about `permission`.
    pub fn check_permission(&self, permission: &Permission, object: &Value) -> bool {
        if permission.is_public() {
            return true;
        }
        let participations = self.participations();
        self.policy
            .check_permission(permission, object, &participations)
    }
}

impl fmt::Debug for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interaction")
            .field("id", &self.id)
            .field("started_at", &self.started_at)
            .field("policy", &self.policy.name())
            .field("participations", &self.participations().len())
            .finish()
    }
}

#[derive(Default)]
struct InteractionSlot {
    active: Option<Arc<Interaction>>,
    previous: Option<Arc<Interaction>>,
}

thread_local! {
    static THREAD_SLOT: RefCell<InteractionSlot> = RefCell::new(InteractionSlot::default());
}

tokio::task_local! {
    static TASK_SLOT: RefCell<InteractionSlot>;
}

/// Run `f` against the slot of the current task (inside `scope`) or thread.
/// `f` must not call back into this module.
fn with_slot<R>(f: impl FnOnce(&mut InteractionSlot) -> R) -> R {
    if TASK_SLOT.try_with(|_| ()).is_ok() {
        TASK_SLOT.with(|slot| f(&mut slot.borrow_mut()))
    } else {
        THREAD_SLOT.with(|slot| f(&mut slot.borrow_mut()))
    }
}

/// Start an interaction in the current task.
pub fn begin(
    policy: Arc<dyn SecurityPolicy>,
    participations: Vec<Participation>,
) -> Result<Arc<Interaction>, SecurityError> {
    let interaction = Arc::new(Interaction::new(policy, participations));
    with_slot(|slot| {
        if slot.active.is_some() {
            return Err(SecurityError::AlreadyActive);
        }
        slot.active = Some(interaction.clone());
        Ok(())
    })?;
    debug!(
        interaction = %interaction.id(),
        policy = interaction.policy().name(),
        "interaction started"
    );
    Ok(interaction)
}

/// Start an interaction that ends when the returned guard is dropped.
pub fn enter(
    policy: Arc<dyn SecurityPolicy>,
    participations: Vec<Participation>,
) -> Result<InteractionGuard, SecurityError> {
    let interaction = begin(policy, participations)?;
    Ok(InteractionGuard {
        interaction,
        _not_send: PhantomData,
    })
}

/// The active interaction of the current task, if any.
pub fn current() -> Option<Arc<Interaction>> {
    with_slot(|slot| slot.active.clone())
}

/// End the active interaction, remembering it for [`restore`].
pub fn end() {
    let ended = with_slot(|slot| {
        let ended = slot.active.take();
        if let Some(active) = &ended {
            slot.previous = Some(active.clone());
        }
        ended
    });
    if let Some(interaction) = ended {
        debug!(interaction = %interaction.id(), "interaction ended");
    }
}

/// Reinstate the interaction saved by the last [`end`], or clear the slot
/// when there is none. The saved interaction is consumed.
pub fn restore() {
    let restored = with_slot(|slot| {
        slot.active = slot.previous.take();
        slot.active.clone()
    });
    if let Some(interaction) = restored {
        debug!(interaction = %interaction.id(), "interaction restored");
    }
}

/// Whether the active interaction grants `permission` on `object`.
///
/// `Public` and an absent permission are granted without an interaction;
/// anything else needs one.
pub fn check_permission<'a>(
    permission: impl Into<Option<&'a Permission>>,
    object: &Value,
) -> Result<bool, SecurityError> {
    let permission = match permission.into() {
        None => return Ok(true),
        Some(p) if p.is_public() => return Ok(true),
        Some(p) => p,
    };
    // Cloned out so the slot is not borrowed while the policy runs.
    let interaction = current().ok_or(SecurityError::NoActiveInteraction)?;
    Ok(interaction.check_permission(permission, object))
}

/// Run `future` with its own, initially empty, interaction slot.
pub async fn scope<F: Future>(future: F) -> F::Output {
    TASK_SLOT
        .scope(RefCell::new(InteractionSlot::default()), future)
        .await
}

/// Run `f` with its own, initially empty, interaction slot.
pub fn sync_scope<R>(f: impl FnOnce() -> R) -> R {
    TASK_SLOT.sync_scope(RefCell::new(InteractionSlot::default()), f)
}

/// Ends its interaction when dropped. Bound to the task that created it.
#[must_use = "the interaction ends when the guard is dropped"]
pub struct InteractionGuard {
    interaction: Arc<Interaction>,
    _not_send: PhantomData<*const ()>,
}

impl InteractionGuard {
    pub fn interaction(&self) -> &Arc<Interaction> {
        &self.interaction
    }
}

impl fmt::Debug for InteractionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InteractionGuard")
            .field(&self.interaction.id())
            .finish()
    }
}

impl Drop for InteractionGuard {
    fn drop(&mut self) {
        let still_active = with_slot(|slot| {
            slot.active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &self.interaction))
        });
        if still_active {
            end();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ParanoidPolicy, PermissivePolicy};
    use crate::test_support::FixedPolicy;

    fn permissive() -> Arc<dyn SecurityPolicy> {
        Arc::new(PermissivePolicy)
    }

    #[test]
    fn begin_end_restore_sequence() {
        assert!(current().is_none());
        let first = begin(permissive(), Vec::new()).unwrap();
        assert!(Arc::ptr_eq(&current().unwrap(), &first));
        assert_eq!(
            begin(permissive(), Vec::new()).unwrap_err(),
            SecurityError::AlreadyActive
        );

        end();
        assert!(current().is_none());
        restore();
        assert!(Arc::ptr_eq(&current().unwrap(), &first));

        // The stash was consumed: end + restore + restore clears.
        end();
        restore();
        restore();
        assert!(current().is_none());
    }

    #[test]
    fn end_without_active_interaction_is_a_no_op() {
        let first = begin(permissive(), Vec::new()).unwrap();
        end();
        end();
        restore();
        assert!(Arc::ptr_eq(&current().unwrap(), &first));
        end();
    }

    #[test]
    fn guard_ends_on_drop() {
        {
            let guard = enter(permissive(), Vec::new()).unwrap();
            assert_eq!(current().unwrap().id(), guard.interaction().id());
        }
        assert!(current().is_none());
        restore();
        assert!(current().is_some());
        end();
    }

    #[test]
    fn public_and_absent_permissions_need_no_interaction() {
        assert!(check_permission(&Permission::Public, &Value::None).unwrap());
        assert!(check_permission(None, &Value::None).unwrap());
        assert_eq!(
            check_permission(&Permission::named("x"), &Value::None),
            Err(SecurityError::NoActiveInteraction)
        );
    }

    #[test]
    fn named_permissions_go_to_the_policy() {
        let _active = enter(Arc::new(ParanoidPolicy), vec![Participation::system()]).unwrap();
        assert!(check_permission(&Permission::named("x"), &Value::None).unwrap());

        let interaction = current().unwrap();
        let user = Participation::new(Some(Arc::new(Principal::new("bob", "Bob"))));
        let user_id = user.id;
        interaction.add_participation(user);
        assert!(!check_permission(&Permission::named("x"), &Value::None).unwrap());

        assert!(interaction.remove_participation(user_id).is_some());
        assert!(interaction.remove_participation(user_id).is_none());
        assert!(check_permission(&Permission::named("x"), &Value::None).unwrap());
    }

    #[test]
    fn participation_context_is_kept() {
        let p = Participation::system().with_context(serde_json::json!({"ip": "127.0.0.1"}));
        let interaction = Interaction::new(permissive(), vec![p]);
        assert_eq!(
            interaction.participations()[0].context["ip"],
            serde_json::json!("127.0.0.1")
        );
    }

    #[tokio::test]
    async fn scopes_isolate_tasks() {
        let outer = tokio::spawn(scope(async {
            begin(FixedPolicy::granting(&["a"]), Vec::new()).unwrap();
            let inner = tokio::spawn(scope(async { current().is_none() }))
                .await
                .unwrap();
            let outer_active = current().is_some();
            end();
            (inner, outer_active)
        }));
        let (inner_empty, outer_active) = outer.await.unwrap();
        assert!(inner_empty);
        assert!(outer_active);
    }

    #[tokio::test]
    async fn scope_survives_await_points() {
        scope(async {
            let interaction = begin(permissive(), Vec::new()).unwrap();
            tokio::task::yield_now().await;
            assert!(Arc::ptr_eq(&current().unwrap(), &interaction));
            end();
        })
        .await;
    }

    #[test]
    fn sync_scope_has_its_own_slot() {
        let outer = begin(permissive(), Vec::new()).unwrap();
        let inner_empty = sync_scope(|| current().is_none());
        assert!(inner_empty);
        assert!(Arc::ptr_eq(&current().unwrap(), &outer));
        end();
    }
}
