// registry.rs — Type → checker registry and checker selection.
//
// The registry maps a value's `TypeKey` to one of:
//   - a checker, used for every instance of the type;
//   - a factory, asked per instance (it may return another entry);
//   - `NoGuard`, meaning instances are never wrapped.
//
// Selection for a value (`resolve`):
//   0. An object carrying its own checker (`Object::security_checker`) wins.
//   1. No entry for the type → `Undeclared`.
//   2. `NoGuard` → `NoGuard`; a checker → `Guard`.
//   3. A factory is invoked; its result is resolved again, at most twice.
//      A third level of factories is treated as `Undeclared` (fail closed).
//
// `guard` turns `Undeclared` into a handle with the registry's default
// checker, which has no bindings, so only allow-listed names get through.
//
// A fresh registry maps the immutable primitive types and the guarded
// handle type itself to `NoGuard`. The write API (`protect_*`) replaces a
// registered checker with an extended copy; handles created earlier keep
// the checker they were built with.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::checker::{Checker, CheckerBuilder, SecurityChecker, Verbosity, STANDARD_ALLOWED};
use crate::error::SecurityError;
use crate::guarded::{guard_with, Guarded};
use crate::interface::Interface;
use crate::permission::Permission;
use crate::value::{TypeKey, Value};

/// Nesting limit for factories returning factories.
const MAX_FACTORY_DEPTH: usize = 2;

/// Per-instance checker selection.
pub type Factory = Arc<dyn Fn(&Value) -> Option<Entry> + Send + Sync>;

/// What the registry holds for one type.
#[derive(Clone)]
pub enum Entry {
    Checker(Arc<dyn SecurityChecker>),
    Factory(Factory),
    NoGuard,
}

impl Entry {
    pub fn checker(checker: impl SecurityChecker + 'static) -> Self {
        Entry::Checker(Arc::new(checker))
    }

    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn(&Value) -> Option<Entry> + Send + Sync + 'static,
    {
        Entry::Factory(Arc::new(factory))
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Checker(checker) => f.debug_tuple("Checker").field(checker).finish(),
            Entry::Factory(_) => f.write_str("Factory"),
            Entry::NoGuard => f.write_str("NoGuard"),
        }
    }
}

/// Outcome of checker selection for one value.
#[derive(Debug, Clone)]
pub enum Resolution {
    Guard(Arc<dyn SecurityChecker>),
    NoGuard,
    Undeclared,
}

struct RegistryState {
    entries: HashMap<TypeKey, Entry>,
    available_by_default: HashSet<String>,
    verbosity: Verbosity,
}

impl RegistryState {
    fn seeded() -> Self {
        let entries = TypeKey::primitives()
            .into_iter()
            .map(|key| (key, Entry::NoGuard))
            .collect();
        Self {
            entries,
            available_by_default: STANDARD_ALLOWED.iter().map(|s| s.to_string()).collect(),
            verbosity: Verbosity::Quiet,
        }
    }
}

pub(crate) struct RegistryInner {
    state: RwLock<RegistryState>,
    default_checker: Arc<Checker>,
}

impl RegistryInner {
    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_available_by_default(&self, name: &str) -> bool {
        self.read_state().available_by_default.contains(name)
    }

    fn resolve(&self, value: &Value) -> Resolution {
        if let Value::Object(object) = value {
            if let Some(checker) = object.security_checker() {
                return Resolution::Guard(checker);
            }
        }
        let key = value.type_key();
        // Clone out so no lock is held while a factory runs.
        let entry = self.read_state().entries.get(&key).cloned();
        match entry {
            None => Resolution::Undeclared,
            Some(entry) => resolve_entry(entry, value, key, 0),
        }
    }

    fn default_guard(&self) -> Arc<dyn SecurityChecker> {
        self.default_checker.clone()
    }

    /// Protect a value leaving a guarded handle.
    pub(crate) fn wrap(&self, value: Value) -> Value {
        if value.is_guarded() {
            return value;
        }
        match self.resolve(&value) {
            Resolution::Guard(checker) => Value::Guarded(Guarded::new(value, checker)),
            Resolution::NoGuard => value,
            Resolution::Undeclared => Value::Guarded(Guarded::new(value, self.default_guard())),
        }
    }
}

fn resolve_entry(entry: Entry, value: &Value, key: TypeKey, depth: usize) -> Resolution {
    match entry {
        Entry::NoGuard => Resolution::NoGuard,
        Entry::Checker(checker) => Resolution::Guard(checker),
        Entry::Factory(factory) => {
            if depth >= MAX_FACTORY_DEPTH {
                warn!(
                    type_name = key.name(),
                    "checker factories nested too deeply; treating value as undeclared"
                );
                return Resolution::Undeclared;
            }
            match factory(value) {
                None => Resolution::NoGuard,
                Some(next) => resolve_entry(next, value, key, depth + 1),
            }
        }
    }
}

static GLOBAL: Lazy<Registry> = Lazy::new(Registry::new);

/// Handle to a checker registry. Clones share the same registry.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// A new registry holding only the primitive seeds.
    pub fn new() -> Self {
        let inner = Arc::new_cyclic(|weak| RegistryInner {
            state: RwLock::new(RegistryState::seeded()),
            default_checker: Arc::new(Checker::empty(weak.clone(), Verbosity::Quiet)),
        });
        Self { inner }
    }

    /// The process-wide default registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// True if both handles refer to the same registry.
    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Start building a checker that uses this registry's allow-list and
    /// wraps results through it.
    pub fn checker(&self) -> CheckerBuilder {
        CheckerBuilder::new(Arc::downgrade(&self.inner), self.verbosity())
    }

    pub fn register(&self, key: TypeKey, entry: Entry) -> Result<(), SecurityError> {
        let mut state = self.inner.write_state();
        if state.entries.contains_key(&key) {
            return Err(SecurityError::DuplicateRegistration {
                type_name: key.name().to_string(),
            });
        }
        debug!(type_name = key.name(), entry = ?entry, "registered checker entry");
        state.entries.insert(key, entry);
        Ok(())
    }

    pub fn unregister(&self, key: TypeKey) -> Result<Entry, SecurityError> {
        let removed = self.inner.write_state().entries.remove(&key);
        match removed {
            Some(entry) => {
                debug!(type_name = key.name(), "unregistered checker entry");
                Ok(entry)
            }
            None => Err(SecurityError::NotFound {
                type_name: key.name().to_string(),
            }),
        }
    }

    pub fn lookup_for_instances_of(&self, key: TypeKey) -> Option<Entry> {
        self.inner.read_state().entries.get(&key).cloned()
    }

    pub fn resolve(&self, value: &Value) -> Resolution {
        self.inner.resolve(value)
    }

    /// The checker that would guard `value`, or `None` when it would not be
    /// guarded by a declared checker (`NoGuard` or undeclared).
    pub fn select(&self, value: &Value) -> Option<Arc<dyn SecurityChecker>> {
        match self.resolve(value) {
            Resolution::Guard(checker) => Some(checker),
            Resolution::NoGuard | Resolution::Undeclared => None,
        }
    }

    /// Produce a guarded handle for `value`.
    ///
    /// With an explicit checker the value is wrapped with it: a value already
    /// guarded by the same checker is returned as-is, and one guarded by a
    /// different checker is refused with `CheckerConflict`. Without one, the
    /// checker is selected; `NoGuard` values come back unwrapped and
    /// undeclared types get the default checker.
    pub fn guard(
        &self,
        value: Value,
        checker: Option<Arc<dyn SecurityChecker>>,
    ) -> Result<Value, SecurityError> {
        match checker {
            Some(checker) => guard_with(value, checker),
            None => Ok(self.inner.wrap(value)),
        }
    }

    /// The checker used for undeclared types: no bindings at all.
    pub fn default_checker(&self) -> Arc<Checker> {
        self.inner.default_checker.clone()
    }

    /// Restore the seed entries and the standard allow-list.
    pub fn reset(&self) {
        *self.inner.write_state() = RegistryState::seeded();
        debug!("checker registry reset");
    }

    /// Add `name` to the names every checker of this registry allows.
    pub fn allow_by_default(&self, name: impl Into<String>) {
        self.inner
            .write_state()
            .available_by_default
            .insert(name.into());
    }

    pub fn is_available_by_default(&self, name: &str) -> bool {
        self.inner.is_available_by_default(name)
    }

    /// The allow-list, sorted.
    pub fn available_by_default(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read_state()
            .available_by_default
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Verbosity given to checkers built from now on.
    pub fn set_verbosity(&self, verbosity: Verbosity) {
        self.inner.write_state().verbosity = verbosity;
    }

    pub fn verbosity(&self) -> Verbosity {
        self.inner.read_state().verbosity
    }

    /// Require `permission` to read `name` on instances of `key`.
    pub fn protect_name(
        &self,
        key: TypeKey,
        name: &str,
        permission: impl Into<Permission>,
    ) -> Result<(), SecurityError> {
        let permission = permission.into();
        self.protect(key, |builder| builder.require(permission, [name]))
    }

    /// Require `permission` to assign or delete `name` on instances of `key`.
    pub fn protect_write_name(
        &self,
        key: TypeKey,
        name: &str,
        permission: impl Into<Permission>,
    ) -> Result<(), SecurityError> {
        let permission = permission.into();
        self.protect(key, |builder| builder.require_write(permission, [name]))
    }

    /// Require `permission` to read every name of `interface`.
    pub fn protect_interface(
        &self,
        key: TypeKey,
        interface: &Interface,
        permission: impl Into<Permission>,
    ) -> Result<(), SecurityError> {
        let permission = permission.into();
        self.protect(key, |builder| builder.require_interface(permission, interface))
    }

    /// Copy every binding of `like`'s checker onto `key`'s checker.
    pub fn protect_like_unto(&self, key: TypeKey, like: TypeKey) -> Result<(), SecurityError> {
        let source = match self.lookup_for_instances_of(like) {
            Some(Entry::Checker(checker)) => checker.as_checker().cloned().ok_or_else(|| {
                SecurityError::InvalidDeclaration(format!(
                    "{} is protected by a composite checker and cannot be copied",
                    like.name()
                ))
            })?,
            _ => {
                return Err(SecurityError::InvalidDeclaration(format!(
                    "{} has no registered checker to copy",
                    like.name()
                )))
            }
        };
        self.protect(key, |mut builder| {
            for (name, permission) in source.read_bindings() {
                builder = builder.require(permission.clone(), [name]);
            }
            for (name, permission) in source.write_bindings() {
                builder = builder.require_write(permission.clone(), [name]);
            }
            builder
        })
    }

    /// Replace `key`'s checker with an extended copy.
    fn protect<F>(&self, key: TypeKey, extend: F) -> Result<(), SecurityError>
    where
        F: FnOnce(CheckerBuilder) -> CheckerBuilder,
    {
        let mut state = self.inner.write_state();
        let builder = match state.entries.get(&key) {
            None => CheckerBuilder::new(Arc::downgrade(&self.inner), state.verbosity),
            Some(Entry::Checker(existing)) => match existing.as_checker() {
                Some(checker) => checker.to_builder(),
                None => {
                    return Err(SecurityError::InvalidDeclaration(format!(
                        "{} is protected by a composite checker",
                        key.name()
                    )))
                }
            },
            Some(Entry::Factory(_)) => {
                return Err(SecurityError::InvalidDeclaration(format!(
                    "{} is registered with a checker factory",
                    key.name()
                )))
            }
            Some(Entry::NoGuard) => {
                return Err(SecurityError::InvalidDeclaration(format!(
                    "{} is registered as never guarded",
                    key.name()
                )))
            }
        };
        let checker = extend(builder).build()?;
        state.entries.insert(key, Entry::Checker(Arc::new(checker)));
        debug!(type_name = key.name(), "extended registered checker");
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.read_state();
        f.debug_struct("Registry")
            .field("entries", &state.entries.len())
            .field("verbosity", &state.verbosity)
            .finish()
    }
}
