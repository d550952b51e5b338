// checker.rs — Name-to-permission checkers.
//
// A checker answers one question: may the current interaction perform the
// operation called `name` on this value? It holds two immutable maps, one for
// reads (attribute reads, method lookups, operators) and one for writes
// (attribute assignment and deletion). The decision for a name is:
//
// 1. Bound to `Public` → allow, no policy consulted.
// 2. Bound to a named permission → ask the active interaction; deny with
//    `Unauthorized` if it says no.
// 3. Not bound → allow if the name is on the registry's allow-list (reads
//    only), otherwise `Forbidden`.
//
// Checkers are built through `CheckerBuilder`, usually obtained from
// `Registry::checker()` so the checker shares that registry's allow-list and
// uses it to wrap results.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::SecurityError;
use crate::guarded::Guarded;
use crate::interaction;
use crate::interface::Interface;
use crate::operation::Operation;
use crate::permission::Permission;
use crate::registry::RegistryInner;
use crate::value::Value;

/// Names every checker allows even when they are not declared.
pub const STANDARD_ALLOWED: [&str; 13] = [
    "eq",
    "ne",
    "lt",
    "le",
    "gt",
    "ge",
    "hash",
    "truthy",
    "debug",
    "type",
    "interfaces",
    "name",
    "parent",
];

/// How much checker decisions are logged (target `warden::checker`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Nothing is logged.
    #[default]
    Quiet,
    /// Policy-backed grants and every denial.
    Decisions,
    /// Also `Public` and allow-listed accesses.
    All,
}

impl Verbosity {
    /// Map a numeric level (0, 1, 2+) to a verbosity.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Verbosity::Quiet,
            1 => Verbosity::Decisions,
            _ => Verbosity::All,
        }
    }
}

/// The contract guarded handles use to authorize operations.
pub trait SecurityChecker: Send + Sync + fmt::Debug {
    /// Authorize reading attribute `name` (or looking up method `name`).
    fn check_read(&self, target: &Value, name: &str) -> Result<(), SecurityError>;

    /// Authorize assigning or deleting attribute `name`.
    fn check_write(&self, target: &Value, name: &str) -> Result<(), SecurityError>;

    /// Authorize a non-attribute operation, keyed by its canonical name.
    fn check_operation(&self, target: &Value, op: Operation) -> Result<(), SecurityError> {
        self.check_read(target, op.name())
    }

    fn read_permission(&self, name: &str) -> Option<Permission>;

    fn write_permission(&self, name: &str) -> Option<Permission>;

    /// Protect a value flowing out of a guarded handle.
    fn wrap_result(&self, value: Value) -> Value;

    /// The underlying simple checker, if this is one.
    fn as_checker(&self) -> Option<&Checker> {
        None
    }
}

/// Checker identity: two handles hold "the same checker" only if they share
/// the same allocation.
pub fn same_checker(a: &Arc<dyn SecurityChecker>, b: &Arc<dyn SecurityChecker>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Public,
    AllowListed,
    Granted,
    Unauthorized,
    Forbidden,
}

impl Decision {
    fn as_str(self) -> &'static str {
        match self {
            Decision::Public => "public",
            Decision::AllowListed => "allow_listed",
            Decision::Granted => "granted",
            Decision::Unauthorized => "unauthorized",
            Decision::Forbidden => "forbidden",
        }
    }

    fn is_routine(self) -> bool {
        matches!(self, Decision::Public | Decision::AllowListed)
    }
}

/// A simple checker: read and write maps from names to permissions.
#[derive(Clone)]
pub struct Checker {
    read: HashMap<String, Permission>,
    write: HashMap<String, Permission>,
    registry: Weak<RegistryInner>,
    verbosity: Verbosity,
}

impl Checker {
    /// A builder not bound to any registry, not even [`Registry::global`].
    ///
    /// Checkers built this way use only the standard allow-list and wrap
    /// every non-primitive result with an empty checker, so nested values
    /// are locked down. Use [`Registry::checker`] (for example
    /// `Registry::global().checker()`) to get results re-guarded through a
    /// registry's declarations.
    ///
    /// [`Registry::global`]: crate::registry::Registry::global
    /// [`Registry::checker`]: crate::registry::Registry::checker
    pub fn builder() -> CheckerBuilder {
        CheckerBuilder::new(Weak::new(), Verbosity::Quiet)
    }

    /// A checker with no bindings: everything but the allow-list is forbidden.
    pub(crate) fn empty(registry: Weak<RegistryInner>, verbosity: Verbosity) -> Self {
        Self {
            read: HashMap::new(),
            write: HashMap::new(),
            registry,
            verbosity,
        }
    }

    /// A builder pre-loaded with this checker's bindings.
    pub fn to_builder(&self) -> CheckerBuilder {
        CheckerBuilder {
            read: self.read.clone(),
            write: self.write.clone(),
            registry: self.registry.clone(),
            verbosity: self.verbosity,
            error: None,
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn read_bindings(&self) -> impl Iterator<Item = (&str, &Permission)> {
        self.read.iter().map(|(name, perm)| (name.as_str(), perm))
    }

    pub fn write_bindings(&self) -> impl Iterator<Item = (&str, &Permission)> {
        self.write.iter().map(|(name, perm)| (name.as_str(), perm))
    }

    /// Declared read names, sorted.
    pub fn read_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.read.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Declared write names, sorted.
    pub fn write_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.write.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn is_allowed_by_default(&self, name: &str) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.is_available_by_default(name),
            None => STANDARD_ALLOWED.contains(&name),
        }
    }

    fn decide(
        &self,
        target: &Value,
        name: &str,
        access: &'static str,
        bindings: &HashMap<String, Permission>,
        use_allow_list: bool,
    ) -> Result<(), SecurityError> {
        let (decision, result) = match bindings.get(name) {
            Some(Permission::Public) => (Decision::Public, Ok(())),
            Some(permission) => {
                if interaction::check_permission(permission, target)? {
                    (Decision::Granted, Ok(()))
                } else {
                    (
                        Decision::Unauthorized,
                        Err(SecurityError::Unauthorized {
                            target: target.type_name().to_string(),
                            operation: name.to_string(),
                            permission: permission.clone(),
                        }),
                    )
                }
            }
            None if use_allow_list && self.is_allowed_by_default(name) => {
                (Decision::AllowListed, Ok(()))
            }
            None => (
                Decision::Forbidden,
                Err(SecurityError::Forbidden {
                    target: target.type_name().to_string(),
                    operation: name.to_string(),
                }),
            ),
        };
        self.record(decision, access, target, name);
        result
    }

    fn record(&self, decision: Decision, access: &'static str, target: &Value, name: &str) {
        let log = match self.verbosity {
            Verbosity::Quiet => false,
            Verbosity::Decisions => !decision.is_routine(),
            Verbosity::All => true,
        };
        if log {
            info!(
                target: "warden::checker",
                access,
                object = target.type_name(),
                name,
                decision = decision.as_str(),
                "checker decision"
            );
        }
    }
}

impl fmt::Debug for Checker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checker")
            .field("read", &self.read_names())
            .field("write", &self.write_names())
            .field("verbosity", &self.verbosity)
            .finish()
    }
}

impl SecurityChecker for Checker {
    fn check_read(&self, target: &Value, name: &str) -> Result<(), SecurityError> {
        self.decide(target, name, "read", &self.read, true)
    }

    fn check_write(&self, target: &Value, name: &str) -> Result<(), SecurityError> {
        self.decide(target, name, "write", &self.write, false)
    }

    fn read_permission(&self, name: &str) -> Option<Permission> {
        self.read.get(name).cloned()
    }

    fn write_permission(&self, name: &str) -> Option<Permission> {
        self.write.get(name).cloned()
    }

    fn wrap_result(&self, value: Value) -> Value {
        match self.registry.upgrade() {
            Some(registry) => registry.wrap(value),
            None => wrap_detached(value),
        }
    }

    fn as_checker(&self) -> Option<&Checker> {
        Some(self)
    }
}

/// Wrapping without a registry: primitives pass, everything else is locked
/// down behind an empty checker.
pub(crate) fn wrap_detached(value: Value) -> Value {
    if value.is_guarded() || value.is_primitive() {
        return value;
    }
    warn!(
        type_name = value.type_name(),
        "no registry available to wrap result; applying empty checker"
    );
    let checker: Arc<dyn SecurityChecker> =
        Arc::new(Checker::empty(Weak::new(), Verbosity::Quiet));
    Value::Guarded(Guarded::new(value, checker))
}

/// Accumulates bindings for a [`Checker`].
///
/// Binding a name twice to the same permission is fine; binding it to two
/// different permissions makes `build()` fail with `DuplicateBinding`.
#[derive(Debug)]
pub struct CheckerBuilder {
    read: HashMap<String, Permission>,
    write: HashMap<String, Permission>,
    registry: Weak<RegistryInner>,
    verbosity: Verbosity,
    error: Option<SecurityError>,
}

impl CheckerBuilder {
    pub(crate) fn new(registry: Weak<RegistryInner>, verbosity: Verbosity) -> Self {
        Self {
            read: HashMap::new(),
            write: HashMap::new(),
            registry,
            verbosity,
            error: None,
        }
    }

    fn bind(&mut self, write: bool, name: String, permission: Permission) {
        let map = if write { &mut self.write } else { &mut self.read };
        match map.get(&name) {
            Some(existing) if *existing != permission => {
                if self.error.is_none() {
                    self.error = Some(SecurityError::DuplicateBinding {
                        name,
                        existing: existing.clone(),
                        requested: permission,
                    });
                }
            }
            Some(_) => {}
            None => {
                map.insert(name, permission);
            }
        }
    }

    /// Make `names` readable by anyone.
    pub fn allow<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require(Permission::Public, names)
    }

    /// Require `permission` to read `names`.
    pub fn require<I, S>(mut self, permission: impl Into<Permission>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permission = permission.into();
        for name in names {
            self.bind(false, name.into(), permission.clone());
        }
        self
    }

    /// Make every name of `interface` readable by anyone.
    pub fn allow_interface(self, interface: &Interface) -> Self {
        self.require_interface(Permission::Public, interface)
    }

    /// Require `permission` to read every name of `interface`.
    pub fn require_interface(
        self,
        permission: impl Into<Permission>,
        interface: &Interface,
    ) -> Self {
        self.require(permission, interface.all_names())
    }

    /// Require `permission` to assign or delete `names`.
    pub fn require_write<I, S>(mut self, permission: impl Into<Permission>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permission = permission.into();
        for name in names {
            self.bind(true, name.into(), permission.clone());
        }
        self
    }

    pub fn require_write_interface(
        self,
        permission: impl Into<Permission>,
        interface: &Interface,
    ) -> Self {
        self.require_write(permission, interface.all_names())
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn build(self) -> Result<Checker, SecurityError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(Checker {
            read: self.read,
            write: self.write,
            registry: self.registry,
            verbosity: self.verbosity,
        })
    }
}
