// guarded.rs — The guarded handle.
//
// A `Guarded` pairs one value with one checker, both fixed for the life of
// the handle. Every operation goes through `intercept` (or the attribute
// methods), which asks the checker first and wraps whatever comes back out,
// so protection follows the value graph as it is traversed.
//
// Comparison, hashing and truthiness are exempt and go straight to the value.
// Attribute writes are checked against the write map and never wrapped
// (there is nothing to return).

use std::fmt;
use std::sync::Arc;

use crate::checker::{same_checker, SecurityChecker};
use crate::error::{ObjectError, SecurityError};
use crate::operation::Operation;
use crate::registry::{Registry, Resolution};
use crate::value::Value;

struct GuardedInner {
    value: Value,
    checker: Arc<dyn SecurityChecker>,
}

/// A value whose every operation is mediated by a checker.
///
/// Clones are the same handle (see [`Guarded::ptr_eq`]).
#[derive(Clone)]
pub struct Guarded(Arc<GuardedInner>);

impl Guarded {
    /// Callers must not pass an already guarded value; use [`guard_with`].
    pub(crate) fn new(value: Value, checker: Arc<dyn SecurityChecker>) -> Self {
        Self(Arc::new(GuardedInner { value, checker }))
    }

    pub(crate) fn inner(&self) -> &Value {
        &self.0.value
    }

    pub fn checker(&self) -> &Arc<dyn SecurityChecker> {
        &self.0.checker
    }

    /// Handle identity.
    pub fn ptr_eq(&self, other: &Guarded) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Type name of the protected value.
    pub fn type_name(&self) -> &'static str {
        self.0.value.type_name()
    }

    fn wrap(&self, value: Value) -> Value {
        self.0.checker.wrap_result(value)
    }

    /// Perform `op` on the protected value.
    pub fn intercept(&self, op: Operation, args: &[Value]) -> Result<Value, SecurityError> {
        let value = &self.0.value;
        if op.is_exempt() {
            return value.dispatch(op, args);
        }
        self.0.checker.check_operation(value, op)?;
        match op {
            Operation::Iter => {
                let items = value.iterate()?;
                Ok(Value::list(items.into_iter().map(|item| self.wrap(item))))
            }
            Operation::InPlace(bin) => {
                let rhs = args.first().ok_or_else(|| {
                    ObjectError::TypeMismatch(format!("'{op}' expects an operand"))
                })?;
                match value.in_place(bin, rhs)? {
                    None => Ok(Value::Guarded(self.clone())),
                    Some(result) => Ok(self.wrap(result)),
                }
            }
            _ => {
                let result = value.dispatch(op, args)?;
                Ok(self.wrap(result))
            }
        }
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, SecurityError> {
        self.0.checker.check_read(&self.0.value, name)?;
        let raw = self.0.value.raw_get_attr(name)?;
        Ok(self.wrap(raw))
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), SecurityError> {
        self.0.checker.check_write(&self.0.value, name)?;
        self.0.value.raw_set_attr(name, value)
    }

    pub fn del_attr(&self, name: &str) -> Result<(), SecurityError> {
        self.0.checker.check_write(&self.0.value, name)?;
        self.0.value.raw_del_attr(name)
    }

    /// Method lookup is a read of `name`; the return value is wrapped.
    pub fn call_method(&self, name: &str, args: &[Value]) -> Result<Value, SecurityError> {
        self.0.checker.check_read(&self.0.value, name)?;
        let result = self.0.value.raw_call_method(name, args)?;
        Ok(self.wrap(result))
    }

    /// Checked textual rendering.
    pub fn render(&self) -> Result<String, SecurityError> {
        match self.intercept(Operation::Display, &[])? {
            Value::Text(s) => Ok(s.to_string()),
            _ => Ok(self.placeholder()),
        }
    }

    fn placeholder(&self) -> String {
        format!("<guarded {}>", self.type_name())
    }
}

impl fmt::Display for Guarded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.render() {
            Ok(text) => f.write_str(&text),
            Err(_) => f.write_str(&self.placeholder()),
        }
    }
}

impl fmt::Debug for Guarded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.intercept(Operation::Debug, &[]) {
            Ok(Value::Text(text)) => f.write_str(&text),
            _ => f.write_str(&self.placeholder()),
        }
    }
}

/// Wrap `value` with an explicit checker.
///
/// An already guarded value is returned unchanged when it uses the same
/// checker and refused with `CheckerConflict` otherwise.
pub fn guard_with(value: Value, checker: Arc<dyn SecurityChecker>) -> Result<Value, SecurityError> {
    match value {
        Value::Guarded(existing) => {
            if same_checker(existing.checker(), &checker) {
                Ok(Value::Guarded(existing))
            } else {
                Err(SecurityError::CheckerConflict)
            }
        }
        bare => Ok(Value::Guarded(Guarded::new(bare, checker))),
    }
}

/// The raw value behind a guard (or the value itself if unguarded).
///
/// This bypasses all protection.
pub fn remove_guard(value: &Value) -> Value {
    match value {
        Value::Guarded(g) => g.inner().clone(),
        other => other.clone(),
    }
}

/// The checker of a guarded value.
pub fn get_checker(value: &Value) -> Option<Arc<dyn SecurityChecker>> {
    value.as_guarded().map(|g| g.checker().clone())
}

pub fn is_guarded(value: &Value) -> bool {
    value.is_guarded()
}

/// Target and checker that govern `value`, or `None` when it is unrestricted.
fn governing_checker(
    registry: &Registry,
    value: &Value,
) -> Option<(Value, Arc<dyn SecurityChecker>)> {
    if let Value::Guarded(g) = value {
        return Some((g.inner().clone(), g.checker().clone()));
    }
    match registry.resolve(value) {
        Resolution::Guard(checker) => Some((value.clone(), checker)),
        Resolution::NoGuard => None,
        Resolution::Undeclared => Some((value.clone(), registry.default_checker())),
    }
}

/// Whether the current interaction may read `name` on `value`.
///
/// A missing permission answers `false`; a name outside the protected
/// surface is an error (`Forbidden`).
pub fn can_read(registry: &Registry, value: &Value, name: &str) -> Result<bool, SecurityError> {
    let Some((target, checker)) = governing_checker(registry, value) else {
        return Ok(true);
    };
    match checker.check_read(&target, name) {
        Ok(()) => Ok(true),
        Err(e) if e.is_unauthorized() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Whether the current interaction may write `name` on `value`.
///
/// A name that is not writable but is readable (or read-protected) answers
/// `false`; a name absent from both surfaces is `Forbidden`.
pub fn can_write(registry: &Registry, value: &Value, name: &str) -> Result<bool, SecurityError> {
    let Some((target, checker)) = governing_checker(registry, value) else {
        return Ok(true);
    };
    match checker.check_write(&target, name) {
        Ok(()) => Ok(true),
        Err(e) if e.is_unauthorized() => Ok(false),
        Err(write_err) if write_err.is_forbidden() => match checker.check_read(&target, name) {
            Ok(()) => Ok(false),
            Err(read_err) if read_err.is_unauthorized() => Ok(false),
            Err(read_err) if read_err.is_forbidden() => Err(write_err),
            Err(other) => Err(other),
        },
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction;
    use crate::operation::{BinaryOp, CompareOp};
    use crate::registry::Entry;
    use crate::test_support::{FixedPolicy, Record};
    use crate::value::{List, TypeKey};
    use std::collections::HashSet;

    fn setup() -> (Registry, Arc<FixedPolicy>, interaction::InteractionGuard) {
        let registry = Registry::new();
        let checker = registry
            .checker()
            .allow(["title", "describe", "child", "iter", "len", "display"])
            .require("content.View", ["body", "call", "add", "rev_add"])
            .require("content.Edit", ["add_assign"])
            .require_write("content.Edit", ["title"])
            .build()
            .unwrap();
        registry
            .register(TypeKey::of::<Record>(), Entry::checker(checker))
            .unwrap();
        let policy = FixedPolicy::granting(&[]);
        let active = interaction::enter(policy.clone(), Vec::new()).unwrap();
        (registry, policy, active)
    }

    fn document(registry: &Registry) -> Value {
        let record = Record::with(&[
            ("title", Value::text("Plans")),
            ("body", Value::text("secret")),
        ]);
        registry.guard(record, None).unwrap()
    }

    #[test]
    fn attribute_reads_are_checked() {
        let (registry, policy, _active) = setup();
        let doc = document(&registry);
        assert_eq!(doc.get_attr("title").unwrap(), Value::text("Plans"));
        assert!(doc.get_attr("body").unwrap_err().is_unauthorized());
        assert!(doc.get_attr("hidden").unwrap_err().is_forbidden());

        policy.grant("content.View");
        assert_eq!(doc.get_attr("body").unwrap(), Value::text("secret"));
    }

    #[test]
    fn attribute_writes_use_the_write_map() {
        let (registry, policy, _active) = setup();
        let doc = document(&registry);
        assert!(doc
            .set_attr("title", Value::text("New"))
            .unwrap_err()
            .is_unauthorized());
        assert!(doc.set_attr("body", Value::Int(1)).unwrap_err().is_forbidden());
        assert!(doc.del_attr("title").unwrap_err().is_unauthorized());

        policy.grant("content.Edit");
        doc.set_attr("title", Value::text("New")).unwrap();
        assert_eq!(doc.get_attr("title").unwrap(), Value::text("New"));
    }

    #[test]
    fn results_are_rewrapped() {
        let (registry, _policy, _active) = setup();
        let doc = document(&registry);
        let child = doc.call_method("child", &[]).unwrap();
        assert!(child.is_guarded());
        assert!(child.get_attr("body").unwrap_err().is_unauthorized());

        // Primitives pass through unwrapped.
        let described = doc.call_method("describe", &[]).unwrap();
        assert!(!described.is_guarded());
    }

    #[test]
    fn operations_are_checked_by_canonical_name() {
        let (registry, policy, _active) = setup();
        let doc = document(&registry);
        assert_eq!(doc.len().unwrap(), 2);
        assert!(doc.call(&[]).unwrap_err().is_unauthorized());
        assert!(doc.get_item(&Value::Int(0)).unwrap_err().is_forbidden());
        assert!((&doc + &Value::Int(1)).unwrap_err().is_unauthorized());
        assert!((&Value::Int(1) + &doc).unwrap_err().is_unauthorized());

        policy.grant("content.View");
        assert_eq!((&doc + &Value::Int(1)).unwrap(), Value::Int(3));
        assert_eq!((&Value::Int(1) + &doc).unwrap(), Value::Int(3));
        assert_eq!(doc.call(&[]).unwrap(), Value::text("called"));
    }

    #[test]
    fn exempt_operations_skip_the_checker() {
        let registry = Registry::new();
        let deny_all: Arc<dyn SecurityChecker> = registry.default_checker();
        let raw = Value::list([1, 2]);
        let guarded = guard_with(raw.clone(), deny_all).unwrap();

        assert_eq!(guarded, raw);
        assert!(guarded.compare(CompareOp::Le, &raw));
        assert_eq!(guarded.hash_value(), raw.hash_value());
        assert!(guarded.truthy());
        assert!(guarded.len().unwrap_err().is_forbidden());

        let mut set = HashSet::new();
        set.insert(guarded.clone());
        assert!(set.contains(&raw));
    }

    #[test]
    fn iteration_wraps_each_item() {
        let registry = Registry::new();
        let checker = registry.checker().allow(["iter"]).build().unwrap();
        let list = Value::list([Record::value(), Value::Int(7)]);
        let guarded = guard_with(list, Arc::new(checker)).unwrap();

        let items = guarded.iterate().unwrap();
        assert!(items[0].is_guarded());
        assert_eq!(items[1], Value::Int(7));
        assert!(!items[1].is_guarded());
    }

    #[test]
    fn maps_guarded_for_iteration_are_read_only() {
        let registry = Registry::new();
        let checker = registry.checker().allow(["iter", "len"]).build().unwrap();
        registry
            .register(TypeKey::map(), Entry::checker(checker))
            .unwrap();
        let raw = Value::map([(1, "one"), (2, "two")]);
        let guarded = registry.guard(raw.clone(), None).unwrap();
        assert!(guarded.is_guarded());

        assert_eq!(guarded.iterate().unwrap(), raw.iterate().unwrap());
        assert_eq!(guarded.len().unwrap(), 2);

        let err = guarded
            .set_item(Value::Int(3), Value::text("three"))
            .unwrap_err();
        assert!(matches!(err, SecurityError::Forbidden { ref target, .. } if target == "map"));
        assert!(guarded
            .call_method("insert", &[Value::Int(3), Value::text("three")])
            .unwrap_err()
            .is_forbidden());
        assert!(guarded.del_item(&Value::Int(1)).unwrap_err().is_forbidden());
        assert!(guarded.get_item(&Value::Int(1)).unwrap_err().is_forbidden());

        assert_eq!(raw.len().unwrap(), 2);
        assert_eq!(raw, Value::map([(1, "one"), (2, "two")]));
    }

    #[test]
    fn in_place_mutation_keeps_handle_identity() {
        let registry = Registry::new();
        let checker = registry.checker().allow(["add_assign", "len"]).build().unwrap();
        let storage = List::new(vec![Value::Int(1)]);
        let guarded = guard_with(Value::List(storage.clone()), Arc::new(checker)).unwrap();

        let mut handle = guarded.clone();
        handle.apply_in_place(BinaryOp::Add, &Value::list([2, 3])).unwrap();
        assert!(handle.as_guarded().unwrap().ptr_eq(guarded.as_guarded().unwrap()));
        assert_eq!(storage.len(), 3);
        assert_eq!(guarded.len().unwrap(), 3);
    }

    #[test]
    fn in_place_on_objects_is_checked_once_under_its_own_name() {
        let (registry, policy, _active) = setup();
        let doc = document(&registry);
        let mut handle = doc.clone();
        assert!(handle
            .apply_in_place(BinaryOp::Add, &Value::Int(1))
            .unwrap_err()
            .is_unauthorized());

        policy.grant("content.Edit");
        handle.apply_in_place(BinaryOp::Add, &Value::Int(5)).unwrap();
        assert!(handle.as_guarded().unwrap().ptr_eq(doc.as_guarded().unwrap()));
        assert_eq!(
            remove_guard(&doc).get_attr("counter").unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn display_falls_back_when_denied() {
        let registry = Registry::new();
        let guarded = registry.guard(Value::list([1]), None).unwrap();
        assert_eq!(guarded.to_string(), "<guarded list>");
        assert!(guarded.render().unwrap_err().is_forbidden());
        // debug is allow-listed
        assert_eq!(format!("{guarded:?}"), "[1]");

        let (registry, _policy, _active) = setup();
        let doc = document(&registry);
        assert_eq!(doc.render().unwrap(), "Record(2 fields)");
    }

    #[test]
    fn rewrapping_follows_checker_identity() {
        let registry = Registry::new();
        let a: Arc<dyn SecurityChecker> = Arc::new(registry.checker().build().unwrap());
        let b: Arc<dyn SecurityChecker> = Arc::new(registry.checker().build().unwrap());

        let once = guard_with(Record::value(), a.clone()).unwrap();
        let again = guard_with(once.clone(), a).unwrap();
        assert!(once.as_guarded().unwrap().ptr_eq(again.as_guarded().unwrap()));
        assert_eq!(guard_with(once, b), Err(SecurityError::CheckerConflict));
    }

    #[test]
    fn escape_hatches_expose_value_and_checker() {
        let registry = Registry::new();
        let raw = Record::value();
        let checker: Arc<dyn SecurityChecker> = Arc::new(registry.checker().build().unwrap());
        let guarded = guard_with(raw.clone(), checker.clone()).unwrap();

        assert!(is_guarded(&guarded));
        assert!(!is_guarded(&remove_guard(&guarded)));
        assert_eq!(remove_guard(&guarded), raw);
        assert!(same_checker(&get_checker(&guarded).unwrap(), &checker));
        assert!(get_checker(&raw).is_none());
    }

    #[test]
    fn can_read_and_can_write() {
        let (registry, policy, _active) = setup();
        let doc = document(&registry);

        assert!(can_read(&registry, &doc, "title").unwrap());
        assert!(!can_read(&registry, &doc, "body").unwrap());
        assert!(can_read(&registry, &doc, "hidden").unwrap_err().is_forbidden());

        // Writable name without the permission.
        assert!(!can_write(&registry, &doc, "title").unwrap());
        // Not writable but readable (publicly or behind a permission).
        assert!(!can_write(&registry, &doc, "describe").unwrap());
        assert!(!can_write(&registry, &doc, "body").unwrap());
        // Neither surface.
        assert!(can_write(&registry, &doc, "hidden").unwrap_err().is_forbidden());

        policy.grant("content.Edit");
        assert!(can_write(&registry, &doc, "title").unwrap());

        // Unguarded values are unrestricted.
        assert!(can_read(&registry, &Value::Int(1), "anything").unwrap());
        assert!(can_write(&registry, &Value::Int(1), "anything").unwrap());

        // Unwrapped values use the registry's choice.
        let raw = Record::value();
        assert!(!can_read(&registry, &raw, "body").unwrap());
    }
}
