// combined.rs — Composition of two checkers.
//
// A value protected by a combined checker is accessible if either checker
// allows the access. When both deny, the more informative denial wins:
// `Unauthorized` (the name is governed, you just lack the permission) is
// preferred over `Forbidden` (the name is not on the surface at all), and the
// primary's error is preferred when both agree.

use std::sync::Arc;

use crate::checker::SecurityChecker;
use crate::error::SecurityError;
use crate::operation::Operation;
use crate::permission::Permission;
use crate::value::Value;

/// "Protected by either" composition of a primary and a secondary checker.
#[derive(Debug, Clone)]
pub struct CombinedChecker {
    primary: Arc<dyn SecurityChecker>,
    secondary: Arc<dyn SecurityChecker>,
}

impl CombinedChecker {
    pub fn new(primary: Arc<dyn SecurityChecker>, secondary: Arc<dyn SecurityChecker>) -> Self {
        Self { primary, secondary }
    }

    pub fn primary(&self) -> &Arc<dyn SecurityChecker> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<dyn SecurityChecker> {
        &self.secondary
    }

    fn combine<F>(&self, check: F) -> Result<(), SecurityError>
    where
        F: Fn(&dyn SecurityChecker) -> Result<(), SecurityError>,
    {
        match check(self.primary.as_ref()) {
            Ok(()) => Ok(()),
            Err(primary_err) if primary_err.is_unauthorized() => {
                match check(self.secondary.as_ref()) {
                    Ok(()) => Ok(()),
                    Err(secondary_err) if secondary_err.is_denial() => Err(primary_err),
                    Err(other) => Err(other),
                }
            }
            Err(primary_err) if primary_err.is_forbidden() => check(self.secondary.as_ref()),
            Err(other) => Err(other),
        }
    }
}

impl SecurityChecker for CombinedChecker {
    fn check_read(&self, target: &Value, name: &str) -> Result<(), SecurityError> {
        self.combine(|checker| checker.check_read(target, name))
    }

    fn check_write(&self, target: &Value, name: &str) -> Result<(), SecurityError> {
        self.combine(|checker| checker.check_write(target, name))
    }

    fn check_operation(&self, target: &Value, op: Operation) -> Result<(), SecurityError> {
        self.combine(|checker| checker.check_operation(target, op))
    }

    fn read_permission(&self, name: &str) -> Option<Permission> {
        self.primary
            .read_permission(name)
            .or_else(|| self.secondary.read_permission(name))
    }

    fn write_permission(&self, name: &str) -> Option<Permission> {
        self.primary
            .write_permission(name)
            .or_else(|| self.secondary.write_permission(name))
    }

    fn wrap_result(&self, value: Value) -> Value {
        self.primary.wrap_result(value)
    }
}
