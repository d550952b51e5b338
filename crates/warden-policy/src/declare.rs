// declare.rs — Typed protection declarations.
//
// A declaration describes how instances of one type are protected:
//
// - `Require`: the listed names (and every name of the listed interfaces)
//   need `permission` to read; `write_names`/`write_interfaces` need it to
//   assign or delete.
// - `Allow`: the listed names and interfaces are readable by anyone.
// - `LikeUnto`: copy every binding from another type's checker.
//
// `declare` validates the whole batch before touching the registry, then
// applies it through the registry's copy-on-write protect API. Bindings that
// conflict with existing ones fail with `DuplicateBinding`.

use tracing::debug;
use warden_security::{Interface, Permission, Registry, TypeKey};

use crate::error::PolicyError;

/// One protection declaration for a type.
#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Require {
        permission: Permission,
        names: Vec<String>,
        interfaces: Vec<Interface>,
        write_names: Vec<String>,
        write_interfaces: Vec<Interface>,
    },
    Allow {
        names: Vec<String>,
        interfaces: Vec<Interface>,
    },
    LikeUnto(TypeKey),
}

impl Declaration {
    /// `permission` guards reading `names`.
    pub fn require<I, S>(permission: impl Into<Permission>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Declaration::Require {
            permission: permission.into(),
            names: names.into_iter().map(Into::into).collect(),
            interfaces: Vec::new(),
            write_names: Vec::new(),
            write_interfaces: Vec::new(),
        }
    }

    /// `permission` guards writing `names`.
    pub fn require_write<I, S>(permission: impl Into<Permission>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Declaration::Require {
            permission: permission.into(),
            names: Vec::new(),
            interfaces: Vec::new(),
            write_names: names.into_iter().map(Into::into).collect(),
            write_interfaces: Vec::new(),
        }
    }

    /// `names` are readable by anyone.
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Declaration::Allow {
            names: names.into_iter().map(Into::into).collect(),
            interfaces: Vec::new(),
        }
    }

    pub fn like_unto(key: TypeKey) -> Self {
        Declaration::LikeUnto(key)
    }

    /// Add read-protected interfaces (`Require`) or public ones (`Allow`).
    pub fn with_interface(mut self, interface: Interface) -> Self {
        match &mut self {
            Declaration::Require { interfaces, .. } | Declaration::Allow { interfaces, .. } => {
                interfaces.push(interface)
            }
            Declaration::LikeUnto(_) => {}
        }
        self
    }

    /// Add write-protected interfaces to a `Require`.
    pub fn with_write_interface(mut self, interface: Interface) -> Self {
        if let Declaration::Require {
            write_interfaces, ..
        } = &mut self
        {
            write_interfaces.push(interface);
        }
        self
    }

    fn validate(&self, target: TypeKey) -> Result<(), PolicyError> {
        match self {
            Declaration::Require {
                permission,
                names,
                interfaces,
                write_names,
                write_interfaces,
            } if names.is_empty()
                && interfaces.is_empty()
                && write_names.is_empty()
                && write_interfaces.is_empty() =>
            {
                Err(PolicyError::InvalidDeclaration(format!(
                    "requirement of '{permission}' on {} names nothing to protect",
                    target.name()
                )))
            }
            Declaration::Allow { names, interfaces }
                if names.is_empty() && interfaces.is_empty() =>
            {
                Err(PolicyError::InvalidDeclaration(format!(
                    "allowance on {} names neither attributes nor interfaces",
                    target.name()
                )))
            }
            _ => Ok(()),
        }
    }

    fn apply(&self, registry: &Registry, target: TypeKey) -> Result<(), PolicyError> {
        match self {
            Declaration::Require {
                permission,
                names,
                interfaces,
                write_names,
                write_interfaces,
            } => {
                for name in names {
                    registry.protect_name(target, name, permission.clone())?;
                }
                for interface in interfaces {
                    registry.protect_interface(target, interface, permission.clone())?;
                }
                for name in write_names {
                    registry.protect_write_name(target, name, permission.clone())?;
                }
                for interface in write_interfaces {
                    for name in interface.all_names() {
                        registry.protect_write_name(target, &name, permission.clone())?;
                    }
                }
            }
            Declaration::Allow { names, interfaces } => {
                for name in names {
                    registry.protect_name(target, name, Permission::Public)?;
                }
                for interface in interfaces {
                    registry.protect_interface(target, interface, Permission::Public)?;
                }
            }
            Declaration::LikeUnto(like) => registry.protect_like_unto(target, *like)?,
        }
        Ok(())
    }
}

/// Validate and apply `declarations` for instances of `target`.
///
/// Nothing is applied if any declaration is invalid. A registry error part
/// way through leaves the earlier declarations applied.
pub fn declare(
    registry: &Registry,
    target: TypeKey,
    declarations: &[Declaration],
) -> Result<(), PolicyError> {
    for declaration in declarations {
        declaration.validate(target)?;
    }
    for declaration in declarations {
        declaration.apply(registry, target)?;
    }
    debug!(
        type_name = target.name(),
        count = declarations.len(),
        "protection declarations applied"
    );
    Ok(())
}
