// interface.rs — Named attribute surfaces.
//
// An interface is a named set of attribute names, optionally extending other
// interfaces. Checkers can be declared "by interface" (every name the
// interface provides, including inherited ones, gets the same permission),
// and objects report the interfaces they provide through the allow-listed
// `interfaces` attribute.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named set of attribute names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    name: String,
    #[serde(default)]
    names: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bases: Vec<Interface>,
}

impl Interface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            names: BTreeSet::new(),
            bases: Vec::new(),
        }
    }

    /// Add attribute names declared directly on this interface.
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare that this interface extends `base`.
    pub fn extends(mut self, base: Interface) -> Self {
        self.bases.push(base);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names declared directly on this interface.
    pub fn own_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Every name this interface provides, including inherited ones.
    pub fn all_names(&self) -> BTreeSet<String> {
        let mut all = self.names.clone();
        for base in &self.bases {
            all.extend(base.all_names());
        }
        all
    }

    /// True if this interface is `other` or extends it (directly or not).
    pub fn is_or_extends(&self, other: &str) -> bool {
        self.name == other || self.bases.iter().any(|b| b.is_or_extends(other))
    }
}
