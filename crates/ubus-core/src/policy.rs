//! Argument schemas and the exact-match policy check.

use crate::codec::Attribute;
use crate::value::ValueKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One declared argument of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentPolicy {
    pub name: String,
    pub kind: ValueKind,
}

impl ArgumentPolicy {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered argument schema of a method.
///
/// ```
/// use ubus_core::{Signature, ValueKind};
///
/// let sig = Signature::new()
///     .arg("a", ValueKind::Int32)
///     .arg("b", ValueKind::Int32);
/// assert_eq!(sig.policies().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature {
    policies: Vec<ArgumentPolicy>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a declared argument.
    pub fn arg(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.policies.push(ArgumentPolicy::new(name, kind));
        self
    }

    pub fn policies(&self) -> &[ArgumentPolicy] {
        &self.policies
    }

    /// Name of the first argument declared more than once, if any.
    pub fn duplicate_name(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.policies
            .iter()
            .map(|p| p.name.as_str())
            .find(|name| !seen.insert(*name))
    }
}

impl FromIterator<ArgumentPolicy> for Signature {
    fn from_iter<I: IntoIterator<Item = ArgumentPolicy>>(iter: I) -> Self {
        Self {
            policies: iter.into_iter().collect(),
        }
    }
}

/// Check an inbound attribute set against a method's declared arguments.
///
/// Every attribute must name a declared argument of a compatible kind, no
/// attribute may appear twice, and every declared argument must be present.
pub fn validate(policies: &[ArgumentPolicy], attrs: &[Attribute]) -> bool {
    let mut seen = HashSet::with_capacity(attrs.len());
    let mut matched = 0;

    for attr in attrs {
        let Some(policy) = policies.iter().find(|p| p.name == attr.name) else {
            return false;
        };
        if !policy.kind.accepts(attr.kind) {
            return false;
        }
        if !seen.insert(attr.name.as_str()) {
            return false;
        }
        matched += 1;
    }

    matched == policies.len()
}
