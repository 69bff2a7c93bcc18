//! Package requirements.
//!
//! A requirement names a definition (optionally namespace-qualified with
//! `::`), an optional bracketed variant selector, and a specifier set:
//! `maya::mtoa[gpu] >=2, <3`.

use crate::specifier::{SpecifierError, SpecifierSet};
use crate::version::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequirementError {
    #[error("invalid requirement {literal:?}: {reason}")]
    Invalid { literal: String, reason: String },
    #[error("invalid requirement {literal:?}: {source}")]
    Specifier {
        literal: String,
        source: SpecifierError,
    },
}

impl RequirementError {
    fn new(literal: &str, reason: impl Into<String>) -> Self {
        RequirementError::Invalid {
            literal: literal.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RequirementError>;

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-')
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    namespace: Option<String>,
    name: String,
    extras: BTreeSet<String>,
    specifiers: SpecifierSet,
}

impl Requirement {
    pub fn new(
        namespace: Option<String>,
        name: impl Into<String>,
        extras: impl IntoIterator<Item = String>,
        specifiers: SpecifierSet,
    ) -> Self {
        Self {
            namespace,
            name: name.into(),
            extras: extras.into_iter().collect(),
            specifiers,
        }
    }

    /// An unconstrained requirement on a bare name.
    pub fn any(name: impl Into<String>) -> Self {
        Self::new(None, name, [], SpecifierSet::any())
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extras(&self) -> &BTreeSet<String> {
        &self.extras
    }

    pub fn specifiers(&self) -> &SpecifierSet {
        &self.specifiers
    }

    /// `namespace::name`, or the bare name when no namespace is set.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}::{}", self.name),
            None => self.name.clone(),
        }
    }

    /// Match against the identity of a materialized package. The namespace
    /// only constrains when the requirement carries one; a non-empty extras
    /// set requires the package's variant to be one of its members.
    pub fn matches_parts(
        &self,
        namespace: Option<&str>,
        name: &str,
        variant: Option<&str>,
        version: &Version,
    ) -> bool {
        if self.name != name {
            return false;
        }
        if let Some(required) = &self.namespace {
            if namespace != Some(required.as_str()) {
                return false;
            }
        }
        if !self.extras.is_empty() {
            match variant {
                Some(variant) if self.extras.contains(variant) => {}
                _ => return false,
            }
        }
        self.specifiers.matches(version)
    }

    /// Conjunction of this requirement's specifiers with another's.
    pub fn intersect(&self, other: &Requirement) -> SpecifierSet {
        self.specifiers.intersect(&other.specifiers)
    }

    pub fn is_overlapping(&self, other: &Requirement) -> bool {
        self.specifiers.is_overlapping(&other.specifiers)
    }
}

/// Fold several requirements on the same definition into one: specifiers
/// conjoin, extras union (a parent that demanded `foo[V1]` keeps that
/// extra), the first explicit namespace wins.
pub fn combine_requirements<'a>(
    requirements: impl IntoIterator<Item = &'a Requirement>,
) -> Option<Requirement> {
    let mut iter = requirements.into_iter();
    let first = iter.next()?;
    let mut combined = first.clone();
    for requirement in iter {
        combined.specifiers = combined.specifiers.intersect(&requirement.specifiers);
        combined.extras.extend(requirement.extras.iter().cloned());
        if combined.namespace.is_none() {
            combined.namespace = requirement.namespace.clone();
        }
    }
    Some(combined)
}

/// A pair of requirements on the same name whose version ranges cannot both
/// be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementConflict {
    pub name: String,
    pub left: Requirement,
    pub right: Requirement,
}

impl fmt::Display for RequirementConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vs {}", self.left, self.right)
    }
}

/// Cross-check two requirement lists: for every name appearing in both, a
/// conflict is recorded iff the two version ranges do not overlap.
pub fn check_conflicting_requirements(
    left: &[Requirement],
    right: &[Requirement],
) -> Vec<RequirementConflict> {
    let mut conflicts = Vec::new();
    for a in left {
        for b in right {
            if a.qualified_name() == b.qualified_name() && !a.is_overlapping(b) {
                conflicts.push(RequirementConflict {
                    name: a.qualified_name(),
                    left: a.clone(),
                    right: b.clone(),
                });
            }
        }
    }
    conflicts
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())?;
        if !self.extras.is_empty() {
            let extras = self
                .extras
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "[{extras}]")?;
        }
        if !self.specifiers.is_any() {
            write!(f, " {}", self.specifiers)?;
        }
        Ok(())
    }
}

impl FromStr for Requirement {
    type Err = RequirementError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let bytes = trimmed.as_bytes();
        let mut pos = 0;

        // `ns::ns2::name`: every token but the last is namespace.
        let mut tokens: Vec<&str> = Vec::new();
        loop {
            let start = pos;
            while pos < bytes.len() && is_name_byte(bytes[pos]) {
                pos += 1;
            }
            if start == pos {
                return Err(RequirementError::new(s, "expected a package name"));
            }
            tokens.push(&trimmed[start..pos]);
            if bytes.get(pos) == Some(&b':') && bytes.get(pos + 1) == Some(&b':') {
                pos += 2;
            } else {
                break;
            }
        }
        let name = tokens.pop().map(str::to_string).unwrap_or_default();
        let namespace = if tokens.is_empty() {
            None
        } else {
            Some(tokens.join("::"))
        };

        let mut extras = BTreeSet::new();
        if bytes.get(pos) == Some(&b'[') {
            let close = trimmed[pos..]
                .find(']')
                .map(|offset| pos + offset)
                .ok_or_else(|| RequirementError::new(s, "unclosed variant selector"))?;
            let inner = trimmed[pos + 1..close].trim();
            if inner.is_empty() {
                return Err(RequirementError::new(s, "empty variant selector"));
            }
            if inner.contains(',') {
                return Err(RequirementError::new(
                    s,
                    "at most one variant may be selected",
                ));
            }
            extras.insert(inner.to_string());
            pos = close + 1;
        }

        let rest = trimmed[pos..].trim();
        let specifiers = rest
            .parse()
            .map_err(|source| RequirementError::Specifier {
                literal: s.to_string(),
                source,
            })?;

        Ok(Requirement {
            namespace,
            name,
            extras,
            specifiers,
        })
    }
}

impl Serialize for Requirement {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Requirement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
