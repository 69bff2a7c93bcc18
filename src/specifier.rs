//! PEP 440 version specifiers and specifier sets.
//!
//! A specifier pairs an operator (`==`, `!=`, `<`, `<=`, `>`, `>=`, `~=`,
//! `===`, plus the wildcard forms `== X.*` / `!= X.*`) with a version. A
//! specifier set is a comma-separated conjunction.

use crate::version::{Version, VersionError, parse_version_wildcard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecifierError {
    #[error("invalid specifier {literal:?}: {reason}")]
    Invalid { literal: String, reason: String },
    #[error(transparent)]
    Version(#[from] VersionError),
}

impl SpecifierError {
    fn new(literal: &str, reason: impl Into<String>) -> Self {
        SpecifierError::Invalid {
            literal: literal.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SpecifierError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    /// `== 1.2.3`
    Equal,
    /// `== 1.2.*`
    EqualStar,
    /// `=== 1.2.3` (arbitrary equality)
    ExactEqual,
    /// `!= 1.2.3`
    NotEqual,
    /// `!= 1.2.*`
    NotEqualStar,
    /// `~= 1.2.3` (compatible release)
    TildeEqual,
    /// `< 1.2.3`
    LessThan,
    /// `<= 1.2.3`
    LessThanEqual,
    /// `> 1.2.3`
    GreaterThan,
    /// `>= 1.2.3`
    GreaterThanEqual,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operator::Equal | Operator::EqualStar => "==",
            Operator::ExactEqual => "===",
            Operator::NotEqual | Operator::NotEqualStar => "!=",
            Operator::TildeEqual => "~=",
            Operator::LessThan => "<",
            Operator::LessThanEqual => "<=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanEqual => ">=",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Specifier {
    operator: Operator,
    version: Version,
}

impl Specifier {
    pub fn new(operator: Operator, version: Version) -> Result<Self> {
        if operator == Operator::TildeEqual && version.release().len() < 2 {
            return Err(SpecifierError::new(
                &version.to_string(),
                "~= requires at least two release segments",
            ));
        }
        Ok(Self { operator, version })
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// PEP 440 match of a candidate version against this specifier.
    pub fn contains(&self, candidate: &Version) -> bool {
        match self.operator {
            Operator::Equal => {
                if self.version.is_local() {
                    candidate == &self.version
                } else {
                    // A public `==` ignores the candidate's local label.
                    candidate.without_local() == self.version
                }
            }
            Operator::ExactEqual => candidate == &self.version,
            Operator::NotEqual => !Specifier {
                operator: Operator::Equal,
                version: self.version.clone(),
            }
            .contains(candidate),
            Operator::EqualStar => self.matches_prefix(candidate),
            Operator::NotEqualStar => !self.matches_prefix(candidate),
            Operator::TildeEqual => {
                if candidate.without_local() < self.version {
                    return false;
                }
                let mut truncated = self.version.release().to_vec();
                truncated.pop();
                Specifier {
                    operator: Operator::EqualStar,
                    version: Version::new(truncated).with_epoch(self.version.epoch()),
                }
                .matches_prefix(candidate)
            }
            Operator::LessThan => {
                let candidate = candidate.without_local();
                if candidate >= self.version {
                    return false;
                }
                // `< V` does not admit pre-releases of V's own release
                // number unless V is itself a pre-release.
                if !self.version.any_prerelease()
                    && candidate.any_prerelease()
                    && padded_release(&candidate, self.version.release().len())
                        == self.version.release()
                {
                    return false;
                }
                true
            }
            Operator::LessThanEqual => candidate.without_local() <= self.version,
            Operator::GreaterThan => {
                let candidate = candidate.without_local();
                if candidate <= self.version {
                    return false;
                }
                // `> V` does not admit post-releases of V's own release
                // number unless V is itself a post-release.
                if self.version.post().is_none()
                    && candidate.post().is_some()
                    && padded_release(&candidate, self.version.release().len())
                        == self.version.release()
                {
                    return false;
                }
                true
            }
            Operator::GreaterThanEqual => candidate.without_local() >= self.version,
        }
    }

    /// Release-prefix match used by the `X.*` wildcard forms.
    fn matches_prefix(&self, candidate: &Version) -> bool {
        candidate.epoch() == self.version.epoch()
            && padded_release(candidate, self.version.release().len())
                == self.version.release()
    }

    /// This specifier's contribution to a version interval, if it has one.
    /// `!=` forms contribute nothing (a single interval cannot carry holes).
    fn to_bounds(&self) -> (Bound<Version>, Bound<Version>) {
        match self.operator {
            Operator::Equal | Operator::ExactEqual => (
                Bound::Included(self.version.clone()),
                Bound::Included(self.version.clone()),
            ),
            Operator::EqualStar => (
                Bound::Included(self.version.clone()),
                Bound::Excluded(bump_release(self.version.release(), self.version.epoch())),
            ),
            Operator::TildeEqual => {
                let mut truncated = self.version.release().to_vec();
                truncated.pop();
                (
                    Bound::Included(self.version.clone()),
                    Bound::Excluded(bump_release(&truncated, self.version.epoch())),
                )
            }
            Operator::LessThan => (Bound::Unbounded, Bound::Excluded(self.version.clone())),
            Operator::LessThanEqual => (Bound::Unbounded, Bound::Included(self.version.clone())),
            Operator::GreaterThan => (Bound::Excluded(self.version.clone()), Bound::Unbounded),
            Operator::GreaterThanEqual => {
                (Bound::Included(self.version.clone()), Bound::Unbounded)
            }
            Operator::NotEqual | Operator::NotEqualStar => (Bound::Unbounded, Bound::Unbounded),
        }
    }
}

/// Increment the last segment of a release, yielding the exclusive upper
/// bound of its prefix range (`1.2` -> `1.3`).
fn bump_release(release: &[u64], epoch: u64) -> Version {
    let mut bumped = release.to_vec();
    if let Some(last) = bumped.last_mut() {
        *last += 1;
    } else {
        bumped.push(1);
    }
    Version::new(bumped).with_epoch(epoch)
}

/// Candidate release padded with zeros to `len`, for prefix comparison.
fn padded_release(version: &Version, len: usize) -> Vec<u64> {
    let mut padded = version.release().to_vec();
    padded.resize(len.max(padded.len()), 0);
    padded.truncate(len);
    padded
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let star = matches!(
            self.operator,
            Operator::EqualStar | Operator::NotEqualStar
        );
        write!(f, "{}{}", self.operator, self.version)?;
        if star {
            write!(f, ".*")?;
        }
        Ok(())
    }
}

impl FromStr for Specifier {
    type Err = SpecifierError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        // Longest operators first so `==` is not read as two halves of `===`.
        let (op_text, rest) = ["===", "==", "!=", "~=", "<=", ">=", "<", ">"]
            .iter()
            .find_map(|op| trimmed.strip_prefix(op).map(|rest| (*op, rest)))
            .ok_or_else(|| SpecifierError::new(trimmed, "missing comparison operator"))?;
        let (version, star) = parse_version_wildcard(rest.trim())?;
        let operator = match (op_text, star) {
            ("==", false) => Operator::Equal,
            ("==", true) => Operator::EqualStar,
            ("===", false) => Operator::ExactEqual,
            ("!=", false) => Operator::NotEqual,
            ("!=", true) => Operator::NotEqualStar,
            ("~=", false) => Operator::TildeEqual,
            ("<", false) => Operator::LessThan,
            ("<=", false) => Operator::LessThanEqual,
            (">", false) => Operator::GreaterThan,
            (">=", false) => Operator::GreaterThanEqual,
            (op, true) => {
                return Err(SpecifierError::new(
                    trimmed,
                    format!("wildcard is not allowed with {op}"),
                ));
            }
            _ => unreachable!(),
        };
        Specifier::new(operator, version)
    }
}

/// A conjunction of specifiers, e.g. `>=1.0, <2, !=1.5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SpecifierSet {
    specifiers: Vec<Specifier>,
}

impl SpecifierSet {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn from_specifiers(specifiers: impl IntoIterator<Item = Specifier>) -> Self {
        Self {
            specifiers: specifiers.into_iter().collect(),
        }
    }

    pub fn is_any(&self) -> bool {
        self.specifiers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Specifier> {
        self.specifiers.iter()
    }

    /// Conjunction of member matches.
    pub fn matches(&self, version: &Version) -> bool {
        self.specifiers.iter().all(|s| s.contains(version))
    }

    /// Conjunction of two sets; duplicates collapse.
    pub fn intersect(&self, other: &SpecifierSet) -> SpecifierSet {
        let mut merged = self.specifiers.clone();
        for specifier in &other.specifiers {
            if !merged.contains(specifier) {
                merged.push(specifier.clone());
            }
        }
        SpecifierSet { specifiers: merged }
    }

    /// Tightest version interval implied by this conjunction. Deterministic
    /// regardless of member order: every specifier's contribution is folded
    /// through max-of-lowers / min-of-uppers.
    pub fn bounds(&self) -> (Bound<Version>, Bound<Version>) {
        let mut lower = Bound::Unbounded;
        let mut upper = Bound::Unbounded;
        for specifier in &self.specifiers {
            let (candidate_lower, candidate_upper) = specifier.to_bounds();
            if lower_is_tighter(&candidate_lower, &lower) {
                lower = candidate_lower;
            }
            if upper_is_tighter(&candidate_upper, &upper) {
                upper = candidate_upper;
            }
        }
        (lower, upper)
    }

    /// Whether some conceivable version could satisfy both conjunctions.
    pub fn is_overlapping(&self, other: &SpecifierSet) -> bool {
        let combined = self.intersect(other);
        let (lower, upper) = combined.bounds();
        match (&lower, &upper) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
            (
                Bound::Included(low) | Bound::Excluded(low),
                Bound::Included(high) | Bound::Excluded(high),
            ) => match low.cmp(high) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => {
                    matches!(lower, Bound::Included(_)) && matches!(upper, Bound::Included(_))
                }
            },
        }
    }
}

fn lower_is_tighter(candidate: &Bound<Version>, current: &Bound<Version>) -> bool {
    match (candidate, current) {
        (Bound::Unbounded, _) => false,
        (_, Bound::Unbounded) => true,
        (
            Bound::Included(a) | Bound::Excluded(a),
            Bound::Included(b) | Bound::Excluded(b),
        ) => match a.cmp(b) {
            Ordering::Greater => true,
            Ordering::Less => false,
            // Exclusive beats inclusive at the same version.
            Ordering::Equal => {
                matches!(candidate, Bound::Excluded(_)) && matches!(current, Bound::Included(_))
            }
        },
    }
}

fn upper_is_tighter(candidate: &Bound<Version>, current: &Bound<Version>) -> bool {
    match (candidate, current) {
        (Bound::Unbounded, _) => false,
        (_, Bound::Unbounded) => true,
        (
            Bound::Included(a) | Bound::Excluded(a),
            Bound::Included(b) | Bound::Excluded(b),
        ) => match a.cmp(b) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                matches!(candidate, Bound::Excluded(_)) && matches!(current, Bound::Included(_))
            }
        },
    }
}

impl fmt::Display for SpecifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .specifiers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{parts}")
    }
}

impl FromStr for SpecifierSet {
    type Err = SpecifierError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(SpecifierSet::any());
        }
        let specifiers = trimmed
            .split(',')
            .map(|part| part.parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(SpecifierSet { specifiers })
    }
}

impl Serialize for SpecifierSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SpecifierSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    fn set(s: &str) -> SpecifierSet {
        s.parse().unwrap()
    }

    #[test]
    fn equality_ignores_candidate_local() {
        assert!(set("==1.2").matches(&v("1.2+build.4")));
        assert!(!set("==1.2+build.4").matches(&v("1.2")));
        assert!(set("===1.2+build.4").matches(&v("1.2+build.4")));
    }

    #[test]
    fn wildcard_matches_release_prefix() {
        let spec = set("==2016.*");
        assert!(spec.matches(&v("2016.1")));
        assert!(spec.matches(&v("2016.9.9")));
        assert!(!spec.matches(&v("2017.0")));
        assert!(set("!=1.2.*").matches(&v("1.3")));
        assert!(!set("!=1.2.*").matches(&v("1.2.5")));
    }

    #[test]
    fn compatible_release() {
        let spec = set("~=2.2");
        assert!(spec.matches(&v("2.2")));
        assert!(spec.matches(&v("2.9")));
        assert!(!spec.matches(&v("3.0")));
        let spec = set("~=1.4.5");
        assert!(spec.matches(&v("1.4.9")));
        assert!(!spec.matches(&v("1.5.0")));
        assert!("~=2".parse::<Specifier>().is_err());
    }

    #[test]
    fn ordered_comparisons_gate_pre_and_post() {
        assert!(!set("<1.5").matches(&v("1.5a1")));
        assert!(set("<1.5a2").matches(&v("1.5a1")));
        assert!(!set(">1.5").matches(&v("1.5.post1")));
        assert!(set(">1.5.post1").matches(&v("1.5.post2")));
        assert!(set(">1.5").matches(&v("1.6")));
    }

    #[test]
    fn set_is_conjunction() {
        let spec = set(">=1.0, <2, !=1.5");
        assert!(spec.matches(&v("1.4")));
        assert!(!spec.matches(&v("1.5")));
        assert!(!spec.matches(&v("2.0")));
        assert!(SpecifierSet::any().matches(&v("0.0.1")));
    }

    #[test]
    fn bounds_are_order_independent() {
        let forward = set(">=1.0, <2").bounds();
        let backward = set("<2, >=1.0").bounds();
        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            (Bound::Included(v("1.0")), Bound::Excluded(v("2")))
        );
        assert_eq!(
            set("==1.2.*").bounds(),
            (Bound::Included(v("1.2")), Bound::Excluded(v("1.3")))
        );
    }

    #[test]
    fn overlap_detection() {
        assert!(set(">=1.0").is_overlapping(&set("<2")));
        assert!(!set("<2").is_overlapping(&set(">=2")));
        assert!(set("<=2").is_overlapping(&set(">=2")));
        assert!(!set(">2").is_overlapping(&set("<2")));
        assert!(!set(">=2.7, <2.8").is_overlapping(&set("==3.*")));
        assert!(set("").is_overlapping(&set(">=100")));
    }

    #[test]
    fn overlap_is_commutative() {
        let cases = [(">=1, <3", ">=2"), ("<1", ">=1"), ("~=1.2", "==1.2.5")];
        for (a, b) in cases {
            assert_eq!(
                set(a).is_overlapping(&set(b)),
                set(b).is_overlapping(&set(a)),
                "{a} vs {b}"
            );
        }
    }

    #[test]
    fn intersection_matches_conjunction_of_parts() {
        let a = set(">=1.0, <3");
        let b = set(">=2, !=2.5");
        let both = a.intersect(&b);
        for candidate in ["1.0", "1.9", "2.0", "2.5", "2.9", "3.0"] {
            let version = v(candidate);
            assert_eq!(
                both.matches(&version),
                a.matches(&version) && b.matches(&version),
                "{candidate}"
            );
        }
    }

    #[test]
    fn display_round_trips() {
        for s in [">=1.0, <2", "==1.2.*", "~=1.4.2", "===1.0+abc"] {
            assert_eq!(set(s).to_string(), s);
        }
    }
}
