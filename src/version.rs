//! PEP 440 version numbers.
//!
//! A version is an ordered tuple `(epoch, release, pre, post, dev, local)`.
//! Parsing accepts the full PEP 440 syntax including lenient spellings
//! (`alpha` for `a`, `rc`/`c`, a leading `v`, arbitrary `.`/`-`/`_`
//! separators); display renders the canonical form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version {literal:?}: {reason}")]
    Invalid { literal: String, reason: String },
}

impl VersionError {
    fn new(literal: &str, reason: impl Into<String>) -> Self {
        VersionError::Invalid {
            literal: literal.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// Pre-release phase, ordered `a < b < rc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PrereleaseKind {
    Alpha,
    Beta,
    Rc,
}

impl fmt::Display for PrereleaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrereleaseKind::Alpha => write!(f, "a"),
            PrereleaseKind::Beta => write!(f, "b"),
            PrereleaseKind::Rc => write!(f, "rc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Prerelease {
    pub kind: PrereleaseKind,
    pub number: u64,
}

/// One dot-separated part of a local version label. Numeric segments
/// compare numerically and sort after alphanumeric ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalSegment {
    Text(String),
    Number(u64),
}

impl Ord for LocalSegment {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (LocalSegment::Number(a), LocalSegment::Number(b)) => a.cmp(b),
            (LocalSegment::Text(a), LocalSegment::Text(b)) => a.cmp(b),
            (LocalSegment::Number(_), LocalSegment::Text(_)) => Ordering::Greater,
            (LocalSegment::Text(_), LocalSegment::Number(_)) => Ordering::Less,
        }
    }
}

impl PartialOrd for LocalSegment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LocalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalSegment::Text(s) => write!(f, "{s}"),
            LocalSegment::Number(n) => write!(f, "{n}"),
        }
    }
}

/// A PEP 440 version such as `1.2.3` or `4!5.6.7a8.post9.dev0+linux.1`.
///
/// Trailing zeros in the release segment are insignificant for comparison
/// and equality (`1.0 == 1.0.0`), matching PEP 440.
#[derive(Debug, Clone)]
pub struct Version {
    epoch: u64,
    release: Vec<u64>,
    pre: Option<Prerelease>,
    post: Option<u64>,
    dev: Option<u64>,
    local: Vec<LocalSegment>,
}

impl Version {
    /// Build a plain release version from its segments.
    pub fn new(release: impl IntoIterator<Item = u64>) -> Self {
        Self {
            epoch: 0,
            release: release.into_iter().collect(),
            pre: None,
            post: None,
            dev: None,
            local: Vec::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn release(&self) -> &[u64] {
        &self.release
    }

    pub fn pre(&self) -> Option<Prerelease> {
        self.pre
    }

    pub fn post(&self) -> Option<u64> {
        self.post
    }

    pub fn dev(&self) -> Option<u64> {
        self.dev
    }

    pub fn local(&self) -> &[LocalSegment] {
        &self.local
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_pre(mut self, pre: Prerelease) -> Self {
        self.pre = Some(pre);
        self
    }

    pub fn with_post(mut self, post: u64) -> Self {
        self.post = Some(post);
        self
    }

    pub fn with_dev(mut self, dev: u64) -> Self {
        self.dev = Some(dev);
        self
    }

    pub fn with_local(mut self, local: Vec<LocalSegment>) -> Self {
        self.local = local;
        self
    }

    /// Whether this is an alpha/beta/rc or dev version.
    pub fn any_prerelease(&self) -> bool {
        self.pre.is_some() || self.dev.is_some()
    }

    pub fn is_local(&self) -> bool {
        !self.local.is_empty()
    }

    /// The same version with the local label stripped.
    pub fn without_local(&self) -> Version {
        Version {
            local: Vec::new(),
            ..self.clone()
        }
    }

    /// Release segment with trailing zeros removed; the comparison key.
    fn release_trimmed(&self) -> &[u64] {
        let mut end = self.release.len();
        while end > 1 && self.release[end - 1] == 0 {
            end -= 1;
        }
        &self.release[..end]
    }

    /// Within one release number, versions order `dev < pre < final < post`.
    /// The key collapses the pre/post/dev slots into comparable ranks.
    fn phase_key(&self) -> (u8, u8, u64, u64, u64) {
        let (pre_rank, pre_kind, pre_n) = match self.pre {
            Some(p) => (1, p.kind as u8 + 1, p.number),
            // A bare dev release sorts before any pre-release of the same
            // release number; anything else sorts after.
            None if self.post.is_none() && self.dev.is_some() => (0, 0, 0),
            None => (2, 0, 0),
        };
        let post_n = self.post.map_or(0, |n| n + 1);
        let dev_n = self.dev.map_or(u64::MAX, |n| n);
        (pre_rank, pre_kind, pre_n, post_n, dev_n)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.epoch.hash(state);
        self.release_trimmed().hash(state);
        self.pre.hash(state);
        self.post.hash(state);
        self.dev.hash(state);
        self.local.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.release_trimmed().cmp(other.release_trimmed()))
            .then_with(|| self.phase_key().cmp(&other.phase_key()))
            .then_with(|| self.local.cmp(&other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.epoch != 0 {
            write!(f, "{}!", self.epoch)?;
        }
        let release = self
            .release
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{release}")?;
        if let Some(pre) = self.pre {
            write!(f, "{}{}", pre.kind, pre.number)?;
        }
        if let Some(post) = self.post {
            write!(f, ".post{post}")?;
        }
        if let Some(dev) = self.dev {
            write!(f, ".dev{dev}")?;
        }
        if !self.local.is_empty() {
            let local = self
                .local
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(".");
            write!(f, "+{local}")?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parser = Parser::new(s)?;
        let version = parser.parse()?;
        if !parser.at_end() {
            return Err(VersionError::new(s, "trailing characters"));
        }
        Ok(version)
    }
}

/// Parse a version, ignoring a trailing `.*` wildcard. Returns the parsed
/// prefix version and whether the wildcard was present; used by specifier
/// parsing for `== 1.2.*`.
pub(crate) fn parse_version_wildcard(s: &str) -> Result<(Version, bool)> {
    if let Some(prefix) = s.strip_suffix(".*") {
        let version = prefix.parse()?;
        Ok((version, true))
    } else {
        Ok((s.parse()?, false))
    }
}

struct Parser<'a> {
    literal: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(literal: &'a str) -> Result<Self> {
        let trimmed = literal.trim();
        if trimmed.is_empty() {
            return Err(VersionError::new(literal, "empty string"));
        }
        Ok(Self {
            literal,
            bytes: trimmed.as_bytes(),
            pos: 0,
        })
    }

    fn parse(&mut self) -> Result<Version> {
        // Optional leading `v` prefix.
        if matches!(self.peek(), Some(b'v' | b'V')) {
            self.pos += 1;
        }

        let first = self.take_number().ok_or_else(|| {
            VersionError::new(self.literal, "must start with a release number")
        })?;

        // `N!` marks an epoch.
        let (epoch, mut release) = if self.eat(b'!') {
            let lead = self.take_number().ok_or_else(|| {
                VersionError::new(self.literal, "epoch must be followed by a release")
            })?;
            (first, vec![lead])
        } else {
            (0, vec![first])
        };

        while self.peek() == Some(b'.') && self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
            match self.take_number() {
                Some(n) => release.push(n),
                None => return Err(VersionError::new(self.literal, "bad release segment")),
            }
        }

        let pre = self.take_pre()?;
        let post = self.take_post();
        let dev = self.take_dev();
        let local = self.take_local()?;

        Ok(Version {
            epoch,
            release,
            pre,
            post,
            dev,
            local,
        })
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_separator(&mut self) -> bool {
        if matches!(self.peek(), Some(b'.' | b'-' | b'_')) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn take_number(&mut self) -> Option<u64> {
        let start = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }

    /// Try to consume one of `words` (ASCII, case-insensitive) at the cursor.
    fn take_word(&mut self, words: &[&str]) -> Option<&'static str> {
        // Longest spelling first so `rc` does not shadow `r`, etc.
        for &word in words {
            let end = self.pos + word.len();
            if end <= self.bytes.len()
                && self.bytes[self.pos..end].eq_ignore_ascii_case(word.as_bytes())
                && !self.bytes.get(end).is_some_and(|b| b.is_ascii_alphabetic())
            {
                self.pos = end;
                // Map back to a static spelling for the caller.
                return WORDS.iter().find(|w| w.eq_ignore_ascii_case(word)).copied();
            }
        }
        None
    }

    fn take_pre(&mut self) -> Result<Option<Prerelease>> {
        let mark = self.pos;
        self.eat_separator();
        let Some(word) = self.take_word(&["alpha", "beta", "preview", "pre", "rc", "a", "b", "c"])
        else {
            self.pos = mark;
            return Ok(None);
        };
        let kind = match word {
            "alpha" | "a" => PrereleaseKind::Alpha,
            "beta" | "b" => PrereleaseKind::Beta,
            _ => PrereleaseKind::Rc,
        };
        self.eat_separator();
        let number = self.take_number().unwrap_or(0);
        Ok(Some(Prerelease { kind, number }))
    }

    fn take_post(&mut self) -> Option<u64> {
        let mark = self.pos;
        // The `1.0-2` shorthand means `1.0.post2`.
        if self.eat(b'-') {
            if let Some(n) = self.take_number() {
                return Some(n);
            }
            self.pos = mark;
        }
        self.eat_separator();
        if self.take_word(&["post", "rev", "r"]).is_some() {
            self.eat_separator();
            return Some(self.take_number().unwrap_or(0));
        }
        self.pos = mark;
        None
    }

    fn take_dev(&mut self) -> Option<u64> {
        let mark = self.pos;
        self.eat_separator();
        if self.take_word(&["dev"]).is_some() {
            self.eat_separator();
            return Some(self.take_number().unwrap_or(0));
        }
        self.pos = mark;
        None
    }

    fn take_local(&mut self) -> Result<Vec<LocalSegment>> {
        if !self.eat(b'+') {
            return Ok(Vec::new());
        }
        let mut segments = Vec::new();
        loop {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|b| b.is_ascii_alphanumeric())
            {
                self.pos += 1;
            }
            if start == self.pos {
                return Err(VersionError::new(self.literal, "empty local segment"));
            }
            let raw = std::str::from_utf8(&self.bytes[start..self.pos])
                .map_err(|_| VersionError::new(self.literal, "invalid local segment"))?;
            let segment = match raw.parse::<u64>() {
                Ok(n) => LocalSegment::Number(n),
                Err(_) => LocalSegment::Text(raw.to_ascii_lowercase()),
            };
            segments.push(segment);
            if !self.eat_separator() {
                break;
            }
        }
        Ok(segments)
    }
}

const WORDS: &[&str] = &[
    "alpha", "beta", "preview", "pre", "rc", "a", "b", "c", "post", "rev", "r", "dev",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn parses_plain_releases() {
        assert_eq!(v("1.2.3").release(), &[1, 2, 3]);
        assert_eq!(v("1").release(), &[1]);
        assert_eq!(v("v2.0").release(), &[2, 0]);
        assert_eq!(v("0!0").release(), &[0]);
    }

    #[test]
    fn parses_epoch_pre_post_dev_local() {
        let version = v("4!5.6.7a8.post9.dev0+linux.1");
        assert_eq!(version.epoch(), 4);
        assert_eq!(version.release(), &[5, 6, 7]);
        assert_eq!(
            version.pre(),
            Some(Prerelease {
                kind: PrereleaseKind::Alpha,
                number: 8
            })
        );
        assert_eq!(version.post(), Some(9));
        assert_eq!(version.dev(), Some(0));
        assert_eq!(
            version.local(),
            &[LocalSegment::Text("linux".into()), LocalSegment::Number(1)]
        );
    }

    #[test]
    fn lenient_spellings_normalize() {
        assert_eq!(v("1.0alpha1"), v("1.0a1"));
        assert_eq!(v("1.0-beta.2"), v("1.0b2"));
        assert_eq!(v("1.0c3"), v("1.0rc3"));
        assert_eq!(v("1.0.rev4"), v("1.0.post4"));
        assert_eq!(v("1.0-2"), v("1.0.post2"));
        assert_eq!(v("1.0DEV3"), v("1.0.dev3"));
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("abc".parse::<Version>().is_err());
        assert!("1.0.x".parse::<Version>().is_err());
        assert!("1.0+".parse::<Version>().is_err());
    }

    #[test]
    fn trailing_zeros_are_insignificant() {
        assert_eq!(v("1.0"), v("1.0.0"));
        assert_eq!(v("1"), v("1.0"));
        assert!(v("1.0.1") > v("1.0"));
    }

    #[test]
    fn ordering_follows_pep440() {
        let ordered = [
            "1.0.dev1", "1.0a1", "1.0a2.dev1", "1.0a2", "1.0b1", "1.0rc1", "1.0", "1.0.post1",
            "1.1.dev1", "1.1",
        ];
        for pair in ordered.windows(2) {
            assert!(v(pair[0]) < v(pair[1]), "{} < {}", pair[0], pair[1]);
        }
        assert!(v("1!0.5") > v("2.0"));
    }

    #[test]
    fn local_versions_order_after_public() {
        assert!(v("1.0+abc") > v("1.0"));
        assert!(v("1.0+abc.2") > v("1.0+abc.1"));
        assert!(v("1.0+2") > v("1.0+abc"));
    }

    #[test]
    fn canonical_display_round_trips() {
        for s in ["1.2.3", "1!2.0", "1.0a0", "1.0rc2.post1.dev3", "1.0+local.7"] {
            assert_eq!(v(s).to_string(), s);
        }
        assert_eq!(v("1.0Alpha3").to_string(), "1.0a3");
    }

    #[test]
    fn wildcard_helper_strips_star() {
        let (version, star) = parse_version_wildcard("1.2.*").unwrap();
        assert_eq!(version, v("1.2"));
        assert!(star);
        let (version, star) = parse_version_wildcard("1.2").unwrap();
        assert_eq!(version, v("1.2"));
        assert!(!star);
    }
}
