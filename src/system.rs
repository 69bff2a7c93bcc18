//! Host system identification and definition system constraints.

use crate::specifier::SpecifierSet;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CurrentSystemError {
    #[error("unable to identify the current platform {0:?}")]
    UnknownPlatform(String),
    #[error("invalid os constraint {literal:?}: {reason}")]
    InvalidOsConstraint { literal: String, reason: String },
}

pub type Result<T> = std::result::Result<T, CurrentSystemError>;

/// The `system` block of a definition: each field optionally restricts the
/// hosts the definition is valid on. `os` pairs an OS name with a PEP 440
/// specifier set, e.g. `"el >= 7, < 8"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConstraint {
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub os: Option<String>,
}

/// Identity of the host a resolution runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemDescriptor {
    pub platform: String,
    pub arch: String,
    pub os_name: String,
    pub os_version: Version,
}

impl SystemDescriptor {
    pub fn new(
        platform: impl Into<String>,
        arch: impl Into<String>,
        os_name: impl Into<String>,
        os_version: Version,
    ) -> Self {
        Self {
            platform: platform.into(),
            arch: arch.into(),
            os_name: os_name.into(),
            os_version,
        }
    }

    /// Identify the host from the compiled target and, on Linux, the
    /// `/etc/os-release` distribution record.
    pub fn current() -> Result<Self> {
        let platform = match std::env::consts::OS {
            "linux" => "linux",
            "macos" => "mac",
            "windows" => "windows",
            other => return Err(CurrentSystemError::UnknownPlatform(other.to_string())),
        };
        let (os_name, os_version) = detect_os(platform);
        Ok(Self {
            platform: platform.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_name,
            os_version,
        })
    }

    /// Whether a definition restricted by `constraint` is usable here.
    pub fn matches(&self, constraint: &SystemConstraint) -> Result<bool> {
        if let Some(platform) = &constraint.platform {
            if platform != &self.platform {
                return Ok(false);
            }
        }
        if let Some(arch) = &constraint.arch {
            if arch != &self.arch {
                return Ok(false);
            }
        }
        if let Some(os) = &constraint.os {
            let (name, specifiers) = parse_os_constraint(os)?;
            if name != self.os_name {
                return Ok(false);
            }
            if !specifiers.matches(&self.os_version) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Split an os constraint into its leading name and the trailing PEP 440
/// specifier set (`"el >= 7.3"` -> `("el", ">=7.3")`). A bare name means
/// any version.
fn parse_os_constraint(literal: &str) -> Result<(String, SpecifierSet)> {
    let trimmed = literal.trim();
    let split = trimmed
        .find(|c: char| c.is_whitespace() || matches!(c, '<' | '>' | '=' | '!' | '~'))
        .unwrap_or(trimmed.len());
    let name = trimmed[..split].to_string();
    if name.is_empty() {
        return Err(CurrentSystemError::InvalidOsConstraint {
            literal: literal.to_string(),
            reason: "missing os name".to_string(),
        });
    }
    let specifiers = trimmed[split..].trim().parse().map_err(|err| {
        CurrentSystemError::InvalidOsConstraint {
            literal: literal.to_string(),
            reason: format!("{err}"),
        }
    })?;
    Ok((name, specifiers))
}

fn detect_os(platform: &str) -> (String, Version) {
    if platform == "linux" {
        if let Some(parsed) = read_os_release() {
            return parsed;
        }
    }
    (platform.to_string(), Version::new([0]))
}

/// Best-effort `ID` + `VERSION_ID` from /etc/os-release.
fn read_os_release() -> Option<(String, Version)> {
    let content = fs::read_to_string("/etc/os-release").ok()?;
    let mut id = None;
    let mut version_id = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = Some(value.trim().trim_matches('"').to_string());
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version_id = Some(value.trim().trim_matches('"').to_string());
        }
    }
    let id = id?;
    let version = version_id
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_else(|| Version::new([0]));
    Some((id, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> SystemDescriptor {
        SystemDescriptor::new("linux", "x86_64", "el", "7.3".parse().unwrap())
    }

    #[test]
    fn unconstrained_matches_everything() {
        assert!(host().matches(&SystemConstraint::default()).unwrap());
    }

    #[test]
    fn platform_and_arch_compare_exactly() {
        let constraint = SystemConstraint {
            platform: Some("linux".into()),
            arch: Some("x86_64".into()),
            os: None,
        };
        assert!(host().matches(&constraint).unwrap());

        let other = SystemConstraint {
            platform: Some("mac".into()),
            ..Default::default()
        };
        assert!(!host().matches(&other).unwrap());
    }

    #[test]
    fn os_constraint_uses_specifiers() {
        let constraint = SystemConstraint {
            os: Some("el >= 7, < 8".into()),
            ..Default::default()
        };
        assert!(host().matches(&constraint).unwrap());

        let too_new = SystemConstraint {
            os: Some("el >= 8".into()),
            ..Default::default()
        };
        assert!(!host().matches(&too_new).unwrap());

        let wrong_name = SystemConstraint {
            os: Some("centos".into()),
            ..Default::default()
        };
        assert!(!host().matches(&wrong_name).unwrap());
    }

    #[test]
    fn malformed_os_constraint_is_an_error() {
        let constraint = SystemConstraint {
            os: Some(">= 7".into()),
            ..Default::default()
        };
        assert!(host().matches(&constraint).is_err());
    }

    #[test]
    fn current_host_is_identifiable() {
        let system = SystemDescriptor::current().unwrap();
        assert!(!system.platform.is_empty());
        assert!(!system.arch.is_empty());
    }
}
