//! The resolved context: ordered packages, merged environment, merged
//! command aliases, and the `WIZ_CONTEXT` snapshot.
//!
//! Environment merging folds package environs from the farthest package
//! toward ROOT, so a higher-priority package's `${VAR}` reference reads
//! the value accumulated from lower-priority packages and its own entries
//! land in front. Substitution is a single pass; it does not iterate to a
//! fixpoint. A reference to the key being assigned reads the prior value
//! of that key (the `PATH` augmentation pattern) and collapses to empty
//! when there is none; any other unresolved reference stays literal and
//! records a warning.

use crate::history::EventCollector;
use crate::package::Package;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Environment variable carrying the encoded context snapshot.
pub const CONTEXT_ENVIRON: &str = "WIZ_CONTEXT";

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to decode context snapshot: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("failed to parse context snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment variable {CONTEXT_ENVIRON} is not set")]
    NotCaptured,
}

pub type Result<T> = std::result::Result<T, ContextError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub qualified_identifier: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_id: Option<String>,
    pub definition_path: PathBuf,
    pub registry_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub packages: Vec<PackageSummary>,
    pub environ: BTreeMap<String, String>,
    pub command: BTreeMap<String, String>,
    pub registries: Vec<PathBuf>,
}

impl Context {
    /// Assemble the context from distance-ordered packages.
    pub fn from_packages(
        packages: &[Arc<Package>],
        registries: &[PathBuf],
        initial_environ: &BTreeMap<String, String>,
        collector: &mut EventCollector,
    ) -> Context {
        let mut environ = initial_environ.clone();
        for package in packages.iter().rev() {
            merge_package_environ(&mut environ, package, collector);
        }

        // Later packages override earlier ones.
        let mut command = BTreeMap::new();
        for package in packages {
            for (alias, target) in package.command() {
                command.insert(alias.clone(), target.clone());
            }
        }

        let summaries: Vec<PackageSummary> = packages
            .iter()
            .map(|package| PackageSummary {
                qualified_identifier: package.qualified_identifier().to_string(),
                version: package.version().to_string(),
                variant_id: package.variant_id().map(str::to_string),
                definition_path: package.definition().definition_path().to_path_buf(),
                registry_path: package.definition().registry_path().to_path_buf(),
            })
            .collect();

        let package_ids: Vec<String> = summaries
            .iter()
            .map(|summary| summary.qualified_identifier.clone())
            .collect();
        environ.insert(
            CONTEXT_ENVIRON.to_string(),
            encode_context(registries, &package_ids),
        );

        Context {
            packages: summaries,
            environ,
            command,
            registries: registries.to_vec(),
        }
    }
}

/// Fold one package's environ into the accumulated mapping, substituting
/// `${VAR}` references as each entry lands.
fn merge_package_environ(
    environ: &mut BTreeMap<String, String>,
    package: &Arc<Package>,
    collector: &mut EventCollector,
) {
    for (key, value) in package.environ() {
        let substituted = substitute(value, key, environ, package, collector);
        environ.insert(key.clone(), substituted);
    }
}

fn substitute(
    value: &str,
    current_key: &str,
    environ: &BTreeMap<String, String>,
    package: &Arc<Package>,
    collector: &mut EventCollector,
) -> String {
    let mut output = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference; keep the tail verbatim.
            output.push_str(&rest[start..]);
            return output;
        };
        let name = &after[..end];
        match lookup(name, environ, package) {
            Some(resolved) => output.push_str(&resolved),
            None if name == current_key => {
                // Self-augmentation with no prior value collapses to
                // nothing: `PATH=/a:${PATH}` on an empty PATH gives `/a:`.
            }
            None => {
                collector.warning(format!(
                    "unresolved reference ${{{name}}} in {key} of {package}",
                    key = current_key,
                    package = package.qualified_identifier(),
                ));
                output.push_str("${");
                output.push_str(name);
                output.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    output
}

fn lookup(
    name: &str,
    environ: &BTreeMap<String, String>,
    package: &Arc<Package>,
) -> Option<String> {
    match name {
        "INSTALL_LOCATION" => package.install_location().map(str::to_string),
        "INSTALL_ROOT" => package.install_root().map(str::to_string),
        _ => environ.get(name).cloned(),
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct ContextSnapshot {
    registries: Vec<PathBuf>,
    packages: Vec<String>,
}

/// Base64-encoded JSON snapshot of `(registry paths, package ids)`.
pub fn encode_context(registries: &[PathBuf], package_ids: &[String]) -> String {
    let snapshot = ContextSnapshot {
        registries: registries.to_vec(),
        packages: package_ids.to_vec(),
    };
    let json = serde_json::to_vec(&snapshot).unwrap_or_default();
    BASE64.encode(json)
}

/// Invert [`encode_context`].
pub fn decode_context(encoded: &str) -> Result<(Vec<PathBuf>, Vec<String>)> {
    let bytes = BASE64.decode(encoded.trim())?;
    let snapshot: ContextSnapshot = serde_json::from_slice(&bytes)?;
    Ok((snapshot.registries, snapshot.packages))
}

/// Reconstitute the resolver state recorded in the calling environment.
pub fn discover_context() -> Result<(Vec<PathBuf>, Vec<String>)> {
    let encoded = std::env::var(CONTEXT_ENVIRON).map_err(|_| ContextError::NotCaptured)?;
    decode_context(&encoded)
}
