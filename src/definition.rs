//! Package definitions as loaded from registry JSON files.
//!
//! A definition is an immutable declarative record; materialized packages
//! are derived from it (see `package`). Unknown top-level keys are
//! rejected, identifiers are restricted to `[A-Za-z0-9_.\-]+`, and every
//! embedded version or requirement string must parse.

use crate::requirement::Requirement;
use crate::system::SystemConstraint;
use crate::version::Version;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read definition {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse definition {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid definition {path}: {reason}")]
    Validation { path: PathBuf, reason: String },
    #[error("no definition found for request {request:?}")]
    NotFound { request: String },
    #[error("namespace of {name:?} is ambiguous: known in {namespaces:?}")]
    AmbiguousNamespace {
        name: String,
        namespaces: Vec<String>,
    },
}

pub type Result<T> = std::result::Result<T, DefinitionError>;

/// One mutually exclusive sub-configuration of a definition. Its environ
/// and command overlay the definition's on materialization.
#[derive(Debug, Clone)]
pub struct VariantDecl {
    pub identifier: String,
    pub environ: Vec<(String, String)>,
    pub command: BTreeMap<String, String>,
    pub requirements: Vec<Requirement>,
    pub install_location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Definition {
    identifier: String,
    namespace: Option<String>,
    version: Option<Version>,
    description: Option<String>,
    disabled: bool,
    auto_use: bool,
    install_location: Option<String>,
    install_root: Option<String>,
    system: Option<SystemConstraint>,
    environ: Vec<(String, String)>,
    command: BTreeMap<String, String>,
    requirements: Vec<Requirement>,
    conditions: Vec<Requirement>,
    variants: Vec<VariantDecl>,
    registry_path: PathBuf,
    definition_path: PathBuf,
    effective_version: OnceLock<Version>,
}

impl Definition {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// `namespace::identifier`, or the bare identifier.
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}::{}", self.identifier),
            None => self.identifier.clone(),
        }
    }

    pub fn declared_version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    /// The declared version, or `0!0` for version-less definitions so they
    /// remain orderable.
    pub fn version(&self) -> &Version {
        self.effective_version
            .get_or_init(|| self.version.clone().unwrap_or_else(|| Version::new([0])))
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }

    pub fn auto_use(&self) -> bool {
        self.auto_use
    }

    pub fn install_location(&self) -> Option<&str> {
        self.install_location.as_deref()
    }

    pub fn install_root(&self) -> Option<&str> {
        self.install_root.as_deref()
    }

    pub fn system(&self) -> Option<&SystemConstraint> {
        self.system.as_ref()
    }

    pub fn environ(&self) -> &[(String, String)] {
        &self.environ
    }

    pub fn command(&self) -> &BTreeMap<String, String> {
        &self.command
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn conditions(&self) -> &[Requirement] {
        &self.conditions
    }

    pub fn variants(&self) -> &[VariantDecl] {
        &self.variants
    }

    pub fn variant_index(&self, identifier: &str) -> Option<usize> {
        self.variants
            .iter()
            .position(|variant| variant.identifier == identifier)
    }

    pub fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    pub fn definition_path(&self) -> &Path {
        &self.definition_path
    }

    /// The unversioned requirement an `auto-use` definition contributes to
    /// every resolution.
    pub fn implicit_requirement(&self) -> Requirement {
        Requirement::new(
            self.namespace.clone(),
            self.identifier.clone(),
            [],
            Default::default(),
        )
    }
}

fn valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Raw file shape; typed fields are derived after decoding.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
    identifier: String,
    namespace: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default, rename = "auto-use")]
    auto_use: bool,
    #[serde(rename = "install-location")]
    install_location: Option<String>,
    #[serde(rename = "install-root")]
    install_root: Option<String>,
    system: Option<SystemConstraint>,
    #[serde(default)]
    command: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "ordered_string_map")]
    environ: Vec<(String, String)>,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(default)]
    conditions: Vec<String>,
    #[serde(default)]
    variants: Vec<VariantFile>,
}

#[derive(Debug, Deserialize)]
struct VariantFile {
    identifier: String,
    #[serde(default, deserialize_with = "ordered_string_map")]
    environ: Vec<(String, String)>,
    #[serde(default)]
    command: BTreeMap<String, String>,
    #[serde(default)]
    requirements: Vec<String>,
    #[serde(rename = "install-location")]
    install_location: Option<String>,
}

/// Decode a JSON object into key/value pairs preserving file order, which
/// is significant for environ merging.
fn ordered_string_map<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedMapVisitor;

    impl<'de> Visitor<'de> for OrderedMapVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of string to string")
        }

        fn visit_map<A: MapAccess<'de>>(
            self,
            mut access: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<String, String>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedMapVisitor)
}

/// Load and validate one definition file.
pub fn load_definition(path: &Path, registry_path: &Path) -> Result<Definition> {
    let data = fs::read_to_string(path).map_err(|source| DefinitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: DefinitionFile =
        serde_json::from_str(&data).map_err(|source| DefinitionError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    definition_from_file(file, path, registry_path)
}

fn definition_from_file(
    file: DefinitionFile,
    path: &Path,
    registry_path: &Path,
) -> Result<Definition> {
    let invalid = |reason: String| DefinitionError::Validation {
        path: path.to_path_buf(),
        reason,
    };

    if !valid_identifier(&file.identifier) {
        return Err(invalid(format!("invalid identifier {:?}", file.identifier)));
    }

    let version = file
        .version
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|err| invalid(format!("{err}")))?;

    let parse_requirements = |raw: &[String]| -> Result<Vec<Requirement>> {
        raw.iter()
            .map(|item| item.parse().map_err(|err| invalid(format!("{err}"))))
            .collect()
    };

    let requirements = parse_requirements(&file.requirements)?;
    let conditions = parse_requirements(&file.conditions)?;

    let mut variants = Vec::with_capacity(file.variants.len());
    for variant in file.variants {
        if !valid_identifier(&variant.identifier) {
            return Err(invalid(format!(
                "invalid variant identifier {:?}",
                variant.identifier
            )));
        }
        variants.push(VariantDecl {
            requirements: parse_requirements(&variant.requirements)?,
            identifier: variant.identifier,
            environ: variant.environ,
            command: variant.command,
            install_location: variant.install_location,
        });
    }

    Ok(Definition {
        identifier: file.identifier,
        namespace: file.namespace,
        version,
        description: file.description,
        disabled: file.disabled,
        auto_use: file.auto_use,
        install_location: file.install_location,
        install_root: file.install_root,
        system: file.system,
        environ: file.environ,
        command: file.command,
        requirements,
        conditions,
        variants,
        registry_path: registry_path.to_path_buf(),
        definition_path: path.to_path_buf(),
        effective_version: OnceLock::new(),
    })
}

#[cfg(test)]
pub(crate) fn definition_from_json(
    json: serde_json::Value,
    path: &Path,
    registry_path: &Path,
) -> Result<Definition> {
    let file: DefinitionFile =
        serde_json::from_value(json).map_err(|source| DefinitionError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    definition_from_file(file, path, registry_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(json: serde_json::Value) -> Result<Definition> {
        definition_from_json(json, Path::new("/reg/def.json"), Path::new("/reg"))
    }

    #[test]
    fn decodes_a_full_definition() {
        let definition = load(json!({
            "identifier": "mtoa",
            "namespace": "maya",
            "version": "2.3.1",
            "description": "Arnold for Maya",
            "auto-use": false,
            "install-location": "/apps/mtoa",
            "system": {"platform": "linux"},
            "command": {"mtoa": "mtoa-run"},
            "environ": {"B": "2", "A": "1"},
            "requirements": ["maya >=2018, <2020"],
            "conditions": ["maya"],
            "variants": [
                {"identifier": "gpu", "requirements": ["cuda >=10"]},
                {"identifier": "cpu"}
            ]
        }))
        .unwrap();

        assert_eq!(definition.identifier(), "mtoa");
        assert_eq!(definition.qualified_name(), "maya::mtoa");
        assert_eq!(definition.version().to_string(), "2.3.1");
        // File order, not sorted order.
        assert_eq!(
            definition.environ(),
            &[("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]
        );
        assert_eq!(definition.requirements().len(), 1);
        assert_eq!(definition.variants().len(), 2);
        assert_eq!(definition.variant_index("cpu"), Some(1));
        assert_eq!(definition.variant_index("tpu"), None);
    }

    #[test]
    fn rejects_unknown_top_level_keys() {
        let err = load(json!({"identifier": "foo", "unexpected": 1})).unwrap_err();
        assert!(matches!(err, DefinitionError::Parse { .. }));
    }

    #[test]
    fn rejects_bad_identifiers() {
        assert!(load(json!({"identifier": ""})).is_err());
        assert!(load(json!({"identifier": "has space"})).is_err());
        assert!(load(json!({"identifier": "ok-id_1.0"})).is_ok());
        assert!(
            load(json!({"identifier": "foo", "variants": [{"identifier": "a b"}]})).is_err()
        );
    }

    #[test]
    fn rejects_bad_embedded_strings() {
        assert!(load(json!({"identifier": "foo", "version": "abc"})).is_err());
        assert!(load(json!({"identifier": "foo", "requirements": ["bar [x,y]"]})).is_err());
    }

    #[test]
    fn versionless_definitions_default_to_zero() {
        let definition = load(json!({"identifier": "foo"})).unwrap();
        assert!(definition.declared_version().is_none());
        assert_eq!(definition.version(), &Version::new([0]));
    }

    #[test]
    fn implicit_requirement_is_unversioned() {
        let definition = load(json!({
            "identifier": "proj",
            "namespace": "studio",
            "version": "1.2",
            "auto-use": true
        }))
        .unwrap();
        assert!(definition.auto_use());
        let requirement = definition.implicit_requirement();
        assert_eq!(requirement.qualified_name(), "studio::proj");
        assert!(requirement.specifiers().is_any());
    }
}
