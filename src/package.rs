//! Materialized packages.
//!
//! A package is one definition at one version with at most one variant,
//! the unit placed in the dependency graph. Variant environ/command
//! overlay the definition's; requirements concatenate.

use crate::definition::Definition;
use crate::requirement::Requirement;
use crate::version::Version;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("definition {name:?} has no variant at index {index}")]
    UnknownVariant { name: String, index: usize },
    #[error("definition {name:?} declares variants; one must be selected")]
    VariantRequired { name: String },
}

pub type Result<T> = std::result::Result<T, PackageError>;

#[derive(Debug, Clone)]
pub struct Package {
    qualified_identifier: String,
    namespace: Option<String>,
    name: String,
    variant_id: Option<String>,
    version: Version,
    environ: Vec<(String, String)>,
    command: BTreeMap<String, String>,
    requirements: Vec<Requirement>,
    conditions: Vec<Requirement>,
    install_location: Option<String>,
    install_root: Option<String>,
    definition: Arc<Definition>,
}

impl Package {
    /// `namespace::name[variant]==version`, optional elements omitted.
    pub fn qualified_identifier(&self) -> &str {
        &self.qualified_identifier
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `namespace::name` of the definition this package came from.
    pub fn definition_name(&self) -> String {
        self.definition.qualified_name()
    }

    pub fn variant_id(&self) -> Option<&str> {
        self.variant_id.as_deref()
    }

    pub fn version(&self) -> &Version {
        &self.version
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

    /// Variant install-location wins over the definition's.
    pub fn install_location(&self) -> Option<&str> {
        self.install_location.as_deref()
    }

    pub fn install_root(&self) -> Option<&str> {
        self.install_root.as_deref()
    }

    pub fn definition(&self) -> &Arc<Definition> {
        &self.definition
    }

    pub fn satisfies(&self, requirement: &Requirement) -> bool {
        requirement.matches_parts(
            self.namespace.as_deref(),
            &self.name,
            self.variant_id.as_deref(),
            &self.version,
        )
    }
}

/// Materialize a package from a definition and an optional variant index.
/// Definitions with variants always require an index; the graph fans out
/// one node per variant before materializing.
pub fn materialize(definition: &Arc<Definition>, variant_index: Option<usize>) -> Result<Arc<Package>> {
    let variant = match variant_index {
        Some(index) => Some(definition.variants().get(index).ok_or_else(|| {
            PackageError::UnknownVariant {
                name: definition.qualified_name(),
                index,
            }
        })?),
        None => {
            if !definition.variants().is_empty() {
                return Err(PackageError::VariantRequired {
                    name: definition.qualified_name(),
                });
            }
            None
        }
    };

    // Last writer wins per key; variant entries override the definition's.
    let mut environ = definition.environ().to_vec();
    let mut command = definition.command().clone();
    let mut requirements = definition.requirements().to_vec();
    if let Some(variant) = variant {
        for (key, value) in &variant.environ {
            if let Some(existing) = environ.iter_mut().find(|(k, _)| k == key) {
                existing.1 = value.clone();
            } else {
                environ.push((key.clone(), value.clone()));
            }
        }
        for (key, value) in &variant.command {
            command.insert(key.clone(), value.clone());
        }
        requirements.extend(variant.requirements.iter().cloned());
    }

    let install_location = variant
        .and_then(|v| v.install_location.clone())
        .or_else(|| definition.install_location().map(str::to_string));

    let variant_id = variant.map(|v| v.identifier.clone());
    let qualified_identifier = qualify(
        definition.namespace(),
        definition.identifier(),
        variant_id.as_deref(),
        definition.version(),
    );

    Ok(Arc::new(Package {
        qualified_identifier,
        namespace: definition.namespace().map(str::to_string),
        name: definition.identifier().to_string(),
        variant_id,
        version: definition.version().clone(),
        environ,
        command,
        requirements,
        conditions: definition.conditions().to_vec(),
        install_location,
        install_root: definition.install_root().map(str::to_string),
        definition: Arc::clone(definition),
    }))
}

fn qualify(
    namespace: Option<&str>,
    name: &str,
    variant: Option<&str>,
    version: &Version,
) -> String {
    let mut identifier = String::new();
    if let Some(namespace) = namespace {
        identifier.push_str(namespace);
        identifier.push_str("::");
    }
    identifier.push_str(name);
    if let Some(variant) = variant {
        identifier.push('[');
        identifier.push_str(variant);
        identifier.push(']');
    }
    identifier.push_str("==");
    identifier.push_str(&version.to_string());
    identifier
}

/// Materialization cache keyed by `(definition file, variant index)`.
#[derive(Debug, Default)]
pub struct PackageCache {
    packages: BTreeMap<(PathBuf, Option<usize>), Arc<Package>>,
}

impl PackageCache {
    pub fn materialize(
        &mut self,
        definition: &Arc<Definition>,
        variant_index: Option<usize>,
    ) -> Result<Arc<Package>> {
        let key = (definition.definition_path().to_path_buf(), variant_index);
        if let Some(package) = self.packages.get(&key) {
            return Ok(Arc::clone(package));
        }
        let package = materialize(definition, variant_index)?;
        self.packages.insert(key, Arc::clone(&package));
        Ok(package)
    }
}
