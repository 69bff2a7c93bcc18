//! Registry discovery and the definition lookup index.
//!
//! A registry is a directory tree of JSON definition files; several
//! registries form an ordered chain. The index maps qualified names to
//! version-ordered definitions, commands back to the definition carrying
//! them, and bare names to the namespaces they are known under.

use crate::definition::{Definition, DefinitionError, load_definition};
use crate::history::{EventCollector, EventType};
use crate::requirement::Requirement;
use crate::system::{CurrentSystemError, SystemDescriptor};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    System(#[from] CurrentSystemError),
    #[error("failed to scan registry {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug)]
pub struct RegistryIndex {
    /// Qualified name -> definitions, newest version first. Among equal
    /// versions the later registry wins.
    definitions: BTreeMap<String, Vec<Arc<Definition>>>,
    command_index: BTreeMap<String, String>,
    namespace_index: BTreeMap<String, BTreeSet<String>>,
    implicit_packages: Vec<Requirement>,
    registry_paths: Vec<PathBuf>,
}

impl RegistryIndex {
    /// Scan the registry chain and build the lookup index. Disabled
    /// definitions and definitions whose system constraint does not match
    /// `system` are left out.
    pub fn discover(
        registry_paths: &[PathBuf],
        system: &SystemDescriptor,
        collector: &mut EventCollector,
    ) -> Result<Self> {
        let mut records = Vec::new();
        for registry_path in registry_paths {
            let before = records.len();
            scan_registry(registry_path, registry_path, &mut records)?;
            collector.event_with(
                EventType::RegistryScanned,
                registry_path.display().to_string(),
                json!({"definitions": records.len() - before}),
            );
        }
        Self::build(records, registry_paths.to_vec(), system, collector)
    }

    fn build(
        records: Vec<Arc<Definition>>,
        registry_paths: Vec<PathBuf>,
        system: &SystemDescriptor,
        collector: &mut EventCollector,
    ) -> Result<Self> {
        let mut definitions: BTreeMap<String, Vec<(usize, Arc<Definition>)>> = BTreeMap::new();
        let mut command_index = BTreeMap::new();
        let mut namespace_index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut implicit_names = Vec::new();

        for (order, definition) in records.into_iter().enumerate() {
            if definition.disabled() {
                continue;
            }
            if let Some(constraint) = definition.system() {
                if !system.matches(constraint)? {
                    continue;
                }
            }

            let qualified = definition.qualified_name();
            if let Some(namespace) = definition.namespace() {
                namespace_index
                    .entry(definition.identifier().to_string())
                    .or_default()
                    .insert(namespace.to_string());
            }
            for command in definition.command().keys() {
                if let Some(previous) =
                    command_index.insert(command.clone(), qualified.clone())
                {
                    if previous != qualified {
                        collector.event_with(
                            EventType::CommandOverridden,
                            format!("command {command:?} now maps to {qualified:?}"),
                            json!({"command": command, "previous": previous}),
                        );
                    }
                }
            }
            if definition.auto_use() && !implicit_names.contains(&qualified) {
                implicit_names.push(qualified.clone());
            }
            definitions.entry(qualified).or_default().push((order, definition));
        }

        let definitions: BTreeMap<String, Vec<Arc<Definition>>> = definitions
            .into_iter()
            .map(|(name, mut versions)| {
                versions.sort_by(|(a_order, a), (b_order, b)| {
                    b.version()
                        .cmp(a.version())
                        .then_with(|| b_order.cmp(a_order))
                });
                (
                    name,
                    versions.into_iter().map(|(_, def)| def).collect(),
                )
            })
            .collect();

        // Implicit packages in reverse discovery order: deeper registries
        // end up first, giving them higher priority at the root.
        let implicit_packages = implicit_names
            .into_iter()
            .rev()
            .filter_map(|name| {
                definitions
                    .get(&name)
                    .and_then(|versions| versions.first())
                    .map(|definition| definition.implicit_requirement())
            })
            .collect();

        Ok(Self {
            definitions,
            command_index,
            namespace_index,
            implicit_packages,
            registry_paths,
        })
    }

    pub fn registry_paths(&self) -> &[PathBuf] {
        &self.registry_paths
    }

    /// Index over in-memory records on a permissive host; unit tests in
    /// sibling modules build fixtures through this.
    #[cfg(test)]
    pub(crate) fn build_for_tests(records: Vec<Arc<Definition>>) -> Self {
        Self::build(
            records,
            vec![PathBuf::from("/reg")],
            &SystemDescriptor::new(
                "linux",
                "x86_64",
                "linux",
                crate::version::Version::new([0]),
            ),
            &mut EventCollector::new(),
        )
        .expect("test registry index")
    }

    /// Requirements for every auto-use definition, highest priority first.
    pub fn implicit_packages(&self) -> &[Requirement] {
        &self.implicit_packages
    }

    /// All known versions of a qualified name, newest first.
    pub fn versions_of(&self, qualified_name: &str) -> &[Arc<Definition>] {
        self.definitions
            .get(qualified_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Namespaces a bare name is known under.
    pub fn namespaces_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.namespace_index.get(name)
    }

    pub fn command_index(&self) -> &BTreeMap<String, String> {
        &self.command_index
    }

    /// The qualified name of the definition carrying a command.
    pub fn fetch_from_command(&self, command: &str) -> Option<&str> {
        self.command_index.get(command).map(String::as_str)
    }

    /// Resolve a requirement to the best matching definition.
    ///
    /// Namespace resolution, in order: the request's own namespace; the
    /// sole known namespace; a namespace equal to the bare name; a
    /// namespace-hint intersection ranked by the namespace counter (ties
    /// break lexicographically). Anything else is ambiguous. A name known
    /// under no namespace at all resolves to its bare definition.
    pub fn fetch(
        &self,
        request: &Requirement,
        hints: &BTreeSet<String>,
        counter: &BTreeMap<String, u32>,
    ) -> std::result::Result<&Arc<Definition>, DefinitionError> {
        let qualified = self.resolve_qualified_name(request, hints, counter)?;
        let versions = self.versions_of(&qualified);

        for definition in versions {
            if !request.specifiers().matches(definition.version()) {
                continue;
            }
            // A requested variant must exist at this version; otherwise
            // descend to the next highest.
            if !request.extras().is_empty()
                && !request
                    .extras()
                    .iter()
                    .any(|extra| definition.variant_index(extra).is_some())
            {
                continue;
            }
            return Ok(definition);
        }
        Err(DefinitionError::NotFound {
            request: request.to_string(),
        })
    }

    fn resolve_qualified_name(
        &self,
        request: &Requirement,
        hints: &BTreeSet<String>,
        counter: &BTreeMap<String, u32>,
    ) -> std::result::Result<String, DefinitionError> {
        if request.namespace().is_some() {
            return Ok(request.qualified_name());
        }
        let name = request.name();

        let Some(known) = self.namespace_index.get(name) else {
            // No namespace carries this name; a namespace-less definition
            // is the only possible match.
            if self.definitions.contains_key(name) {
                return Ok(name.to_string());
            }
            return Err(DefinitionError::NotFound {
                request: request.to_string(),
            });
        };
        if known.len() == 1 {
            let namespace = known.iter().next().map(String::as_str).unwrap_or_default();
            return Ok(format!("{namespace}::{name}"));
        }
        // Self-titled namespace wins: `massive` resolves to
        // `massive::massive` over `maya::massive`.
        if known.contains(name) {
            return Ok(format!("{name}::{name}"));
        }
        let mut intersecting: Vec<&String> = known.intersection(hints).collect();
        if !intersecting.is_empty() {
            intersecting.sort_by(|a, b| {
                let count_a = counter.get(*a).copied().unwrap_or(0);
                let count_b = counter.get(*b).copied().unwrap_or(0);
                count_b.cmp(&count_a).then_with(|| a.cmp(b))
            });
            let namespace = intersecting[0];
            return Ok(format!("{namespace}::{name}"));
        }
        Err(DefinitionError::AmbiguousNamespace {
            name: name.to_string(),
            namespaces: known.iter().cloned().collect(),
        })
    }
}

/// Recursively collect definition records from a registry directory.
/// Entries are visited in name order so discovery is deterministic; dot
/// files and dot directories are skipped.
fn scan_registry(
    dir: &Path,
    registry_path: &Path,
    records: &mut Vec<Arc<Definition>>,
) -> Result<()> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| RegistryError::Scan {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        let hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if hidden {
            continue;
        }
        if path.is_dir() {
            scan_registry(&path, registry_path, records)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            records.push(Arc::new(load_definition(&path, registry_path)?));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::definition_from_json;
    use crate::version::Version;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn system() -> SystemDescriptor {
        SystemDescriptor::new("linux", "x86_64", "el", "7.3".parse().unwrap())
    }

    fn index_from(values: Vec<serde_json::Value>) -> RegistryIndex {
        let records = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let path = PathBuf::from(format!("/reg/def{i}.json"));
                Arc::new(
                    definition_from_json(value, &path, Path::new("/reg")).unwrap(),
                )
            })
            .collect();
        RegistryIndex::build(
            records,
            vec![PathBuf::from("/reg")],
            &system(),
            &mut EventCollector::new(),
        )
        .unwrap()
    }

    fn fetch<'a>(index: &'a RegistryIndex, request: &str) -> &'a Arc<Definition> {
        index
            .fetch(
                &request.parse().unwrap(),
                &BTreeSet::new(),
                &BTreeMap::new(),
            )
            .unwrap()
    }

    #[test]
    fn versions_sort_newest_first() {
        let index = index_from(vec![
            json!({"identifier": "foo", "version": "0.5.0"}),
            json!({"identifier": "foo", "version": "1.0.0"}),
            json!({"identifier": "foo", "version": "0.9.0"}),
        ]);
        let versions: Vec<String> = index
            .versions_of("foo")
            .iter()
            .map(|d| d.version().to_string())
            .collect();
        assert_eq!(versions, ["1.0.0", "0.9.0", "0.5.0"]);
    }

    #[test]
    fn fetch_selects_highest_matching_version() {
        let index = index_from(vec![
            json!({"identifier": "foo", "version": "1.0.0"}),
            json!({"identifier": "foo", "version": "2.0.0"}),
        ]);
        assert_eq!(fetch(&index, "foo").version(), &"2.0.0".parse::<Version>().unwrap());
        assert_eq!(fetch(&index, "foo <2").version(), &"1.0.0".parse::<Version>().unwrap());
        assert!(
            index
                .fetch(&"foo >3".parse().unwrap(), &BTreeSet::new(), &BTreeMap::new())
                .is_err()
        );
    }

    #[test]
    fn fetch_descends_until_the_variant_exists() {
        let index = index_from(vec![
            json!({"identifier": "foo", "version": "1.0.0",
                   "variants": [{"identifier": "old"}]}),
            json!({"identifier": "foo", "version": "2.0.0",
                   "variants": [{"identifier": "new"}]}),
        ]);
        assert_eq!(
            fetch(&index, "foo[old]").version(),
            &"1.0.0".parse::<Version>().unwrap()
        );
    }

    #[test]
    fn disabled_and_foreign_system_definitions_are_hidden() {
        let index = index_from(vec![
            json!({"identifier": "foo", "version": "2.0.0", "disabled": true}),
            json!({"identifier": "foo", "version": "1.0.0"}),
            json!({"identifier": "bar", "version": "1.0.0",
                   "system": {"platform": "windows"}}),
            json!({"identifier": "baz", "version": "1.0.0",
                   "system": {"os": "el >= 7, < 8"}}),
        ]);
        assert_eq!(fetch(&index, "foo").version(), &"1.0.0".parse::<Version>().unwrap());
        assert!(index.versions_of("bar").is_empty());
        assert_eq!(index.versions_of("baz").len(), 1);
    }

    #[test]
    fn self_titled_namespace_wins() {
        let index = index_from(vec![
            json!({"identifier": "massive", "namespace": "maya", "version": "1.0"}),
            json!({"identifier": "massive", "namespace": "massive", "version": "2.0"}),
        ]);
        assert_eq!(fetch(&index, "massive").qualified_name(), "massive::massive");
        assert_eq!(fetch(&index, "maya::massive").qualified_name(), "maya::massive");
    }

    #[test]
    fn sole_namespace_is_inferred() {
        let index = index_from(vec![json!({
            "identifier": "mtoa", "namespace": "maya", "version": "1.0"
        })]);
        assert_eq!(fetch(&index, "mtoa").qualified_name(), "maya::mtoa");
    }

    #[test]
    fn sole_namespace_wins_over_a_bare_homonym() {
        let index = index_from(vec![
            json!({"identifier": "tool", "version": "1.0"}),
            json!({"identifier": "tool", "namespace": "studio", "version": "2.0"}),
            json!({"identifier": "lone", "version": "1.0"}),
        ]);
        assert_eq!(fetch(&index, "tool").qualified_name(), "studio::tool");
        // The bare definition stays reachable through its own name only
        // when no namespace carries it.
        assert_eq!(fetch(&index, "lone").qualified_name(), "lone");
    }

    #[test]
    fn hints_and_counter_break_namespace_ties() {
        let index = index_from(vec![
            json!({"identifier": "tool", "namespace": "alpha", "version": "1.0"}),
            json!({"identifier": "tool", "namespace": "beta", "version": "1.0"}),
        ]);
        let request: Requirement = "tool".parse().unwrap();

        let err = index
            .fetch(&request, &BTreeSet::new(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, DefinitionError::AmbiguousNamespace { .. }));

        let hints: BTreeSet<String> = ["beta".to_string()].into();
        let chosen = index.fetch(&request, &hints, &BTreeMap::new()).unwrap();
        assert_eq!(chosen.qualified_name(), "beta::tool");

        let hints: BTreeSet<String> = ["alpha".to_string(), "beta".to_string()].into();
        let counter: BTreeMap<String, u32> = [("beta".to_string(), 3)].into();
        let chosen = index.fetch(&request, &hints, &counter).unwrap();
        assert_eq!(chosen.qualified_name(), "beta::tool");

        // Equal counts fall back to lexicographic order.
        let chosen = index.fetch(&request, &hints, &BTreeMap::new()).unwrap();
        assert_eq!(chosen.qualified_name(), "alpha::tool");
    }

    #[test]
    fn implicit_packages_reverse_discovery_order() {
        let index = index_from(vec![
            json!({"identifier": "early", "version": "1.0", "auto-use": true}),
            json!({"identifier": "late", "version": "1.0", "auto-use": true}),
            json!({"identifier": "plain", "version": "1.0"}),
        ]);
        let names: Vec<String> = index
            .implicit_packages()
            .iter()
            .map(|r| r.qualified_name())
            .collect();
        assert_eq!(names, ["late", "early"]);
    }

    #[test]
    fn command_index_later_registry_overrides() {
        let mut collector = EventCollector::new();
        let records = vec![
            Arc::new(
                definition_from_json(
                    json!({"identifier": "one", "version": "1.0", "command": {"app": "one-run"}}),
                    Path::new("/reg/one.json"),
                    Path::new("/reg"),
                )
                .unwrap(),
            ),
            Arc::new(
                definition_from_json(
                    json!({"identifier": "two", "version": "1.0", "command": {"app": "two-run"}}),
                    Path::new("/reg2/two.json"),
                    Path::new("/reg2"),
                )
                .unwrap(),
            ),
        ];
        let index = RegistryIndex::build(
            records,
            vec![PathBuf::from("/reg"), PathBuf::from("/reg2")],
            &system(),
            &mut collector,
        )
        .unwrap();
        assert_eq!(index.fetch_from_command("app"), Some("two"));
        assert!(
            collector
                .events()
                .iter()
                .any(|e| e.event_type == EventType::CommandOverridden)
        );
    }

    #[test]
    fn discovery_walks_nested_directories() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("tools").join("render");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            temp.path().join("foo.json"),
            r#"{"identifier": "foo", "version": "1.0"}"#,
        )
        .unwrap();
        fs::write(
            nested.join("bar.json"),
            r#"{"identifier": "bar", "version": "2.0"}"#,
        )
        .unwrap();
        fs::create_dir_all(temp.path().join(".hidden")).unwrap();
        fs::write(
            temp.path().join(".hidden").join("baz.json"),
            r#"{"identifier": "baz", "version": "1.0"}"#,
        )
        .unwrap();
        fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let index = RegistryIndex::discover(
            &[temp.path().to_path_buf()],
            &system(),
            &mut EventCollector::new(),
        )
        .unwrap();
        assert_eq!(index.versions_of("foo").len(), 1);
        assert_eq!(index.versions_of("bar").len(), 1);
        assert!(index.versions_of("baz").is_empty());
    }
}
