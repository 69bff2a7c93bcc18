//! The resolver: conflict resolution over combinations, and the driver
//! that orchestrates the whole search.
//!
//! The driver builds one initial graph from the requests, then walks the
//! variant combinations. Each combination is reduced to a fixed point:
//! version conflicts are merged or replaced, parents relinked, conditional
//! packages re-evaluated. A combination with no recorded errors emits its
//! packages in distance order. When every combination fails, conflicting
//! definitions are downgraded to open new combinations, bounded by the
//! attempt budget.

use crate::combination::{Combination, Combinations};
use crate::context::Context;
use crate::definition::DefinitionError;
use crate::distance::{DistanceMapping, compute_distance_mapping, packages_by_distance};
use crate::graph::{
    Graph, GraphBuildError, GraphConflictsError, GraphInvalidNodesError, ROOT, RecordedError,
    ResolverContext,
};
use crate::history::{EventCollector, EventType};
use crate::package::{Package, PackageError};
use crate::registry::RegistryIndex;
use crate::requirement::{Requirement, RequirementError, combine_requirements};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub max_attempts: usize,
    pub max_combinations: usize,
    pub include_implicit: bool,
    pub namespace_hints: BTreeSet<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            max_combinations: 10_000,
            include_implicit: true,
            namespace_hints: BTreeSet::new(),
        }
    }
}

/// Every variant combination was pruned or exhausted without a resolvable
/// graph and no more specific failure was recorded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no variant combination could be resolved ({combinations} explored)")]
pub struct GraphVariantsError {
    pub combinations: usize,
}

/// Aggregate failure once combinations and downgrade attempts run out.
#[derive(Debug, Error)]
pub enum GraphResolutionError {
    #[error("failed to resolve graph at combination #{combination}: {source}")]
    Conflicts {
        combination: usize,
        #[source]
        source: GraphConflictsError,
        /// Every conflict recorded by the final combination.
        conflicts: Vec<GraphConflictsError>,
    },
    #[error("failed to resolve graph at combination #{combination}: {source}")]
    InvalidNodes {
        combination: usize,
        #[source]
        source: GraphInvalidNodesError,
    },
    #[error(transparent)]
    Variants(#[from] GraphVariantsError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Requirement(#[from] RequirementError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Package(#[from] PackageError),
    #[error(transparent)]
    Resolution(#[from] GraphResolutionError),
}

impl From<GraphBuildError> for ResolveError {
    fn from(error: GraphBuildError) -> Self {
        match error {
            GraphBuildError::Definition(error) => ResolveError::Definition(error),
            GraphBuildError::Package(error) => ResolveError::Package(error),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;

enum CombinationOutcome {
    Resolved(Vec<Arc<Package>>),
    Failed(Vec<RecordedError>),
}

pub struct Resolver<'a> {
    index: &'a RegistryIndex,
    options: ResolveOptions,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a RegistryIndex, options: ResolveOptions) -> Self {
        Self { index, options }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Resolve requests into a full context, folding environments over an
    /// initial mapping.
    pub fn resolve(
        &self,
        requests: &[String],
        initial_environ: &BTreeMap<String, String>,
        collector: &mut EventCollector,
    ) -> Result<Context> {
        let packages = self.resolve_packages(requests, collector)?;
        let context = Context::from_packages(
            &packages,
            self.index.registry_paths(),
            initial_environ,
            collector,
        );
        collector.event_with(
            EventType::ContextExtracted,
            format!("{} package(s)", context.packages.len()),
            json!({"packages": context.packages.len()}),
        );
        Ok(context)
    }

    /// Resolve requests into the ordered package list.
    pub fn resolve_packages(
        &self,
        requests: &[String],
        collector: &mut EventCollector,
    ) -> Result<Vec<Arc<Package>>> {
        collector.event_with(
            EventType::ResolveStart,
            requests.join(", "),
            json!({"requests": requests}),
        );

        let mut requirements = Vec::new();
        if self.options.include_implicit {
            requirements.extend(self.index.implicit_packages().iter().cloned());
        }
        for request in requests {
            requirements.push(request.parse::<Requirement>()?);
        }

        let counter = self.namespace_counter(&requirements);
        let ctx = ResolverContext::new(self.index);
        let mut graph = Graph::new(counter);
        graph.update_from_requirements(&ctx, &requirements, ROOT, collector)?;
        collector.event_with(
            EventType::GraphCreated,
            format!("{} node(s)", graph.node_count()),
            json!({"nodes": graph.node_count()}),
        );

        let mut combinations_total = 0usize;
        let mut last_errors: Vec<RecordedError> = Vec::new();

        for _attempt in 0..self.options.max_attempts {
            let mut conflict_definitions: BTreeSet<String> = BTreeSet::new();

            {
                let mut combinations = Combinations::new(&graph);
                while let Some(mut combination) = combinations.next() {
                    if combinations_total >= self.options.max_combinations {
                        break;
                    }
                    combinations_total += 1;
                    combination.number = combinations_total;
                    collector.event_with(
                        EventType::CombinationExtracted,
                        format!("combination #{combinations_total}"),
                        json!({"selection": combination.selection.clone()}),
                    );

                    match self.resolve_combination(&ctx, &mut combination, collector)? {
                        CombinationOutcome::Resolved(packages) => {
                            collector.event_with(
                                EventType::ResolveComplete,
                                format!("combination #{combinations_total}"),
                                json!({"packages": packages.len()}),
                            );
                            return Ok(packages);
                        }
                        CombinationOutcome::Failed(errors) => {
                            for definition in conflict_targets(&graph, &errors) {
                                conflict_definitions.insert(definition);
                            }
                            last_errors = errors;
                        }
                    }
                }
            }

            if conflict_definitions.is_empty() {
                break;
            }
            if !graph.downgrade_versions(&ctx, &conflict_definitions, collector)? {
                break;
            }
        }

        let error = resolution_error(combinations_total, last_errors);
        collector.event_with(
            EventType::ResolveFailed,
            error.to_string(),
            json!({"combinations": combinations_total}),
        );
        Err(error.into())
    }

    /// Reduce one combination to a fixed point and validate it.
    fn resolve_combination(
        &self,
        ctx: &ResolverContext,
        combination: &mut Combination,
        collector: &mut EventCollector,
    ) -> std::result::Result<CombinationOutcome, GraphBuildError> {
        let graph = &mut combination.graph;

        loop {
            self.resolve_conflicts(ctx, graph, collector)?;
            graph.prune();
            if !graph.settle_conditionals(ctx, collector)? {
                break;
            }
        }

        if !graph.errors().is_empty() {
            return Ok(CombinationOutcome::Failed(graph.errors().to_vec()));
        }
        let mapping = compute_distance_mapping(graph);
        Ok(CombinationOutcome::Resolved(packages_by_distance(
            graph, &mapping,
        )))
    }

    /// Merge or replace conflicting nodes until no mutation happens. The
    /// distance mapping is memoized across iterations and refreshed only
    /// when the graph reports a mutation.
    fn resolve_conflicts(
        &self,
        ctx: &ResolverContext,
        graph: &mut Graph,
        collector: &mut EventCollector,
    ) -> std::result::Result<(), GraphBuildError> {
        let mut mapping = DistanceMapping::new();
        let mut labelled = false;
        loop {
            if graph.take_mutated() || !labelled {
                mapping = compute_distance_mapping(graph);
                labelled = true;
            }
            let conflicting = conflicting_nodes(graph, &mapping);
            if conflicting.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            'pairs: for (position, left) in conflicting.iter().enumerate() {
                for right in &conflicting[position + 1..] {
                    let same_definition = match (graph.node(left), graph.node(right)) {
                        (Some(a), Some(b)) => {
                            a.package().definition_name() == b.package().definition_name()
                        }
                        _ => continue,
                    };
                    if !same_definition {
                        continue;
                    }
                    if self.resolve_conflict_pair(ctx, graph, left, right, collector)? {
                        progressed = true;
                        break 'pairs;
                    }
                }
            }
            // Fixed point: every remaining pair is unresolvable and has
            // been recorded.
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Try to converge two same-definition nodes onto one version.
    /// Returns true when the graph mutated.
    fn resolve_conflict_pair(
        &self,
        ctx: &ResolverContext,
        graph: &mut Graph,
        left_id: &str,
        right_id: &str,
        collector: &mut EventCollector,
    ) -> std::result::Result<bool, GraphBuildError> {
        let left_incoming: Vec<(String, Requirement)> = graph
            .incoming(left_id)
            .into_iter()
            .map(|(parent, edge)| (parent, edge.requirement.clone()))
            .collect();
        let right_incoming: Vec<(String, Requirement)> = graph
            .incoming(right_id)
            .into_iter()
            .map(|(parent, edge)| (parent, edge.requirement.clone()))
            .collect();

        let all: Vec<Requirement> = left_incoming
            .iter()
            .chain(right_incoming.iter())
            .map(|(_, requirement)| requirement.clone())
            .collect();
        let Some(combined) = combine_requirements(all.iter()) else {
            return Ok(false);
        };

        let fetched = ctx.index.fetch(
            &combined,
            &graph.namespace_hints(),
            graph.namespace_counter(),
        );
        let definition = match fetched {
            Ok(definition) => Arc::clone(definition),
            Err(_) => {
                let conflict = conflict_record(
                    graph,
                    left_id,
                    &left_incoming,
                    right_id,
                    &right_incoming,
                    combined,
                );
                collector.event_with(
                    EventType::ConflictDetected,
                    conflict.to_string(),
                    json!({"definition": conflict.definition.clone()}),
                );
                if !graph
                    .errors()
                    .iter()
                    .any(|error| matches!(error, RecordedError::Conflict(c) if *c == conflict))
                {
                    graph.record_error(RecordedError::Conflict(conflict));
                }
                return Ok(false);
            }
        };

        let left_version = graph
            .node(left_id)
            .map(|node| node.package().version().clone());
        let right_version = graph
            .node(right_id)
            .map(|node| node.package().version().clone());

        if left_version.as_ref() == Some(definition.version()) {
            graph.relink_parents(right_id, Some(left_id), Some(&combined));
            return Ok(true);
        }
        if right_version.as_ref() == Some(definition.version()) {
            graph.relink_parents(left_id, Some(right_id), Some(&combined));
            return Ok(true);
        }

        // Neither node carries the re-fetched version: replace both.
        let variant_id = graph
            .node(left_id)
            .and_then(|node| node.package().variant_id().map(str::to_string));
        let variant_index = match &variant_id {
            Some(variant) => match definition.variant_index(variant) {
                Some(index) => Some(index),
                None => {
                    let conflict = conflict_record(
                        graph,
                        left_id,
                        &left_incoming,
                        right_id,
                        &right_incoming,
                        combined,
                    );
                    graph.record_error(RecordedError::Conflict(conflict));
                    return Ok(false);
                }
            },
            None => None,
        };
        let package = ctx
            .cache
            .borrow_mut()
            .materialize(&definition, variant_index)?;
        let new_id = graph.insert_package(Arc::clone(&package), collector);
        graph.relink_parents(left_id, Some(&new_id), Some(&combined));
        graph.relink_parents(right_id, Some(&new_id), Some(&combined));
        graph.update_from_requirements(ctx, &package.requirements().to_vec(), &new_id, collector)?;
        Ok(true)
    }

    /// Counter seeding namespace tie-breaks, derived from the request
    /// list: explicit namespaces count directly, bare names count toward
    /// their only known namespace.
    fn namespace_counter(&self, requirements: &[Requirement]) -> BTreeMap<String, u32> {
        let mut counter: BTreeMap<String, u32> = BTreeMap::new();
        for requirement in requirements {
            if let Some(namespace) = requirement.namespace() {
                *counter.entry(namespace.to_string()).or_insert(0) += 1;
            } else if let Some(known) = self.index.namespaces_of(requirement.name()) {
                if known.len() == 1 {
                    if let Some(namespace) = known.iter().next() {
                        *counter.entry(namespace.clone()).or_insert(0) += 1;
                    }
                }
            }
        }
        for hint in &self.options.namespace_hints {
            counter.entry(hint.clone()).or_insert(0);
        }
        counter
    }
}

/// Nodes sharing a definition with at least one other node, ordered by
/// distance, then definition, then version descending.
fn conflicting_nodes(graph: &Graph, mapping: &DistanceMapping) -> Vec<String> {
    let mut by_definition: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, node) in graph.nodes() {
        by_definition
            .entry(node.package().definition_name())
            .or_default()
            .push(id.clone());
    }

    let mut conflicting: Vec<String> = by_definition
        .into_values()
        .filter(|ids| ids.len() > 1)
        .flatten()
        .collect();
    conflicting.sort_by(|a, b| {
        let weight = |id: &str| mapping.get(id).map(|d| d.weight).unwrap_or(u64::MAX);
        let definition = |id: &str| {
            graph
                .node(id)
                .map(|node| node.package().definition_name())
                .unwrap_or_default()
        };
        let version = |id: &str| graph.node(id).map(|node| node.package().version().clone());
        weight(a)
            .cmp(&weight(b))
            .then_with(|| definition(a).cmp(&definition(b)))
            .then_with(|| version(b).cmp(&version(a)))
    });
    conflicting
}

/// Build the record for an unresolvable pair: the incompatible
/// requirements, their immediate parents, and the combined requirement
/// that no version satisfied.
fn conflict_record(
    graph: &Graph,
    left_id: &str,
    left_incoming: &[(String, Requirement)],
    right_id: &str,
    right_incoming: &[(String, Requirement)],
    combined: Requirement,
) -> GraphConflictsError {
    let definition = graph
        .node(left_id)
        .map(|node| node.package().definition_name())
        .unwrap_or_else(|| left_id.to_string());

    // Prefer a provably incompatible pair; fall back to the first of each.
    let mut left = left_incoming.first().map(|(_, r)| r.clone());
    let mut right = right_incoming.first().map(|(_, r)| r.clone());
    'search: for (_, a) in left_incoming {
        for (_, b) in right_incoming {
            if !a.is_overlapping(b) {
                left = Some(a.clone());
                right = Some(b.clone());
                break 'search;
            }
        }
    }

    GraphConflictsError {
        definition,
        left: left.unwrap_or_else(|| Requirement::any(left_id)),
        left_parents: left_incoming
            .iter()
            .map(|(parent, _)| parent.clone())
            .collect(),
        right: right.unwrap_or_else(|| Requirement::any(right_id)),
        right_parents: right_incoming
            .iter()
            .map(|(parent, _)| parent.clone())
            .collect(),
        combined,
    }
}

/// Definitions worth downgrading after a failed round: the conflicting
/// definition itself plus the definitions of the conflict's parents.
fn conflict_targets(graph: &Graph, errors: &[RecordedError]) -> BTreeSet<String> {
    let mut targets = BTreeSet::new();
    for error in errors {
        if let RecordedError::Conflict(conflict) = error {
            targets.insert(conflict.definition.clone());
            for parent in conflict
                .left_parents
                .iter()
                .chain(conflict.right_parents.iter())
            {
                if parent == ROOT {
                    continue;
                }
                if let Some(node) = graph.node(parent) {
                    targets.insert(node.package().definition_name());
                }
            }
        }
    }
    targets
}

fn resolution_error(combinations: usize, errors: Vec<RecordedError>) -> GraphResolutionError {
    let conflicts: Vec<GraphConflictsError> = errors
        .iter()
        .filter_map(|error| match error {
            RecordedError::Conflict(conflict) => Some(conflict.clone()),
            RecordedError::InvalidNode(_) => None,
        })
        .collect();
    if let Some(first) = conflicts.first() {
        return GraphResolutionError::Conflicts {
            combination: combinations,
            source: first.clone(),
            conflicts,
        };
    }
    if let Some(RecordedError::InvalidNode(invalid)) = errors
        .iter()
        .find(|error| matches!(error, RecordedError::InvalidNode(_)))
    {
        return GraphResolutionError::InvalidNodes {
            combination: combinations,
            source: invalid.clone(),
        };
    }
    GraphResolutionError::Variants(GraphVariantsError { combinations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::definition_from_json;
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn index_from(values: Vec<serde_json::Value>) -> RegistryIndex {
        let records = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                let path = PathBuf::from(format!("/reg/def{i}.json"));
                Arc::new(definition_from_json(value, &path, Path::new("/reg")).unwrap())
            })
            .collect();
        RegistryIndex::build_for_tests(records)
    }

    fn resolve_ids(index: &RegistryIndex, requests: &[&str]) -> Result<Vec<String>> {
        let resolver = Resolver::new(index, ResolveOptions::default());
        let requests: Vec<String> = requests.iter().map(|r| r.to_string()).collect();
        let packages = resolver.resolve_packages(&requests, &mut EventCollector::new())?;
        Ok(packages
            .iter()
            .map(|package| package.qualified_identifier().to_string())
            .collect())
    }

    #[test]
    fn resolves_a_single_package() {
        let index = index_from(vec![json!({"identifier": "foo", "version": "0.1.0"})]);
        assert_eq!(resolve_ids(&index, &["foo"]).unwrap(), ["foo==0.1.0"]);
    }

    #[test]
    fn merges_overlapping_requirements_onto_one_version() {
        let index = index_from(vec![
            json!({"identifier": "app", "version": "1.0", "requirements": ["lib >=1, <2"]}),
            json!({"identifier": "lib", "version": "1.4"}),
            json!({"identifier": "lib", "version": "2.3"}),
        ]);
        let ids = resolve_ids(&index, &["app", "lib"]).unwrap();
        assert_eq!(ids, ["app==1.0", "lib==1.4"]);
    }

    #[test]
    fn downgrades_a_parent_to_clear_a_conflict() {
        let index = index_from(vec![
            json!({"identifier": "foo", "version": "1.0.0", "requirements": ["bar <2"]}),
            json!({"identifier": "foo", "version": "0.5.0", "requirements": ["bar <3"]}),
            json!({"identifier": "bar", "version": "1.5.0"}),
            json!({"identifier": "bar", "version": "2.5.0"}),
        ]);
        let ids = resolve_ids(&index, &["foo", "bar ==2.5.0"]).unwrap();
        assert_eq!(ids, ["foo==0.5.0", "bar==2.5.0"]);
    }

    #[test]
    fn variant_precedence_follows_declaration_order() {
        let index = index_from(vec![
            json!({"identifier": "numpy", "version": "1.16.6", "variants": [
                {"identifier": "3.7", "requirements": ["python >=3.7, <3.8"]},
                {"identifier": "2.7", "requirements": ["python >=2.7, <2.8"]}
            ]}),
            json!({"identifier": "python", "version": "3.7.8"}),
            json!({"identifier": "python", "version": "2.7.16"}),
        ]);
        let ids = resolve_ids(&index, &["numpy"]).unwrap();
        assert_eq!(ids, ["numpy[3.7]==1.16.6", "python==3.7.8"]);

        let ids = resolve_ids(&index, &["numpy[2.7]"]).unwrap();
        assert_eq!(ids, ["numpy[2.7]==1.16.6", "python==2.7.16"]);
    }

    #[test]
    fn impossible_variant_pin_reports_the_requirement_pair() {
        let index = index_from(vec![
            json!({"identifier": "numpy", "version": "1.16.6", "variants": [
                {"identifier": "3.7", "requirements": ["python >=3.7, <3.8"]},
                {"identifier": "2.7", "requirements": ["python >=2.7, <2.8"]}
            ]}),
            json!({"identifier": "python", "version": "3.7.8"}),
            json!({"identifier": "python", "version": "2.7.16"}),
        ]);
        let error = resolve_ids(&index, &["numpy[2.7]", "python ==3.*"]).unwrap_err();
        match error {
            ResolveError::Resolution(GraphResolutionError::Conflicts { source, .. }) => {
                let pair = format!("{} vs {}", source.left, source.right);
                assert!(pair.contains("python"), "{pair}");
                assert!(
                    pair.contains(">=2.7, <2.8") && pair.contains("==3.*"),
                    "{pair}"
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn conditional_packages_join_only_when_satisfied() {
        let index = index_from(vec![
            json!({"identifier": "project", "version": "1.0", "auto-use": true,
                   "conditions": ["maya"],
                   "requirements": ["tdsvn", "maya ==2016.*"]}),
            json!({"identifier": "maya", "version": "2016.1"}),
            json!({"identifier": "maya", "version": "2018.0"}),
            json!({"identifier": "tdsvn", "version": "1.0"}),
            json!({"identifier": "noise", "version": "1.0"}),
        ]);

        let ids = resolve_ids(&index, &["noise"]).unwrap();
        assert_eq!(ids, ["noise==1.0"]);

        let ids = resolve_ids(&index, &["maya"]).unwrap();
        assert_eq!(ids, ["project==1.0", "maya==2016.1", "tdsvn==1.0"]);
    }

    #[test]
    fn missing_definitions_are_fatal() {
        let index = index_from(vec![]);
        let error = resolve_ids(&index, &["ghost"]).unwrap_err();
        assert!(matches!(
            error,
            ResolveError::Definition(DefinitionError::NotFound { .. })
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let index = index_from(vec![
            json!({"identifier": "a", "version": "1.0", "requirements": ["c", "b"]}),
            json!({"identifier": "b", "version": "1.0", "requirements": ["c"]}),
            json!({"identifier": "c", "version": "1.0"}),
            json!({"identifier": "c", "version": "0.9"}),
        ]);
        let first = resolve_ids(&index, &["a", "b"]).unwrap();
        for _ in 0..5 {
            assert_eq!(resolve_ids(&index, &["a", "b"]).unwrap(), first);
        }
    }
}
