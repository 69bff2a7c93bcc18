//! The dependency graph.
//!
//! One node per materialized package instance, identified by its qualified
//! package identifier. Directed edges run parent -> child and carry the
//! requirement that created them plus a weight: the 1-based position of
//! the child among its parent's dependencies. A synthetic ROOT node holds
//! the initial requests.
//!
//! Definitions with variants fan out into one node per variant; the
//! variant groups feed the combination generator. Packages whose
//! conditions are not yet satisfied wait in a conditional queue and join
//! the graph when the node set satisfies them.

use crate::definition::{Definition, DefinitionError};
use crate::history::{EventCollector, EventType};
use crate::package::{Package, PackageCache, PackageError};
use crate::registry::RegistryIndex;
use crate::requirement::{Requirement, combine_requirements};
use serde_json::json;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Identifier of the synthetic root node.
pub const ROOT: &str = "root";

/// Fatal failures while growing a graph; recoverable ones are recorded on
/// the graph instead (see [`RecordedError`]).
#[derive(Debug, Error)]
pub enum GraphBuildError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Package(#[from] PackageError),
}

pub type Result<T> = std::result::Result<T, GraphBuildError>;

/// A removed node's parent could not be relinked to any remaining node.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("requirement {requirement} of {parent:?} cannot be satisfied by any remaining package")]
pub struct GraphInvalidNodesError {
    pub requirement: Requirement,
    pub parent: String,
}

/// Two requirements on one definition admit no common version.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "conflicting requirements on {definition:?}: {left} (from {left_parents:?}) vs {right} (from {right_parents:?})"
)]
pub struct GraphConflictsError {
    pub definition: String,
    pub left: Requirement,
    pub left_parents: Vec<String>,
    pub right: Requirement,
    pub right_parents: Vec<String>,
    /// The conjunction no registry version satisfies.
    pub combined: Requirement,
}

/// Recoverable failure recorded onto the graph during exploration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordedError {
    #[error(transparent)]
    InvalidNode(#[from] GraphInvalidNodesError),
    #[error(transparent)]
    Conflict(#[from] GraphConflictsError),
}

/// Shared lookups a graph needs while growing: the definition index and
/// the materialization cache.
pub struct ResolverContext<'a> {
    pub index: &'a RegistryIndex,
    pub cache: RefCell<PackageCache>,
}

impl<'a> ResolverContext<'a> {
    pub fn new(index: &'a RegistryIndex) -> Self {
        Self {
            index,
            cache: RefCell::new(PackageCache::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    package: Arc<Package>,
    parents: BTreeSet<String>,
    /// Monotonic insertion order; the stable tie-break for equal distances.
    order: u64,
}

impl Node {
    pub fn package(&self) -> &Arc<Package> {
        &self.package
    }

    pub fn parents(&self) -> &BTreeSet<String> {
        &self.parents
    }

    pub fn order(&self) -> u64 {
        self.order
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub child: String,
    pub requirement: Requirement,
    pub weight: u64,
}

/// A requirement whose definition's conditions are not yet satisfied. The
/// weight slot is reserved so a later promotion keeps its priority among
/// the parent's dependencies.
#[derive(Debug, Clone)]
struct PendingRequirement {
    requirement: Requirement,
    parent: String,
    weight: u64,
}

#[derive(Debug, Clone)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    /// Parent id -> ordered outgoing edges.
    children: BTreeMap<String, Vec<Edge>>,
    /// Definition qualified name -> variant node ids.
    variant_groups: BTreeMap<String, Vec<String>>,
    /// Definition names with variant groups, in first-seen order.
    group_order: Vec<String>,
    conditional: Vec<PendingRequirement>,
    errors: Vec<RecordedError>,
    namespace_counter: BTreeMap<String, u32>,
    next_order: u64,
    mutated: bool,
}

impl Graph {
    pub fn new(namespace_counter: BTreeMap<String, u32>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            children: BTreeMap::new(),
            variant_groups: BTreeMap::new(),
            group_order: Vec::new(),
            conditional: Vec::new(),
            errors: Vec::new(),
            namespace_counter,
            next_order: 0,
            mutated: false,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn outgoing(&self, id: &str) -> &[Edge] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn errors(&self) -> &[RecordedError] {
        &self.errors
    }

    pub fn record_error(&mut self, error: RecordedError) {
        self.errors.push(error);
    }

    /// Whether a node or edge changed since the flag was last taken;
    /// clears it. The conflict-resolution loop keeps its distance mapping
    /// memoized and refreshes it when this reports true.
    pub fn take_mutated(&mut self) -> bool {
        std::mem::replace(&mut self.mutated, false)
    }

    pub fn namespace_counter(&self) -> &BTreeMap<String, u32> {
        &self.namespace_counter
    }

    /// Namespaces of packages already in the graph, used as fetch hints.
    pub fn namespace_hints(&self) -> BTreeSet<String> {
        self.nodes
            .values()
            .filter_map(|node| node.package.namespace().map(str::to_string))
            .collect()
    }

    /// Nodes whose package matches `requirement`, in id order.
    pub fn find(&self, requirement: &Requirement) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.package.satisfies(requirement))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Grow the graph from `requirements`, hanging them off `parent`.
    /// Requirements are visited in strict breadth-first order; each newly
    /// added node enqueues its own requirements behind its siblings. The
    /// edge weight is the requirement's 1-based position in its parent's
    /// requirement list.
    pub fn update_from_requirements(
        &mut self,
        ctx: &ResolverContext,
        requirements: &[Requirement],
        parent: &str,
        collector: &mut EventCollector,
    ) -> Result<()> {
        let mut queue: VecDeque<(String, Requirement, u64)> = requirements
            .iter()
            .enumerate()
            .map(|(position, requirement)| {
                (parent.to_string(), requirement.clone(), position as u64 + 1)
            })
            .collect();

        while let Some((parent_id, requirement, weight)) = queue.pop_front() {
            self.process_requirement(ctx, &parent_id, &requirement, weight, &mut queue, collector)?;
            self.promote_ready_conditionals(ctx, &mut queue, collector)?;
        }
        Ok(())
    }

    fn process_requirement(
        &mut self,
        ctx: &ResolverContext,
        parent_id: &str,
        requirement: &Requirement,
        weight: u64,
        queue: &mut VecDeque<(String, Requirement, u64)>,
        collector: &mut EventCollector,
    ) -> Result<()> {
        let definition = Arc::clone(ctx.index.fetch(
            requirement,
            &self.namespace_hints(),
            &self.namespace_counter,
        )?);

        if !self.conditions_satisfied(definition.conditions()) {
            collector.event_with(
                EventType::ConditionDeferred,
                definition.qualified_name(),
                json!({"requirement": requirement.to_string()}),
            );
            self.conditional.push(PendingRequirement {
                requirement: requirement.clone(),
                parent: parent_id.to_string(),
                weight,
            });
            return Ok(());
        }

        for variant_index in candidate_variants(&definition, requirement) {
            let package = ctx
                .cache
                .borrow_mut()
                .materialize(&definition, variant_index)?;
            let node_id = package.qualified_identifier().to_string();
            let newly_added = !self.nodes.contains_key(&node_id);

            if newly_added {
                self.add_node(Arc::clone(&package), collector);
                if package.variant_id().is_some() {
                    self.register_variant(&definition.qualified_name(), &node_id);
                }
            }
            self.add_edge(parent_id, &node_id, requirement.clone(), weight);
            if newly_added {
                for (position, child_requirement) in package.requirements().iter().enumerate() {
                    queue.push_back((
                        node_id.clone(),
                        child_requirement.clone(),
                        position as u64 + 1,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Re-queue deferred requirements whose conditions the graph now
    /// satisfies. Node additions are monotone during a build, so each
    /// entry is promoted at most once.
    fn promote_ready_conditionals(
        &mut self,
        ctx: &ResolverContext,
        queue: &mut VecDeque<(String, Requirement, u64)>,
        collector: &mut EventCollector,
    ) -> Result<()> {
        let mut i = 0;
        while i < self.conditional.len() {
            let pending = &self.conditional[i];
            let definition = ctx.index.fetch(
                &pending.requirement,
                &self.namespace_hints(),
                &self.namespace_counter,
            )?;
            if self.conditions_satisfied(definition.conditions()) {
                let pending = self.conditional.remove(i);
                collector.event_with(
                    EventType::ConditionPromoted,
                    definition.qualified_name(),
                    json!({"requirement": pending.requirement.to_string()}),
                );
                queue.push_back((pending.parent, pending.requirement, pending.weight));
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Every condition must match some package already in the graph.
    pub fn conditions_satisfied(&self, conditions: &[Requirement]) -> bool {
        conditions.iter().all(|condition| {
            self.nodes
                .values()
                .any(|node| node.package.satisfies(condition))
        })
    }

    /// Packages parked on unsatisfied conditions.
    pub fn has_conditional(&self) -> bool {
        !self.conditional.is_empty()
    }

    /// Move any newly satisfiable conditional requirements into the graph.
    /// Returns true when the node set changed.
    pub fn settle_conditionals(
        &mut self,
        ctx: &ResolverContext,
        collector: &mut EventCollector,
    ) -> Result<bool> {
        let before = self.nodes.len();
        let mut queue = VecDeque::new();
        self.promote_ready_conditionals(ctx, &mut queue, collector)?;
        while let Some((parent_id, requirement, weight)) = queue.pop_front() {
            self.process_requirement(ctx, &parent_id, &requirement, weight, &mut queue, collector)?;
            self.promote_ready_conditionals(ctx, &mut queue, collector)?;
        }
        Ok(self.nodes.len() != before)
    }

    fn add_node(&mut self, package: Arc<Package>, collector: &mut EventCollector) {
        let node_id = package.qualified_identifier().to_string();
        if let Some(namespace) = package.namespace() {
            *self
                .namespace_counter
                .entry(namespace.to_string())
                .or_insert(0) += 1;
        }
        collector.event_with(EventType::NodeAdded, node_id.clone(), json!({}));
        self.nodes.insert(
            node_id,
            Node {
                package,
                parents: BTreeSet::new(),
                order: self.next_order,
            },
        );
        self.next_order += 1;
        self.mutated = true;
    }

    /// Insert a node directly; used by conflict resolution when replacing
    /// nodes at a re-fetched version.
    pub fn insert_package(
        &mut self,
        package: Arc<Package>,
        collector: &mut EventCollector,
    ) -> String {
        let node_id = package.qualified_identifier().to_string();
        if !self.nodes.contains_key(&node_id) {
            self.add_node(package, collector);
        }
        node_id
    }

    /// Add a parent -> child edge. A duplicate edge keeps its original
    /// requirement (first wins) and collapses to the minimum weight.
    pub fn add_edge(&mut self, parent: &str, child: &str, requirement: Requirement, weight: u64) {
        let edges = self.children.entry(parent.to_string()).or_default();
        if let Some(existing) = edges.iter_mut().find(|edge| edge.child == child) {
            existing.weight = existing.weight.min(weight);
        } else {
            edges.push(Edge {
                child: child.to_string(),
                requirement,
                weight,
            });
        }
        if let Some(node) = self.nodes.get_mut(child) {
            node.parents.insert(parent.to_string());
        }
        self.mutated = true;
    }

    fn register_variant(&mut self, definition_name: &str, node_id: &str) {
        let group = match self.variant_groups.get_mut(definition_name) {
            Some(group) => group,
            None => {
                self.group_order.push(definition_name.to_string());
                self.variant_groups
                    .entry(definition_name.to_string())
                    .or_default()
            }
        };
        if !group.iter().any(|id| id == node_id) {
            group.push(node_id.to_string());
        }
    }

    /// Re-point every parent edge of `removed` to `substitute` (or, when
    /// none is given, to any remaining node matching the edge requirement),
    /// preserving weights. A parent that cannot be relinked records a
    /// [`GraphInvalidNodesError`]; validation surfaces it later. The node
    /// itself is removed afterwards.
    pub fn relink_parents(
        &mut self,
        removed: &str,
        substitute: Option<&str>,
        new_requirement: Option<&Requirement>,
    ) {
        let parents: Vec<String> = self
            .nodes
            .get(removed)
            .map(|node| node.parents.iter().cloned().collect())
            .unwrap_or_default();

        for parent in parents {
            let Some(edges) = self.children.get_mut(&parent) else {
                continue;
            };
            let Some(position) = edges.iter().position(|edge| edge.child == removed) else {
                continue;
            };
            let edge = edges.remove(position);
            let requirement = new_requirement.cloned().unwrap_or(edge.requirement);

            let target = substitute.map(str::to_string).or_else(|| {
                self.find(&requirement)
                    .into_iter()
                    .find(|candidate| candidate != removed)
            });
            match target {
                Some(target) if self.nodes.contains_key(&target) => {
                    self.add_edge(&parent, &target, requirement, edge.weight);
                }
                _ => {
                    self.errors.push(RecordedError::InvalidNode(
                        GraphInvalidNodesError {
                            requirement,
                            parent: parent.clone(),
                        },
                    ));
                }
            }
        }
        // The surviving node stands in for the removed one; it inherits
        // the earlier insertion order so output ties stay stable.
        if let Some(substitute) = substitute {
            let removed_order = self.nodes.get(removed).map(Node::order);
            if let (Some(removed_order), Some(node)) =
                (removed_order, self.nodes.get_mut(substitute))
            {
                node.order = node.order.min(removed_order);
            }
        }
        self.remove_node(removed);
    }

    /// Remove a node and every edge touching it. Orphaned descendants are
    /// swept by `prune`.
    pub fn remove_node(&mut self, id: &str) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        for parent in &node.parents {
            if let Some(edges) = self.children.get_mut(parent) {
                edges.retain(|edge| edge.child != id);
            }
        }
        if let Some(edges) = self.children.remove(id) {
            for edge in edges {
                if let Some(child) = self.nodes.get_mut(&edge.child) {
                    child.parents.remove(id);
                }
            }
        }
        for group in self.variant_groups.values_mut() {
            group.retain(|member| member != id);
        }
        self.drop_empty_groups();
        self.mutated = true;
    }

    fn drop_empty_groups(&mut self) {
        let empty: Vec<String> = self
            .variant_groups
            .iter()
            .filter(|(_, group)| group.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        for name in empty {
            self.variant_groups.remove(&name);
            self.group_order.retain(|entry| entry != &name);
        }
    }

    /// Remove nodes unreachable from ROOT, and thin variant groups down to
    /// surviving members.
    pub fn prune(&mut self) {
        let mut reachable = BTreeSet::new();
        let mut queue = VecDeque::from([ROOT.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            for edge in self.outgoing(&id) {
                if !reachable.contains(&edge.child) {
                    queue.push_back(edge.child.clone());
                }
            }
        }
        let unreachable: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| !reachable.contains(*id))
            .cloned()
            .collect();
        for id in unreachable {
            self.remove_node(&id);
        }
    }

    /// Occurrences of each definition among the graph's requirements.
    fn requirement_counts(&self) -> BTreeMap<String, u64> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for edges in self.children.values() {
            for edge in edges {
                *counts
                    .entry(edge.requirement.name().to_string())
                    .or_insert(0) += 1;
            }
        }
        counts
    }

    /// Variant groups for combination enumeration. Outer order: most
    /// requirement occurrences first, first-seen order on ties. Inner
    /// order: variant declaration order (then newest version first).
    pub fn variant_groups(&self) -> Vec<Vec<String>> {
        let counts = self.requirement_counts();
        let mut ordered = self.group_order.clone();
        ordered.sort_by_key(|name| {
            let identifier = name.rsplit("::").next().unwrap_or(name);
            std::cmp::Reverse(counts.get(identifier).copied().unwrap_or(0))
        });

        ordered
            .into_iter()
            .filter_map(|name| {
                let group = self.variant_groups.get(&name)?;
                let mut members: Vec<&String> = group.iter().collect();
                members.sort_by_key(|id| {
                    let node = &self.nodes[*id];
                    let package = node.package();
                    let declared = package
                        .variant_id()
                        .and_then(|variant| package.definition().variant_index(variant))
                        .unwrap_or(usize::MAX);
                    (
                        declared,
                        std::cmp::Reverse(package.version().clone()),
                        (*id).clone(),
                    )
                });
                Some(members.into_iter().cloned().collect())
            })
            .collect()
    }

    /// All edges pointing at `id`, with their owning parents.
    pub fn incoming(&self, id: &str) -> Vec<(String, &Edge)> {
        let mut incoming = Vec::new();
        for (parent, edges) in &self.children {
            for edge in edges {
                if edge.child == id {
                    incoming.push((parent.clone(), edge));
                }
            }
        }
        incoming
    }

    /// Replace every node of the named definitions with the next-older
    /// version satisfying their combined incoming requirements. Variants
    /// carry over. Returns true when at least one definition moved.
    pub fn downgrade_versions(
        &mut self,
        ctx: &ResolverContext,
        definitions: &BTreeSet<String>,
        collector: &mut EventCollector,
    ) -> Result<bool> {
        let mut downgraded = false;
        for definition_name in definitions {
            if self.downgrade_definition(ctx, definition_name, collector)? {
                downgraded = true;
            }
        }
        if downgraded {
            self.prune();
        }
        Ok(downgraded)
    }

    fn downgrade_definition(
        &mut self,
        ctx: &ResolverContext,
        definition_name: &str,
        collector: &mut EventCollector,
    ) -> Result<bool> {
        let node_ids: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.package.definition_name() == definition_name)
            .map(|(id, _)| id.clone())
            .collect();
        if node_ids.is_empty() {
            return Ok(false);
        }

        let incoming: Vec<Requirement> = node_ids
            .iter()
            .flat_map(|id| self.incoming(id))
            .map(|(_, edge)| edge.requirement.clone())
            .collect();
        let Some(combined) = combine_requirements(incoming.iter()) else {
            return Ok(false);
        };

        let current = node_ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|node| node.package.version().clone())
            .max();
        let Some(current) = current else {
            return Ok(false);
        };

        let variants: Vec<Option<String>> = node_ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|node| node.package.variant_id().map(str::to_string))
            .collect();

        let candidate = ctx
            .index
            .versions_of(definition_name)
            .iter()
            .find(|definition| {
                definition.version() < &current
                    && combined.specifiers().matches(definition.version())
                    && variants.iter().all(|variant| match variant {
                        Some(variant) => definition.variant_index(variant).is_some(),
                        None => true,
                    })
            })
            .cloned();
        let Some(candidate) = candidate else {
            return Ok(false);
        };

        let mut replacements = Vec::new();
        for (node_id, variant) in node_ids.iter().zip(&variants) {
            let variant_index = match variant {
                Some(variant) => candidate.variant_index(variant),
                None => None,
            };
            let package = ctx
                .cache
                .borrow_mut()
                .materialize(&candidate, variant_index)?;
            let new_id = self.insert_package(Arc::clone(&package), collector);
            if new_id == *node_id {
                continue;
            }
            if package.variant_id().is_some() {
                self.register_variant(definition_name, &new_id);
            }
            collector.event_with(
                EventType::VersionDowngraded,
                format!("{node_id} -> {new_id}"),
                json!({"definition": definition_name}),
            );
            self.relink_parents(node_id, Some(&new_id), None);
            replacements.push((new_id, package));
        }

        for (new_id, package) in replacements {
            self.update_from_requirements(ctx, &package.requirements().to_vec(), &new_id, collector)?;
        }
        Ok(true)
    }
}

/// Which variant indices a requirement selects on a definition: all of
/// them when unpinned, the named ones when pinned, `None` when the
/// definition has no variants.
fn candidate_variants(definition: &Definition, requirement: &Requirement) -> Vec<Option<usize>> {
    if definition.variants().is_empty() {
        return vec![None];
    }
    if requirement.extras().is_empty() {
        return (0..definition.variants().len()).map(Some).collect();
    }
    definition
        .variants()
        .iter()
        .enumerate()
        .filter(|(_, variant)| requirement.extras().contains(&variant.identifier))
        .map(|(index, _)| Some(index))
        .collect()
}
