//! Shortest-path labelling from ROOT.
//!
//! Dijkstra over the directed parent -> child edges, with edge weights as
//! costs. Equal-weight candidates settle in lexicographic order of the
//! path walked from ROOT, so the labelling is identical across runs. The
//! resulting mapping orders the final package list.

use crate::graph::{Graph, ROOT};
use crate::package::Package;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDistance {
    /// Sum of edge weights along the shortest path from ROOT.
    pub weight: u64,
    /// Ancestor ids walked from ROOT (exclusive of the node itself).
    pub path: Vec<String>,
}

pub type DistanceMapping = BTreeMap<String, NodeDistance>;

/// Label every reachable node with its distance from ROOT. Unreachable
/// nodes are absent from the mapping and are candidates for pruning.
pub fn compute_distance_mapping(graph: &Graph) -> DistanceMapping {
    let mut mapping = DistanceMapping::new();
    let mut heap: BinaryHeap<Reverse<(u64, Vec<String>, String)>> = BinaryHeap::new();
    heap.push(Reverse((0, Vec::new(), ROOT.to_string())));

    while let Some(Reverse((weight, path, id))) = heap.pop() {
        if mapping.contains_key(&id) {
            continue;
        }
        for edge in graph.outgoing(&id) {
            if !mapping.contains_key(&edge.child) {
                let mut child_path = path.clone();
                child_path.push(id.clone());
                heap.push(Reverse((
                    weight + edge.weight,
                    child_path,
                    edge.child.clone(),
                )));
            }
        }
        mapping.insert(id, NodeDistance { weight, path });
    }
    mapping
}

/// Packages in strictly increasing distance order; equal distances keep
/// node insertion order.
pub fn packages_by_distance(graph: &Graph, mapping: &DistanceMapping) -> Vec<Arc<Package>> {
    let mut labelled: Vec<(u64, u64, &Arc<Package>)> = graph
        .nodes()
        .filter_map(|(id, node)| {
            mapping
                .get(id)
                .map(|distance| (distance.weight, node.order(), node.package()))
        })
        .collect();
    labelled.sort_by_key(|(weight, order, _)| (*weight, *order));
    labelled
        .into_iter()
        .map(|(_, _, package)| Arc::clone(package))
        .collect()
}
