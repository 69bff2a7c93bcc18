//! Variant combination enumeration.
//!
//! A combination picks one node per variant group and derives a working
//! graph: a clone of the initial graph with the rejected sibling variants
//! removed and unreachable descendants pruned. Permutations are generated
//! lazily, first group slowest, and permutations whose chosen packages
//! carry pairwise-incompatible requirements are skipped before any graph
//! is cloned.

use crate::graph::Graph;
use crate::requirement::check_conflicting_requirements;

/// One candidate variant selection with its working graph.
#[derive(Debug)]
pub struct Combination {
    /// 1-based combination number, for reporting.
    pub number: usize,
    pub graph: Graph,
    /// Chosen node id per variant group, in group order.
    pub selection: Vec<String>,
}

pub struct Combinations<'a> {
    base: &'a Graph,
    groups: Vec<Vec<String>>,
    cursor: Vec<usize>,
    exhausted: bool,
    emitted: usize,
}

impl<'a> Combinations<'a> {
    pub fn new(base: &'a Graph) -> Self {
        let groups = base.variant_groups();
        let cursor = vec![0; groups.len()];
        Self {
            base,
            groups,
            cursor,
            exhausted: false,
            emitted: 0,
        }
    }

    /// Permutations remaining in the whole space (before pruning), as a
    /// budget hint.
    pub fn permutation_count(&self) -> usize {
        self.groups.iter().map(Vec::len).product()
    }

    fn advance(&mut self) {
        // Odometer over the groups; the last group iterates fastest.
        for position in (0..self.cursor.len()).rev() {
            self.cursor[position] += 1;
            if self.cursor[position] < self.groups[position].len() {
                return;
            }
            self.cursor[position] = 0;
        }
        self.exhausted = true;
    }

    fn compatible(&self, chosen: &[String]) -> bool {
        let packages: Vec<_> = chosen
            .iter()
            .filter_map(|id| self.base.node(id))
            .map(|node| node.package())
            .collect();
        for (position, left) in packages.iter().enumerate() {
            for right in &packages[position + 1..] {
                if !check_conflicting_requirements(left.requirements(), right.requirements())
                    .is_empty()
                {
                    return false;
                }
            }
        }
        true
    }
}

impl<'a> Iterator for Combinations<'a> {
    type Item = Combination;

    fn next(&mut self) -> Option<Combination> {
        if self.exhausted {
            return None;
        }
        // No variant groups: the initial graph is the only combination.
        if self.groups.is_empty() {
            self.exhausted = true;
            self.emitted = 1;
            return Some(Combination {
                number: 1,
                graph: self.base.clone(),
                selection: Vec::new(),
            });
        }

        loop {
            if self.exhausted {
                return None;
            }
            let chosen: Vec<String> = self
                .groups
                .iter()
                .zip(&self.cursor)
                .map(|(group, index)| group[*index].clone())
                .collect();
            self.advance();

            if !self.compatible(&chosen) {
                continue;
            }

            let mut graph = self.base.clone();
            for (group, selected) in self.groups.iter().zip(&chosen) {
                for id in group {
                    if id != selected {
                        graph.remove_node(id);
                    }
                }
            }
            graph.prune();

            self.emitted += 1;
            return Some(Combination {
                number: self.emitted,
                graph,
                selection: chosen,
            });
        }
    }
}
