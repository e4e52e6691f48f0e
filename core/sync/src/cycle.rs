//! Cycle detection in the reordering graph.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::operation::OpId;

/// Edge of the reordering graph: `first` must run before `second`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Reordering {
    pub first: OpId,
    pub second: OpId,
}

/// Depth-first search over reordering edges.
pub struct CycleFinder {
    edges: BTreeMap<OpId, Vec<OpId>>,
}

impl CycleFinder {
    pub fn new(reorderings: &[Reordering]) -> Self {
        let mut edges: BTreeMap<OpId, Vec<OpId>> = BTreeMap::new();
        for r in reorderings {
            let targets = edges.entry(r.first).or_default();
            if !targets.contains(&r.second) {
                targets.push(r.second);
            }
        }
        Self { edges }
    }

    /// First complete cycle found, as the op ids along it.
    ///
    /// Start nodes are tried in id order, so the result does not depend on
    /// the order the edges were recorded in.
    pub fn find_complete_cycle(&self) -> Option<Vec<OpId>> {
        let mut done = HashSet::new();
        for start in self.edges.keys() {
            if done.contains(start) {
                continue;
            }
            let mut stack = Vec::new();
            let mut depth = HashMap::new();
            if let Some(cycle) = self.visit(*start, &mut stack, &mut depth, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        id: OpId,
        stack: &mut Vec<OpId>,
        depth: &mut HashMap<OpId, usize>,
        done: &mut HashSet<OpId>,
    ) -> Option<Vec<OpId>> {
        depth.insert(id, stack.len());
        stack.push(id);

        for next in self.edges.get(&id).into_iter().flatten() {
            if let Some(at) = depth.get(next) {
                return Some(stack[*at..].to_vec());
            }
            if done.contains(next) {
                continue;
            }
            if let Some(cycle) = self.visit(*next, stack, depth, done) {
                return Some(cycle);
            }
        }

        stack.pop();
        depth.remove(&id);
        done.insert(id);
        None
    }
}
