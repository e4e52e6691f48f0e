//! Operation sorter.
//!
//! Operations are applied one at a time to real filesystems, so their order
//! matters: a path must be vacated before it is reoccupied, a folder must
//! exist before anything lands in it, and so on. The sorter repeatedly runs
//! a fixed set of pairwise hazard passes until none of them moves anything.
//! Every reordering is recorded as an edge; a cycle among those edges means
//! no order satisfies all hazards, and one operation of the cycle is turned
//! into a move to the root of the other replica.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use twinsync_common::SyncPath;

use crate::cycle::{CycleFinder, Reordering};
use crate::filter::{OpFacts, OpIndex};
use crate::node::NodeRef;
use crate::operation::{OpId, OperationType, SyncOperationList};
use crate::platform::{NameGenerator, SuffixType};
use crate::stop::{StepOutcome, StopFlag};
use crate::tree::ReplicaTrees;

/// Default bound on sorting rounds.
pub const DEFAULT_MAX_SORT_ROUNDS: usize = 1_000;

/// Ordering hazards, in the order the passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hazard {
    /// A path is vacated by a Delete before a Move reoccupies it.
    DeleteBeforeMove,
    /// An item leaves a folder before the folder is deleted.
    MoveBeforeDelete,
    /// A folder is created before something is moved into it.
    CreateBeforeMove,
    /// A path is vacated by a Move before a Create reuses it.
    MoveBeforeCreate,
    /// A stale occupant is deleted before a new item is created there.
    DeleteBeforeCreate,
    /// A Move vacates the slot another Move needs.
    MoveBeforeMove,
    /// A folder is created before its children.
    ///
    /// The descendant Create is moved to just after its ancestor's, the same
    /// direction every other pass moves in, instead of reinserting the
    /// deepest ancestor Create just before the descendant.
    CreateBeforeCreate,
    /// Content is edited before it is moved away.
    EditBeforeMove,
    /// A Move making a former ancestor a descendant runs after the other one.
    HierarchyFlip,
}

const PASSES: [Hazard; 9] = [
    Hazard::DeleteBeforeMove,
    Hazard::MoveBeforeDelete,
    Hazard::CreateBeforeMove,
    Hazard::MoveBeforeCreate,
    Hazard::DeleteBeforeCreate,
    Hazard::MoveBeforeMove,
    Hazard::CreateBeforeCreate,
    Hazard::EditBeforeMove,
    Hazard::HierarchyFlip,
];

impl Hazard {
    /// Pairs `(first, second)` this hazard requires, in discovery order.
    fn pairs(self, trees: &ReplicaTrees, index: &OpIndex) -> Vec<(OpId, OpId)> {
        let mut pairs = Vec::new();
        match self {
            Hazard::DeleteBeforeMove => {
                for m in index.of_type(OperationType::Move) {
                    for d in index.deletes_at(m.target, &m.path) {
                        pairs.push((*d, m.id));
                    }
                }
            }
            Hazard::MoveBeforeDelete => {
                for m in index.of_type(OperationType::Move) {
                    for ancestor in strict_ancestors(m.origin.as_ref()) {
                        for d in index.deletes_at(m.target, &ancestor) {
                            pairs.push((m.id, *d));
                        }
                    }
                }
            }
            Hazard::CreateBeforeMove => {
                for m in index.of_type(OperationType::Move) {
                    for ancestor in strict_ancestors(Some(&m.path)) {
                        for c in index.creates_at(m.target, &ancestor) {
                            pairs.push((*c, m.id));
                        }
                    }
                }
            }
            Hazard::MoveBeforeCreate => {
                for m in index.of_type(OperationType::Move) {
                    if let Some(origin) = &m.origin {
                        for c in index.creates_at(m.target, origin) {
                            pairs.push((m.id, *c));
                        }
                    }
                }
            }
            Hazard::DeleteBeforeCreate => {
                for c in index.of_type(OperationType::Create) {
                    for d in index.deletes_at(c.target, &c.path) {
                        pairs.push((*d, c.id));
                    }
                }
            }
            Hazard::MoveBeforeMove => {
                for second in index.of_type(OperationType::Move) {
                    for first in index.moves_from(second.target, &second.path) {
                        if *first != second.id {
                            pairs.push((*first, second.id));
                        }
                    }
                }
            }
            Hazard::CreateBeforeCreate => {
                for c in index.of_type(OperationType::Create) {
                    for ancestor in node_ancestors(trees, c.node) {
                        for a in index.creates_of(c.target, ancestor) {
                            pairs.push((*a, c.id));
                        }
                    }
                }
            }
            Hazard::EditBeforeMove => {
                for e in index.of_type(OperationType::Edit) {
                    let subtree_roots = std::iter::once(e.node).chain(node_ancestors(trees, e.node));
                    for node in subtree_roots {
                        for m in index.moves_of(e.target, node) {
                            pairs.push((e.id, *m));
                        }
                    }
                }
            }
            Hazard::HierarchyFlip => {
                for inner in index.of_type(OperationType::Move) {
                    for ancestor in strict_ancestors(inner.origin.as_ref()) {
                        for outer in index.moves_from(inner.target, &ancestor) {
                            let flips = index
                                .get(*outer)
                                .is_some_and(|o: &OpFacts| inner.path.is_ancestor_of(&o.path));
                            if flips {
                                pairs.push((inner.id, *outer));
                            }
                        }
                    }
                }
            }
        }
        pairs
    }
}

/// Ancestors of a path, root excluded.
fn strict_ancestors(path: Option<&SyncPath>) -> Vec<SyncPath> {
    path.map(|p| p.ancestors().into_iter().filter(|a| !a.is_root()).collect())
        .unwrap_or_default()
}

/// Ancestors of a node, nearest first.
fn node_ancestors(trees: &ReplicaTrees, node: NodeRef) -> Vec<NodeRef> {
    trees
        .tree(node.side)
        .ancestors(node.index)
        .into_iter()
        .map(|a| NodeRef::new(node.side, a))
        .collect()
}

/// Result of a sorting run.
#[derive(Debug, Clone)]
pub struct SortOutcome {
    pub outcome: StepOutcome,
    pub order_changed: bool,
    /// Operations converted to cycle-breaking moves.
    pub broken_cycle_ops: Vec<OpId>,
    pub rounds: usize,
}

pub struct OperationSorter {
    names: NameGenerator,
    stop: StopFlag,
    max_rounds: usize,
    reorderings: Vec<Reordering>,
    has_order_changed: bool,
}

impl OperationSorter {
    pub fn new(names: NameGenerator, stop: StopFlag) -> Self {
        Self {
            names,
            stop,
            max_rounds: DEFAULT_MAX_SORT_ROUNDS,
            reorderings: Vec::new(),
            has_order_changed: false,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// True if the last run moved at least one operation.
    pub fn has_order_changed(&self) -> bool {
        self.has_order_changed
    }

    /// Edges recorded since the last broken cycle.
    pub fn reorderings(&self) -> &[Reordering] {
        &self.reorderings
    }

    /// Reorder `ops` in place until no hazard remains.
    pub fn sort(&mut self, trees: &ReplicaTrees, ops: &mut SyncOperationList) -> SortOutcome {
        self.reorderings.clear();
        self.has_order_changed = false;

        let mut index = OpIndex::build(trees, ops);
        let mut broken_cycle_ops = Vec::new();
        let mut rounds = 0;

        loop {
            if self.stop.is_stop_requested() {
                info!("Operation sorting stopped after {} round(s)", rounds);
                return SortOutcome {
                    outcome: StepOutcome::Cancelled,
                    order_changed: self.has_order_changed,
                    broken_cycle_ops,
                    rounds,
                };
            }
            if rounds >= self.max_rounds {
                warn!("Operation order still changing after {} rounds, giving up", rounds);
                break;
            }
            rounds += 1;

            if !self.run_round(trees, &index, ops) {
                break;
            }
            self.has_order_changed = true;

            if let Some(cycle) = CycleFinder::new(&self.reorderings).find_complete_cycle() {
                debug!("Reordering cycle found: {:?}", cycle);
                match self.break_cycle(trees, ops, &cycle) {
                    Some(id) => broken_cycle_ops.push(id),
                    None => {
                        warn!("No operation of cycle {:?} can be converted", cycle);
                        break;
                    }
                }
                self.reorderings.clear();
                index = OpIndex::build(trees, ops);
            }
        }

        debug!(
            "Sorted {} operation(s) in {} round(s), order changed: {}",
            ops.len(),
            rounds,
            self.has_order_changed
        );
        SortOutcome {
            outcome: StepOutcome::Completed,
            order_changed: self.has_order_changed,
            broken_cycle_ops,
            rounds,
        }
    }

    /// Run every pass once. Returns true if anything moved.
    fn run_round(&mut self, trees: &ReplicaTrees, index: &OpIndex, ops: &mut SyncOperationList) -> bool {
        let mut changed = self.fix_impossible_first_move(index, ops);

        for hazard in PASSES {
            if self.stop.is_stop_requested() {
                return changed;
            }
            for (first, second) in hazard.pairs(trees, index) {
                if self.stop.is_stop_requested() {
                    return changed;
                }
                if self.push_after(ops, first, second) {
                    debug!("{:?}: op {} now runs before op {}", hazard, first, second);
                    changed = true;
                }
            }
        }
        changed
    }

    /// If `first` runs after `second`, move `second` right after `first`.
    fn push_after(&mut self, ops: &mut SyncOperationList, first: OpId, second: OpId) -> bool {
        if !is_misordered(ops, first, second) || !ops.move_after(second, first) {
            return false;
        }
        self.reorderings.push(Reordering { first, second });
        true
    }

    /// Defer the first Move when its destination folder is put in place by a
    /// later Move, so that the end of that chain of Moves runs first.
    fn fix_impossible_first_move(&mut self, index: &OpIndex, ops: &mut SyncOperationList) -> bool {
        let Some(&head) = ops.op_sorted_list().first() else {
            return false;
        };
        let Some(mut current) = index.get(head).filter(|f| f.op_type == OperationType::Move) else {
            return false;
        };

        let mut visited = HashSet::from([head]);
        let mut promote = None;
        loop {
            let blocker = strict_ancestors(Some(&current.path))
                .iter()
                .flat_map(|a| index.moves_to(current.target, a).iter().copied())
                .find(|id| !visited.contains(id));
            let Some(blocker) = blocker else {
                break;
            };
            visited.insert(blocker);
            promote = Some(blocker);
            match index.get(blocker) {
                Some(facts) => current = facts,
                None => break,
            }
        }

        let Some(promote) = promote else {
            return false;
        };
        debug!("Op {} cannot run first, op {} goes before it", head, promote);
        self.push_after(ops, promote, head)
    }

    /// Convert one operation of `cycle` into a move of its counterpart to
    /// the root of the counterpart's replica. Returns the converted id.
    fn break_cycle(&mut self, trees: &ReplicaTrees, ops: &mut SyncOperationList, cycle: &[OpId]) -> Option<OpId> {
        for id in cycle {
            let Some(op) = ops.get(*id) else {
                continue;
            };
            let affected = op.affected();
            let counterpart = op
                .corresponding()
                .filter(|c| trees.is_live(*c))
                .or_else(|| trees.counterpart(affected))
                .filter(|c| c.side != affected.side && *c != trees.root(c.side));
            let Some(counterpart) = counterpart else {
                continue;
            };
            let Some(path) = trees.path(counterpart) else {
                continue;
            };

            let root = trees.root(counterpart.side);
            let name = self
                .names
                .generate_unique_name(&path, SuffixType::Orphan, |candidate| trees.is_name_taken(root, candidate));
            info!(
                "Breaking reordering cycle: {} on the {} replica moves to the root as '{}'",
                path, counterpart.side, name
            );

            let op = ops.get_mut(*id)?;
            op.convert_to_breaking_move(counterpart, root, name);
            return Some(*id);
        }
        None
    }
}

fn is_misordered(ops: &SyncOperationList, first: OpId, second: OpId) -> bool {
    match (ops.position(first), ops.position(second)) {
        (Some(f), Some(s)) => f > s,
        _ => false,
    }
}
