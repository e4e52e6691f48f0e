//! Conflict resolution.
//!
//! Each [`Conflict`] pairs one node per replica whose pending changes cannot
//! both be applied. The resolver turns it into operations with a
//! deterministic winner, rescuing content that would otherwise be lost with a
//! deleted ancestor.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

use twinsync_common::{ReplicaSide, SyncPath};

use crate::node::{ChangeEvents, DbNodeId, NodeIdx, NodeRef};
use crate::operation::{OperationKind, SyncOperation, SyncOperationList};
use crate::platform::{NameGenerator, SuffixType};
use crate::stop::{StepOutcome, StopFlag};
use crate::tree::ReplicaTrees;

/// Kind of collision between the two replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    CreateCreate,
    EditEdit,
    MoveCreate,
    EditDelete,
    MoveDelete,
    MoveParentDelete,
    CreateParentDelete,
    MoveMoveSource,
    MoveMoveDest,
    MoveMoveCycle,
}

impl ConflictType {
    fn user_message(self) -> &'static str {
        match self {
            ConflictType::CreateCreate
            | ConflictType::EditEdit
            | ConflictType::MoveCreate
            | ConflictType::MoveMoveDest => {
                "Both replicas changed this item; the local copy was renamed"
            }
            ConflictType::EditDelete | ConflictType::MoveDelete => {
                "The parent folder was deleted; the item was moved to the root folder"
            }
            ConflictType::MoveParentDelete => "The destination folder was deleted; the move was reverted",
            ConflictType::CreateParentDelete => {
                "The parent folder was deleted; the new item was removed"
            }
            ConflictType::MoveMoveSource | ConflictType::MoveMoveCycle => {
                "The item was moved on both replicas; the local move was reverted"
            }
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A pair of colliding nodes, one per replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    conflict_type: ConflictType,
    local: NodeIdx,
    remote: NodeIdx,
}

impl Conflict {
    pub fn new(conflict_type: ConflictType, local: NodeIdx, remote: NodeIdx) -> Self {
        Self {
            conflict_type,
            local,
            remote,
        }
    }

    pub fn conflict_type(&self) -> ConflictType {
        self.conflict_type
    }

    pub fn local_node(&self) -> NodeRef {
        NodeRef::new(ReplicaSide::Local, self.local)
    }

    pub fn remote_node(&self) -> NodeRef {
        NodeRef::new(ReplicaSide::Remote, self.remote)
    }

    pub fn node(&self, side: ReplicaSide) -> NodeRef {
        match side {
            ReplicaSide::Local => self.local_node(),
            ReplicaSide::Remote => self.remote_node(),
        }
    }
}

/// FIFO of conflicts detected for one pass.
#[derive(Debug, Clone, Default)]
pub struct ConflictQueue {
    queue: VecDeque<Conflict>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, conflict: Conflict) {
        self.queue.push_back(conflict);
    }

    pub fn pop(&mut self) -> Option<Conflict> {
        self.queue.pop_front()
    }

    /// Put a conflict back at the head, used when a pass stops early.
    pub fn push_front(&mut self, conflict: Conflict) {
        self.queue.push_front(conflict);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.queue.iter()
    }
}

/// Nodes already rescued to a root during the current pass.
#[derive(Debug, Clone, Default)]
pub struct OrphanRegistry {
    orphans: HashSet<(DbNodeId, ReplicaSide)>,
}

impl OrphanRegistry {
    pub fn register(&mut self, db_id: DbNodeId, side: ReplicaSide) {
        self.orphans.insert((db_id, side));
    }

    pub fn contains(&self, db_id: DbNodeId, side: ReplicaSide) -> bool {
        self.orphans.contains(&(db_id, side))
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn clear(&mut self) {
        self.orphans.clear();
    }
}

/// User-visible record of a conflict resolved by changing the user's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictIssue {
    pub conflict_type: ConflictType,
    pub local_path: Option<SyncPath>,
    pub remote_path: Option<SyncPath>,
    pub message: String,
}

/// Outcome of resolving one conflict.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Operations to merge into the operation list.
    Planned(Vec<SyncOperation>),
    /// The conflict no longer applies (node gone or already rescued).
    AlreadyResolved,
}

/// Summary of a resolver run.
#[derive(Debug, Clone)]
pub struct ResolverReport {
    pub outcome: StepOutcome,
    pub resolved: usize,
    pub skipped: usize,
    pub issues: Vec<ConflictIssue>,
}

impl Default for ResolverReport {
    fn default() -> Self {
        Self {
            outcome: StepOutcome::Completed,
            resolved: 0,
            skipped: 0,
            issues: Vec::new(),
        }
    }
}

/// Drains the conflict queue into operations.
pub struct ConflictResolver {
    names: NameGenerator,
    orphans: OrphanRegistry,
    stop: StopFlag,
}

impl ConflictResolver {
    pub fn new(names: NameGenerator, stop: StopFlag) -> Self {
        Self {
            names,
            orphans: OrphanRegistry::default(),
            stop,
        }
    }

    pub fn orphans(&self) -> &OrphanRegistry {
        &self.orphans
    }

    /// Forget the orphans registered by the previous pass.
    pub fn reset(&mut self) {
        self.orphans.clear();
    }

    /// Resolve every queued conflict and append the operations to `ops`.
    pub fn resolve_all(
        &mut self,
        trees: &ReplicaTrees,
        queue: &mut ConflictQueue,
        ops: &mut SyncOperationList,
    ) -> ResolverReport {
        self.reset();
        let mut report = ResolverReport::default();

        while let Some(conflict) = queue.pop() {
            if self.stop.is_stop_requested() {
                queue.push_front(conflict);
                report.outcome = StepOutcome::Cancelled;
                info!("Conflict resolution stopped with {} conflicts left", queue.len());
                return report;
            }

            match self.resolve(trees, &conflict) {
                Resolution::AlreadyResolved => report.skipped += 1,
                Resolution::Planned(operations) => {
                    report.resolved += 1;
                    if operations.iter().any(|op| !op.omit()) {
                        report.issues.push(ConflictIssue {
                            conflict_type: conflict.conflict_type(),
                            local_path: trees.path(conflict.local_node()),
                            remote_path: trees.path(conflict.remote_node()),
                            message: conflict.conflict_type().user_message().to_string(),
                        });
                    }
                    for op in operations {
                        ops.push(op);
                    }
                }
            }
        }

        debug!(
            "Conflict resolution done: {} resolved, {} skipped",
            report.resolved, report.skipped
        );
        report
    }

    /// Turn one conflict into operations.
    pub fn resolve(&mut self, trees: &ReplicaTrees, conflict: &Conflict) -> Resolution {
        let local = conflict.local_node();
        let remote = conflict.remote_node();

        if !trees.is_live(local) || !trees.is_live(remote) {
            debug!("{} conflict refers to a removed node, skipping", conflict.conflict_type());
            return Resolution::AlreadyResolved;
        }
        if self.is_registered_orphan(trees, local) || self.is_registered_orphan(trees, remote) {
            debug!("{} conflict refers to a rescued orphan, skipping", conflict.conflict_type());
            return Resolution::AlreadyResolved;
        }

        let operations = match conflict.conflict_type() {
            ConflictType::CreateCreate
            | ConflictType::EditEdit
            | ConflictType::MoveCreate
            | ConflictType::MoveMoveDest => self.local_rename(trees, conflict),
            ConflictType::EditDelete => self.resolve_edit_delete(trees, conflict),
            ConflictType::MoveDelete => self.resolve_move_delete(trees, conflict),
            ConflictType::MoveParentDelete => {
                let moved = pick_with_event(trees, conflict, ChangeEvents::MOVE);
                self.undo_move(trees, conflict, moved, false)
            }
            ConflictType::CreateParentDelete => self.resolve_create_parent_delete(trees, conflict),
            ConflictType::MoveMoveSource => self.undo_move(trees, conflict, local, true),
            ConflictType::MoveMoveCycle => self.undo_move(trees, conflict, local, false),
        };

        match operations {
            Some(operations) => {
                info!(
                    "Resolved {} conflict on {} with {} operation(s)",
                    conflict.conflict_type(),
                    display_path(trees, local),
                    operations.len()
                );
                Resolution::Planned(operations)
            }
            None => Resolution::AlreadyResolved,
        }
    }

    fn is_registered_orphan(&self, trees: &ReplicaTrees, node: NodeRef) -> bool {
        trees
            .node(node)
            .and_then(|n| n.db_id())
            .is_some_and(|db_id| self.orphans.contains(db_id, node.side))
    }

    /// Rename the local node in place to a fresh conflict name.
    fn local_rename(&mut self, trees: &ReplicaTrees, conflict: &Conflict) -> Option<Vec<SyncOperation>> {
        let local = conflict.local_node();
        let path = trees.path(local)?;
        let parent = trees.parent(local)?;
        let name = self.names.generate_unique_name(&path, SuffixType::Conflict, |candidate| {
            trees.is_name_taken(parent, candidate)
        });

        let op = SyncOperation::new(
            OperationKind::Move {
                new_name: Some(name),
                new_parent: None,
            },
            local,
            ReplicaSide::Local,
        )
        .with_corresponding(conflict.remote_node())
        .with_conflict(*conflict);
        Some(vec![op])
    }

    fn resolve_edit_delete(&mut self, trees: &ReplicaTrees, conflict: &Conflict) -> Option<Vec<SyncOperation>> {
        let (deleted, edited) = split_delete_side(trees, conflict)?;
        let delete_op = bookkeeping_delete(trees, deleted, edited, conflict);

        if is_directly_deleted(trees, deleted) {
            // The edit loses the database entry and is re-created next pass.
            return Some(vec![delete_op]);
        }

        let rescue = self.rescue_to_root(trees, edited, conflict)?;
        Some(vec![delete_op, rescue])
    }

    fn resolve_move_delete(&mut self, trees: &ReplicaTrees, conflict: &Conflict) -> Option<Vec<SyncOperation>> {
        let (deleted, moved) = split_delete_side(trees, conflict)?;
        let delete_op = bookkeeping_delete(trees, deleted, moved, conflict);

        if is_directly_deleted(trees, deleted) {
            return Some(vec![delete_op]);
        }

        let mut operations = vec![delete_op];
        for orphan in orphans_of_cascading_delete(trees, deleted, moved) {
            if let Some(rescue) = self.rescue_to_root(trees, orphan, conflict) {
                operations.push(rescue);
            }
        }
        Some(operations)
    }

    fn resolve_create_parent_delete(
        &mut self,
        trees: &ReplicaTrees,
        conflict: &Conflict,
    ) -> Option<Vec<SyncOperation>> {
        let created = pick_with_event(trees, conflict, ChangeEvents::CREATE);
        let other = conflict.node(created.side.opposite());

        let op = SyncOperation::new(OperationKind::Delete, created, created.side)
            .with_corresponding(other)
            .with_conflict(*conflict);
        Some(vec![op])
    }

    /// Move `node` to the root of its own replica under an orphan name.
    fn rescue_to_root(
        &mut self,
        trees: &ReplicaTrees,
        node: NodeRef,
        conflict: &Conflict,
    ) -> Option<SyncOperation> {
        let path = trees.path(node)?;
        let root = trees.root(node.side);
        let name = self
            .names
            .generate_unique_name(&path, SuffixType::Orphan, |candidate| trees.is_name_taken(root, candidate));

        if let Some(db_id) = trees.node(node).and_then(|n| n.db_id()) {
            self.orphans.register(db_id, node.side);
        }
        info!("Rescuing {} to the {} root as '{}'", path, node.side, name);

        let mut op = SyncOperation::new(
            OperationKind::Move {
                new_name: Some(name),
                new_parent: Some(root),
            },
            node,
            node.side,
        )
        .with_conflict(*conflict);
        if let Some(counterpart) = trees.counterpart(node) {
            op = op.with_corresponding(counterpart);
        }
        Some(op)
    }

    /// Revert the pending move of `node` on its own replica.
    ///
    /// The node goes back under its pre-move parent. It keeps its pre-move
    /// name unless `fresh_name` is set or that slot is taken, in which case
    /// it gets a conflict name. Without a usable origin parent it is rescued
    /// to the root instead.
    fn undo_move(
        &mut self,
        trees: &ReplicaTrees,
        conflict: &Conflict,
        node: NodeRef,
        fresh_name: bool,
    ) -> Option<Vec<SyncOperation>> {
        let tree = trees.tree(node.side);
        let origin = trees.node(node)?.move_origin().cloned();

        let origin_parent = origin
            .as_ref()
            .and_then(|o| o.parent_db_id)
            .and_then(|db_id| tree.find_by_db_id(db_id))
            .filter(|parent| {
                tree.node(*parent).is_some_and(|p| p.is_directory())
                    && *parent != node.index
                    && !tree.is_ancestor(node.index, *parent)
                    && tree.deleted_ancestor_or_self(*parent).is_none()
            });

        let (Some(origin), Some(parent)) = (origin, origin_parent) else {
            warn!(
                "Cannot revert the move of {}, rescuing it instead",
                display_path(trees, node)
            );
            return self.rescue_to_root(trees, node, conflict).map(|op| vec![op]);
        };

        let parent = NodeRef::new(node.side, parent);
        let origin_name = origin.name().unwrap_or_else(|| tree.node(node.index).map_or("", |n| n.name()));
        let slot_taken = tree
            .child_by_name_ignore_case(parent.index, origin_name)
            .is_some_and(|occupant| occupant != node.index);
        let name = if fresh_name || slot_taken {
            self.names
                .generate_unique_name(&origin.path, SuffixType::Conflict, |candidate| {
                    trees.is_name_taken(parent, candidate)
                })
        } else {
            origin_name.to_string()
        };

        let mut op = SyncOperation::new(
            OperationKind::Move {
                new_name: Some(name),
                new_parent: Some(parent),
            },
            node,
            node.side,
        )
        .with_conflict(*conflict);
        if let Some(counterpart) = trees.counterpart(node) {
            op = op.with_corresponding(counterpart);
        }
        Some(vec![op])
    }
}

/// The conflict node carrying `event`, local side first.
fn pick_with_event(trees: &ReplicaTrees, conflict: &Conflict, event: ChangeEvents) -> NodeRef {
    let local = conflict.local_node();
    if trees.node(local).is_some_and(|n| n.has_event(event)) {
        local
    } else {
        conflict.remote_node()
    }
}

/// Split a conflict into (delete-side node, surviving node).
fn split_delete_side(trees: &ReplicaTrees, conflict: &Conflict) -> Option<(NodeRef, NodeRef)> {
    for side in [ReplicaSide::Local, ReplicaSide::Remote] {
        let node = conflict.node(side);
        if trees.tree(side).deleted_ancestor_or_self(node.index).is_some() {
            return Some((node, conflict.node(side.opposite())));
        }
    }
    warn!(
        "{} conflict without a deleted node, skipping",
        conflict.conflict_type()
    );
    None
}

fn is_directly_deleted(trees: &ReplicaTrees, node: NodeRef) -> bool {
    trees
        .node(node)
        .is_some_and(|n| n.has_event(ChangeEvents::DELETE))
}

/// Database-only removal of the deleted item, so the survivor is re-synced
/// as new.
///
/// When the delete cascades from an ancestor, the ancestor is the one
/// dropped.
fn bookkeeping_delete(
    trees: &ReplicaTrees,
    deleted: NodeRef,
    survivor: NodeRef,
    conflict: &Conflict,
) -> SyncOperation {
    let dropped = trees
        .tree(deleted.side)
        .deleted_ancestor_or_self(deleted.index)
        .map_or(deleted, |idx| NodeRef::new(deleted.side, idx));
    let corresponding = if dropped == deleted {
        Some(survivor)
    } else {
        trees.counterpart(dropped)
    };

    let mut op = SyncOperation::new(OperationKind::Delete, dropped, survivor.side)
        .with_omit(true)
        .with_conflict(*conflict);
    if let Some(corresponding) = corresponding {
        op = op.with_corresponding(corresponding);
    }
    op
}

/// Live nodes that a cascading delete would take down with it.
///
/// Always contains `moved`; when the deleted ancestor has a counterpart on
/// the move side, every other top-most node moved into that subtree follows.
fn orphans_of_cascading_delete(trees: &ReplicaTrees, deleted: NodeRef, moved: NodeRef) -> Vec<NodeRef> {
    let mut orphans = vec![moved];

    let delete_tree = trees.tree(deleted.side);
    let Some(ancestor) = delete_tree.deleted_ancestor_or_self(deleted.index) else {
        return orphans;
    };
    let Some(counterpart) = trees.counterpart(NodeRef::new(deleted.side, ancestor)) else {
        return orphans;
    };

    let move_tree = trees.tree(moved.side);
    for candidate in move_tree.descendants(counterpart.index) {
        let covered = orphans
            .iter()
            .any(|o| o.index == candidate || move_tree.is_ancestor(o.index, candidate));
        if covered {
            continue;
        }
        let is_moved_in = move_tree
            .node(candidate)
            .is_some_and(|n| n.has_event(ChangeEvents::MOVE) && n.db_id().is_some());
        if is_moved_in {
            orphans.push(NodeRef::new(moved.side, candidate));
        }
    }
    orphans
}

fn display_path(trees: &ReplicaTrees, node: NodeRef) -> String {
    trees
        .path(node)
        .map(|p| p.to_string())
        .unwrap_or_else(|| "<removed>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::operation::OperationType;
    use crate::testutil::{add, fixed_names};
    use proptest::prelude::*;

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(fixed_names(11), StopFlag::new())
    }

    fn planned(resolution: Resolution) -> Vec<SyncOperation> {
        match resolution {
            Resolution::Planned(ops) => ops,
            Resolution::AlreadyResolved => panic!("expected operations"),
        }
    }

    #[test]
    fn test_create_create_renames_local() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let local = add(&mut trees, lroot, Node::new_file("report.txt").with_events(ChangeEvents::CREATE));
        let remote = add(&mut trees, rroot, Node::new_file("report.txt").with_events(ChangeEvents::CREATE));

        let conflict = Conflict::new(ConflictType::CreateCreate, local.index, remote.index);
        let ops = planned(resolver().resolve(&trees, &conflict));

        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op_type(), OperationType::Move);
        assert_eq!(op.target_side(), ReplicaSide::Local);
        assert_eq!(op.affected(), local);
        assert!(!op.omit());
        let name = op.new_name().unwrap();
        assert!(!name.is_empty());
        assert_ne!(name, "report.txt");
        assert!(name.starts_with("report_conflict_"));
        assert!(name.ends_with(".txt"));
        assert_eq!(op.conflict().map(|c| c.conflict_type()), Some(ConflictType::CreateCreate));
    }

    #[test]
    fn test_edit_edit_and_move_move_dest_rename_local() {
        for conflict_type in [ConflictType::EditEdit, ConflictType::MoveCreate, ConflictType::MoveMoveDest] {
            let mut trees = ReplicaTrees::new();
            let lroot = trees.root(ReplicaSide::Local);
            let rroot = trees.root(ReplicaSide::Remote);
            let local = add(&mut trees, lroot, Node::new_file("a.md").with_db_id(5).with_events(ChangeEvents::EDIT));
            let remote = add(&mut trees, rroot, Node::new_file("a.md").with_db_id(5).with_events(ChangeEvents::EDIT));

            let ops = planned(resolver().resolve(&trees, &Conflict::new(conflict_type, local.index, remote.index)));
            assert_eq!(ops.len(), 1);
            assert_eq!(ops[0].op_type(), OperationType::Move);
            assert_eq!(ops[0].target_side(), ReplicaSide::Local);
            assert!(!ops[0].omit());
        }
    }

    #[test]
    fn test_edit_delete_direct_keeps_single_omit_delete() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let local = add(&mut trees, lroot, Node::new_file("notes.txt").with_db_id(2).with_events(ChangeEvents::EDIT));
        let remote = add(&mut trees, rroot, Node::new_file("notes.txt").with_db_id(2).with_events(ChangeEvents::DELETE));

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::EditDelete, local.index, remote.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type(), OperationType::Delete);
        assert!(ops[0].omit());
        assert_eq!(ops[0].affected(), remote);
        assert_eq!(ops[0].corresponding(), Some(local));
    }

    #[test]
    fn test_edit_delete_cascading_rescues_file() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let la = add(&mut trees, lroot, Node::new_directory("A").with_db_id(2));
        let lb = add(&mut trees, la, Node::new_directory("B").with_db_id(3));
        let lfile = add(&mut trees, lb, Node::new_file("file.txt").with_db_id(4).with_events(ChangeEvents::EDIT));
        let ra = add(&mut trees, rroot, Node::new_directory("A").with_db_id(2));
        let rb = add(&mut trees, ra, Node::new_directory("B").with_db_id(3).with_events(ChangeEvents::DELETE));
        let rfile = add(&mut trees, rb, Node::new_file("file.txt").with_db_id(4));

        let mut resolver = resolver();
        let ops = planned(resolver.resolve(
            &trees,
            &Conflict::new(ConflictType::EditDelete, lfile.index, rfile.index),
        ));

        assert_eq!(ops.len(), 2);
        let delete = ops.iter().find(|op| op.op_type() == OperationType::Delete).unwrap();
        assert!(delete.omit());
        assert_eq!(delete.affected(), rb);
        assert_eq!(delete.corresponding(), Some(lb));

        let rescue = ops.iter().find(|op| op.op_type() == OperationType::Move).unwrap();
        assert!(!rescue.omit());
        assert_eq!(rescue.affected(), lfile);
        assert_eq!(rescue.new_parent(), Some(lroot));
        assert!(rescue.new_name().unwrap().contains("_orphan_"));
        assert!(resolver.orphans().contains(DbNodeId(4), ReplicaSide::Local));
    }

    #[test]
    fn test_move_delete_direct_is_single_omit_delete() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let local = add(
            &mut trees,
            lroot,
            Node::new_directory("B")
                .with_db_id(2)
                .with_move_origin(SyncPath::parse("/A").unwrap(), Some(1)),
        );
        add(&mut trees, local, Node::new_file("inside.txt").with_db_id(3));
        let remote = add(&mut trees, rroot, Node::new_directory("A").with_db_id(2).with_events(ChangeEvents::DELETE));

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::MoveDelete, local.index, remote.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type(), OperationType::Delete);
        assert!(ops[0].omit());
        assert!(ops.iter().all(|op| op.op_type() != OperationType::Move));
    }

    #[test]
    fn test_move_delete_cascading_rescues_orphans_and_skips_them_later() {
        // Local: X renamed to Y inside A, and Z moved into A. Remote deleted A.
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let la = add(&mut trees, lroot, Node::new_directory("A").with_db_id(2));
        let ly = add(
            &mut trees,
            la,
            Node::new_file("Y").with_db_id(3).with_move_origin(SyncPath::parse("/A/X").unwrap(), Some(2)),
        );
        let lz = add(
            &mut trees,
            la,
            Node::new_file("Z").with_db_id(4).with_move_origin(SyncPath::parse("/Z").unwrap(), Some(1)),
        );
        let ra = add(&mut trees, rroot, Node::new_directory("A").with_db_id(2).with_events(ChangeEvents::DELETE));
        let rx = add(&mut trees, ra, Node::new_file("X").with_db_id(3));
        let rz = add(&mut trees, rroot, Node::new_file("Z").with_db_id(4));

        let mut resolver = resolver();
        let mut queue = ConflictQueue::new();
        queue.push(Conflict::new(ConflictType::MoveDelete, ly.index, rx.index));
        queue.push(Conflict::new(ConflictType::MoveParentDelete, lz.index, rz.index));
        let mut ops = SyncOperationList::new();

        let report = resolver.resolve_all(&trees, &mut queue, &mut ops);

        assert_eq!(report.outcome, StepOutcome::Completed);
        assert_eq!(report.resolved, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.issues.len(), 1);

        let moves: Vec<_> = ops.iter().filter(|op| op.op_type() == OperationType::Move).collect();
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|op| !op.omit() && op.new_parent() == Some(lroot)));
        let deletes: Vec<_> = ops.iter().filter(|op| op.op_type() == OperationType::Delete).collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].omit());
        assert_eq!(deletes[0].affected(), ra);

        assert!(resolver.orphans().contains(DbNodeId(3), ReplicaSide::Local));
        assert!(resolver.orphans().contains(DbNodeId(4), ReplicaSide::Local));
    }

    #[test]
    fn test_move_parent_delete_reverts_move() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let lsrc = add(&mut trees, lroot, Node::new_directory("src").with_db_id(2));
        let ldst = add(&mut trees, lroot, Node::new_directory("dst").with_db_id(3));
        let lfile = add(
            &mut trees,
            ldst,
            Node::new_file("f.txt").with_db_id(4).with_move_origin(SyncPath::parse("/src/f.txt").unwrap(), Some(2)),
        );
        let rsrc = add(&mut trees, rroot, Node::new_directory("src").with_db_id(2));
        add(&mut trees, rroot, Node::new_directory("dst").with_db_id(3).with_events(ChangeEvents::DELETE));
        let rfile = add(&mut trees, rsrc, Node::new_file("f.txt").with_db_id(4));

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::MoveParentDelete, lfile.index, rfile.index),
        ));

        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op_type(), OperationType::Move);
        assert_eq!(op.target_side(), ReplicaSide::Local);
        assert!(!op.omit());
        assert_eq!(op.new_parent(), Some(lsrc));
        assert_eq!(op.new_name(), Some("f.txt"));
    }

    #[test]
    fn test_undo_move_picks_fresh_name_when_origin_is_taken() {
        // Local moved a.txt into dst and created A.TXT; remote deleted dst.
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let ldst = add(&mut trees, lroot, Node::new_directory("dst").with_db_id(3));
        let moved = add(
            &mut trees,
            ldst,
            Node::new_file("a.txt").with_db_id(2).with_move_origin(SyncPath::parse("/a.txt").unwrap(), Some(1)),
        );
        add(&mut trees, lroot, Node::new_file("A.TXT").with_events(ChangeEvents::CREATE));
        add(&mut trees, rroot, Node::new_directory("dst").with_db_id(3).with_events(ChangeEvents::DELETE));
        let remote = add(&mut trees, rroot, Node::new_file("a.txt").with_db_id(2));

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::MoveParentDelete, moved.index, remote.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].target_side(), ReplicaSide::Local);
        assert_eq!(ops[0].new_parent(), Some(lroot));
        assert!(ops[0].new_name().unwrap().starts_with("a_conflict_"));
    }

    #[test]
    fn test_move_move_source_relocates_under_fresh_name() {
        // o.txt moved into d1 locally and into d2 remotely.
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let ld1 = add(&mut trees, lroot, Node::new_directory("d1").with_db_id(3));
        add(&mut trees, lroot, Node::new_directory("d2").with_db_id(4));
        let local = add(
            &mut trees,
            ld1,
            Node::new_file("o.txt").with_db_id(2).with_move_origin(SyncPath::parse("/o.txt").unwrap(), Some(1)),
        );
        add(&mut trees, rroot, Node::new_directory("d1").with_db_id(3));
        let rd2 = add(&mut trees, rroot, Node::new_directory("d2").with_db_id(4));
        let remote = add(
            &mut trees,
            rd2,
            Node::new_file("o.txt").with_db_id(2).with_move_origin(SyncPath::parse("/o.txt").unwrap(), Some(1)),
        );

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::MoveMoveSource, local.index, remote.index),
        ));

        assert_eq!(ops.len(), 1);
        let op = &ops[0];
        assert_eq!(op.op_type(), OperationType::Move);
        assert_eq!(op.target_side(), ReplicaSide::Local);
        assert_eq!(op.affected(), local);
        assert!(!op.omit());
        assert_eq!(op.new_parent(), Some(lroot));
        let name = op.new_name().unwrap();
        assert_ne!(name, "o.txt");
        assert!(name.starts_with("o_conflict_"));
        assert!(name.ends_with(".txt"));
    }

    #[test]
    fn test_undo_move_without_origin_parent_rescues_to_root() {
        // The pre-move parent is no longer in the local tree.
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let ldst = add(&mut trees, lroot, Node::new_directory("dst").with_db_id(3));
        let moved = add(
            &mut trees,
            ldst,
            Node::new_file("f.txt").with_db_id(4).with_move_origin(SyncPath::parse("/gone/f.txt").unwrap(), Some(77)),
        );
        add(&mut trees, rroot, Node::new_directory("dst").with_db_id(3).with_events(ChangeEvents::DELETE));
        let remote = add(&mut trees, rroot, Node::new_file("f.txt").with_db_id(4));

        let mut resolver = resolver();
        let ops = planned(resolver.resolve(
            &trees,
            &Conflict::new(ConflictType::MoveParentDelete, moved.index, remote.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].affected(), moved);
        assert_eq!(ops[0].new_parent(), Some(lroot));
        assert!(ops[0].new_name().unwrap().contains("_orphan_"));
        assert!(resolver.orphans().contains(DbNodeId(4), ReplicaSide::Local));
    }

    #[test]
    fn test_move_move_cycle_reverts_local_move() {
        // Local moved A into B, remote moved B into A.
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let lb = add(&mut trees, lroot, Node::new_directory("B").with_db_id(3));
        let la = add(
            &mut trees,
            lb,
            Node::new_directory("A").with_db_id(2).with_move_origin(SyncPath::parse("/A").unwrap(), Some(1)),
        );
        let ra = add(&mut trees, rroot, Node::new_directory("A").with_db_id(2));
        add(
            &mut trees,
            ra,
            Node::new_directory("B").with_db_id(3).with_move_origin(SyncPath::parse("/B").unwrap(), Some(1)),
        );

        let mut resolver = resolver();
        let ops = planned(resolver.resolve(
            &trees,
            &Conflict::new(ConflictType::MoveMoveCycle, la.index, ra.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].affected(), la);
        assert_eq!(ops[0].new_parent(), Some(lroot));
        assert_eq!(ops[0].new_name(), Some("A"));
        assert!(resolver.orphans().is_empty());
    }

    #[test]
    fn test_move_move_source_skips_registered_orphan() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let local = add(
            &mut trees,
            lroot,
            Node::new_file("n.txt").with_db_id(9).with_move_origin(SyncPath::parse("/o.txt").unwrap(), Some(1)),
        );
        let remote = add(
            &mut trees,
            rroot,
            Node::new_file("m.txt").with_db_id(9).with_move_origin(SyncPath::parse("/o.txt").unwrap(), Some(1)),
        );

        let mut resolver = resolver();
        resolver.orphans.register(DbNodeId(9), ReplicaSide::Local);
        let resolution = resolver.resolve(
            &trees,
            &Conflict::new(ConflictType::MoveMoveSource, local.index, remote.index),
        );
        assert!(matches!(resolution, Resolution::AlreadyResolved));
    }

    #[test]
    fn test_create_parent_delete_deletes_created_item() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let ldir = add(&mut trees, lroot, Node::new_directory("d").with_db_id(2));
        let lnew = add(&mut trees, ldir, Node::new_file("new.txt").with_events(ChangeEvents::CREATE));
        let rdir = add(&mut trees, rroot, Node::new_directory("d").with_db_id(2).with_events(ChangeEvents::DELETE));

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::CreateParentDelete, lnew.index, rdir.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type(), OperationType::Delete);
        assert_eq!(ops[0].target_side(), ReplicaSide::Local);
        assert_eq!(ops[0].affected(), lnew);
        assert!(!ops[0].omit());
    }

    #[test]
    fn test_create_parent_delete_on_remote_deletes_remotely() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let ldir = add(&mut trees, lroot, Node::new_directory("d").with_db_id(2).with_events(ChangeEvents::DELETE));
        let rdir = add(&mut trees, rroot, Node::new_directory("d").with_db_id(2));
        let rnew = add(&mut trees, rdir, Node::new_file("new.txt").with_events(ChangeEvents::CREATE));

        let ops = planned(resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::CreateParentDelete, ldir.index, rnew.index),
        ));

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type(), OperationType::Delete);
        assert_eq!(ops[0].target_side(), ReplicaSide::Remote);
        assert_eq!(ops[0].affected(), rnew);
        assert_eq!(ops[0].corresponding(), Some(ldir));
        assert!(!ops[0].omit());
    }

    #[test]
    fn test_removed_node_is_already_resolved() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let local = add(&mut trees, lroot, Node::new_file("x").with_events(ChangeEvents::CREATE));
        let remote = add(&mut trees, rroot, Node::new_file("x").with_events(ChangeEvents::CREATE));
        trees.local.remove_subtree(local.index).unwrap();

        let resolution = resolver().resolve(
            &trees,
            &Conflict::new(ConflictType::CreateCreate, local.index, remote.index),
        );
        assert!(matches!(resolution, Resolution::AlreadyResolved));
    }

    #[test]
    fn test_resolve_all_stops_when_requested() {
        let mut trees = ReplicaTrees::new();
        let lroot = trees.root(ReplicaSide::Local);
        let rroot = trees.root(ReplicaSide::Remote);
        let local = add(&mut trees, lroot, Node::new_file("x").with_events(ChangeEvents::CREATE));
        let remote = add(&mut trees, rroot, Node::new_file("x").with_events(ChangeEvents::CREATE));

        let stop = StopFlag::new();
        let mut resolver = ConflictResolver::new(fixed_names(1), stop.clone());
        let mut queue = ConflictQueue::new();
        queue.push(Conflict::new(ConflictType::CreateCreate, local.index, remote.index));
        let mut ops = SyncOperationList::new();

        stop.request_stop();
        let report = resolver.resolve_all(&trees, &mut queue, &mut ops);

        assert_eq!(report.outcome, StepOutcome::Cancelled);
        assert_eq!(queue.len(), 1);
        assert!(ops.is_empty());
    }

    proptest! {
        /// Live content under a deletion is either rescued to the root or
        /// dropped from bookkeeping only, and never physically deleted.
        #[test]
        fn deletions_never_lose_live_content(
            depth in 1usize..4,
            deleted_level in 0usize..4,
            edit in any::<bool>(),
            local_deletes in any::<bool>(),
        ) {
            let deleted_level = deleted_level.min(depth);
            let (live_side, delete_side) = if local_deletes {
                (ReplicaSide::Remote, ReplicaSide::Local)
            } else {
                (ReplicaSide::Local, ReplicaSide::Remote)
            };

            let mut trees = ReplicaTrees::new();
            let mut live_parent = trees.root(live_side);
            let mut delete_parent = trees.root(delete_side);
            for level in 0..depth {
                let db_id = 10 + level as u64;
                let name = format!("d{level}");
                live_parent = add(&mut trees, live_parent, Node::new_directory(name.clone()).with_db_id(db_id));
                let mut node = Node::new_directory(name).with_db_id(db_id);
                if level == deleted_level {
                    node = node.with_events(ChangeEvents::DELETE);
                }
                delete_parent = add(&mut trees, delete_parent, node);
            }
            let live_node = if edit {
                Node::new_file("f").with_db_id(99).with_events(ChangeEvents::EDIT)
            } else {
                Node::new_file("f").with_db_id(99).with_move_origin(SyncPath::parse("/f").unwrap(), Some(1))
            };
            let live = add(&mut trees, live_parent, live_node);
            let mut doomed = Node::new_file("f").with_db_id(99);
            if deleted_level == depth {
                doomed = doomed.with_events(ChangeEvents::DELETE);
            }
            let doomed = add(&mut trees, delete_parent, doomed);

            let (local, remote) = if live_side == ReplicaSide::Local { (live, doomed) } else { (doomed, live) };
            let conflict_type = if edit { ConflictType::EditDelete } else { ConflictType::MoveDelete };
            let ops = planned(resolver().resolve(&trees, &Conflict::new(conflict_type, local.index, remote.index)));

            prop_assert!(ops.iter().all(|op| op.op_type() != OperationType::Delete || op.omit()));
            let rescued = ops.iter().any(|op| {
                op.affected() == live && op.op_type() == OperationType::Move && op.new_parent() == Some(trees.root(live_side))
            });
            let deleted_root = trees
                .tree(delete_side)
                .deleted_ancestor_or_self(doomed.index)
                .map(|idx| NodeRef::new(delete_side, idx));
            let dropped = ops.iter().any(|op| {
                op.op_type() == OperationType::Delete && op.omit() && Some(op.affected()) == deleted_root
            });
            let direct = deleted_level == depth;
            prop_assert!(dropped);
            prop_assert_eq!(rescued, !direct);
        }
    }
}
