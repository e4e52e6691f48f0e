//! Planned synchronization operations and their execution order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use twinsync_common::ReplicaSide;

use crate::conflict::Conflict;
use crate::node::NodeRef;

/// Identifier of an operation inside a [`SyncOperationList`].
pub type OpId = u64;

/// Type of planned operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Edit,
    Move,
    Delete,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OperationType::Create => "create",
            OperationType::Edit => "edit",
            OperationType::Move => "move",
            OperationType::Delete => "delete",
        };
        f.write_str(text)
    }
}

/// Operation kind with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Edit,
    /// Without a name or parent the move mirrors the affected node's current
    /// location onto the target side. With either set, the affected node
    /// itself is renamed and/or reparented.
    Move {
        new_name: Option<String>,
        new_parent: Option<NodeRef>,
    },
    Delete,
}

impl OperationKind {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationKind::Create => OperationType::Create,
            OperationKind::Edit => OperationType::Edit,
            OperationKind::Move { .. } => OperationType::Move,
            OperationKind::Delete => OperationType::Delete,
        }
    }
}

/// The unit of planned work.
#[derive(Debug, Clone)]
pub struct SyncOperation {
    id: OpId,
    kind: OperationKind,
    affected: NodeRef,
    corresponding: Option<NodeRef>,
    target_side: ReplicaSide,
    omit: bool,
    is_breaking_cycle_op: bool,
    conflict: Option<Conflict>,
}

impl SyncOperation {
    /// New operation; the id is assigned by [`SyncOperationList::push`].
    pub fn new(kind: OperationKind, affected: NodeRef, target_side: ReplicaSide) -> Self {
        Self {
            id: 0,
            kind,
            affected,
            corresponding: None,
            target_side,
            omit: false,
            is_breaking_cycle_op: false,
            conflict: None,
        }
    }

    /// Mirror move of `affected` onto `target_side`.
    pub fn mirror_move(affected: NodeRef, target_side: ReplicaSide) -> Self {
        Self::new(
            OperationKind::Move {
                new_name: None,
                new_parent: None,
            },
            affected,
            target_side,
        )
    }

    pub fn with_corresponding(mut self, node: NodeRef) -> Self {
        self.corresponding = Some(node);
        self
    }

    pub fn with_omit(mut self, omit: bool) -> Self {
        self.omit = omit;
        self
    }

    pub fn with_conflict(mut self, conflict: Conflict) -> Self {
        self.conflict = Some(conflict);
        self
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn op_type(&self) -> OperationType {
        self.kind.op_type()
    }

    pub fn affected(&self) -> NodeRef {
        self.affected
    }

    pub fn corresponding(&self) -> Option<NodeRef> {
        self.corresponding
    }

    pub fn target_side(&self) -> ReplicaSide {
        self.target_side
    }

    /// True if the operation updates bookkeeping only.
    pub fn omit(&self) -> bool {
        self.omit
    }

    pub fn is_breaking_cycle_op(&self) -> bool {
        self.is_breaking_cycle_op
    }

    pub fn conflict(&self) -> Option<&Conflict> {
        self.conflict.as_ref()
    }

    pub fn new_name(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::Move { new_name, .. } => new_name.as_deref(),
            _ => None,
        }
    }

    pub fn new_parent(&self) -> Option<NodeRef> {
        match &self.kind {
            OperationKind::Move { new_parent, .. } => *new_parent,
            _ => None,
        }
    }

    /// True for a Move that renames or reparents its affected node.
    pub fn is_explicit_move(&self) -> bool {
        matches!(
            &self.kind,
            OperationKind::Move { new_name, new_parent } if new_name.is_some() || new_parent.is_some()
        )
    }

    /// Turn this operation into a move of `counterpart` to `root` under `name`.
    pub(crate) fn convert_to_breaking_move(&mut self, counterpart: NodeRef, root: NodeRef, name: String) {
        let previous = self.affected;
        self.kind = OperationKind::Move {
            new_name: Some(name),
            new_parent: Some(root),
        };
        self.affected = counterpart;
        self.corresponding = Some(previous);
        self.target_side = counterpart.side;
        self.omit = false;
        self.is_breaking_cycle_op = true;
        self.conflict = None;
    }
}

/// Operations keyed by id, plus their execution order.
#[derive(Debug, Clone, Default)]
pub struct SyncOperationList {
    ops: HashMap<OpId, SyncOperation>,
    sorted: Vec<OpId>,
    next_id: OpId,
}

impl SyncOperationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation, returning its id.
    pub fn push(&mut self, mut op: SyncOperation) -> OpId {
        self.next_id += 1;
        let id = self.next_id;
        op.id = id;
        self.ops.insert(id, op);
        self.sorted.push(id);
        id
    }

    pub fn get(&self, id: OpId) -> Option<&SyncOperation> {
        self.ops.get(&id)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut SyncOperation> {
        self.ops.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Execution order.
    pub fn op_sorted_list(&self) -> &[OpId] {
        &self.sorted
    }

    /// Operations in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &SyncOperation> {
        self.sorted.iter().filter_map(|id| self.ops.get(id))
    }

    /// Replace the whole content with `other`, keeping id allocation monotonic.
    pub fn replace(&mut self, other: SyncOperationList) {
        self.next_id = self.next_id.max(other.next_id);
        self.ops = other.ops;
        self.sorted = other.sorted;
    }

    pub fn clear(&mut self) {
        self.ops.clear();
        self.sorted.clear();
    }

    /// Keep only operations for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&SyncOperation) -> bool) {
        let ops = &mut self.ops;
        self.sorted.retain(|id| {
            let kept = ops.get(id).is_some_and(&mut keep);
            if !kept {
                ops.remove(id);
            }
            kept
        });
    }

    pub fn position(&self, id: OpId) -> Option<usize> {
        self.sorted.iter().position(|x| *x == id)
    }

    /// Move `id` to the slot right after `anchor`.
    pub(crate) fn move_after(&mut self, id: OpId, anchor: OpId) -> bool {
        if id == anchor {
            return false;
        }
        let Some(from) = self.position(id) else {
            return false;
        };
        self.sorted.remove(from);
        match self.position(anchor) {
            Some(at) => {
                self.sorted.insert(at + 1, id);
                true
            }
            None => {
                self.sorted.insert(from, id);
                false
            }
        }
    }
}
