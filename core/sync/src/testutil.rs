//! Shared fixtures for unit tests.

use chrono::TimeZone;
use chrono::Utc;

use crate::node::{Node, NodeRef};
use crate::operation::{OpId, OperationKind, SyncOperation, SyncOperationList};
use crate::platform::{FixedClock, NameGenerator};
use crate::tree::ReplicaTrees;

/// Insert `node` under `parent` on the parent's side.
pub fn add(trees: &mut ReplicaTrees, parent: NodeRef, node: Node) -> NodeRef {
    let idx = trees
        .tree_mut(parent.side)
        .insert(parent.index, node)
        .expect("fixture insert");
    NodeRef::new(parent.side, idx)
}

/// Name generator frozen at 2024-01-15 12:34:56 UTC.
pub fn fixed_names(seed: u64) -> NameGenerator {
    let instant = Utc
        .with_ymd_and_hms(2024, 1, 15, 12, 34, 56)
        .single()
        .expect("valid instant");
    NameGenerator::new(Box::new(FixedClock(instant)), Some(seed))
}

/// Push an operation propagating `affected` to the opposite side.
pub fn push_op(ops: &mut SyncOperationList, kind: OperationKind, affected: NodeRef) -> OpId {
    ops.push(SyncOperation::new(kind, affected, affected.side.opposite()))
}

/// Explicit move of `affected` on its own side.
pub fn explicit_move(affected: NodeRef, new_parent: Option<NodeRef>, new_name: Option<&str>) -> SyncOperation {
    SyncOperation::new(
        OperationKind::Move {
            new_name: new_name.map(str::to_string),
            new_parent,
        },
        affected,
        affected.side,
    )
}

/// Operation ids in execution order.
pub fn order(ops: &SyncOperationList) -> Vec<OpId> {
    ops.op_sorted_list().to_vec()
}
