//! JSON scenario files: two replica trees, detected conflicts and planned
//! operations, as handed over by change detection.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use twinsync_common::{ReplicaSide, SyncPath};
use twinsync_sync::{
    ChangeEvents, Conflict, ConflictQueue, ConflictType, Node, NodeRef, NodeType, OperationKind,
    OperationType, ReconcileConfig, ReplicaTrees, SyncOperation, SyncOperationList,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Event {
    Create,
    Edit,
    Move,
    Delete,
}

impl Event {
    fn flag(&self) -> ChangeEvents {
        match self {
            Event::Create => ChangeEvents::CREATE,
            Event::Edit => ChangeEvents::EDIT,
            Event::Move => ChangeEvents::MOVE,
            Event::Delete => ChangeEvents::DELETE,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OriginEntry {
    path: String,
    parent_db_id: Option<u64>,
}

/// One node; parents must be listed before their children.
#[derive(Debug, Deserialize)]
struct NodeEntry {
    id: String,
    db_id: Option<u64>,
    /// Id of the parent node, or none for the root.
    parent: Option<String>,
    name: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    events: Vec<Event>,
    move_origin: Option<OriginEntry>,
}

#[derive(Debug, Deserialize)]
struct ConflictEntry {
    #[serde(rename = "type")]
    conflict_type: ConflictType,
    local: String,
    remote: String,
}

#[derive(Debug, Clone, Deserialize)]
struct NodeHandle {
    side: ReplicaSide,
    id: String,
}

#[derive(Debug, Deserialize)]
struct OperationEntry {
    #[serde(rename = "type")]
    op_type: OperationType,
    affected: NodeHandle,
    target: ReplicaSide,
    corresponding: Option<NodeHandle>,
    new_name: Option<String>,
    new_parent: Option<NodeHandle>,
    #[serde(default)]
    omit: bool,
}

#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub config: ReconcileConfig,
    /// Frozen clock for generated names.
    pub now: Option<DateTime<Utc>>,
    #[serde(default)]
    local: Vec<NodeEntry>,
    #[serde(default)]
    remote: Vec<NodeEntry>,
    #[serde(default)]
    conflicts: Vec<ConflictEntry>,
    #[serde(default)]
    operations: Vec<OperationEntry>,
}

/// Everything a reconciliation pass works on.
pub struct Workload {
    pub trees: ReplicaTrees,
    pub conflicts: ConflictQueue,
    pub ops: SyncOperationList,
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self> {
        let scenario: Self = serde_json::from_str(json).context("Invalid scenario file")?;
        scenario.config.validate().context("Invalid scenario config")?;
        Ok(scenario)
    }

    pub fn build(&self) -> Result<Workload> {
        let mut trees = ReplicaTrees::new();
        let mut ids = HashMap::new();
        for (side, entries) in [(ReplicaSide::Local, &self.local), (ReplicaSide::Remote, &self.remote)] {
            for entry in entries {
                let node = insert_entry(&mut trees, &ids, side, entry)?;
                ids.insert((side, entry.id.clone()), node);
            }
        }
        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            trees
                .tree(side)
                .validate()
                .with_context(|| format!("Invalid {} tree", side))?;
        }

        let resolve = |handle: &NodeHandle| -> Result<NodeRef> {
            ids.get(&(handle.side, handle.id.clone()))
                .copied()
                .ok_or_else(|| anyhow!("Unknown {} node '{}'", handle.side, handle.id))
        };

        let mut conflicts = ConflictQueue::new();
        for entry in &self.conflicts {
            let local = resolve(&NodeHandle {
                side: ReplicaSide::Local,
                id: entry.local.clone(),
            })?;
            let remote = resolve(&NodeHandle {
                side: ReplicaSide::Remote,
                id: entry.remote.clone(),
            })?;
            conflicts.push(Conflict::new(entry.conflict_type, local.index, remote.index));
        }

        let mut ops = SyncOperationList::new();
        for entry in &self.operations {
            let kind = match entry.op_type {
                OperationType::Create => OperationKind::Create,
                OperationType::Edit => OperationKind::Edit,
                OperationType::Delete => OperationKind::Delete,
                OperationType::Move => OperationKind::Move {
                    new_name: entry.new_name.clone(),
                    new_parent: entry.new_parent.as_ref().map(&resolve).transpose()?,
                },
            };
            let mut op = SyncOperation::new(kind, resolve(&entry.affected)?, entry.target)
                .with_omit(entry.omit);
            if let Some(handle) = &entry.corresponding {
                op = op.with_corresponding(resolve(handle)?);
            }
            ops.push(op);
        }

        Ok(Workload {
            trees,
            conflicts,
            ops,
        })
    }
}

fn insert_entry(
    trees: &mut ReplicaTrees,
    ids: &HashMap<(ReplicaSide, String), NodeRef>,
    side: ReplicaSide,
    entry: &NodeEntry,
) -> Result<NodeRef> {
    let parent = match &entry.parent {
        Some(parent_id) => *ids
            .get(&(side, parent_id.clone()))
            .ok_or_else(|| anyhow!("Parent '{}' of '{}' must be listed first", parent_id, entry.id))?,
        None => trees.root(side),
    };

    let mut node = match entry.node_type {
        NodeType::File => Node::new_file(entry.name.clone()),
        NodeType::Directory => Node::new_directory(entry.name.clone()),
    }
    .with_id(entry.id.clone());
    if let Some(db_id) = entry.db_id {
        node = node.with_db_id(db_id);
    }
    for event in &entry.events {
        node = node.with_events(event.flag());
    }
    if let Some(origin) = &entry.move_origin {
        let path = SyncPath::parse(&origin.path)
            .with_context(|| format!("Invalid move origin of '{}'", entry.id))?;
        node = node.with_move_origin(path, origin.parent_db_id);
    }
    if entry.events.iter().any(|e| matches!(e, Event::Move)) && entry.move_origin.is_none() {
        bail!("Node '{}' has a move event but no move_origin", entry.id);
    }

    let idx = trees
        .tree_mut(side)
        .insert(parent.index, node)
        .with_context(|| format!("Cannot add node '{}'", entry.id))?;
    Ok(NodeRef::new(side, idx))
}

/// One line of a computed plan.
#[derive(Debug, Serialize)]
pub struct PlannedOp {
    pub id: u64,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub target: ReplicaSide,
    pub affected_side: ReplicaSide,
    pub path: Option<SyncPath>,
    pub new_name: Option<String>,
    pub new_parent: Option<SyncPath>,
    pub omit: bool,
    pub breaking_cycle: bool,
}

pub fn planned_ops(trees: &ReplicaTrees, ops: &SyncOperationList) -> Vec<PlannedOp> {
    ops.iter()
        .map(|op| PlannedOp {
            id: op.id(),
            op_type: op.op_type(),
            target: op.target_side(),
            affected_side: op.affected().side,
            path: trees.path(op.affected()),
            new_name: op.new_name().map(str::to_string),
            new_parent: op.new_parent().and_then(|p| trees.path(p)),
            omit: op.omit(),
            breaking_cycle: op.is_breaking_cycle_op(),
        })
        .collect()
}
