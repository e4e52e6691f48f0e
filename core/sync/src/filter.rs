//! Path facts about planned operations, indexed for the sorter passes.

use std::collections::HashMap;

use twinsync_common::{ReplicaSide, SyncPath};

use crate::node::NodeRef;
use crate::operation::{OpId, OperationKind, OperationType, SyncOperation, SyncOperationList};
use crate::tree::ReplicaTrees;

/// What the sorter needs to know about one operation.
#[derive(Debug, Clone)]
pub(crate) struct OpFacts {
    pub id: OpId,
    pub op_type: OperationType,
    pub target: ReplicaSide,
    pub node: NodeRef,
    /// Path the operation works on; for a Move, where the item ends up.
    pub path: SyncPath,
    /// For a Move, where the item is before it runs.
    pub origin: Option<SyncPath>,
}

type PathKey = (ReplicaSide, SyncPath);

/// Lookup tables over the operations of one list.
#[derive(Debug, Default)]
pub(crate) struct OpIndex {
    facts: Vec<OpFacts>,
    by_id: HashMap<OpId, usize>,
    creates_at: HashMap<PathKey, Vec<OpId>>,
    deletes_at: HashMap<PathKey, Vec<OpId>>,
    moves_to: HashMap<PathKey, Vec<OpId>>,
    moves_from: HashMap<PathKey, Vec<OpId>>,
    moves_of: HashMap<(ReplicaSide, NodeRef), Vec<OpId>>,
    creates_of: HashMap<(ReplicaSide, NodeRef), Vec<OpId>>,
}

impl OpIndex {
    /// Index every operation whose affected node is still in its tree.
    pub fn build(trees: &ReplicaTrees, ops: &SyncOperationList) -> Self {
        let mut index = Self::default();
        for op in ops.iter() {
            if let Some(facts) = op_facts(trees, op) {
                index.insert(facts);
            }
        }
        index
    }

    fn insert(&mut self, facts: OpFacts) {
        let id = facts.id;
        let key = (facts.target, facts.path.clone());
        match facts.op_type {
            OperationType::Create => {
                self.creates_at.entry(key).or_default().push(id);
                self.creates_of
                    .entry((facts.target, facts.node))
                    .or_default()
                    .push(id);
            }
            OperationType::Delete => self.deletes_at.entry(key).or_default().push(id),
            OperationType::Move => {
                self.moves_to.entry(key).or_default().push(id);
                if let Some(origin) = &facts.origin {
                    self.moves_from
                        .entry((facts.target, origin.clone()))
                        .or_default()
                        .push(id);
                }
                self.moves_of
                    .entry((facts.target, facts.node))
                    .or_default()
                    .push(id);
            }
            OperationType::Edit => {}
        }
        self.by_id.insert(id, self.facts.len());
        self.facts.push(facts);
    }

    pub fn get(&self, id: OpId) -> Option<&OpFacts> {
        self.by_id.get(&id).map(|i| &self.facts[*i])
    }

    pub fn of_type(&self, op_type: OperationType) -> impl Iterator<Item = &OpFacts> {
        self.facts.iter().filter(move |f| f.op_type == op_type)
    }

    pub fn creates_at(&self, target: ReplicaSide, path: &SyncPath) -> &[OpId] {
        lookup(&self.creates_at, target, path)
    }

    pub fn deletes_at(&self, target: ReplicaSide, path: &SyncPath) -> &[OpId] {
        lookup(&self.deletes_at, target, path)
    }

    pub fn moves_to(&self, target: ReplicaSide, path: &SyncPath) -> &[OpId] {
        lookup(&self.moves_to, target, path)
    }

    pub fn moves_from(&self, target: ReplicaSide, path: &SyncPath) -> &[OpId] {
        lookup(&self.moves_from, target, path)
    }

    pub fn moves_of(&self, target: ReplicaSide, node: NodeRef) -> &[OpId] {
        self.moves_of
            .get(&(target, node))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn creates_of(&self, target: ReplicaSide, node: NodeRef) -> &[OpId] {
        self.creates_of
            .get(&(target, node))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn lookup<'a>(map: &'a HashMap<PathKey, Vec<OpId>>, target: ReplicaSide, path: &SyncPath) -> &'a [OpId] {
    map.get(&(target, path.clone()))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Facts for one operation, or `None` if its affected node is gone.
fn op_facts(trees: &ReplicaTrees, op: &SyncOperation) -> Option<OpFacts> {
    let node = op.affected();
    let current = trees.path(node)?;

    let (path, origin) = match op.kind() {
        OperationKind::Move {
            new_name,
            new_parent,
        } if new_name.is_some() || new_parent.is_some() => {
            let parent_path = match new_parent {
                Some(parent) => trees.path(*parent)?,
                None => current.parent()?,
            };
            let name = match new_name {
                Some(name) => name.as_str(),
                None => current.name()?,
            };
            let destination = parent_path.child(name);
            (destination, Some(current))
        }
        OperationKind::Move { .. } => {
            let origin = trees
                .node(node)
                .and_then(|n| n.move_origin())
                .map(|o| o.path.clone())
                .or_else(|| op.corresponding().and_then(|c| trees.path(c)))
                .unwrap_or_else(|| current.clone());
            (current, Some(origin))
        }
        _ => (current, None),
    };

    Some(OpFacts {
        id: op.id(),
        op_type: op.op_type(),
        target: op.target_side(),
        node,
        path,
        origin,
    })
}
