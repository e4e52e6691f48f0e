//! Platform inconsistency checker.
//!
//! Walks the subtrees holding pending Create or Move events and blacklists
//! nodes whose name or path the target platform would reject. Blacklisted
//! nodes are dropped from both trees once the walk is over.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use twinsync_common::{ReplicaSide, SyncPath};

use crate::node::{ChangeEvents, DbNodeId, NodeIdx, NodeRef};
use crate::platform::{is_special_folder, InconsistencyKind, Platform};
use crate::stop::{StepOutcome, StopFlag};
use crate::tree::{ReplicaTree, ReplicaTrees};

/// Error record for a node excluded from the pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlacklistRecord {
    pub side: ReplicaSide,
    pub node_id: Option<String>,
    pub db_id: Option<DbNodeId>,
    pub path: SyncPath,
    pub kind: InconsistencyKind,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub outcome: StepOutcome,
    pub blacklisted: Vec<BlacklistRecord>,
}

pub struct PlatformInconsistencyChecker {
    platform: Platform,
    sync_root_len: usize,
    stop: StopFlag,
}

impl PlatformInconsistencyChecker {
    /// `sync_root` is the absolute local folder; its length counts toward
    /// the path limit.
    pub fn new(platform: Platform, sync_root: &Path, stop: StopFlag) -> Self {
        Self {
            platform,
            sync_root_len: sync_root.to_string_lossy().chars().count(),
            stop,
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Check one side and remove what it blacklists from both trees.
    ///
    /// A cancelled walk removes nothing.
    pub fn check_tree(&mut self, trees: &mut ReplicaTrees, side: ReplicaSide) -> CheckReport {
        let tree = trees.tree(side);
        let relevant = changed_with_ancestors(tree);

        let mut walk = Walk {
            tree,
            relevant: &relevant,
            blacklisted: Vec::new(),
        };
        let outcome = self.check_subtree(&mut walk, tree.root());
        let blacklisted = walk.blacklisted;

        if outcome == StepOutcome::Cancelled {
            info!("Platform check of the {} tree stopped", side);
            return CheckReport {
                outcome,
                blacklisted: Vec::new(),
            };
        }

        let records: Vec<BlacklistRecord> = blacklisted
            .iter()
            .filter_map(|(idx, kind)| {
                let node = tree.node(*idx)?;
                Some(BlacklistRecord {
                    side,
                    node_id: node.id().map(str::to_string),
                    db_id: node.db_id(),
                    path: tree.path(*idx)?,
                    kind: *kind,
                })
            })
            .collect();

        for (idx, _) in &blacklisted {
            remove_with_counterpart(trees, NodeRef::new(side, *idx));
        }

        debug!("Platform check of the {} tree blacklisted {} node(s)", side, records.len());
        CheckReport {
            outcome: StepOutcome::Completed,
            blacklisted: records,
        }
    }

    fn check_subtree(&self, walk: &mut Walk<'_>, idx: NodeIdx) -> StepOutcome {
        if self.stop.is_stop_requested() {
            return StepOutcome::Cancelled;
        }
        let tree = walk.tree;
        let children = tree.children(idx);

        let mut clashing = HashSet::new();
        if children.iter().any(|c| has_create_or_move(tree, *c)) {
            for loser in name_clash_losers(tree, children) {
                clashing.insert(loser);
                walk.blacklist(loser, InconsistencyKind::NameClash);
            }
        }

        for child in children.iter().copied() {
            if self.stop.is_stop_requested() {
                return StepOutcome::Cancelled;
            }
            if clashing.contains(&child) || !walk.relevant.contains(&child) {
                continue;
            }
            if has_create_or_move(tree, child) {
                if let Some(kind) = self.check_node(tree, child) {
                    walk.blacklist(child, kind);
                    continue;
                }
            }
            if self.check_subtree(walk, child) == StepOutcome::Cancelled {
                return StepOutcome::Cancelled;
            }
        }
        StepOutcome::Completed
    }

    /// First failing legality rule for a node, if any.
    fn check_node(&self, tree: &ReplicaTree, idx: NodeIdx) -> Option<InconsistencyKind> {
        let node = tree.node(idx)?;
        if let Some(kind) = self.platform.check_name(node.name()) {
            return Some(kind);
        }
        let path = tree.path(idx)?;
        let size = self.sync_root_len + 1 + path.char_len();
        if self.platform.is_path_too_long(size) {
            return Some(InconsistencyKind::PathLength);
        }
        None
    }
}

struct Walk<'a> {
    tree: &'a ReplicaTree,
    relevant: &'a HashSet<NodeIdx>,
    blacklisted: Vec<(NodeIdx, InconsistencyKind)>,
}

impl Walk<'_> {
    fn blacklist(&mut self, idx: NodeIdx, kind: InconsistencyKind) {
        let path = self
            .tree
            .path(idx)
            .map(|p| p.to_string())
            .unwrap_or_default();
        warn!("Blacklisting {} on the {} replica: {}", path, self.tree.side(), kind);
        self.blacklisted.push((idx, kind));
    }
}

fn has_create_or_move(tree: &ReplicaTree, idx: NodeIdx) -> bool {
    tree.node(idx).is_some_and(|n| {
        n.events().intersects(ChangeEvents::CREATE | ChangeEvents::MOVE)
            && !n.has_event(ChangeEvents::DELETE)
    })
}

/// Nodes with a pending Create or Move, plus all their ancestors.
fn changed_with_ancestors(tree: &ReplicaTree) -> HashSet<NodeIdx> {
    let mut relevant = HashSet::new();
    for (idx, _) in tree.iter() {
        if !has_create_or_move(tree, idx) || relevant.contains(&idx) {
            continue;
        }
        relevant.insert(idx);
        for ancestor in tree.ancestors(idx) {
            if !relevant.insert(ancestor) {
                break;
            }
        }
    }
    relevant
}

/// Siblings that lose a case-insensitive name clash.
///
/// In each group of equal lowercase names the survivor is a special folder,
/// else a node without pending events, else the first one. Only nodes with a
/// pending Create or Move can lose.
fn name_clash_losers(tree: &ReplicaTree, children: &[NodeIdx]) -> Vec<NodeIdx> {
    let mut groups: BTreeMap<String, Vec<NodeIdx>> = BTreeMap::new();
    for child in children {
        if let Some(node) = tree.node(*child) {
            if node.has_event(ChangeEvents::DELETE) {
                continue;
            }
            groups.entry(node.name().to_lowercase()).or_default().push(*child);
        }
    }

    let mut losers = Vec::new();
    for members in groups.values().filter(|m| m.len() > 1) {
        let keep = members
            .iter()
            .copied()
            .find(|m| tree.node(*m).is_some_and(|n| is_special_folder(n.name())))
            .or_else(|| {
                members
                    .iter()
                    .copied()
                    .find(|m| tree.node(*m).is_some_and(|n| !n.has_change_event()))
            })
            .unwrap_or(members[0]);

        losers.extend(
            members
                .iter()
                .copied()
                .filter(|m| *m != keep && has_create_or_move(tree, *m)),
        );
    }
    losers
}

fn remove_with_counterpart(trees: &mut ReplicaTrees, node: NodeRef) {
    let counterpart = trees.counterpart(node).filter(|c| *c != trees.root(c.side));

    for target in std::iter::once(node).chain(counterpart) {
        if !trees.is_live(target) {
            continue;
        }
        if let Err(e) = trees.tree_mut(target.side).remove_subtree(target.index) {
            warn!("Could not remove blacklisted node from the {} tree: {}", target.side, e);
        }
    }
}
