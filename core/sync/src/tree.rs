//! In-memory replica trees.
//!
//! Each replica keeps its nodes in an arena addressed by [`NodeIdx`]; parent
//! and children are stored as indices so reparenting is O(1) and removed
//! nodes simply leave an empty slot behind.

use std::collections::HashMap;

use twinsync_common::{Error, ReplicaSide, Result, SyncPath};

use crate::node::{ChangeEvents, DbNodeId, Node, NodeIdx, NodeRef};

/// Tree of one replica.
#[derive(Debug, Clone)]
pub struct ReplicaTree {
    side: ReplicaSide,
    nodes: Vec<Option<Node>>,
    root: NodeIdx,
    by_id: HashMap<String, NodeIdx>,
    by_db_id: HashMap<DbNodeId, NodeIdx>,
}

impl ReplicaTree {
    /// Create a tree holding only its root directory.
    pub fn new(side: ReplicaSide) -> Self {
        let mut root = Node::new_directory("");
        root.side = side;
        root.db_id = Some(DbNodeId::ROOT);

        let root_idx = NodeIdx(0);
        let mut by_db_id = HashMap::new();
        by_db_id.insert(DbNodeId::ROOT, root_idx);

        Self {
            side,
            nodes: vec![Some(root)],
            root: root_idx,
            by_id: HashMap::new(),
            by_db_id,
        }
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn root(&self) -> NodeIdx {
        self.root
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    pub fn node(&self, idx: NodeIdx) -> Option<&Node> {
        self.nodes.get(idx.slot()).and_then(|n| n.as_ref())
    }

    pub fn node_mut(&mut self, idx: NodeIdx) -> Option<&mut Node> {
        self.nodes.get_mut(idx.slot()).and_then(|n| n.as_mut())
    }

    pub fn is_live(&self, idx: NodeIdx) -> bool {
        self.node(idx).is_some()
    }

    /// Iterate over live nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeIdx(i as u32), n)))
    }

    /// Insert `node` as a child of `parent`.
    ///
    /// # Errors
    /// - Parent missing or not a directory
    /// - Invalid name
    /// - Replica id or database id already present in this tree
    pub fn insert(&mut self, parent: NodeIdx, mut node: Node) -> Result<NodeIdx> {
        match self.node(parent) {
            Some(p) if p.is_directory() => {}
            Some(_) => {
                return Err(Error::InvalidTree(format!(
                    "Cannot add '{}' under a file",
                    node.name
                )));
            }
            None => {
                return Err(Error::NotFound(format!(
                    "Parent of '{}' is not in the {} tree",
                    node.name, self.side
                )));
            }
        }
        validate_name(&node.name)?;

        if let Some(id) = &node.id {
            if self.by_id.contains_key(id) {
                return Err(Error::AlreadyExists(format!("Node id '{}'", id)));
            }
        }
        if let Some(db_id) = node.db_id {
            if self.by_db_id.contains_key(&db_id) {
                return Err(Error::AlreadyExists(format!("Database id {}", db_id)));
            }
        }

        let idx = NodeIdx(self.nodes.len() as u32);
        node.side = self.side;
        node.parent = Some(parent);
        node.children.clear();

        if let Some(id) = &node.id {
            self.by_id.insert(id.clone(), idx);
        }
        if let Some(db_id) = node.db_id {
            self.by_db_id.insert(db_id, idx);
        }
        self.nodes.push(Some(node));
        if let Some(p) = self.node_mut(parent) {
            p.children.push(idx);
        }

        Ok(idx)
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeIdx> {
        self.by_id.get(id).copied()
    }

    pub fn find_by_db_id(&self, db_id: DbNodeId) -> Option<NodeIdx> {
        self.by_db_id.get(&db_id).copied()
    }

    pub fn parent(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.node(idx).and_then(|n| n.parent)
    }

    pub fn children(&self, idx: NodeIdx) -> &[NodeIdx] {
        self.node(idx).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Child of `parent` with exactly `name`.
    pub fn child_by_name(&self, parent: NodeIdx, name: &str) -> Option<NodeIdx> {
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.node(*c).is_some_and(|n| n.name == name))
    }

    /// Child of `parent` whose name matches `name` ignoring case.
    pub fn child_by_name_ignore_case(&self, parent: NodeIdx, name: &str) -> Option<NodeIdx> {
        let wanted = name.to_lowercase();
        self.children(parent)
            .iter()
            .copied()
            .find(|c| self.node(*c).is_some_and(|n| n.name.to_lowercase() == wanted))
    }

    /// Relative path of a live node, derived by walking up to the root.
    pub fn path(&self, idx: NodeIdx) -> Option<SyncPath> {
        let mut names = Vec::new();
        let mut current = idx;
        loop {
            let node = self.node(current)?;
            match node.parent {
                Some(parent) => {
                    names.push(node.name.as_str());
                    current = parent;
                }
                None => break,
            }
        }

        let mut path = SyncPath::root();
        for name in names.into_iter().rev() {
            path = path.child(name);
        }
        Some(path)
    }

    /// True if `ancestor` is a strict ancestor of `idx`.
    pub fn is_ancestor(&self, ancestor: NodeIdx, idx: NodeIdx) -> bool {
        let mut current = self.parent(idx);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.parent(p);
        }
        false
    }

    /// Strict ancestors of `idx`, nearest first.
    pub fn ancestors(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        let mut out = Vec::new();
        let mut current = self.parent(idx);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    /// All live descendants of `idx`, depth first, `idx` excluded.
    pub fn descendants(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeIdx> = self.children(idx).iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    /// Nearest ancestor-or-self carrying a Delete event.
    pub fn deleted_ancestor_or_self(&self, idx: NodeIdx) -> Option<NodeIdx> {
        std::iter::once(idx)
            .chain(self.ancestors(idx))
            .find(|i| self.node(*i).is_some_and(|n| n.has_event(ChangeEvents::DELETE)))
    }

    /// Move `idx` under `new_parent`.
    ///
    /// # Preconditions
    /// - `idx` is a live node other than the root
    /// - `new_parent` is a live directory outside the subtree of `idx`
    ///
    /// # Postconditions
    /// - `idx` is listed among the children of `new_parent` only
    ///
    /// # Errors
    /// - `InvalidTree` for the root, a cycle or a non-directory parent
    /// - `NotFound` if `idx` is not in the tree
    pub fn reparent(&mut self, idx: NodeIdx, new_parent: NodeIdx) -> Result<()> {
        if idx == self.root {
            return Err(Error::InvalidTree("Cannot move the root".to_string()));
        }
        if idx == new_parent || self.is_ancestor(idx, new_parent) {
            return Err(Error::InvalidTree(
                "Cannot move a node below itself".to_string(),
            ));
        }
        match self.node(new_parent) {
            Some(p) if p.is_directory() => {}
            _ => {
                return Err(Error::InvalidTree(
                    "New parent must be a live directory".to_string(),
                ));
            }
        }
        let old_parent = self
            .parent(idx)
            .ok_or_else(|| Error::NotFound("Node is not in the tree".to_string()))?;

        if let Some(p) = self.node_mut(old_parent) {
            p.children.retain(|c| *c != idx);
        }
        if let Some(p) = self.node_mut(new_parent) {
            p.children.push(idx);
        }
        if let Some(n) = self.node_mut(idx) {
            n.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Rename a live node.
    pub fn rename(&mut self, idx: NodeIdx, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        validate_name(&name)?;
        let node = self
            .node_mut(idx)
            .ok_or_else(|| Error::NotFound("Node is not in the tree".to_string()))?;
        node.name = name;
        Ok(())
    }

    /// Remove `idx` and its whole subtree. Returns the number of removed nodes.
    ///
    /// # Postconditions
    /// - No removed node is reachable by index, replica id or database id
    ///
    /// # Errors
    /// - `InvalidTree` for the root
    /// - `NotFound` if `idx` is not in the tree
    pub fn remove_subtree(&mut self, idx: NodeIdx) -> Result<usize> {
        if idx == self.root {
            return Err(Error::InvalidTree("Cannot remove the root".to_string()));
        }
        let parent = self
            .parent(idx)
            .ok_or_else(|| Error::NotFound("Node is not in the tree".to_string()))?;

        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|c| *c != idx);
        }

        let mut doomed = self.descendants(idx);
        doomed.push(idx);
        for i in &doomed {
            if let Some(node) = self.nodes[i.slot()].take() {
                if let Some(id) = &node.id {
                    self.by_id.remove(id);
                }
                if let Some(db_id) = node.db_id {
                    self.by_db_id.remove(&db_id);
                }
            }
        }
        Ok(doomed.len())
    }

    /// Check structural invariants.
    ///
    /// Children must point back to their parent, and a node with a pending
    /// Delete must not have live descendants with events other than Delete.
    pub fn validate(&self) -> Result<()> {
        for (idx, node) in self.iter() {
            for child in &node.children {
                let back = self.node(*child).and_then(|c| c.parent);
                if back != Some(idx) {
                    return Err(Error::InvalidTree(format!(
                        "Child of '{}' does not point back to it",
                        node.name
                    )));
                }
            }
            if node.has_event(ChangeEvents::DELETE) {
                let offending = self.descendants(idx).into_iter().find(|d| {
                    self.node(*d).is_some_and(|n| {
                        n.events.intersects(
                            ChangeEvents::CREATE | ChangeEvents::EDIT | ChangeEvents::MOVE,
                        )
                    })
                });
                if let Some(d) = offending {
                    return Err(Error::InvalidTree(format!(
                        "Deleted node '{}' has a live changed descendant {}",
                        node.name,
                        self.path(d).map(|p| p.to_string()).unwrap_or_default()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The pair of replica trees reconciled in one pass.
#[derive(Debug, Clone)]
pub struct ReplicaTrees {
    pub local: ReplicaTree,
    pub remote: ReplicaTree,
}

impl ReplicaTrees {
    pub fn new() -> Self {
        Self {
            local: ReplicaTree::new(ReplicaSide::Local),
            remote: ReplicaTree::new(ReplicaSide::Remote),
        }
    }

    pub fn tree(&self, side: ReplicaSide) -> &ReplicaTree {
        match side {
            ReplicaSide::Local => &self.local,
            ReplicaSide::Remote => &self.remote,
        }
    }

    pub fn tree_mut(&mut self, side: ReplicaSide) -> &mut ReplicaTree {
        match side {
            ReplicaSide::Local => &mut self.local,
            ReplicaSide::Remote => &mut self.remote,
        }
    }

    pub fn root(&self, side: ReplicaSide) -> NodeRef {
        NodeRef::new(side, self.tree(side).root())
    }

    pub fn node(&self, node: NodeRef) -> Option<&Node> {
        self.tree(node.side).node(node.index)
    }

    pub fn is_live(&self, node: NodeRef) -> bool {
        self.node(node).is_some()
    }

    pub fn path(&self, node: NodeRef) -> Option<SyncPath> {
        self.tree(node.side).path(node.index)
    }

    pub fn parent(&self, node: NodeRef) -> Option<NodeRef> {
        self.tree(node.side)
            .parent(node.index)
            .map(|p| NodeRef::new(node.side, p))
    }

    /// Corresponding node on the opposite replica, matched by database id.
    pub fn counterpart(&self, node: NodeRef) -> Option<NodeRef> {
        let db_id = self.node(node)?.db_id?;
        let side = node.side.opposite();
        self.tree(side)
            .find_by_db_id(db_id)
            .map(|idx| NodeRef::new(side, idx))
    }

    /// True if a child of `parent`, or of its counterpart, already uses
    /// `name` ignoring case.
    pub fn is_name_taken(&self, parent: NodeRef, name: &str) -> bool {
        let taken_under = |node: NodeRef| {
            self.tree(node.side)
                .child_by_name_ignore_case(node.index, name)
                .is_some()
        };
        taken_under(parent) || self.counterpart(parent).is_some_and(taken_under)
    }
}

impl Default for ReplicaTrees {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(Error::InvalidInput(format!("Invalid node name: '{}'", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (ReplicaTree, NodeIdx, NodeIdx) {
        let mut tree = ReplicaTree::new(ReplicaSide::Local);
        let root = tree.root();
        let dir = tree
            .insert(root, Node::new_directory("docs").with_id("l1").with_db_id(2))
            .unwrap();
        let file = tree
            .insert(dir, Node::new_file("a.txt").with_id("l2").with_db_id(3))
            .unwrap();
        (tree, dir, file)
    }

    #[test]
    fn test_tree_creation() {
        let tree = ReplicaTree::new(ReplicaSide::Remote);
        let root = tree.node(tree.root()).unwrap();
        assert!(root.is_directory());
        assert_eq!(root.side(), ReplicaSide::Remote);
        assert!(tree.is_empty());
        assert_eq!(tree.path(tree.root()), Some(SyncPath::root()));
    }

    #[test]
    fn test_insert_and_lookup() {
        let (tree, dir, file) = sample();
        assert_eq!(tree.find_by_id("l2"), Some(file));
        assert_eq!(tree.find_by_db_id(DbNodeId(2)), Some(dir));
        assert_eq!(tree.path(file).unwrap().to_string_path(), "/docs/a.txt");
        assert_eq!(tree.child_by_name(dir, "a.txt"), Some(file));
        assert_eq!(tree.child_by_name_ignore_case(dir, "A.TXT"), Some(file));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_insert_rejects_duplicates_and_bad_parents() {
        let (mut tree, dir, file) = sample();
        assert!(matches!(
            tree.insert(dir, Node::new_file("b").with_id("l2")),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.insert(dir, Node::new_file("b").with_db_id(3)),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            tree.insert(file, Node::new_file("b")),
            Err(Error::InvalidTree(_))
        ));
        assert!(tree.insert(dir, Node::new_file("x/y")).is_err());
    }

    #[test]
    fn test_reparent_and_rename() {
        let (mut tree, dir, file) = sample();
        let root = tree.root();
        tree.reparent(file, root).unwrap();
        tree.rename(file, "b.txt").unwrap();

        assert_eq!(tree.path(file).unwrap().to_string_path(), "/b.txt");
        assert!(tree.children(dir).is_empty());
        assert!(tree.reparent(dir, dir).is_err());
        assert!(tree.validate().is_ok());
    }

    #[test]
    fn test_reparent_rejects_cycle() {
        let (mut tree, dir, _) = sample();
        let sub = tree.insert(dir, Node::new_directory("sub")).unwrap();
        assert!(tree.reparent(dir, sub).is_err());
        assert!(tree.is_ancestor(dir, sub));
    }

    #[test]
    fn test_remove_subtree() {
        let (mut tree, dir, file) = sample();
        assert_eq!(tree.remove_subtree(dir).unwrap(), 2);
        assert!(!tree.is_live(file));
        assert!(tree.find_by_id("l2").is_none());
        assert!(tree.find_by_db_id(DbNodeId(2)).is_none());
        assert!(tree.remove_subtree(tree.root()).is_err());
        assert_eq!(tree.path(file), None);
    }

    #[test]
    fn test_validate_delete_invariant() {
        let (mut tree, dir, file) = sample();
        tree.node_mut(dir).unwrap().add_event(ChangeEvents::DELETE);
        tree.node_mut(file).unwrap().add_event(ChangeEvents::DELETE);
        assert!(tree.validate().is_ok());

        tree.node_mut(file).unwrap().add_event(ChangeEvents::EDIT);
        assert!(matches!(tree.validate(), Err(Error::InvalidTree(_))));
    }

    #[test]
    fn test_deleted_ancestor_lookup() {
        let (mut tree, dir, file) = sample();
        assert_eq!(tree.deleted_ancestor_or_self(file), None);
        tree.node_mut(dir).unwrap().add_event(ChangeEvents::DELETE);
        assert_eq!(tree.deleted_ancestor_or_self(file), Some(dir));
    }

    #[test]
    fn test_counterpart_by_db_id() {
        let mut trees = ReplicaTrees::new();
        let local_root = trees.local.root();
        let remote_root = trees.remote.root();
        let l = trees
            .local
            .insert(local_root, Node::new_file("f").with_db_id(10))
            .unwrap();
        let r = trees
            .remote
            .insert(remote_root, Node::new_file("f").with_db_id(10))
            .unwrap();

        let local = NodeRef::new(ReplicaSide::Local, l);
        assert_eq!(trees.counterpart(local), Some(NodeRef::new(ReplicaSide::Remote, r)));
        assert_eq!(
            trees.counterpart(trees.root(ReplicaSide::Remote)),
            Some(trees.root(ReplicaSide::Local))
        );
    }

    #[test]
    fn test_name_taken_on_either_side() {
        let mut trees = ReplicaTrees::new();
        let remote_root = trees.remote.root();
        trees
            .remote
            .insert(remote_root, Node::new_file("Photo.JPG"))
            .unwrap();

        let local_root = trees.root(ReplicaSide::Local);
        assert!(trees.is_name_taken(local_root, "photo.jpg"));
        assert!(!trees.is_name_taken(local_root, "other.jpg"));
    }
}
