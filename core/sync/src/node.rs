//! Replica tree nodes and their pending change events.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use twinsync_common::{ReplicaSide, SyncPath};

/// Identifier of a node in the database of synchronized state.
///
/// Both replicas share the same database id for a pair of corresponding nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DbNodeId(pub u64);

impl DbNodeId {
    /// Database id of both replica roots.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for DbNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Directory,
}

bitflags! {
    /// Set of change events recorded on a node since the last reconciled state.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ChangeEvents: u8 {
        const CREATE = 1 << 0;
        const EDIT = 1 << 1;
        const MOVE = 1 << 2;
        const DELETE = 1 << 3;
    }
}

/// Where a moved node was before its pending Move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveOrigin {
    /// Relative path before the move.
    pub path: SyncPath,
    /// Database id of the parent before the move.
    pub parent_db_id: Option<DbNodeId>,
}

impl MoveOrigin {
    /// Name the node carried before the move.
    pub fn name(&self) -> Option<&str> {
        self.path.name()
    }
}

/// Index of a node inside its replica tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(pub(crate) u32);

impl NodeIdx {
    pub(crate) fn slot(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a node on a given side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub side: ReplicaSide,
    pub index: NodeIdx,
}

impl NodeRef {
    pub fn new(side: ReplicaSide, index: NodeIdx) -> Self {
        Self { side, index }
    }
}

/// One filesystem entry on one replica.
///
/// Structure (parent and children) is owned by the [`ReplicaTree`]; build a
/// node with the constructors below and hand it to
/// [`ReplicaTree::insert`](crate::tree::ReplicaTree::insert).
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) side: ReplicaSide,
    pub(crate) id: Option<String>,
    pub(crate) db_id: Option<DbNodeId>,
    pub(crate) name: String,
    pub(crate) node_type: NodeType,
    pub(crate) parent: Option<NodeIdx>,
    pub(crate) children: Vec<NodeIdx>,
    pub(crate) events: ChangeEvents,
    pub(crate) move_origin: Option<MoveOrigin>,
}

impl Node {
    /// Create a new file node.
    pub fn new_file(name: impl Into<String>) -> Self {
        Self::new(name, NodeType::File)
    }

    /// Create a new directory node.
    pub fn new_directory(name: impl Into<String>) -> Self {
        Self::new(name, NodeType::Directory)
    }

    fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            // Overwritten by the tree on insertion.
            side: ReplicaSide::Local,
            id: None,
            db_id: None,
            name: name.into(),
            node_type,
            parent: None,
            children: Vec::new(),
            events: ChangeEvents::empty(),
            move_origin: None,
        }
    }

    /// Set the replica id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the database id.
    pub fn with_db_id(mut self, db_id: u64) -> Self {
        self.db_id = Some(DbNodeId(db_id));
        self
    }

    /// Add pending change events.
    pub fn with_events(mut self, events: ChangeEvents) -> Self {
        self.events.insert(events);
        self
    }

    /// Record a pending move and where it came from.
    pub fn with_move_origin(mut self, path: SyncPath, parent_db_id: Option<u64>) -> Self {
        self.events.insert(ChangeEvents::MOVE);
        self.move_origin = Some(MoveOrigin {
            path,
            parent_db_id: parent_db_id.map(DbNodeId),
        });
        self
    }

    pub fn side(&self) -> ReplicaSide {
        self.side
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn db_id(&self) -> Option<DbNodeId> {
        self.db_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn parent(&self) -> Option<NodeIdx> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIdx] {
        &self.children
    }

    pub fn events(&self) -> ChangeEvents {
        self.events
    }

    pub fn has_event(&self, event: ChangeEvents) -> bool {
        self.events.contains(event)
    }

    /// True if any change event is pending.
    pub fn has_change_event(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn move_origin(&self) -> Option<&MoveOrigin> {
        self.move_origin.as_ref()
    }

    pub fn add_event(&mut self, event: ChangeEvents) {
        self.events.insert(event);
    }

    pub fn clear_event(&mut self, event: ChangeEvents) {
        self.events.remove(event);
        if !self.events.contains(ChangeEvents::MOVE) {
            self.move_origin = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_events_set() {
        let mut events = ChangeEvents::CREATE | ChangeEvents::MOVE;
        assert!(events.contains(ChangeEvents::CREATE));
        assert!(events.intersects(ChangeEvents::MOVE | ChangeEvents::DELETE));
        assert!(!events.contains(ChangeEvents::DELETE));

        events.remove(ChangeEvents::CREATE);
        assert_eq!(events, ChangeEvents::MOVE);
        events.remove(ChangeEvents::MOVE);
        assert!(events.is_empty());
    }

    #[test]
    fn test_change_events_serialize_as_names() {
        let events = ChangeEvents::CREATE | ChangeEvents::MOVE;
        let json = serde_json::to_string(&events).unwrap();
        assert_eq!(json, "\"CREATE | MOVE\"");
        let parsed: ChangeEvents = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, events);
    }

    #[test]
    fn test_move_origin_sets_move_event() {
        let node = Node::new_file("b.txt")
            .with_db_id(7)
            .with_move_origin(SyncPath::parse("/a.txt").unwrap(), Some(1));

        assert!(node.has_event(ChangeEvents::MOVE));
        assert_eq!(node.move_origin().unwrap().name(), Some("a.txt"));
        assert_eq!(node.move_origin().unwrap().parent_db_id, Some(DbNodeId::ROOT));
    }

    #[test]
    fn test_clearing_move_drops_origin() {
        let mut node = Node::new_directory("d")
            .with_move_origin(SyncPath::parse("/c").unwrap(), None);
        node.clear_event(ChangeEvents::MOVE);
        assert!(node.move_origin().is_none());
        assert!(!node.has_change_event());
    }
}
