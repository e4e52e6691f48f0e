//! TwinSync reconciliation core
//!
//! This crate plans how two replicas of a folder tree converge:
//! - Replica trees with pending change events per node
//! - Platform naming rules and blacklisting of illegal nodes
//! - Conflict resolution with orphan rescue
//! - Safe ordering of planned operations, with cycle breaking

pub mod checker;
pub mod config;
pub mod conflict;
pub mod cycle;
pub mod engine;
mod filter;
pub mod node;
pub mod operation;
pub mod platform;
pub mod sorter;
pub mod stop;
pub mod tree;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use checker::{BlacklistRecord, CheckReport, PlatformInconsistencyChecker};
pub use config::ReconcileConfig;
pub use conflict::{
    Conflict, ConflictIssue, ConflictQueue, ConflictResolver, ConflictType, OrphanRegistry,
    Resolution, ResolverReport,
};
pub use cycle::{CycleFinder, Reordering};
pub use engine::{PassReport, Reconciler};
pub use node::{ChangeEvents, DbNodeId, MoveOrigin, Node, NodeIdx, NodeRef, NodeType};
pub use operation::{OpId, OperationKind, OperationType, SyncOperation, SyncOperationList};
pub use platform::{
    Clock, FixedClock, InconsistencyKind, NameGenerator, Platform, SuffixType, SystemClock,
};
pub use sorter::{OperationSorter, SortOutcome};
pub use stop::{StepOutcome, StopFlag};
pub use tree::{ReplicaTree, ReplicaTrees};
