//! Reconciliation pass that chains the checker, the resolver and the sorter.

use serde::Serialize;
use tracing::{debug, info};

use crate::checker::{BlacklistRecord, PlatformInconsistencyChecker};
use crate::config::ReconcileConfig;
use crate::conflict::{ConflictIssue, ConflictQueue, ConflictResolver};
use crate::operation::{OpId, SyncOperationList};
use crate::platform::{Clock, NameGenerator, SystemClock};
use crate::sorter::OperationSorter;
use crate::stop::{StepOutcome, StopFlag};
use crate::tree::ReplicaTrees;
use twinsync_common::ReplicaSide;

/// What one pass did.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub outcome: StepOutcome,
    pub blacklisted: Vec<BlacklistRecord>,
    /// Operations dropped because their nodes were blacklisted.
    pub purged_ops: usize,
    pub resolved_conflicts: usize,
    pub skipped_conflicts: usize,
    pub issues: Vec<ConflictIssue>,
    pub order_changed: bool,
    pub broken_cycle_ops: Vec<OpId>,
}

impl PassReport {
    fn new() -> Self {
        Self {
            outcome: StepOutcome::Completed,
            blacklisted: Vec::new(),
            purged_ops: 0,
            resolved_conflicts: 0,
            skipped_conflicts: 0,
            issues: Vec::new(),
            order_changed: false,
            broken_cycle_ops: Vec::new(),
        }
    }

    fn cancelled(mut self) -> Self {
        self.outcome = StepOutcome::Cancelled;
        self
    }
}

/// Runs reconciliation passes for one pair of replicas.
pub struct Reconciler {
    checker: PlatformInconsistencyChecker,
    resolver: ConflictResolver,
    sorter: OperationSorter,
    stop: StopFlag,
}

impl Reconciler {
    /// Create a reconciler on the wall clock.
    pub fn new(config: &ReconcileConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    /// Create a reconciler whose generated names use `clock`.
    pub fn with_clock<C: Clock + Clone + 'static>(config: &ReconcileConfig, clock: C) -> Self {
        let stop = StopFlag::new();
        let names = |seed: Option<u64>| {
            NameGenerator::new(Box::new(clock.clone()), seed).with_random_len(config.suffix_random_len)
        };

        Self {
            checker: PlatformInconsistencyChecker::new(config.platform, &config.sync_root, stop.clone()),
            resolver: ConflictResolver::new(names(config.name_seed), stop.clone()),
            sorter: OperationSorter::new(names(config.name_seed.map(|s| s.wrapping_add(1))), stop.clone())
                .with_max_rounds(config.max_sort_rounds),
            stop,
        }
    }

    /// Flag shared by every stage; request a stop from any thread.
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Run one pass over the trees, the detected conflicts and the planned
    /// operations.
    ///
    /// Resolved operations are appended to `ops`, which ends up sorted. On
    /// cancellation the report says so and the unprocessed conflicts stay
    /// queued.
    pub fn run_pass(
        &mut self,
        trees: &mut ReplicaTrees,
        conflicts: &mut ConflictQueue,
        ops: &mut SyncOperationList,
    ) -> PassReport {
        let mut report = PassReport::new();
        info!(
            "Reconciliation pass: {} conflict(s), {} operation(s)",
            conflicts.len(),
            ops.len()
        );

        for side in [ReplicaSide::Local, ReplicaSide::Remote] {
            let check = self.checker.check_tree(trees, side);
            report.blacklisted.extend(check.blacklisted);
            if check.outcome == StepOutcome::Cancelled {
                return report.cancelled();
            }
        }

        let before = ops.len();
        ops.retain(|op| {
            trees.is_live(op.affected()) && op.corresponding().map_or(true, |c| trees.is_live(c))
        });
        report.purged_ops = before - ops.len();
        if report.purged_ops > 0 {
            debug!("Dropped {} operation(s) on blacklisted nodes", report.purged_ops);
        }

        let resolved = self.resolver.resolve_all(trees, conflicts, ops);
        report.resolved_conflicts = resolved.resolved;
        report.skipped_conflicts = resolved.skipped;
        report.issues = resolved.issues;
        if resolved.outcome == StepOutcome::Cancelled {
            return report.cancelled();
        }

        let sorted = self.sorter.sort(trees, ops);
        report.order_changed = sorted.order_changed;
        report.broken_cycle_ops = sorted.broken_cycle_ops;
        if sorted.outcome == StepOutcome::Cancelled {
            return report.cancelled();
        }

        info!(
            "Reconciliation pass done: {} blacklisted, {} conflict(s) resolved, {} operation(s) planned",
            report.blacklisted.len(),
            report.resolved_conflicts,
            ops.len()
        );
        report
    }
}
