//! Run context: progress reporting and cancellation
//!
//! These let the engine report to a terminal (or anything else) without
//! depending on a particular UI.

use crate::types::{OperationKind, OperationResult, Phase};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Progress callback for run execution
///
/// Implement this trait to receive progress updates during apply, destroy,
/// rollback and recovery.
pub trait ProgressCallback: Send {
    /// Called once a run has planned its work
    fn on_run_start(&mut self, stack_id: &str, run_id: &str, total: usize);

    /// Called when a batch of a phase is dispatched
    fn on_batch_start(&mut self, phase: Phase, batch: usize, logical_ids: &[String]);

    /// Called when a provider call for a resource is dispatched
    fn on_resource_start(&mut self, logical_id: &str, kind: OperationKind);

    /// Called when a provider call for a resource settles
    fn on_resource_complete(&mut self, logical_id: &str, kind: OperationKind, result: &OperationResult);

    /// Called when a failure switches the run into rollback
    fn on_rollback_start(&mut self, reason: &str);

    /// Called when the run reaches a terminal state
    fn on_run_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_run_start(&mut self, _stack_id: &str, _run_id: &str, _total: usize) {}
    fn on_batch_start(&mut self, _phase: Phase, _batch: usize, _logical_ids: &[String]) {}
    fn on_resource_start(&mut self, _logical_id: &str, _kind: OperationKind) {}
    fn on_resource_complete(&mut self, _logical_id: &str, _kind: OperationKind, _result: &OperationResult) {}
    fn on_rollback_start(&mut self, _reason: &str) {}
    fn on_run_complete(&mut self) {}
}

/// Cooperative cancellation flag shared between a caller and a run
///
/// Workers check the flag before calling a provider. Calls already in
/// flight complete; the run then rolls back.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
