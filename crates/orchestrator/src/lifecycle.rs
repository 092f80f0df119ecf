//! Per-resource lifecycle state machine
//!
//! ```text
//! Pending -> InProgress -> Complete | Failed
//! Pending -> CreatingReplacement -> AwaitingDeletion -> Complete
//! ```

use crate::error::{Error, Result};
use crate::types::ResourceStatus;

impl ResourceStatus {
    /// Whether the state machine allows moving to `next`
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        use ResourceStatus::{AwaitingDeletion, Complete, CreatingReplacement, Failed, InProgress, Pending};

        matches!(
            (self, next),
            (Pending, InProgress | CreatingReplacement | Failed)
                | (InProgress, Complete | Failed)
                | (CreatingReplacement, AwaitingDeletion | Failed)
                | (AwaitingDeletion, Complete | Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceStatus::Complete | ResourceStatus::Failed)
    }
}

/// Tracks one resource through a run
#[derive(Debug, Clone)]
pub struct Lifecycle {
    logical_id: String,
    status: ResourceStatus,
}

impl Lifecycle {
    pub fn new(logical_id: &str) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            status: ResourceStatus::Pending,
        }
    }

    /// Continue tracking a resource from a recorded status
    pub fn resume(logical_id: &str, status: ResourceStatus) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            status,
        }
    }

    pub fn status(&self) -> ResourceStatus {
        self.status
    }

    /// Move to `next`, rejecting transitions the machine forbids
    pub fn advance(&mut self, next: ResourceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                logical_id: self.logical_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("{}: {} -> {}", self.logical_id, self.status, next);
        self.status = next;
        Ok(())
    }

    /// Record a provider failure from any non-terminal state
    pub fn fail(&mut self) -> Result<()> {
        self.advance(ResourceStatus::Failed)
    }
}
