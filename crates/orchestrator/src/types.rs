//! Core status, option and report types

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upper bound on how long the engine waits for a custom provider callback
pub const MAX_CALLBACK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Lifecycle status of a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    UpdateInProgress,
    UpdateComplete,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    DeleteInProgress,
    DeleteComplete,
    Failed,
}

impl StackStatus {
    /// Wire and display name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::Failed => "FAILED",
        }
    }

    /// An operation is running (or was interrupted while running)
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::CreateInProgress
                | Self::UpdateInProgress
                | Self::RollbackInProgress
                | Self::DeleteInProgress
        )
    }

    /// The last operation did not reach its target state
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RollbackComplete | Self::RollbackFailed | Self::Failed
        )
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a single resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    #[default]
    Pending,
    InProgress,
    CreatingReplacement,
    AwaitingDeletion,
    Complete,
    Failed,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "Pending",
            Self::InProgress => "InProgress",
            Self::CreatingReplacement => "CreatingReplacement",
            Self::AwaitingDeletion => "AwaitingDeletion",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Who provisions a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process adapter registered with the engine
    #[default]
    Native,
    /// External endpoint reached through the callback gateway
    Custom,
}

/// Kind of provider call recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// Part of a run that produced a journal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Forward batches of an apply
    Forward,
    /// Deletion of replaced and removed resources after forward batches
    Cleanup,
    /// Inverse operations after a failure
    Rollback,
    /// Teardown of a whole stack
    Destroy,
    /// Outcomes reconciled after a crash
    Recovery,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Forward => "forward",
            Self::Cleanup => "cleanup",
            Self::Rollback => "rollback",
            Self::Destroy => "destroy",
            Self::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// Result recorded for a journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    /// Intent written before dispatch
    Pending,
    Succeeded,
    Failed { reason: String },
}

impl OperationResult {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Worker pool size
    pub jobs: usize,
    /// Bound on a single native provider call
    pub provider_timeout: Duration,
    /// How long rollback waits for timed-out native calls that are still
    /// running before it looks for what they created
    pub abandoned_call_grace: Duration,
    /// How long a custom provider has to call back
    pub callback_timeout: Duration,
    /// How often the sweeper expires overdue callbacks
    pub sweep_interval: Duration,
    /// How long resolved callbacks are kept to recognise late duplicates
    pub callback_retention: Duration,
    /// Backoff for transient native provider errors
    pub retry: RetryConfig,
    /// Where custom providers send their responses
    pub response_url: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            provider_timeout: Duration::from_secs(300),
            abandoned_call_grace: Duration::from_secs(60),
            callback_timeout: MAX_CALLBACK_TIMEOUT,
            sweep_interval: Duration::from_secs(1),
            callback_retention: Duration::from_secs(600),
            retry: RetryConfig::default(),
            response_url: "http://127.0.0.1:8787/v1/callbacks".to_string(),
        }
    }
}

impl EngineOptions {
    /// Set the callback timeout, capped at one hour.
    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        if timeout > MAX_CALLBACK_TIMEOUT {
            log::warn!(
                "callback timeout of {}s exceeds the maximum, using {}s",
                timeout.as_secs(),
                MAX_CALLBACK_TIMEOUT.as_secs()
            );
        }
        self.callback_timeout = timeout.min(MAX_CALLBACK_TIMEOUT);
        self
    }
}

/// Counts of what a run changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl RunSummary {
    /// Total number of successful changes
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }
}

/// The resource that stopped a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFailure {
    pub logical_id: String,
    pub reason: String,
    /// The failure was a provider or callback timeout
    pub timed_out: bool,
}

/// Outcome of an apply, destroy or recover run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub stack_id: String,
    pub run_id: String,
    pub status: StackStatus,
    pub summary: RunSummary,
    pub failure: Option<ResourceFailure>,
    /// Logical ids whose changes were undone, in inverse order
    pub rolled_back: Vec<String>,
    /// Logical ids whose committed deletes could not be undone
    pub unrecoverable: Vec<String>,
}

impl RunReport {
    pub(crate) fn new(stack_id: &str, run_id: &str, status: StackStatus) -> Self {
        Self {
            stack_id: stack_id.to_string(),
            run_id: run_id.to_string(),
            status,
            summary: RunSummary::default(),
            failure: None,
            rolled_back: Vec::new(),
            unrecoverable: Vec::new(),
        }
    }

    /// Check if the run reached its target state
    pub fn is_success(&self) -> bool {
        !self.status.is_failure()
    }
}
