//! Error types for orchestration.
//!
//! Errors are categorized so callers can tell template problems (nothing
//! happened yet) from provisioning problems (something happened and was
//! rolled back) and from conditions that need an operator.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Categories of orchestration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The template is invalid; no side effects happened
    Template,
    /// A provider call failed or timed out
    Provisioning,
    /// Another operation holds the stack lease
    Locked,
    /// Rollback itself failed; manual intervention required
    Rollback,
    /// A stack or change set does not exist
    NotFound,
    /// A change set no longer matches the stack it was planned against
    Conflict,
    /// The state store failed
    Storage,
    /// Engine invariant violated
    Internal,
}

impl ErrorCategory {
    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Template => "Invalid template",
            Self::Provisioning => "Provisioning failed",
            Self::Locked => "Stack is locked",
            Self::Rollback => "Rollback failed",
            Self::NotFound => "Not found",
            Self::Conflict => "Conflicting change",
            Self::Storage => "State store error",
            Self::Internal => "Internal error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Template => "Fix the template and plan again",
            Self::Provisioning => "Inspect the journal for the failing resource and apply again",
            Self::Locked => "Wait for the running operation to finish",
            Self::Rollback => {
                "Resolve the failing resource by hand, then run `recover` on the stack"
            }
            Self::NotFound => "Check the stack or change set identifier",
            Self::Conflict => "Plan again against the current stack",
            Self::Storage => "Check the state directory and its permissions",
            Self::Internal => "Report this as a bug",
        }
    }

    /// Process exit code for this category.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Template => 3,
            Self::Provisioning | Self::Rollback => 2,
            Self::Locked => 4,
            _ => 1,
        }
    }
}

/// Template-time errors. These are raised before any provisioning starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// Two resources share a logical identifier
    #[error("duplicate logical id: {0}")]
    DuplicateLogicalId(String),

    /// A reference points at an undeclared logical identifier
    #[error("{from} references undeclared resource {target}")]
    UnresolvedReference {
        /// Resource (or output) holding the reference
        from: String,
        /// Referenced logical id
        target: String,
    },

    /// The dependency graph contains a cycle
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// The shortest cycle found, first node repeated at the end
        cycle: Vec<String>,
    },

    /// A custom resource has no endpoint to send requests to
    #[error("custom resource {0} has no service token")]
    MissingServiceToken(String),

    /// No native provider handles this resource type
    #[error("no provider registered for type {resource_type} (resource {logical_id})")]
    UnknownResourceType {
        /// Declaring resource
        logical_id: String,
        /// The unhandled type tag
        resource_type: String,
    },

    /// The template could not be interpreted
    #[error("invalid template: {0}")]
    Invalid(String),
}

/// Errors reported by provider adapters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Transient failure worth retrying
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The physical resource does not exist
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The provider refused the request
    #[error("{0}")]
    Rejected(String),

    /// The call did not return within the bounded timeout
    #[error("provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Request could not be delivered to a custom provider
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Whether this error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Transport(_))
    }
}

/// Errors raised by a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure (database, filesystem)
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid template
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// A provider adapter call failed
    #[error("provider error on {logical_id}: {source}")]
    Provider {
        /// Resource being provisioned
        logical_id: String,
        /// Adapter failure
        #[source]
        source: ProviderError,
    },

    /// A custom provider never called back
    #[error("custom provider for {logical_id} did not respond before {deadline}")]
    ProviderTimeout {
        /// Resource being provisioned
        logical_id: String,
        /// The callback deadline that passed
        deadline: DateTime<Utc>,
    },

    /// Another operation holds the stack lease
    #[error("stack {0} is locked by another operation")]
    StackLocked(String),

    /// Rollback failed; the stack is left in ROLLBACK_FAILED
    #[error("rollback of stack {stack} failed at {logical_id}: {reason}")]
    RollbackFailure {
        /// Stack identifier
        stack: String,
        /// Resource whose inverse operation failed
        logical_id: String,
        /// Failure detail
        reason: String,
    },

    /// Stack does not exist
    #[error("stack not found: {0}")]
    StackNotFound(String),

    /// Change set does not exist
    #[error("change set not found: {0}")]
    ChangeSetNotFound(String),

    /// The stack moved on since the change set was planned
    #[error(
        "change set {id} was planned against version {planned} of stack {stack}, which is now at version {current}"
    )]
    StaleChangeSet {
        /// Change set identifier
        id: String,
        /// Stack identifier
        stack: String,
        /// Version the change set was planned against
        planned: u64,
        /// Current stack version
        current: u64,
    },

    /// The stack was left mid-run or in ROLLBACK_FAILED
    #[error("stack {0} has an unfinished run; run recover first")]
    NeedsRecovery(String),

    /// Operation was cancelled by the caller
    #[error("operation on {0} was cancelled")]
    Cancelled(String),

    /// A resource lifecycle transition that the state machine forbids
    #[error("illegal lifecycle transition for {logical_id}: {from} -> {to}")]
    IllegalTransition {
        /// Resource identifier
        logical_id: String,
        /// Current state
        from: String,
        /// Rejected target state
        to: String,
    },

    /// State store failure
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Other internal error
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Template(_) => ErrorCategory::Template,
            Error::Provider { .. } | Error::ProviderTimeout { .. } | Error::Cancelled(_) => {
                ErrorCategory::Provisioning
            }
            Error::StackLocked(_) => ErrorCategory::Locked,
            Error::RollbackFailure { .. } => ErrorCategory::Rollback,
            Error::StackNotFound(_) | Error::ChangeSetNotFound(_) => ErrorCategory::NotFound,
            Error::StaleChangeSet { .. } | Error::NeedsRecovery(_) => ErrorCategory::Conflict,
            Error::Store(_) => ErrorCategory::Storage,
            Error::IllegalTransition { .. } | Error::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the failure came from a timed-out provider.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ProviderTimeout { .. }
                | Error::Provider {
                    source: ProviderError::Timeout(_),
                    ..
                }
        )
    }

    pub(crate) fn provider(logical_id: &str, source: ProviderError) -> Self {
        Error::Provider {
            logical_id: logical_id.to_string(),
            source,
        }
    }
}

/// Short form used in journal records and status reasons.
pub(crate) struct Reason<'a>(pub &'a Error);

impl fmt::Display for Reason<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Error::Provider { source, .. } => write!(f, "{source}"),
            other => write!(f, "{other}"),
        }
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_names_path() {
        let err = TemplateError::CyclicDependency {
            cycle: vec!["A".into(), "B".into(), "A".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: A -> B -> A");
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let template: Error = TemplateError::DuplicateLogicalId("A".into()).into();
        let locked = Error::StackLocked("prod".into());
        let provisioning = Error::provider("A", ProviderError::Rejected("quota".into()));

        assert_eq!(template.category().exit_code(), 3);
        assert_eq!(locked.category().exit_code(), 4);
        assert_eq!(provisioning.category().exit_code(), 2);
    }

    #[test]
    fn test_provider_error_retryable() {
        assert!(ProviderError::Transient("throttled".into()).is_retryable());
        assert!(ProviderError::Transport("connection reset".into()).is_retryable());
        assert!(!ProviderError::Rejected("bad input".into()).is_retryable());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_timeout_detection() {
        let err = Error::ProviderTimeout {
            logical_id: "Hook".into(),
            deadline: Utc::now(),
        };
        assert!(err.is_timeout());
        assert!(Error::provider("A", ProviderError::Timeout(Duration::from_secs(5))).is_timeout());
        assert!(!Error::provider("A", ProviderError::NotFound("x".into())).is_timeout());
    }
}
