//! Command implementations
//!
//! - `stack` - commands that change a stack: plan, apply, destroy, recover,
//!   discard, unlock
//! - `inspect` - read-only views: status, journal, drift

pub mod inspect;
pub mod stack;

use chrono::{DateTime, Local, Utc};
use orchestrator::{ErrorCategory, RunReport};
use std::process::ExitCode;

/// Exit code for a run that ended in a failure state
pub fn exit_for(report: &RunReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        exit_code(ErrorCategory::Provisioning.exit_code())
    }
}

pub fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// First 8 characters of an identifier, for tables
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Timestamp in the local timezone
pub fn local_time(at: &DateTime<Utc>, format: &str) -> String {
    at.with_timezone(&Local).format(format).to_string()
}
