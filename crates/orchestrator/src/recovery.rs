//! Crash recovery
//!
//! A run that died leaves intents without outcomes. Recovery asks each
//! provider what actually happened, journals the answer, and then finishes
//! the run the only safe way: an interrupted apply is rolled back, an
//! interrupted destroy is resumed.

use crate::context::ProgressCallback;
use crate::error::{ProviderError, Result};
use crate::executor::Runner;
use crate::journal;
use crate::model::{Operation, Stack};
use crate::properties::Properties;
use crate::provider::{call_with_timeout, ResourceProvider};
use crate::rollback;
use crate::types::{OperationKind, OperationResult, Phase, ProviderKind, RunReport, StackStatus};
use std::sync::Arc;
use std::time::Duration;

/// Settle every intent of the stack's last run that has no outcome.
///
/// Returns the reconciled outcomes as journaled.
pub(crate) fn reconcile(runner: &Runner<'_>, timeout: Duration) -> Result<Vec<Operation>> {
    let entries = runner.journal.run_entries()?;
    let unsettled = journal::unsettled_intents(&entries, runner.run_id());
    if unsettled.is_empty() {
        return Ok(Vec::new());
    }
    log::warn!(
        "stack {}: reconciling {} interrupted call(s) of run {}",
        runner.stack_id(),
        unsettled.len(),
        runner.run_id()
    );

    let mut reconciled = Vec::with_capacity(unsettled.len());
    for intent in unsettled {
        let provider = match intent.provider {
            ProviderKind::Native => runner.providers.get(&intent.resource_type),
            ProviderKind::Custom => None,
        };
        let (result, physical_id, outputs) = match provider {
            Some(provider) => ask(provider, &intent, timeout),
            None => (
                failed(match intent.provider {
                    ProviderKind::Custom => "outcome of custom provider call unknown after interruption".to_string(),
                    ProviderKind::Native => format!("no provider registered for {}", intent.resource_type),
                }),
                None,
                Properties::new(),
            ),
        };
        log::info!(
            "reconciled {} {}: {}",
            intent.kind,
            intent.logical_id,
            if result.is_success() { "applied" } else { "not applied" }
        );
        reconciled.push(runner.journal.append(intent.recovered(result, physical_id, outputs))?);
    }
    Ok(reconciled)
}

fn failed(reason: String) -> OperationResult {
    OperationResult::Failed { reason }
}

/// Ask a native provider whether an interrupted call took effect
fn ask(
    provider: Arc<dyn ResourceProvider>,
    intent: &Operation,
    timeout: Duration,
) -> (OperationResult, Option<String>, Properties) {
    match intent.kind {
        OperationKind::Create => {
            let token = intent.idempotency_token.clone();
            match call_with_timeout(timeout, move || provider.find_by_token(&token)) {
                Ok(Some(found)) => (OperationResult::Succeeded, Some(found.physical_id), found.outputs),
                Ok(None) => (failed("create did not take effect".to_string()), None, Properties::new()),
                Err(e) => (failed(e.to_string()), None, Properties::new()),
            }
        }
        OperationKind::Update => {
            let Some(physical_id) = intent.physical_id.clone() else {
                return (failed("update has no physical id".to_string()), None, Properties::new());
            };
            let declared = intent.properties.clone().unwrap_or_default();
            let id = physical_id.clone();
            match call_with_timeout(timeout, move || provider.read(&id)) {
                Ok(Some(actual)) if declared.iter().all(|(k, v)| actual.get(k) == Some(v)) => {
                    (OperationResult::Succeeded, Some(physical_id), Properties::new())
                }
                Ok(Some(_)) => (failed("update did not take effect".to_string()), None, Properties::new()),
                Ok(None) => (failed(format!("{physical_id} no longer exists")), None, Properties::new()),
                Err(e) => (failed(e.to_string()), None, Properties::new()),
            }
        }
        OperationKind::Delete => {
            let Some(physical_id) = intent.physical_id.clone() else {
                return (OperationResult::Succeeded, None, Properties::new());
            };
            let id = physical_id.clone();
            match call_with_timeout(timeout, move || provider.read(&id)) {
                Ok(None) | Err(ProviderError::NotFound(_)) => (OperationResult::Succeeded, Some(physical_id), Properties::new()),
                Ok(Some(_)) => (failed("delete did not take effect".to_string()), None, Properties::new()),
                Err(e) => (failed(e.to_string()), None, Properties::new()),
            }
        }
    }
}

/// Drop records that the interrupted destroy already deleted
pub(crate) fn prune_destroyed(runner: &Runner<'_>, stack: &mut Stack) -> Result<()> {
    let entries = runner.journal.run_entries()?;
    for call in journal::calls(&entries, runner.run_id()) {
        if call.intent.phase == Phase::Destroy && call.succeeded() {
            stack.resources.remove(&call.intent.logical_id);
        }
    }
    Ok(())
}

/// Roll back the stack's last run after reconciliation
pub(crate) fn resume_rollback(
    runner: &Runner<'_>,
    stack: &mut Stack,
    progress: &mut dyn ProgressCallback,
) -> Result<RunReport> {
    let reason = stack
        .status_reason
        .clone()
        .unwrap_or_else(|| format!("run {} was interrupted", runner.run_id()));
    progress.on_rollback_start(&reason);
    stack.transition(StackStatus::RollbackInProgress);
    runner.store.save_stack(stack)?;

    let mut report = RunReport::new(&stack.id, runner.run_id(), StackStatus::RollbackInProgress);
    match rollback::roll_back(runner, stack, progress) {
        Ok(outcome) => {
            report.rolled_back = outcome.rolled_back;
            report.unrecoverable = outcome.unrecoverable;
            report.status = StackStatus::RollbackComplete;
            stack.settle(StackStatus::RollbackComplete, Some(reason));
            runner.store.save_stack(stack)?;
            log::info!("stack {} recovered: {}", stack.id, report.status);
            Ok(report)
        }
        Err(e) => {
            stack.halt(StackStatus::RollbackFailed, Some(e.to_string()));
            runner.store.save_stack(stack)?;
            Err(e)
        }
    }
}
