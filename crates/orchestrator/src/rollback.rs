//! Inverse execution of a failed run
//!
//! Rollback reads the run's journal rather than the stack record: every
//! forward call that succeeded is undone, newest batch first. Calls whose
//! inverse already succeeded (a rollback interrupted by a crash) are
//! skipped, so rolling back twice converges.

use crate::context::ProgressCallback;
use crate::error::{Error, Reason, Result};
use crate::executor::{Runner, Task};
use crate::journal::{self, idempotency_token, Call};
use crate::model::{ResourceRecord, Stack};
use crate::provider::call_with_timeout;
use crate::types::{OperationKind, Phase, ProviderKind, ResourceStatus};
use std::collections::{BTreeMap, BTreeSet};

/// What a completed rollback did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Logical ids whose changes were undone, in inverse order
    pub rolled_back: Vec<String>,
    /// Logical ids whose committed deletes could not be undone
    pub unrecoverable: Vec<String>,
}

/// How an inverse call folds back into the stack
enum Undo {
    /// A resource created by the run; deleting it is enough
    Created,
    /// A replacement; the pre-run record comes back
    Replaced,
    Updated,
    /// A create journaled as failed that took effect after its timeout
    Orphaned,
}

struct Inverse {
    task: Task,
    undo: Undo,
}

/// Physical id a native provider holds for a create's idempotency token
fn find_created(runner: &Runner<'_>, call: &Call) -> Result<Option<String>> {
    let intent = &call.intent;
    let Some(provider) = runner.providers.get(&intent.resource_type) else {
        return Ok(None);
    };
    let token = intent.idempotency_token.clone();
    match call_with_timeout(runner.options().provider_timeout, move || provider.find_by_token(&token)) {
        Ok(found) => Ok(found.map(|p| p.physical_id)),
        Err(e) => Err(Error::RollbackFailure {
            stack: runner.stack_id().to_string(),
            logical_id: intent.logical_id.clone(),
            reason: format!("could not check whether the failed create took effect: {e}"),
        }),
    }
}

/// Token for the inverse of a forward call
fn inverse_token(stack_id: &str, forward: &Call, kind: OperationKind) -> String {
    let scope = format!("rollback/{}", forward.intent.idempotency_token);
    idempotency_token(stack_id, &forward.intent.logical_id, &scope, kind)
}

/// Undo the successful forward calls of the stack's current run.
///
/// On success the stack's resources, outputs and template hash are the
/// pre-run snapshot, adjusted for deletes that were already committed.
/// The caller settles and saves the stack.
pub(crate) fn roll_back(runner: &Runner<'_>, stack: &mut Stack, progress: &mut dyn ProgressCallback) -> Result<RollbackOutcome> {
    let snapshot = stack
        .snapshot
        .clone()
        .ok_or_else(|| Error::Internal(format!("stack {} has no pre-run snapshot to roll back to", stack.id)))?;
    let entries = runner.journal.run_entries()?;
    let calls = journal::calls(&entries, runner.run_id());

    let undone: BTreeSet<&str> = calls
        .iter()
        .filter(|c| c.intent.phase == Phase::Rollback && c.succeeded())
        .map(|c| c.intent.idempotency_token.as_str())
        .collect();

    // Old physical ids superseded during this run
    let superseded: BTreeMap<String, String> = calls
        .iter()
        .filter(|c| c.intent.phase == Phase::Forward && c.succeeded())
        .filter_map(|c| {
            let replaced = c
                .intent
                .replaced_physical_id
                .clone()
                .or_else(|| c.outcome.as_ref().and_then(|o| o.replaced_physical_id.clone()))?;
            Some((replaced, c.intent.logical_id.clone()))
        })
        .collect();

    // Cleanup deletes that went through cannot be undone
    let mut outcome = RollbackOutcome::default();
    let mut retired_gone: BTreeSet<String> = BTreeSet::new();
    let mut removed_gone: BTreeSet<String> = BTreeSet::new();
    for call in calls.iter().filter(|c| c.intent.phase == Phase::Cleanup && c.succeeded()) {
        let id = call.intent.logical_id.clone();
        match call.intent.physical_id.as_ref() {
            Some(physical) if superseded.contains_key(physical) => {
                retired_gone.insert(id.clone());
            }
            _ => {
                removed_gone.insert(id.clone());
            }
        }
        log::warn!("stack {}: delete of {id} was committed and cannot be rolled back", stack.id);
        outcome.unrecoverable.push(id);
    }

    let mut groups: BTreeMap<usize, Vec<Inverse>> = BTreeMap::new();
    for call in calls.iter().filter(|c| c.intent.phase == Phase::Forward && c.succeeded()) {
        let intent = &call.intent;
        let Some(physical_id) = call.physical_id().map(str::to_string) else {
            continue;
        };
        let replaced = intent.replaced_physical_id.is_some()
            || call.outcome.as_ref().is_some_and(|o| o.replaced_physical_id.is_some());

        let (kind, undo) = match intent.kind {
            OperationKind::Create if replaced => (OperationKind::Delete, Undo::Replaced),
            OperationKind::Create => (OperationKind::Delete, Undo::Created),
            OperationKind::Update if replaced => (OperationKind::Delete, Undo::Replaced),
            OperationKind::Update => (OperationKind::Update, Undo::Updated),
            OperationKind::Delete => continue,
        };
        if matches!(undo, Undo::Replaced) && retired_gone.contains(&intent.logical_id) {
            // The old resource is gone; the replacement stays
            continue;
        }

        let token = inverse_token(&stack.id, call, kind);
        if undone.contains(token.as_str()) {
            log::debug!("{} {} already rolled back", intent.kind, intent.logical_id);
            continue;
        }

        let service_token = stack
            .resources
            .get(&intent.logical_id)
            .or_else(|| snapshot.resources.get(&intent.logical_id))
            .and_then(|r| r.service_token.clone());
        let target = runner.target_for(
            &intent.logical_id,
            &intent.resource_type,
            intent.provider,
            service_token.as_deref(),
        )?;

        let task = match kind {
            OperationKind::Update => Task::update(
                &intent.logical_id,
                &intent.resource_type,
                target,
                physical_id,
                intent.properties.clone().unwrap_or_default(),
                intent.previous.clone().unwrap_or_default(),
                token,
            ),
            _ => Task::delete(&intent.logical_id, &intent.resource_type, target, physical_id, token),
        };
        groups.entry(intent.batch).or_default().push(Inverse {
            task: task.not_cancellable(),
            undo,
        });
    }

    // Creates that failed (usually by timing out) may still have gone through
    runner.await_stragglers();
    for call in calls.iter().filter(|c| {
        c.intent.phase == Phase::Forward
            && c.intent.kind == OperationKind::Create
            && c.intent.provider == ProviderKind::Native
            && c.outcome.is_some()
            && !c.succeeded()
    }) {
        let intent = &call.intent;
        let token = inverse_token(&stack.id, call, OperationKind::Delete);
        if undone.contains(token.as_str()) {
            continue;
        }
        let Some(physical_id) = find_created(runner, call)? else {
            continue;
        };
        log::warn!(
            "stack {}: failed create of {} left {physical_id} behind; deleting it",
            stack.id,
            intent.logical_id
        );
        let target = runner.target_for(&intent.logical_id, &intent.resource_type, intent.provider, None)?;
        groups.entry(intent.batch).or_default().push(Inverse {
            task: Task::delete(&intent.logical_id, &intent.resource_type, target, physical_id, token)
                .not_cancellable(),
            undo: Undo::Orphaned,
        });
    }

    let mut kept = Vec::new();
    for (batch, inverses) in groups.into_iter().rev() {
        let mut undo_by_id = BTreeMap::new();
        let tasks = inverses
            .into_iter()
            .map(|inverse| {
                undo_by_id.insert(inverse.task.logical_id.clone(), inverse.undo);
                inverse.task
            })
            .collect();

        for done in runner.dispatch(Phase::Rollback, batch, tasks, progress)? {
            let id = done.task.logical_id.clone();
            if let Err(e) = &done.result {
                log::error!("stack {}: rollback of {id} failed: {e}", stack.id);
                if let Some(record) = stack.resources.get_mut(&id) {
                    record.status = ResourceStatus::Failed;
                }
                return Err(Error::RollbackFailure {
                    stack: stack.id.clone(),
                    logical_id: id,
                    reason: Reason(e).to_string(),
                });
            }
            if let Some(Undo::Created) = undo_by_id.get(&id) {
                stack.resources.remove(&id);
            }
            outcome.rolled_back.push(id);
        }
    }

    for id in &retired_gone {
        if let Some(record) = stack.resources.get(id) {
            kept.push(ResourceRecord {
                status: ResourceStatus::Complete,
                ..record.clone()
            });
        }
    }

    let mut resources = snapshot.resources;
    for id in &removed_gone {
        resources.remove(id);
    }
    for record in kept {
        resources.insert(record.logical_id.clone(), record);
    }
    stack.resources = resources;
    stack.outputs = snapshot.outputs;
    stack.template_hash = snapshot.template_hash;

    log::info!(
        "stack {}: rolled back {} change(s), {} unrecoverable",
        stack.id,
        outcome.rolled_back.len(),
        outcome.unrecoverable.len()
    );
    Ok(outcome)
}
