//! Operation journal
//!
//! Every provider call is bracketed by two entries: an intent (`Pending`)
//! appended before dispatch and an outcome appended as soon as the result
//! arrives. Entries are never modified. Recovery and drift detection read
//! the journal back through the helpers in this module.

use crate::error::Result;
use crate::model::Operation;
use crate::properties::Properties;
use crate::store::StackStore;
use crate::types::{OperationKind, OperationResult};
use std::collections::BTreeMap;

/// Append-only writer for one run of one stack
pub struct Journal<'a> {
    store: &'a dyn StackStore,
    stack_id: String,
    run_id: String,
}

impl<'a> Journal<'a> {
    pub fn new(store: &'a dyn StackStore, stack_id: &str, run_id: &str) -> Self {
        Self {
            store,
            stack_id: stack_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Append an intent, returning it with its sequence number
    pub fn record_intent(&self, intent: Operation) -> Result<Operation> {
        let mut intent = intent;
        intent.sequence = self.store.append_operation(&intent)?;
        log::debug!(
            "journal #{}: intent {} {} ({} batch {})",
            intent.sequence,
            intent.kind,
            intent.logical_id,
            intent.phase,
            intent.batch
        );
        Ok(intent)
    }

    /// Append the outcome of a previously recorded intent
    pub fn record_outcome(
        &self,
        intent: &Operation,
        result: OperationResult,
        physical_id: Option<String>,
        outputs: Properties,
    ) -> Result<Operation> {
        let mut outcome = intent.outcome(result, physical_id, outputs);
        outcome.sequence = self.store.append_operation(&outcome)?;
        log::debug!(
            "journal #{}: outcome {} {} -> {:?}",
            outcome.sequence,
            outcome.kind,
            outcome.logical_id,
            outcome.result
        );
        Ok(outcome)
    }

    /// Append an already-built outcome (used by recovery)
    pub fn append(&self, entry: Operation) -> Result<Operation> {
        let mut entry = entry;
        entry.sequence = self.store.append_operation(&entry)?;
        Ok(entry)
    }

    /// Entries of this run in append order
    pub fn run_entries(&self) -> Result<Vec<Operation>> {
        Ok(self
            .store
            .operations(&self.stack_id)?
            .into_iter()
            .filter(|op| op.run_id == self.run_id)
            .collect())
    }
}

/// An intent paired with its outcome, if one was written
#[derive(Debug, Clone)]
pub struct Call {
    pub intent: Operation,
    pub outcome: Option<Operation>,
}

impl Call {
    pub fn succeeded(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.result.is_success())
    }

    /// Physical id as reported by the outcome, falling back to the intent
    pub fn physical_id(&self) -> Option<&str> {
        self.outcome
            .as_ref()
            .and_then(|o| o.physical_id.as_deref())
            .or(self.intent.physical_id.as_deref())
    }
}

/// Pair every intent of `run_id` with its outcome, in intent order
pub fn calls(entries: &[Operation], run_id: &str) -> Vec<Call> {
    let run: Vec<&Operation> = entries.iter().filter(|op| op.run_id == run_id).collect();
    run.iter()
        .enumerate()
        .filter(|(_, op)| op.result.is_pending())
        .map(|(i, intent)| Call {
            intent: (*intent).clone(),
            outcome: run[i + 1..]
                .iter()
                .find(|op| !op.result.is_pending() && intent.same_call(op))
                .map(|op| (*op).clone()),
        })
        .collect()
}

/// Intents of `run_id` that never received an outcome
pub fn unsettled_intents(entries: &[Operation], run_id: &str) -> Vec<Operation> {
    calls(entries, run_id)
        .into_iter()
        .filter(|call| call.outcome.is_none())
        .map(|call| call.intent)
        .collect()
}

/// Run id of the most recent entry
pub fn latest_run(entries: &[Operation]) -> Option<String> {
    entries.iter().max_by_key(|op| op.sequence).map(|op| op.run_id.clone())
}

/// Last successfully applied properties per resource.
///
/// A successful delete removes the resource from the map.
pub fn last_applied_properties(entries: &[Operation]) -> BTreeMap<String, (Option<String>, Properties)> {
    let mut applied = BTreeMap::new();
    let mut ordered: Vec<&Operation> = entries.iter().filter(|op| op.result.is_success()).collect();
    ordered.sort_by_key(|op| op.sequence);

    for op in ordered {
        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                let properties = op.properties.clone().unwrap_or_default();
                applied.insert(op.logical_id.clone(), (op.physical_id.clone(), properties));
            }
            OperationKind::Delete => {
                // Deleting a retired physical id leaves the replacement in place
                let current = applied.get(&op.logical_id).and_then(|(id, _)| id.clone());
                if current.is_none() || current == op.physical_id {
                    applied.remove(&op.logical_id);
                }
            }
        }
    }
    applied
}

/// Deterministic idempotency token for one call
pub fn idempotency_token(stack_id: &str, logical_id: &str, scope: &str, kind: OperationKind) -> String {
    let kind = kind.to_string();
    let mut hasher = blake3::Hasher::new();
    for part in [stack_id, logical_id, scope, kind.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}
