//! Drift detection
//!
//! Compares what each provider reports for a resource against the
//! properties the journal says were last applied. Only declared keys are
//! compared; attributes a provider adds on its own are not drift.

use crate::diff::{compute_declared_differences, PropertyDifference};
use crate::error::Result;
use crate::journal;
use crate::model::{ResourceRecord, Stack};
use crate::properties::Properties;
use crate::provider::{call_with_timeout, ProviderRegistry};
use crate::store::StackStore;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::time::Duration;

/// How a resource has drifted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DriftStatus {
    Modified { differences: Vec<PropertyDifference> },
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftItem {
    pub logical_id: String,
    pub physical_id: String,
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Drift detection results for one stack
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub stack_id: String,
    pub checked_at: DateTime<Utc>,
    pub drifted: Vec<DriftItem>,
    pub in_sync: Vec<String>,
    /// Resources that could not be checked
    pub warnings: Vec<String>,
}

impl DriftReport {
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty()
    }
}

enum Check {
    InSync(String),
    Drifted(DriftItem),
    Skipped(String),
}

/// Read every native resource of `stack` and compare it with the last
/// applied properties
pub(crate) fn detect(
    store: &dyn StackStore,
    providers: &ProviderRegistry,
    pool: &ThreadPool,
    stack: &Stack,
    timeout: Duration,
) -> Result<DriftReport> {
    let applied = journal::last_applied_properties(&store.operations(&stack.id)?);

    let targets: Vec<(&ResourceRecord, Properties)> = stack
        .resources
        .values()
        .map(|record| {
            let expected = applied
                .get(&record.logical_id)
                .filter(|(physical_id, _)| *physical_id == record.physical_id)
                .map_or_else(|| record.resolved_properties.clone(), |(_, props)| props.clone());
            (record, expected)
        })
        .collect();

    let checks: Vec<Check> = pool.install(|| {
        targets
            .par_iter()
            .map(|(record, expected)| check(providers, record, expected, timeout))
            .collect()
    });

    let mut report = DriftReport {
        stack_id: stack.id.clone(),
        checked_at: Utc::now(),
        drifted: Vec::new(),
        in_sync: Vec::new(),
        warnings: Vec::new(),
    };
    for check in checks {
        match check {
            Check::InSync(id) => report.in_sync.push(id),
            Check::Drifted(item) => report.drifted.push(item),
            Check::Skipped(warning) => {
                log::warn!("drift: {warning}");
                report.warnings.push(warning);
            }
        }
    }
    log::info!(
        "stack {}: {} drifted, {} in sync, {} skipped",
        stack.id,
        report.drifted.len(),
        report.in_sync.len(),
        report.warnings.len()
    );
    Ok(report)
}

fn check(providers: &ProviderRegistry, record: &ResourceRecord, expected: &Properties, timeout: Duration) -> Check {
    let id = record.logical_id.clone();
    if record.is_custom() {
        return Check::Skipped(format!("{id}: custom resources are not checked for drift"));
    }
    let Some(physical_id) = record.physical_id.clone() else {
        return Check::Skipped(format!("{id}: not provisioned"));
    };
    let Some(provider) = providers.get(&record.resource_type) else {
        return Check::Skipped(format!("{id}: no provider registered for {}", record.resource_type));
    };

    let read_id = physical_id.clone();
    match call_with_timeout(timeout, move || provider.read(&read_id)) {
        Ok(None) => Check::Drifted(DriftItem {
            logical_id: id,
            physical_id,
            status: DriftStatus::Deleted,
        }),
        Ok(Some(actual)) => {
            let differences = compute_declared_differences(expected, &actual);
            if differences.is_empty() {
                Check::InSync(id)
            } else {
                Check::Drifted(DriftItem {
                    logical_id: id,
                    physical_id,
                    status: DriftStatus::Modified { differences },
                })
            }
        }
        Err(e) => Check::Skipped(format!("{id}: read failed: {e}")),
    }
}
