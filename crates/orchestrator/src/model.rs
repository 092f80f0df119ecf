//! Persistent records: stacks, resources, journal entries and change sets

use crate::graph::ResourceNode;
use crate::properties::{Properties, PropertyBag};
use crate::template::Template;
use crate::types::{OperationKind, OperationResult, Phase, ProviderKind, ResourceStatus, StackStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A provisioned (or being provisioned) resource in a stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub logical_id: String,
    pub resource_type: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub service_token: Option<String>,
    /// Assigned by the provider, immutable once set
    #[serde(default)]
    pub physical_id: Option<String>,
    /// Declared bag, references unresolved
    pub properties: PropertyBag,
    /// Properties last sent to the provider
    #[serde(default)]
    pub resolved_properties: Properties,
    #[serde(default)]
    pub outputs: Properties,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    pub status: ResourceStatus,
}

impl ResourceRecord {
    /// A record for a node that has not been provisioned yet
    pub fn from_node(node: &ResourceNode) -> Self {
        Self {
            logical_id: node.logical_id.clone(),
            resource_type: node.resource_type.clone(),
            provider: node.provider,
            service_token: node.service_token.clone(),
            physical_id: None,
            properties: node.properties.clone(),
            resolved_properties: Properties::new(),
            outputs: Properties::new(),
            depends_on: node.depends_on.clone(),
            status: ResourceStatus::Pending,
        }
    }

    pub fn is_custom(&self) -> bool {
        self.provider == ProviderKind::Custom
    }
}

/// Stack contents before a run started, kept until the run settles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSnapshot {
    pub resources: BTreeMap<String, ResourceRecord>,
    pub outputs: BTreeMap<String, Value>,
    pub template_hash: Option<String>,
}

/// A deployed stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    pub status: StackStatus,
    /// Ordered by logical id
    pub resources: BTreeMap<String, ResourceRecord>,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Bumped on every terminal transition
    pub version: u64,
    #[serde(default)]
    pub template_hash: Option<String>,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub last_run: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Pre-run state while a run is in flight
    #[serde(default)]
    pub snapshot: Option<StackSnapshot>,
}

impl Stack {
    /// A stack that has never been applied
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: StackStatus::CreateInProgress,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            version: 0,
            template_hash: None,
            status_reason: None,
            last_run: None,
            updated_at: Utc::now(),
            snapshot: None,
        }
    }

    /// A stack with version 0 and no resources has never completed a run
    pub fn is_new(&self) -> bool {
        self.version == 0 && self.resources.is_empty()
    }

    pub fn has_custom_resources(&self) -> bool {
        self.resources.values().any(ResourceRecord::is_custom)
    }

    pub fn snapshot(&self) -> StackSnapshot {
        StackSnapshot {
            resources: self.resources.clone(),
            outputs: self.outputs.clone(),
            template_hash: self.template_hash.clone(),
        }
    }

    /// Put back the resources, outputs and template hash from a snapshot
    pub fn restore(&mut self, snapshot: StackSnapshot) {
        self.resources = snapshot.resources;
        self.outputs = snapshot.outputs;
        self.template_hash = snapshot.template_hash;
    }

    /// Begin a run: remember the pre-run state and mark the stack in progress
    pub(crate) fn begin(&mut self, run_id: &str, status: StackStatus) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.snapshot());
        }
        self.status = status;
        self.status_reason = None;
        self.last_run = Some(run_id.to_string());
        self.updated_at = Utc::now();
    }

    /// Settle a run into a terminal status
    pub(crate) fn settle(&mut self, status: StackStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.snapshot = None;
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Stop a run that needs an operator, keeping the pre-run snapshot
    pub(crate) fn halt(&mut self, status: StackStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Move to an intermediate status without ending the run
    pub(crate) fn transition(&mut self, status: StackStatus) {
        log::debug!("stack {}: {} -> {}", self.id, self.status, status);
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// One append-only journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Assigned by the store on append
    pub sequence: u64,
    pub stack_id: String,
    pub run_id: String,
    pub phase: Phase,
    pub batch: usize,
    pub logical_id: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub provider: ProviderKind,
    pub kind: OperationKind,
    #[serde(default)]
    pub previous: Option<Properties>,
    #[serde(default)]
    pub properties: Option<Properties>,
    #[serde(default)]
    pub physical_id: Option<String>,
    /// Physical id superseded by a replacement
    #[serde(default)]
    pub replaced_physical_id: Option<String>,
    pub idempotency_token: String,
    pub timestamp: DateTime<Utc>,
    pub result: OperationResult,
    #[serde(default)]
    pub outputs: Properties,
}

impl Operation {
    /// An intent record, written before the provider is called
    pub fn intent(
        stack_id: &str,
        run_id: &str,
        phase: Phase,
        batch: usize,
        logical_id: &str,
        kind: OperationKind,
        idempotency_token: &str,
    ) -> Self {
        Self {
            sequence: 0,
            stack_id: stack_id.to_string(),
            run_id: run_id.to_string(),
            phase,
            batch,
            logical_id: logical_id.to_string(),
            resource_type: String::new(),
            provider: ProviderKind::Native,
            kind,
            previous: None,
            properties: None,
            physical_id: None,
            replaced_physical_id: None,
            idempotency_token: idempotency_token.to_string(),
            timestamp: Utc::now(),
            result: OperationResult::Pending,
            outputs: Properties::new(),
        }
    }

    #[must_use]
    pub fn for_resource(mut self, resource_type: &str, provider: ProviderKind) -> Self {
        self.resource_type = resource_type.to_string();
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_previous(mut self, previous: Option<Properties>) -> Self {
        self.previous = previous;
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: Option<Properties>) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_physical_id(mut self, physical_id: Option<String>) -> Self {
        self.physical_id = physical_id;
        self
    }

    #[must_use]
    pub fn with_replaced(mut self, replaced: Option<String>) -> Self {
        self.replaced_physical_id = replaced;
        self
    }

    /// The outcome entry matching this intent
    pub fn outcome(&self, result: OperationResult, physical_id: Option<String>, outputs: Properties) -> Self {
        Self {
            sequence: 0,
            timestamp: Utc::now(),
            result,
            physical_id: physical_id.or_else(|| self.physical_id.clone()),
            outputs,
            ..self.clone()
        }
    }

    /// The outcome entry reconciled after a crash
    pub fn recovered(&self, result: OperationResult, physical_id: Option<String>, outputs: Properties) -> Self {
        Self {
            phase: Phase::Recovery,
            ..self.outcome(result, physical_id, outputs)
        }
    }

    /// Whether `other` is the intent or outcome of the same call.
    ///
    /// Phase is not compared so reconciled outcomes pair with their intent.
    pub fn same_call(&self, other: &Operation) -> bool {
        self.run_id == other.run_id
            && self.logical_id == other.logical_id
            && self.kind == other.kind
            && self.idempotency_token == other.idempotency_token
    }
}

/// Planned action for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposedAction {
    Create,
    Update,
    Replace,
    Delete,
}

impl fmt::Display for ProposedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Replace => "Replace",
            Self::Delete => "Delete",
        };
        f.write_str(name)
    }
}

/// One entry of a change set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedOperation {
    pub action: ProposedAction,
    pub logical_id: String,
    pub resource_type: String,
    pub previous: Option<PropertyBag>,
    pub target: Option<PropertyBag>,
    pub physical_id: Option<String>,
    /// Forward batch for create/update/replace, teardown batch for delete
    pub batch: usize,
    pub reason: String,
}

/// A proposed, unexecuted diff between a stack and a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub stack_id: String,
    pub created_at: DateTime<Utc>,
    /// Stack version this was planned against
    pub base_version: u64,
    /// BLAKE3 hash of the target graph
    pub template_hash: String,
    pub operations: Vec<ProposedOperation>,
    /// Target declarations
    pub template: Template,
    /// Forward batch layout of the target graph
    pub batches: Vec<Vec<String>>,
}

impl ChangeSet {
    /// An empty change set is a no-op plan
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn get(&self, logical_id: &str) -> Option<&ProposedOperation> {
        self.operations.iter().find(|op| op.logical_id == logical_id)
    }

    pub fn count(&self, action: ProposedAction) -> usize {
        self.operations.iter().filter(|op| op.action == action).count()
    }
}
