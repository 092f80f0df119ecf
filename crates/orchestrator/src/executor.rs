//! Execution engine - dispatches batches of provider calls on the worker pool
//!
//! The coordinator (the thread holding the stack lease) is the only writer
//! of the journal and the stack record. It writes an intent per member of a
//! batch, hands the calls to the pool, and appends each outcome as it comes
//! back over a channel. A batch settles only when every member has reported.

use crate::context::{CancelToken, ProgressCallback};
use crate::error::{Error, ProviderError, Reason, Result};
use crate::gateway::{CallbackGateway, CallbackOutcome, ProviderRequest, RequestTransport, RequestType};
use crate::graph::ResourceGraph;
use crate::journal::{idempotency_token, Journal};
use crate::lifecycle::Lifecycle;
use crate::model::{ChangeSet, Operation, ProposedAction, ResourceRecord, Stack};
use crate::properties::{substitute, substitute_properties, Properties, Reference};
use crate::provider::{call_tracked, CreateRequest, ProviderRegistry, ResourceProvider, Stragglers};
use crate::resolver;
use crate::retry::with_retry;
use crate::rollback;
use crate::store::StackStore;
use crate::types::{
    EngineOptions, OperationKind, OperationResult, Phase, ProviderKind, ResourceFailure, ResourceStatus,
    RunReport, StackStatus,
};
use chrono::Utc;
use rayon::ThreadPool;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

/// Where a call goes
#[derive(Clone)]
pub(crate) enum Target {
    Native(Arc<dyn ResourceProvider>),
    Custom { service_token: String },
}

/// One provider call to make
#[derive(Clone)]
pub(crate) struct Task {
    pub logical_id: String,
    pub resource_type: String,
    pub kind: OperationKind,
    pub target: Target,
    pub physical_id: Option<String>,
    pub previous: Option<Properties>,
    pub properties: Properties,
    pub replaced_physical_id: Option<String>,
    pub token: String,
    /// Checked against the cancel token before the provider is called
    pub cancellable: bool,
}

impl Task {
    pub fn create(logical_id: &str, resource_type: &str, target: Target, properties: Properties, token: String) -> Self {
        Self {
            logical_id: logical_id.to_string(),
            resource_type: resource_type.to_string(),
            kind: OperationKind::Create,
            target,
            physical_id: None,
            previous: None,
            properties,
            replaced_physical_id: None,
            token,
            cancellable: true,
        }
    }

    pub fn update(
        logical_id: &str,
        resource_type: &str,
        target: Target,
        physical_id: String,
        previous: Properties,
        properties: Properties,
        token: String,
    ) -> Self {
        Self {
            kind: OperationKind::Update,
            physical_id: Some(physical_id),
            previous: Some(previous),
            ..Self::create(logical_id, resource_type, target, properties, token)
        }
    }

    pub fn delete(logical_id: &str, resource_type: &str, target: Target, physical_id: String, token: String) -> Self {
        Self {
            kind: OperationKind::Delete,
            physical_id: Some(physical_id),
            ..Self::create(logical_id, resource_type, target, Properties::new(), token)
        }
    }

    #[must_use]
    pub fn replacing(mut self, old_physical_id: Option<String>) -> Self {
        self.replaced_physical_id = old_physical_id;
        self
    }

    #[must_use]
    pub fn not_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    fn provider_kind(&self) -> ProviderKind {
        match self.target {
            Target::Native(_) => ProviderKind::Native,
            Target::Custom { .. } => ProviderKind::Custom,
        }
    }

    fn intent(&self, stack_id: &str, run_id: &str, phase: Phase, batch: usize) -> Operation {
        let properties = match self.kind {
            OperationKind::Delete => None,
            _ => Some(self.properties.clone()),
        };
        Operation::intent(stack_id, run_id, phase, batch, &self.logical_id, self.kind, &self.token)
            .for_resource(&self.resource_type, self.provider_kind())
            .with_previous(self.previous.clone())
            .with_properties(properties)
            .with_physical_id(self.physical_id.clone())
            .with_replaced(self.replaced_physical_id.clone())
    }
}

/// What a successful call reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completed {
    pub physical_id: Option<String>,
    pub outputs: Properties,
}

/// A settled call
pub(crate) struct Dispatched {
    pub task: Task,
    pub outcome: Operation,
    pub result: Result<Completed>,
}

impl Dispatched {
    /// Physical id superseded by this call, for replacements and custom
    /// updates that came back with a new id
    pub fn retired_physical_id(&self) -> Option<String> {
        self.outcome.replaced_physical_id.clone()
    }
}

/// Shared state handed to workers
struct WorkerEnv {
    stack_id: String,
    transport: Arc<dyn RequestTransport>,
    gateway: Arc<CallbackGateway>,
    options: EngineOptions,
    cancel: CancelToken,
    stragglers: Stragglers,
}

/// Coordinator for one run of one stack
pub(crate) struct Runner<'a> {
    pub store: &'a dyn StackStore,
    pub providers: &'a ProviderRegistry,
    pub journal: Journal<'a>,
    pool: &'a ThreadPool,
    env: Arc<WorkerEnv>,
}

impl<'a> Runner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a dyn StackStore,
        providers: &'a ProviderRegistry,
        pool: &'a ThreadPool,
        transport: Arc<dyn RequestTransport>,
        gateway: Arc<CallbackGateway>,
        options: &EngineOptions,
        cancel: CancelToken,
        stack_id: &str,
        run_id: &str,
    ) -> Self {
        Self {
            store,
            providers,
            journal: Journal::new(store, stack_id, run_id),
            pool,
            env: Arc::new(WorkerEnv {
                stack_id: stack_id.to_string(),
                transport,
                gateway,
                options: options.clone(),
                cancel,
                stragglers: Stragglers::default(),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        self.journal.run_id()
    }

    pub fn stack_id(&self) -> &str {
        &self.env.stack_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.env.cancel.is_cancelled()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.env.options
    }

    /// Let native calls that timed out during this run finish, within the
    /// configured grace
    pub fn await_stragglers(&self) {
        let running = self.env.stragglers.settle(self.env.options.abandoned_call_grace);
        if running > 0 {
            log::warn!(
                "stack {}: {running} timed-out provider call(s) still running; their effects may not be rolled back",
                self.stack_id()
            );
        }
    }

    /// Resolve where calls for a resource go
    pub fn target_for(
        &self,
        logical_id: &str,
        resource_type: &str,
        provider: ProviderKind,
        service_token: Option<&str>,
    ) -> Result<Target> {
        match provider {
            ProviderKind::Native => self
                .providers
                .get(resource_type)
                .map(Target::Native)
                .ok_or_else(|| {
                    Error::provider(
                        logical_id,
                        ProviderError::Rejected(format!("no provider registered for {resource_type}")),
                    )
                }),
            ProviderKind::Custom => service_token
                .map(|token| Target::Custom {
                    service_token: token.to_string(),
                })
                .ok_or_else(|| {
                    Error::provider(
                        logical_id,
                        ProviderError::Rejected("custom resource has no service token".to_string()),
                    )
                }),
        }
    }

    /// Target for an existing record
    pub fn target_for_record(&self, record: &ResourceRecord) -> Result<Target> {
        self.target_for(
            &record.logical_id,
            &record.resource_type,
            record.provider,
            record.service_token.as_deref(),
        )
    }

    /// Journal, dispatch and settle one batch.
    ///
    /// Results come back in task order. The outer error is reserved for
    /// journal failures; provider failures are in each result.
    pub fn dispatch(
        &self,
        phase: Phase,
        batch: usize,
        tasks: Vec<Task>,
        progress: &mut dyn ProgressCallback,
    ) -> Result<Vec<Dispatched>> {
        let ids: Vec<String> = tasks.iter().map(|t| t.logical_id.clone()).collect();
        progress.on_batch_start(phase, batch, &ids);
        log::info!(
            "stack {}: {phase} batch {batch} [{}]",
            self.stack_id(),
            ids.join(", ")
        );

        let (tx, rx) = mpsc::channel::<(usize, Result<Completed>)>();
        let mut intents = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            let intent = self
                .journal
                .record_intent(task.intent(self.stack_id(), self.run_id(), phase, batch))?;
            intents.push(intent);
            progress.on_resource_start(&task.logical_id, task.kind);

            let task = task.clone();
            let env = Arc::clone(&self.env);
            let tx = tx.clone();
            self.pool.spawn(move || {
                let result = execute(&task, &env);
                let _ = tx.send((index, result));
            });
        }
        drop(tx);

        let mut results: Vec<Option<(Operation, Result<Completed>)>> = tasks.iter().map(|_| None).collect();
        for (index, result) in rx {
            let outcome = self.settle(&intents[index], &result)?;
            progress.on_resource_complete(&tasks[index].logical_id, tasks[index].kind, &outcome.result);
            results[index] = Some((outcome, result));
        }

        // A worker that panicked never reports back
        let mut settled = Vec::with_capacity(tasks.len());
        for ((task, intent), slot) in tasks.into_iter().zip(&intents).zip(results) {
            let (outcome, result) = match slot {
                Some(done) => done,
                None => {
                    let result = Err(Error::Internal(format!("worker for {} panicked", task.logical_id)));
                    let outcome = self.settle(intent, &result)?;
                    progress.on_resource_complete(&task.logical_id, task.kind, &outcome.result);
                    (outcome, result)
                }
            };
            settled.push(Dispatched { task, outcome, result });
        }
        Ok(settled)
    }

    fn settle(&self, intent: &Operation, result: &Result<Completed>) -> Result<Operation> {
        let mut outcome = match result {
            Ok(done) => intent.outcome(OperationResult::Succeeded, done.physical_id.clone(), done.outputs.clone()),
            Err(e) => {
                log::warn!("{} {} failed: {e}", intent.kind, intent.logical_id);
                intent.outcome(
                    OperationResult::Failed {
                        reason: Reason(e).to_string(),
                    },
                    None,
                    Properties::new(),
                )
            }
        };
        // A custom update that came back with a new physical id replaced the resource
        if intent.kind == OperationKind::Update
            && outcome.result.is_success()
            && outcome.physical_id != intent.physical_id
        {
            outcome.replaced_physical_id = intent.physical_id.clone();
        }
        self.journal.append(outcome)
    }
}

/// Worker body: one provider call
fn execute(task: &Task, env: &WorkerEnv) -> Result<Completed> {
    if task.cancellable && env.cancel.is_cancelled() {
        return Err(Error::Cancelled(task.logical_id.clone()));
    }
    match &task.target {
        Target::Native(provider) => execute_native(provider, task, env),
        Target::Custom { service_token } => execute_custom(service_token, task, env),
    }
}

fn require_physical(task: &Task) -> Result<String> {
    task.physical_id
        .clone()
        .ok_or_else(|| Error::Internal(format!("{} {} has no physical id", task.kind, task.logical_id)))
}

fn execute_native(provider: &Arc<dyn ResourceProvider>, task: &Task, env: &WorkerEnv) -> Result<Completed> {
    let label = format!("{} {}", task.kind, task.logical_id);
    let timeout = env.options.provider_timeout;
    let retry = &env.options.retry;

    let result = match task.kind {
        OperationKind::Create => {
            let request = CreateRequest {
                logical_id: task.logical_id.clone(),
                resource_type: task.resource_type.clone(),
                properties: task.properties.clone(),
                idempotency_token: task.token.clone(),
            };
            with_retry(retry, &label, || {
                let provider = Arc::clone(provider);
                let request = request.clone();
                call_tracked(timeout, &env.stragglers, move || provider.create(&request))
            })
            .map(|p| Completed {
                physical_id: Some(p.physical_id),
                outputs: p.outputs,
            })
        }
        OperationKind::Update => {
            let physical_id = require_physical(task)?;
            let old = task.previous.clone().unwrap_or_default();
            with_retry(retry, &label, || {
                let provider = Arc::clone(provider);
                let (id, old, new) = (physical_id.clone(), old.clone(), task.properties.clone());
                call_tracked(timeout, &env.stragglers, move || provider.update(&id, &old, &new))
            })
            .map(|outputs| Completed {
                physical_id: Some(physical_id.clone()),
                outputs,
            })
        }
        OperationKind::Delete => {
            let physical_id = require_physical(task)?;
            let deleted = with_retry(retry, &label, || {
                let provider = Arc::clone(provider);
                let id = physical_id.clone();
                call_tracked(timeout, &env.stragglers, move || provider.delete(&id))
            });
            match deleted {
                Ok(()) | Err(ProviderError::NotFound(_)) => Ok(Completed {
                    physical_id: Some(physical_id),
                    outputs: Properties::new(),
                }),
                Err(e) => Err(e),
            }
        }
    };

    result.map_err(|e| Error::provider(&task.logical_id, e))
}

fn execute_custom(service_token: &str, task: &Task, env: &WorkerEnv) -> Result<Completed> {
    let request = ProviderRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        request_type: match task.kind {
            OperationKind::Create => RequestType::Create,
            OperationKind::Update => RequestType::Update,
            OperationKind::Delete => RequestType::Delete,
        },
        stack_id: env.stack_id.clone(),
        logical_resource_id: task.logical_id.clone(),
        resource_type: task.resource_type.clone(),
        resource_properties: task.properties.clone(),
        old_resource_properties: task.previous.clone(),
        physical_resource_id: task.physical_id.clone(),
        response_url: env.options.response_url.clone(),
        callback_token: uuid::Uuid::new_v4().to_string(),
    };

    let (callback, rx) = env
        .gateway
        .register(&request, env.options.callback_timeout, Utc::now());
    let label = format!("{} {}", task.kind, task.logical_id);
    if let Err(e) = with_retry(&env.options.retry, &label, || env.transport.send(service_token, &request)) {
        env.gateway.abandon(&request.request_id, &e.to_string(), Utc::now());
        return Err(Error::provider(&task.logical_id, e));
    }

    // The sweeper normally delivers the timeout; the grace covers a stalled sweep
    let grace = env.options.sweep_interval * 2 + Duration::from_secs(1);
    let outcome = match rx.recv_timeout(env.options.callback_timeout + grace) {
        Ok(outcome) => outcome,
        Err(RecvTimeoutError::Timeout) => {
            env.gateway.expire(&request.request_id, Utc::now());
            rx.try_recv().unwrap_or(CallbackOutcome::TimedOut {
                deadline: callback.timeout_at,
            })
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(Error::Internal(format!(
                "callback channel for {} closed",
                request.request_id
            )));
        }
    };

    match outcome {
        CallbackOutcome::Succeeded { physical_id, data } => {
            let physical_id = match task.kind {
                OperationKind::Create => Some(physical_id.ok_or_else(|| {
                    Error::provider(
                        &task.logical_id,
                        ProviderError::Rejected("custom provider returned no physical resource id".to_string()),
                    )
                })?),
                OperationKind::Update | OperationKind::Delete => physical_id.or_else(|| task.physical_id.clone()),
            };
            Ok(Completed {
                physical_id,
                outputs: data,
            })
        }
        CallbackOutcome::Failed { reason } => Err(Error::provider(&task.logical_id, ProviderError::Rejected(reason))),
        CallbackOutcome::TimedOut { deadline } => Err(Error::ProviderTimeout {
            logical_id: task.logical_id.clone(),
            deadline,
        }),
    }
}

/// Resolve a reference against provisioned records
pub(crate) fn lookup(records: &BTreeMap<String, ResourceRecord>, reference: &Reference) -> Option<Value> {
    let record = records.get(reference.target())?;
    match reference {
        Reference::Ref(_) => record.physical_id.clone().map(Value::String),
        Reference::GetAtt { attribute, .. } => record.outputs.get(attribute).cloned(),
    }
}

fn failure_from(logical_id: &str, error: &Error) -> ResourceFailure {
    ResourceFailure {
        logical_id: logical_id.to_string(),
        reason: Reason(error).to_string(),
        timed_out: error.is_timeout(),
    }
}

fn cancelled(stack_id: &str) -> ResourceFailure {
    ResourceFailure {
        logical_id: stack_id.to_string(),
        reason: "cancelled".to_string(),
        timed_out: false,
    }
}

/// An old physical resource scheduled for deletion after forward batches
struct Retired {
    record: ResourceRecord,
    batch: usize,
}

/// Working state of an apply
struct Apply<'r, 'a> {
    runner: &'r Runner<'a>,
    change_set: &'r ChangeSet,
    graph: ResourceGraph,
    records: BTreeMap<String, ResourceRecord>,
    retired: Vec<Retired>,
    report: RunReport,
}

/// Execute a change set against a stack the caller holds the lease on.
///
/// Returns the report for completed and rolled-back runs; a failed rollback
/// is returned as `RollbackFailure` after the stack is saved.
pub(crate) fn apply_change_set(
    runner: &Runner<'_>,
    stack: &mut Stack,
    change_set: &ChangeSet,
    progress: &mut dyn ProgressCallback,
) -> Result<RunReport> {
    let graph = ResourceGraph::build(&change_set.template)?;
    let (starting, complete) = if stack.is_new() {
        (StackStatus::CreateInProgress, StackStatus::CreateComplete)
    } else {
        (StackStatus::UpdateInProgress, StackStatus::UpdateComplete)
    };

    stack.begin(runner.run_id(), starting);
    runner.store.save_stack(stack)?;
    progress.on_run_start(&stack.id, runner.run_id(), change_set.operations.len());
    log::info!(
        "applying change set {} to stack {} (run {})",
        change_set.id,
        stack.id,
        runner.run_id()
    );

    let mut apply = Apply {
        runner,
        change_set,
        graph,
        records: stack.resources.clone(),
        retired: Vec::new(),
        report: RunReport::new(&stack.id, runner.run_id(), starting),
    };

    let mut failure = apply.forward(stack, progress)?;
    let mut outputs = BTreeMap::new();
    if failure.is_none() {
        match apply.resolve_outputs() {
            Ok(resolved) => {
                outputs = resolved;
                failure = apply.cleanup(stack, progress)?;
            }
            Err(f) => failure = Some(f),
        }
    }

    let Some(failure) = failure else {
        apply.refresh_unchanged();
        stack.resources = apply.records;
        stack.outputs = outputs;
        stack.template_hash = Some(change_set.template_hash.clone());
        stack.settle(complete, None);
        runner.store.save_stack(stack)?;
        apply.report.status = complete;
        log::info!("stack {} is {complete}", stack.id);
        return Ok(apply.report);
    };

    log::warn!(
        "stack {}: {} failed ({}), rolling back",
        stack.id,
        failure.logical_id,
        failure.reason
    );
    progress.on_rollback_start(&failure.reason);
    stack.resources = apply.records;
    stack.transition(StackStatus::RollbackInProgress);
    runner.store.save_stack(stack)?;

    let mut report = apply.report;
    report.failure = Some(failure.clone());
    let reason = format!("{}: {}", failure.logical_id, failure.reason);
    match rollback::roll_back(runner, stack, progress) {
        Ok(outcome) => {
            report.rolled_back = outcome.rolled_back;
            report.unrecoverable = outcome.unrecoverable;
            stack.settle(StackStatus::RollbackComplete, Some(reason));
            runner.store.save_stack(stack)?;
            report.status = StackStatus::RollbackComplete;
            log::info!("stack {} is {}", stack.id, report.status);
            Ok(report)
        }
        Err(e) => {
            stack.halt(StackStatus::RollbackFailed, Some(e.to_string()));
            runner.store.save_stack(stack)?;
            log::error!("stack {} is ROLLBACK_FAILED: {e}", stack.id);
            Err(e)
        }
    }
}

impl Apply<'_, '_> {
    fn scope(&self) -> &str {
        &self.change_set.id
    }

    /// Run forward batches; returns the first failure
    fn forward(&mut self, stack: &mut Stack, progress: &mut dyn ProgressCallback) -> Result<Option<ResourceFailure>> {
        let runner = self.runner;
        let change_set = self.change_set;
        for (batch, ids) in change_set.batches.iter().enumerate() {
            let planned: Vec<_> = ids
                .iter()
                .filter_map(|id| change_set.get(id))
                .filter(|op| op.action != ProposedAction::Delete)
                .collect();
            if planned.is_empty() {
                continue;
            }
            if runner.is_cancelled() {
                return Ok(Some(cancelled(&stack.id)));
            }

            let mut tasks = Vec::with_capacity(planned.len());
            for op in planned {
                let node = self
                    .graph
                    .get(&op.logical_id)
                    .ok_or_else(|| Error::Internal(format!("{} missing from target graph", op.logical_id)))?;
                let resolved = node.properties.resolved();
                let properties = match substitute_properties(&resolved, &|r| lookup(&self.records, r)) {
                    Ok(properties) => properties,
                    Err(reference) => {
                        return Ok(Some(ResourceFailure {
                            logical_id: op.logical_id.clone(),
                            reason: format!("cannot resolve {reference}"),
                            timed_out: false,
                        }));
                    }
                };
                let target = match runner.target_for(
                    &node.logical_id,
                    &node.resource_type,
                    node.provider,
                    node.service_token.as_deref(),
                ) {
                    Ok(target) => target,
                    Err(e) => return Ok(Some(failure_from(&op.logical_id, &e))),
                };
                let existing = self.records.get(&op.logical_id);
                let token_kind = match op.action {
                    ProposedAction::Update => OperationKind::Update,
                    _ => OperationKind::Create,
                };
                let token = idempotency_token(&stack.id, &op.logical_id, self.scope(), token_kind);

                let task = match (op.action, existing.and_then(|r| r.physical_id.clone())) {
                    (ProposedAction::Update, Some(physical_id)) => Task::update(
                        &node.logical_id,
                        &node.resource_type,
                        target,
                        physical_id,
                        existing.map(|r| r.resolved_properties.clone()).unwrap_or_default(),
                        properties,
                        token,
                    ),
                    (ProposedAction::Replace, old) => {
                        Task::create(&node.logical_id, &node.resource_type, target, properties, token).replacing(old)
                    }
                    _ => Task::create(&node.logical_id, &node.resource_type, target, properties, token),
                };
                tasks.push(task);
            }

            let settled = runner.dispatch(Phase::Forward, batch, tasks, progress)?;
            let mut failure = None;
            for done in settled {
                if let Some(f) = self.absorb_forward(done, batch)? {
                    failure.get_or_insert(f);
                }
            }
            stack.resources = self.records.clone();
            runner.store.save_stack(stack)?;
            if failure.is_some() {
                return Ok(failure);
            }
        }
        Ok(None)
    }

    /// Fold a settled forward call into the working records
    fn absorb_forward(&mut self, done: Dispatched, batch: usize) -> Result<Option<ResourceFailure>> {
        let id = done.task.logical_id.clone();
        let planned_replacement = done.task.replaced_physical_id.is_some();
        let mut lifecycle = Lifecycle::new(&id);
        lifecycle.advance(if planned_replacement {
            ResourceStatus::CreatingReplacement
        } else {
            ResourceStatus::InProgress
        })?;

        let completed = match &done.result {
            Ok(completed) => completed.clone(),
            Err(e) => {
                lifecycle.fail()?;
                self.report.summary.failed += 1;
                if let Some(record) = self.records.get_mut(&id) {
                    record.status = lifecycle.status();
                }
                return Ok(Some(failure_from(&id, e)));
            }
        };

        let node = self
            .graph
            .get(&id)
            .ok_or_else(|| Error::Internal(format!("{id} missing from target graph")))?;
        let previous = self.records.get(&id).cloned();
        let retired_physical = done.retired_physical_id();

        let mut record = ResourceRecord::from_node(node);
        record.physical_id = completed.physical_id;
        record.resolved_properties = done.task.properties.clone();
        record.outputs = completed.outputs;

        match (previous, retired_physical) {
            (Some(mut old), Some(old_physical)) => {
                if planned_replacement {
                    lifecycle.advance(ResourceStatus::AwaitingDeletion)?;
                } else {
                    lifecycle.advance(ResourceStatus::Complete)?;
                }
                old.physical_id = Some(old_physical);
                self.retired.push(Retired { record: old, batch });
                self.report.summary.replaced += 1;
            }
            _ => {
                lifecycle.advance(ResourceStatus::Complete)?;
                match done.task.kind {
                    OperationKind::Update => self.report.summary.updated += 1,
                    _ => self.report.summary.created += 1,
                }
            }
        }
        record.status = lifecycle.status();
        self.records.insert(id, record);
        Ok(None)
    }

    fn resolve_outputs(&self) -> std::result::Result<BTreeMap<String, Value>, ResourceFailure> {
        let mut outputs = BTreeMap::new();
        for (name, expression) in self.graph.outputs() {
            match substitute(expression, &|r| lookup(&self.records, r)) {
                Ok(value) => {
                    outputs.insert(name.clone(), value);
                }
                Err(reference) => {
                    return Err(ResourceFailure {
                        logical_id: format!("output {name}"),
                        reason: format!("cannot resolve {reference}"),
                        timed_out: false,
                    });
                }
            }
        }
        Ok(outputs)
    }

    /// Delete retired physical resources, then resources removed from the template
    fn cleanup(&mut self, stack: &mut Stack, progress: &mut dyn ProgressCallback) -> Result<Option<ResourceFailure>> {
        let runner = self.runner;
        let change_set = self.change_set;

        let mut retired_batches: BTreeMap<usize, Vec<Task>> = BTreeMap::new();
        for retired in &self.retired {
            let Some(physical_id) = retired.record.physical_id.clone() else {
                continue;
            };
            let target = match runner.target_for_record(&retired.record) {
                Ok(target) => target,
                Err(e) => return Ok(Some(failure_from(&retired.record.logical_id, &e))),
            };
            let scope = format!("{}/retired", self.scope());
            let token = idempotency_token(&stack.id, &retired.record.logical_id, &scope, OperationKind::Delete);
            retired_batches.entry(retired.batch).or_default().push(Task::delete(
                &retired.record.logical_id,
                &retired.record.resource_type,
                target,
                physical_id,
                token,
            ));
        }

        let mut removed_batches: BTreeMap<usize, Vec<Task>> = BTreeMap::new();
        for op in &change_set.operations {
            if op.action != ProposedAction::Delete {
                continue;
            }
            let Some(record) = self.records.get(&op.logical_id) else {
                continue;
            };
            let Some(physical_id) = record.physical_id.clone() else {
                self.records.remove(&op.logical_id);
                continue;
            };
            let target = match runner.target_for_record(record) {
                Ok(target) => target,
                Err(e) => return Ok(Some(failure_from(&op.logical_id, &e))),
            };
            let token = idempotency_token(&stack.id, &op.logical_id, &change_set.id, OperationKind::Delete);
            removed_batches.entry(op.batch).or_default().push(Task::delete(
                &op.logical_id,
                &record.resource_type,
                target,
                physical_id,
                token,
            ));
        }

        let groups = retired_batches
            .into_iter()
            .rev()
            .map(|(batch, tasks)| (batch, tasks, true))
            .chain(removed_batches.into_iter().map(|(batch, tasks)| (batch, tasks, false)));

        for (batch, tasks, retiring) in groups {
            if runner.is_cancelled() {
                return Ok(Some(cancelled(&stack.id)));
            }
            let settled = runner.dispatch(Phase::Cleanup, batch, tasks, progress)?;
            let mut failure = None;
            for done in settled {
                let id = done.task.logical_id.clone();
                match &done.result {
                    Ok(_) if retiring => {
                        if let Some(record) = self.records.get_mut(&id) {
                            if record.status == ResourceStatus::AwaitingDeletion {
                                let mut lifecycle = Lifecycle::resume(&id, record.status);
                                lifecycle.advance(ResourceStatus::Complete)?;
                                record.status = lifecycle.status();
                            }
                        }
                    }
                    Ok(_) => {
                        self.records.remove(&id);
                        self.report.summary.deleted += 1;
                    }
                    Err(e) => {
                        self.report.summary.failed += 1;
                        if retiring {
                            if let Some(record) = self.records.get_mut(&id) {
                                let mut lifecycle = Lifecycle::resume(&id, record.status);
                                if lifecycle.fail().is_ok() {
                                    record.status = lifecycle.status();
                                }
                            }
                        }
                        failure.get_or_insert(failure_from(&id, e));
                    }
                }
            }
            stack.resources = self.records.clone();
            runner.store.save_stack(stack)?;
            if failure.is_some() {
                return Ok(failure);
            }
        }
        Ok(None)
    }

    /// Carry declaration-only changes (e.g. dependsOn) into untouched records
    fn refresh_unchanged(&mut self) {
        for (id, node) in self.graph.nodes() {
            if self.change_set.get(id).is_some() {
                continue;
            }
            if let Some(record) = self.records.get_mut(id) {
                record.properties = node.properties.clone();
                record.depends_on = node.depends_on.clone();
            }
        }
    }
}

/// Tear down every resource of a stack in reverse dependency order.
///
/// A failure leaves the stack `FAILED` with the remaining resources; there
/// is no rollback for a destroy.
pub(crate) fn destroy_stack(
    runner: &Runner<'_>,
    stack: &mut Stack,
    progress: &mut dyn ProgressCallback,
) -> Result<RunReport> {
    stack.begin(runner.run_id(), StackStatus::DeleteInProgress);
    runner.store.save_stack(stack)?;
    progress.on_run_start(&stack.id, runner.run_id(), stack.resources.len());
    log::info!("destroying stack {} (run {})", stack.id, runner.run_id());

    let deps = stack
        .resources
        .values()
        .map(|r| (r.logical_id.clone(), r.depends_on.clone()))
        .collect();
    let teardown = resolver::reverse(&resolver::resolve(&deps)?);
    let mut report = RunReport::new(&stack.id, runner.run_id(), StackStatus::DeleteInProgress);
    let mut failure = None;

    for (batch, ids) in teardown.iter().enumerate() {
        if runner.is_cancelled() {
            failure = Some(cancelled(&stack.id));
            break;
        }

        let mut tasks = Vec::new();
        for id in ids {
            let Some(record) = stack.resources.get(id) else {
                continue;
            };
            let Some(physical_id) = record.physical_id.clone() else {
                stack.resources.remove(id);
                continue;
            };
            match runner.target_for_record(record) {
                Ok(target) => {
                    let token = idempotency_token(&stack.id, id, runner.run_id(), OperationKind::Delete);
                    tasks.push(Task::delete(id, &record.resource_type, target, physical_id, token));
                }
                Err(e) => {
                    failure = Some(failure_from(id, &e));
                    break;
                }
            }
        }
        if failure.is_some() {
            break;
        }
        if tasks.is_empty() {
            continue;
        }

        for done in runner.dispatch(Phase::Destroy, batch, tasks, progress)? {
            match &done.result {
                Ok(_) => {
                    stack.resources.remove(&done.task.logical_id);
                    report.summary.deleted += 1;
                }
                Err(e) => {
                    report.summary.failed += 1;
                    if let Some(record) = stack.resources.get_mut(&done.task.logical_id) {
                        record.status = ResourceStatus::Failed;
                    }
                    failure.get_or_insert(failure_from(&done.task.logical_id, e));
                }
            }
        }
        runner.store.save_stack(stack)?;
        if failure.is_some() {
            break;
        }
    }

    if let Some(failure) = failure {
        let reason = format!("{}: {}", failure.logical_id, failure.reason);
        stack.settle(StackStatus::Failed, Some(reason));
        runner.store.save_stack(stack)?;
        report.status = StackStatus::Failed;
        report.failure = Some(failure);
        log::warn!("destroy of stack {} failed", stack.id);
        return Ok(report);
    }

    runner.store.delete_stack(&stack.id)?;
    for change_set in runner.store.list_change_sets(&stack.id)? {
        runner.store.delete_change_set(&change_set.id)?;
    }
    stack.settle(StackStatus::DeleteComplete, None);
    report.status = StackStatus::DeleteComplete;
    log::info!("stack {} is DELETE_COMPLETE", stack.id);
    Ok(report)
}
