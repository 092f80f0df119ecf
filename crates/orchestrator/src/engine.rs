//! Engine facade
//!
//! Ties together the store, the provider registry, the worker pool and the
//! custom provider gateway. Every mutating operation takes the stack lease
//! first; plans and reads do not.

use crate::context::{CancelToken, ProgressCallback};
use crate::drift::{self, DriftReport};
use crate::error::{Error, Result};
use crate::executor::{self, Runner};
use crate::gateway::{CallbackGateway, NoTransport, RequestTransport};
use crate::model::{ChangeSet, Operation, Stack};
use crate::planner;
use crate::provider::ProviderRegistry;
use crate::recovery;
use crate::store::{StackLease, StackStore};
use crate::sweeper::Sweeper;
use crate::template::Template;
use crate::types::{EngineOptions, RunReport, StackStatus};
use rayon::ThreadPool;
use std::sync::Arc;

/// Orchestration engine for any number of stacks
pub struct Engine {
    store: Arc<dyn StackStore>,
    providers: ProviderRegistry,
    transport: Arc<dyn RequestTransport>,
    gateway: Arc<CallbackGateway>,
    pool: ThreadPool,
    options: EngineOptions,
    _sweeper: Sweeper,
}

impl Engine {
    /// Create an engine. Custom resources fail until a transport is set
    /// with [`Engine::with_transport`].
    pub fn new(store: Arc<dyn StackStore>, providers: ProviderRegistry, options: EngineOptions) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.jobs.max(1))
            .thread_name(|i| format!("strata-worker-{i}"))
            .panic_handler(|_| log::error!("provider worker panicked"))
            .build()
            .map_err(|e| Error::Internal(format!("failed to create worker pool: {e}")))?;

        let gateway = Arc::new(CallbackGateway::new(options.callback_retention));
        let sweeper = Sweeper::start(Arc::clone(&gateway), options.sweep_interval)
            .map_err(|e| Error::Internal(format!("failed to start callback sweeper: {e}")))?;

        Ok(Self {
            store,
            providers,
            transport: Arc::new(NoTransport),
            gateway,
            pool,
            options,
            _sweeper: sweeper,
        })
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn RequestTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// The gateway inbound callbacks are delivered to
    pub fn gateway(&self) -> Arc<CallbackGateway> {
        Arc::clone(&self.gateway)
    }

    pub fn store(&self) -> &dyn StackStore {
        self.store.as_ref()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    fn runner(&self, stack_id: &str, run_id: &str, cancel: CancelToken) -> Runner<'_> {
        Runner::new(
            self.store.as_ref(),
            &self.providers,
            &self.pool,
            Arc::clone(&self.transport),
            Arc::clone(&self.gateway),
            &self.options,
            cancel,
            stack_id,
            run_id,
        )
    }

    /// Diff a stack against `template` and store the resulting change set
    pub fn plan(&self, stack_id: &str, template: &Template) -> Result<ChangeSet> {
        let stack = self.store.load_stack(stack_id)?;
        let change_set = planner::plan(stack_id, stack.as_ref(), template, &self.providers)?;
        self.store.save_change_set(&change_set)?;
        Ok(change_set)
    }

    /// Execute a stored change set.
    ///
    /// The change set is consumed once the run reaches a terminal state.
    pub fn apply(
        &self,
        change_set_id: &str,
        cancel: &CancelToken,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RunReport> {
        let change_set = self
            .store
            .load_change_set(change_set_id)?
            .ok_or_else(|| Error::ChangeSetNotFound(change_set_id.to_string()))?;
        let _lease = StackLease::acquire(self.store.as_ref(), &change_set.stack_id)?;

        let mut stack = match self.store.load_stack(&change_set.stack_id)? {
            Some(stack) => {
                ensure_settled(&stack)?;
                stack
            }
            None => Stack::new(&change_set.stack_id),
        };
        if stack.version != change_set.base_version {
            return Err(Error::StaleChangeSet {
                id: change_set.id.clone(),
                stack: stack.id.clone(),
                planned: change_set.base_version,
                current: stack.version,
            });
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        if change_set.is_empty() && !stack.is_new() {
            log::info!("change set {} is empty; stack {} unchanged", change_set.id, stack.id);
            self.store.delete_change_set(&change_set.id)?;
            progress.on_run_complete();
            return Ok(RunReport::new(&stack.id, &run_id, stack.status));
        }

        let runner = self.runner(&stack.id, &run_id, cancel.clone());
        let result = executor::apply_change_set(&runner, &mut stack, &change_set, progress);
        if let Err(e) = self.store.delete_change_set(&change_set.id) {
            log::error!("failed to delete applied change set {}: {e}", change_set.id);
        }
        progress.on_run_complete();
        result
    }

    /// Delete every resource of a stack, then the stack itself
    pub fn destroy(
        &self,
        stack_id: &str,
        cancel: &CancelToken,
        progress: &mut dyn ProgressCallback,
    ) -> Result<RunReport> {
        let _lease = StackLease::acquire(self.store.as_ref(), stack_id)?;
        let mut stack = self
            .store
            .load_stack(stack_id)?
            .ok_or_else(|| Error::StackNotFound(stack_id.to_string()))?;
        ensure_settled(&stack)?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let runner = self.runner(stack_id, &run_id, cancel.clone());
        let report = executor::destroy_stack(&runner, &mut stack, progress);
        progress.on_run_complete();
        report
    }

    /// Compare provisioned resources with what their providers report
    pub fn detect_drift(&self, stack_id: &str) -> Result<DriftReport> {
        let stack = self
            .store
            .load_stack(stack_id)?
            .ok_or_else(|| Error::StackNotFound(stack_id.to_string()))?;
        drift::detect(
            self.store.as_ref(),
            &self.providers,
            &self.pool,
            &stack,
            self.options.provider_timeout,
        )
    }

    /// Finish a run that was interrupted or whose rollback failed.
    ///
    /// Interrupted applies are rolled back; interrupted destroys resume.
    pub fn recover(&self, stack_id: &str, progress: &mut dyn ProgressCallback) -> Result<RunReport> {
        let _lease = StackLease::acquire(self.store.as_ref(), stack_id)?;
        let mut stack = self
            .store
            .load_stack(stack_id)?
            .ok_or_else(|| Error::StackNotFound(stack_id.to_string()))?;

        let Some(run_id) = stack.last_run.clone().filter(|_| needs_recovery(&stack)) else {
            log::info!("stack {stack_id} is {}; nothing to recover", stack.status);
            return Ok(RunReport::new(
                stack_id,
                stack.last_run.as_deref().unwrap_or_default(),
                stack.status,
            ));
        };

        let runner = self.runner(stack_id, &run_id, CancelToken::new());
        recovery::reconcile(&runner, self.options.provider_timeout)?;

        let report = if stack.status == StackStatus::DeleteInProgress {
            recovery::prune_destroyed(&runner, &mut stack)?;
            let resumed = uuid::Uuid::new_v4().to_string();
            log::info!("resuming destroy of stack {stack_id} as run {resumed}");
            executor::destroy_stack(&self.runner(stack_id, &resumed, CancelToken::new()), &mut stack, progress)
        } else {
            recovery::resume_rollback(&runner, &mut stack, progress)
        };
        progress.on_run_complete();
        report
    }

    /// Drop a change set without applying it
    pub fn discard(&self, change_set_id: &str) -> Result<()> {
        if self.store.load_change_set(change_set_id)?.is_none() {
            return Err(Error::ChangeSetNotFound(change_set_id.to_string()));
        }
        self.store.delete_change_set(change_set_id)?;
        log::info!("discarded change set {change_set_id}");
        Ok(())
    }

    pub fn stack(&self, stack_id: &str) -> Result<Option<Stack>> {
        Ok(self.store.load_stack(stack_id)?)
    }

    pub fn stacks(&self) -> Result<Vec<String>> {
        Ok(self.store.list_stacks()?)
    }

    /// Journal entries of a stack in append order
    pub fn journal(&self, stack_id: &str) -> Result<Vec<Operation>> {
        Ok(self.store.operations(stack_id)?)
    }

    pub fn change_sets(&self, stack_id: &str) -> Result<Vec<ChangeSet>> {
        Ok(self.store.list_change_sets(stack_id)?)
    }

    pub fn change_set(&self, change_set_id: &str) -> Result<Option<ChangeSet>> {
        Ok(self.store.load_change_set(change_set_id)?)
    }
}

/// A stack mid-run (crashed) or halted in `ROLLBACK_FAILED`
fn needs_recovery(stack: &Stack) -> bool {
    stack.snapshot.is_some() || stack.status.is_in_progress() || stack.status == StackStatus::RollbackFailed
}

fn ensure_settled(stack: &Stack) -> Result<()> {
    if needs_recovery(stack) {
        return Err(Error::NeedsRecovery(stack.id.clone()));
    }
    Ok(())
}
