//! # Orchestrator
//!
//! Declarative infrastructure orchestration: resolve a template into a
//! dependency graph, plan a change set against a deployed stack, and
//! provision it in batches with rollback on failure.
//!
//! ## Core Concepts
//!
//! - **Template**: declared resources, their properties and references
//! - **Stack**: the deployed, versioned instance of a template
//! - **ChangeSet**: a stored plan of creates, updates, replacements and deletes
//! - **Journal**: an append-only intent/outcome log of every provider call
//! - **Provider**: a native adapter ([`ResourceProvider`]) or a custom
//!   endpoint reached through a [`RequestTransport`]
//!
//! ## Example
//!
//! ```ignore
//! use orchestrator::{
//!     CancelToken, Engine, EngineOptions, MemoryStore, NoProgress, ProviderRegistry, Template,
//! };
//! use std::sync::Arc;
//!
//! let providers = ProviderRegistry::new().with(Arc::new(MyBucketProvider));
//! let engine = Engine::new(Arc::new(MemoryStore::new()), providers, EngineOptions::default())?;
//!
//! let template = Template::from_json(&std::fs::read_to_string("stack.json")?)?;
//! let change_set = engine.plan("prod", &template)?;
//! let report = engine.apply(&change_set.id, &CancelToken::new(), &mut NoProgress)?;
//! assert!(report.is_success());
//! ```
//!
//! ## Extension Traits
//!
//! - [`ResourceProvider`]: provisions one native resource type
//! - [`RequestTransport`]: delivers requests to custom provider endpoints
//! - [`StackStore`]: durable state for stacks, journals and change sets
//! - [`ProgressCallback`]: receives progress updates

pub mod context;
pub mod diff;
pub mod drift;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod journal;
pub mod lifecycle;
pub mod model;
pub mod planner;
pub mod properties;
pub mod provider;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod template;
pub mod types;

mod executor;
mod recovery;
mod rollback;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use context::{CancelToken, NoProgress, ProgressCallback};
pub use diff::{DiffSummary, PropertyDifference, compute_differences, group_by_type};
pub use drift::{DriftItem, DriftReport, DriftStatus};
pub use engine::Engine;
pub use error::{Error, ErrorCategory, ProviderError, Result, StoreError, TemplateError};
pub use gateway::{
    CallbackGateway, CallbackStatus, NoTransport, ProviderCallback, ProviderRequest, ProviderResponse,
    RequestTransport, RequestType, Resolution, ResponseStatus,
};
pub use graph::ResourceGraph;
pub use lifecycle::Lifecycle;
pub use model::{ChangeSet, Operation, ProposedAction, ProposedOperation, ResourceRecord, Stack};
pub use planner::plan;
pub use properties::{Properties, PropertyBag, PropertyOverride, Reference};
pub use provider::{CreateRequest, ProviderRegistry, Provisioned, ResourceProvider};
pub use retry::RetryConfig;
pub use store::{MemoryStore, StackLease, StackStore};
pub use template::{ResourceDeclaration, Template};
pub use types::{
    EngineOptions, OperationKind, OperationResult, Phase, ProviderKind, ResourceFailure, ResourceStatus,
    RunReport, RunSummary, StackStatus,
};
