//! # Lockstep
//!
//! A workflow (saga) engine over the conveyor job queue: multi-step
//! transactions with idempotency, deterministic state machines, step-level
//! retry with exponential backoff, compensation in reverse order, and
//! crash recovery.
//!
//! ## Core Concepts
//!
//! - A [`WorkflowDefinition`] is an ordered list of [`StepDefinition`]s;
//!   each step is an object with `execute` and an optional `compensate`.
//! - A [`Workflow`] row plus its [`WorkflowStep`] rows are the durable
//!   record; both follow strict transition tables, and anything off the table
//!   is `InvalidStateTransition` and mutates nothing.
//! - Starting a workflow is idempotent per `(type, user, input, context)`
//!   per day: a duplicate start returns the existing workflow unchanged.
//! - Steps run in strict ascending index order; each output becomes
//!   `context[stepName]` for every later step. Compensation walks completed
//!   compensatable steps in strict descending order.
//! - Recovery resumes orphaned workflows and fails stuck steps after a
//!   service interruption; the driver is single-flighted.
//!
//! ## Example
//!
//! ```ignore
//! use lockstep::{DefinitionRegistry, WorkflowEngine, workflows};
//! use lockstep::store::PostgresWorkflowStore;
//! use std::sync::Arc;
//!
//! let registry = DefinitionRegistry::new();
//! registry.register(workflows::contract_deployment());
//!
//! let store = Arc::new(PostgresWorkflowStore::new(pool));
//! let engine = Arc::new(WorkflowEngine::new(store, Arc::new(registry)));
//!
//! let wf = engine
//!     .start_workflow(
//!         "contract_deployment",
//!         serde_json::json!({ "contractCode": "0x6080", "contractName": "Token" }),
//!         Some("user-1"),
//!         None,
//!         None,
//!     )
//!     .await?;
//!
//! engine.spawn_recovery_loop(shutdown);
//! ```

mod definition;
mod engine;
mod error;
mod idempotency;
mod model;
mod recovery;
mod state;
pub mod store;
pub mod workflows;

pub use definition::{
    DefinitionRegistry, QueueStep, StepDefinition, StepHandler, WorkflowDefinition,
};
pub use engine::{EngineConfig, WorkflowEngine};
pub use error::WorkflowError;
pub use idempotency::{canonical_json, sha256_hex, step_key, workflow_key};
pub use model::{StepState, Workflow, WorkflowState, WorkflowStep};
pub use recovery::RecoveryReport;
pub use state::{transition_step, transition_workflow};
pub use store::{PostgresWorkflowStore, WorkflowStore};

// Re-export commonly used external types
pub use async_trait::async_trait;
