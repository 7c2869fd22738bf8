//! Workflow definitions and step handlers.
//!
//! A saga step is an object with an `execute` and an optional `compensate`,
//! not a captured closure: the handler receives its prepared input and the
//! workflow context bag, and compensation receives the original input and
//! the recorded output. Definitions are registered by type and looked up at
//! start time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::debug;

use conveyor::{JobOptions, JobState, QueueManager};

/// One step's behavior.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step. `input` is the workflow input extended with the
    /// outputs of completed prior steps; `context` is the raw output bag.
    async fn execute(&self, input: &Value, context: &Value) -> anyhow::Result<Value>;

    /// Undo a completed step. Only invoked when the step declared
    /// `requires_compensation` and actually completed.
    async fn compensate(
        &self,
        _input: &Value,
        _output: &Value,
        _context: &Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A named step with its execution policy.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub handler: Arc<dyn StepHandler>,
    pub max_retries: u32,
    pub is_idempotent: bool,
    pub requires_compensation: bool,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            max_retries: 3,
            is_idempotent: false,
            requires_compensation: false,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Mark the step idempotent: it gets a persisted idempotency key, and
    /// a completed execution with the same key short-circuits a re-run.
    pub fn idempotent(mut self) -> Self {
        self.is_idempotent = true;
        self
    }

    /// Mark the step for compensation when the saga unwinds.
    pub fn compensated(mut self) -> Self {
        self.requires_compensation = true;
        self
    }
}

/// An ordered set of steps under one workflow type.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    pub steps: Vec<StepDefinition>,
    /// Whole-workflow retry budget for `retry_workflow`.
    pub max_retries: u32,
}

impl WorkflowDefinition {
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            steps: Vec::new(),
            max_retries: 3,
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn step_by_name(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Registry of workflow definitions by type.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: DashMap<String, Arc<WorkflowDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: WorkflowDefinition) {
        let workflow_type = definition.workflow_type.clone();
        if self.definitions.contains_key(&workflow_type) {
            panic!("workflow definition already registered: {workflow_type}");
        }
        self.definitions.insert(workflow_type, Arc::new(definition));
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(workflow_type).map(|d| d.clone())
    }

    pub fn has(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }
}

// ============================================================================
// Queue-backed steps
// ============================================================================

/// A step that runs as a queued job: it enqueues its input as the payload
/// and polls the job log until the job completes, dead-letters, or the poll
/// budget runs out.
pub struct QueueStep {
    manager: Arc<QueueManager>,
    queue: String,
    kind: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl QueueStep {
    pub fn new(
        manager: Arc<QueueManager>,
        queue: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            queue: queue.into(),
            kind: kind.into(),
            poll_interval: Duration::from_millis(500),
            max_polls: 240,
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_polls: u32) -> Self {
        self.poll_interval = interval;
        self.max_polls = max_polls;
        self
    }
}

#[async_trait]
impl StepHandler for QueueStep {
    async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
        let job_id = self
            .manager
            .enqueue(&self.queue, &self.kind, input.clone(), JobOptions::default())
            .await?;
        debug!(queue = %self.queue, job_id = %job_id, "queue step submitted job");

        for _ in 0..self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            let job = self.manager.job_info(&self.queue, job_id).await?;
            match job.state {
                JobState::Completed => {
                    return Ok(json!({
                        "jobId": job_id,
                        "queue": self.queue,
                        "state": "completed",
                    }));
                }
                JobState::Dead => {
                    anyhow::bail!(
                        "queued job {job_id} dead-lettered: {}",
                        job.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
                _ => {}
            }
        }
        anyhow::bail!(
            "timeout: queued job {job_id} did not finish within {} polls",
            self.max_polls
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor::{
        ConveyorConfig, KindSettings, MemoryStore, Processor,
    };
    use conveyor::Job;
    use tokio_util::sync::CancellationToken;

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        async fn execute(&self, _job: &Job) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysInvalid;

    #[async_trait]
    impl Processor for AlwaysInvalid {
        async fn execute(&self, _job: &Job) -> anyhow::Result<()> {
            anyhow::bail!("validation failed: bad payload")
        }
    }

    #[test]
    fn definition_builder_sets_policies() {
        struct Noop;
        #[async_trait]
        impl StepHandler for Noop {
            async fn execute(&self, _i: &Value, _c: &Value) -> anyhow::Result<Value> {
                Ok(Value::Null)
            }
        }

        let def = WorkflowDefinition::new("t")
            .step(StepDefinition::new("a", Arc::new(Noop)).idempotent().compensated())
            .step(StepDefinition::new("b", Arc::new(Noop)).with_retries(5));

        assert_eq!(def.steps.len(), 2);
        assert!(def.steps[0].is_idempotent);
        assert!(def.steps[0].requires_compensation);
        assert_eq!(def.steps[1].max_retries, 5);
        assert!(def.step_by_name("b").is_some());
        assert!(def.step_by_name("zzz").is_none());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_definition_panics() {
        let registry = DefinitionRegistry::new();
        registry.register(WorkflowDefinition::new("t"));
        registry.register(WorkflowDefinition::new("t"));
    }

    #[tokio::test]
    async fn queue_step_waits_for_job_completion() {
        let manager = QueueManager::new(
            Arc::new(MemoryStore::new()),
            ConveyorConfig::default().with_queue("work", 1),
        );
        manager.register_processor("echo", Arc::new(Echo), KindSettings::default());

        let shutdown = CancellationToken::new();
        let handles = manager.start(shutdown.clone());

        let step = QueueStep::new(manager.clone(), "work", "echo")
            .with_polling(Duration::from_millis(25), 80);
        let output = step
            .execute(&json!({ "text": "hi" }), &json!({}))
            .await
            .unwrap();
        assert_eq!(output["state"], "completed");

        shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn queue_step_surfaces_dead_letters() {
        let manager = QueueManager::new(
            Arc::new(MemoryStore::new()),
            ConveyorConfig::default().with_queue("work", 1),
        );
        manager.register_processor("bad", Arc::new(AlwaysInvalid), KindSettings::default());

        let shutdown = CancellationToken::new();
        let handles = manager.start(shutdown.clone());

        let step = QueueStep::new(manager.clone(), "work", "bad")
            .with_polling(Duration::from_millis(25), 80);
        let err = step
            .execute(&json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dead-lettered"));

        shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }
    }
}
