//! Saga orchestration.
//!
//! A workflow runs as one logical task: steps execute synchronously in
//! ascending index order, each step's output lands in the context bag under
//! its name, and a failed step retries with exponential backoff (10%
//! jitter) until its budget runs out, at which point the workflow fails.
//! Compensation unwinds completed steps in descending index order.
//!
//! Business outcomes are states, not errors: a workflow that fails a step
//! returns `Ok` with `state = FAILED` and a `failure_reason`. Errors are
//! reserved for storage trouble, unknown types, and rejected transitions.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::definition::{DefinitionRegistry, StepDefinition, WorkflowDefinition};
use crate::error::WorkflowError;
use crate::idempotency::{step_key, workflow_key};
use crate::model::{StepState, Workflow, WorkflowState, WorkflowStep};
use crate::state::{transition_step, transition_workflow};
use crate::store::WorkflowStore;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base for step retry backoff: `2^retries * base * (1 + rand*0.1)`.
    pub step_backoff_base: Duration,
    /// RUNNING workflows untouched longer than this are orphans.
    pub workflow_stale_after: Duration,
    /// RUNNING steps untouched longer than this are stuck.
    pub step_stale_after: Duration,
    /// COMPLETED workflows older than this are archival candidates.
    pub completed_retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_backoff_base: Duration::from_secs(1),
            workflow_stale_after: Duration::from_secs(5 * 60),
            step_stale_after: Duration::from_secs(10 * 60),
            completed_retention_days: 30,
        }
    }
}

/// Saga engine: definition registry, execution, compensation, recovery.
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    registry: Arc<DefinitionRegistry>,
    config: EngineConfig,
    cancellations: DashMap<Uuid, CancellationToken>,
    pub(crate) recovery_running: AtomicBool,
}

/// How one step execution ended.
enum StepOutcome {
    Completed,
    /// Retries exhausted; reason recorded on the step.
    Exhausted(String),
    /// A cancellation signal was observed at a suspension point.
    Cancelled,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: Arc<DefinitionRegistry>) -> Self {
        Self::with_config(store, registry, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn WorkflowStore>,
        registry: Arc<DefinitionRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            cancellations: DashMap::new(),
            recovery_running: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<DefinitionRegistry> {
        &self.registry
    }

    pub(crate) fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Start (or deduplicate) a workflow and run it to an outcome.
    ///
    /// The idempotency key is derived from `(type, user, input, context)`
    /// plus today's date; a second start with equal arguments on the same
    /// day returns the existing workflow unchanged.
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        user_id: Option<&str>,
        wallet_address: Option<&str>,
        context_seed: Option<Value>,
    ) -> Result<Workflow, WorkflowError> {
        let definition = self
            .registry
            .get(workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(workflow_type.to_string()))?;

        let mut context = match context_seed {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => serde_json::json!({ "seed": other }),
            None => Value::Object(Map::new()),
        };
        if let Some(wallet) = wallet_address {
            context["walletAddress"] = Value::String(wallet.to_string());
        }

        let key = workflow_key(
            workflow_type,
            user_id,
            &input,
            &context,
            Utc::now().date_naive(),
        );

        // Duplicate guard: collisions return the existing workflow as-is.
        if let Some(existing) = self.store.find_by_key(&key).await? {
            debug!(workflow_id = %existing.id, key = %key, "duplicate start, returning existing");
            return Ok(existing);
        }

        let wf = Workflow::new(
            workflow_type,
            key,
            user_id.map(str::to_string),
            input,
            context,
            definition.steps.len(),
            definition.max_retries,
        );
        let steps: Vec<WorkflowStep> = definition
            .steps
            .iter()
            .enumerate()
            .map(|(index, sd)| {
                WorkflowStep::new(
                    wf.id,
                    index,
                    sd.name.clone(),
                    sd.max_retries,
                    sd.is_idempotent,
                    sd.requires_compensation,
                )
            })
            .collect();

        self.store.insert(&wf, &steps).await?;
        info!(
            workflow_id = %wf.id,
            workflow_type = %wf.workflow_type,
            steps = wf.total_steps,
            "workflow started"
        );
        self.execute(wf.id).await
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run a workflow from its current step index to an outcome.
    pub async fn execute(&self, id: Uuid) -> Result<Workflow, WorkflowError> {
        let mut wf = self
            .store
            .workflow(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(id))?;
        let definition = self
            .registry
            .get(&wf.workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(wf.workflow_type.clone()))?;

        match wf.state {
            WorkflowState::Running => {}
            _ => {
                transition_workflow(&mut wf, WorkflowState::Running)?;
                self.store.update_workflow(&wf).await?;
            }
        }

        let token = self
            .cancellations
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone();
        let mut steps = self.store.steps(id).await?;

        let start = wf.current_step_index.max(0) as usize;
        for index in start..wf.total_steps as usize {
            if token.is_cancelled() {
                return self.finish(wf);
            }

            wf.current_step_index = index as i32;
            wf.updated_at = Utc::now();
            self.store.update_workflow(&wf).await?;

            let step = steps
                .get_mut(index)
                .ok_or(WorkflowError::StepMissing { id, index: index as i32 })?;
            if step.state.is_terminal() {
                continue; // already done (recovery resume)
            }
            let step_index = step.step_index;
            let step_def = definition
                .step_by_name(&step.name)
                .ok_or(WorkflowError::StepMissing { id, index: step_index })?;

            match self.execute_step(&mut wf, step_def, step, &token).await? {
                StepOutcome::Completed => {}
                StepOutcome::Cancelled => return self.finish(wf),
                StepOutcome::Exhausted(reason) => {
                    let reason = format!("step {} failed: {reason}", step.name);
                    transition_workflow(&mut wf, WorkflowState::Failed)?;
                    wf.failure_reason = Some(reason.clone());
                    self.store.update_workflow(&wf).await?;
                    warn!(workflow_id = %wf.id, reason = %reason, "workflow failed");
                    return self.finish(wf);
                }
            }
        }

        transition_workflow(&mut wf, WorkflowState::Completed)?;
        self.store.update_workflow(&wf).await?;
        info!(workflow_id = %wf.id, "workflow completed");
        self.finish(wf)
    }

    /// Drop the cancellation token for terminal workflows.
    fn finish(&self, wf: Workflow) -> Result<Workflow, WorkflowError> {
        if wf.state.is_terminal() || wf.state == WorkflowState::Failed {
            self.cancellations.remove(&wf.id);
        }
        Ok(wf)
    }

    /// Run one step to completion, retrying with backoff.
    async fn execute_step(
        &self,
        wf: &mut Workflow,
        step_def: &StepDefinition,
        step: &mut WorkflowStep,
        token: &CancellationToken,
    ) -> Result<StepOutcome, WorkflowError> {
        let input = prepare_step_input(wf);

        // Idempotent steps persist a key and may short-circuit on a prior
        // completed execution with the same key.
        if step_def.is_idempotent {
            let key = step_key(&wf.idempotency_key, &step.name, &input);
            step.idempotency_key = Some(key.clone());
            if let Some(cached) = self.store.cached_step_output(&key).await? {
                debug!(
                    workflow_id = %wf.id,
                    step = %step.name,
                    "idempotency hit, reusing recorded output"
                );
                transition_step(step, StepState::Running)?;
                step.input = Some(input);
                step.output = Some(cached.clone());
                transition_step(step, StepState::Completed)?;
                self.store.update_step(step).await?;
                self.record_output(wf, &step.name, cached).await?;
                return Ok(StepOutcome::Completed);
            }
        }

        loop {
            if token.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }

            // Honor a retry schedule written by the recovery driver.
            if let Some(at) = step.next_retry_at {
                let wait = (at - Utc::now()).to_std().unwrap_or_default();
                if !wait.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return Ok(StepOutcome::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                step.next_retry_at = None;
            }

            transition_step(step, StepState::Running)?;
            step.input = Some(input.clone());
            self.store.update_step(step).await?;

            match step_def.handler.execute(&input, &wf.context).await {
                Ok(output) => {
                    step.output = Some(output.clone());
                    step.failure_reason = None;
                    transition_step(step, StepState::Completed)?;
                    self.store.update_step(step).await?;
                    self.record_output(wf, &step.name, output).await?;
                    debug!(workflow_id = %wf.id, step = %step.name, "step completed");
                    return Ok(StepOutcome::Completed);
                }
                Err(e) => {
                    let reason = e.to_string();
                    transition_step(step, StepState::Failed)?;
                    step.failure_reason = Some(reason.clone());

                    if step.retry_count < step.max_retries {
                        let delay = self.step_backoff(step.retry_count as u32);
                        step.retry_count += 1;
                        step.next_retry_at =
                            Some(Utc::now() + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(1)));
                        self.store.update_step(step).await?;
                        warn!(
                            workflow_id = %wf.id,
                            step = %step.name,
                            retry = step.retry_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %reason,
                            "step failed, retrying"
                        );
                        continue;
                    }

                    self.store.update_step(step).await?;
                    return Ok(StepOutcome::Exhausted(reason));
                }
            }
        }
    }

    /// `2^retries * base`, with up to +10% jitter.
    fn step_backoff(&self, retries: u32) -> Duration {
        let base = self.config.step_backoff_base.as_millis() as f64;
        let raw = base * 2f64.powi(retries as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_millis((raw * (1.0 + jitter * 0.1)) as u64)
    }

    /// Record a step output into the context bag under the step's name.
    async fn record_output(
        &self,
        wf: &mut Workflow,
        step_name: &str,
        output: Value,
    ) -> Result<(), WorkflowError> {
        if !wf.context.is_object() {
            wf.context = Value::Object(Map::new());
        }
        wf.context[step_name] = output;
        wf.updated_at = Utc::now();
        self.store.update_workflow(wf).await
    }

    // ------------------------------------------------------------------
    // Cancel / retry
    // ------------------------------------------------------------------

    /// Cancel a workflow. The current step observes the signal at its next
    /// suspension point and returns without effect.
    pub async fn cancel_workflow(&self, id: Uuid) -> Result<Workflow, WorkflowError> {
        let mut wf = self
            .store
            .workflow(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(id))?;
        transition_workflow(&mut wf, WorkflowState::Cancelled)?;
        self.store.update_workflow(&wf).await?;
        if let Some((_, token)) = self.cancellations.remove(&id) {
            token.cancel();
        }
        info!(workflow_id = %id, "workflow cancelled");
        Ok(wf)
    }

    /// Retry a FAILED workflow from its current step.
    pub async fn retry_workflow(&self, id: Uuid) -> Result<Workflow, WorkflowError> {
        let mut wf = self
            .store
            .workflow(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(id))?;
        if !wf.state.is_recoverable() {
            return Err(WorkflowError::NotRecoverable {
                id,
                state: wf.state.as_str().to_string(),
            });
        }
        if wf.retry_count >= wf.max_retries {
            return Err(WorkflowError::NotRecoverable {
                id,
                state: format!("failed ({} retries exhausted)", wf.retry_count),
            });
        }

        wf.retry_count += 1;
        wf.failure_reason = None;
        wf.updated_at = Utc::now();
        self.store.update_workflow(&wf).await?;

        // Give the step that sank the workflow a fresh budget.
        let mut steps = self.store.steps(id).await?;
        if let Some(step) = steps
            .iter_mut()
            .find(|s| s.step_index == wf.current_step_index)
        {
            if step.state == StepState::Failed {
                step.retry_count = 0;
                step.next_retry_at = None;
                step.updated_at = Utc::now();
                self.store.update_step(step).await?;
            }
        }

        info!(workflow_id = %id, attempt = wf.retry_count, "retrying workflow");
        self.execute(id).await
    }

    // ------------------------------------------------------------------
    // Compensation
    // ------------------------------------------------------------------

    /// Unwind a workflow: compensate completed steps in descending index
    /// order. Requires state in {COMPLETED, FAILED, CANCELLED} unless
    /// `force` is set (admin path), which bypasses the state-machine guard
    /// but follows the same reverse-order contract.
    pub async fn compensate_workflow(
        &self,
        id: Uuid,
        force: bool,
    ) -> Result<Workflow, WorkflowError> {
        let mut wf = self
            .store
            .workflow(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(id))?;
        let definition = self
            .registry
            .get(&wf.workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(wf.workflow_type.clone()))?;

        if force {
            wf.state = WorkflowState::Compensating;
            wf.updated_at = Utc::now();
        } else {
            transition_workflow(&mut wf, WorkflowState::Compensating)?;
        }
        self.store.update_workflow(&wf).await?;
        info!(workflow_id = %id, force, "compensation started");

        let mut steps = self.store.steps(id).await?;
        steps.sort_by_key(|s| std::cmp::Reverse(s.step_index));

        for step in steps.iter_mut() {
            if step.state != StepState::Completed || !step.requires_compensation || step.is_compensated
            {
                continue;
            }
            let Some(step_def) = definition.step_by_name(&step.name) else {
                continue;
            };

            transition_step(step, StepState::Compensating)?;
            self.store.update_step(step).await?;

            let input = step.input.clone().unwrap_or(Value::Null);
            let output = step.output.clone().unwrap_or(Value::Null);
            match step_def.handler.compensate(&input, &output, &wf.context).await {
                Ok(()) => {
                    transition_step(step, StepState::Compensated)?;
                    step.is_compensated = true;
                    self.store.update_step(step).await?;
                    debug!(workflow_id = %id, step = %step.name, "step compensated");
                }
                Err(e) => {
                    let reason = format!("Compensation failed: {e}");
                    transition_step(step, StepState::Failed)?;
                    step.failure_reason = Some(reason.clone());
                    self.store.update_step(step).await?;

                    transition_workflow(&mut wf, WorkflowState::Failed)?;
                    wf.failure_reason = Some(reason.clone());
                    self.store.update_workflow(&wf).await?;
                    warn!(workflow_id = %id, step = %step.name, reason = %reason, "compensation aborted");
                    return Ok(wf);
                }
            }
        }

        transition_workflow(&mut wf, WorkflowState::Compensated)?;
        self.store.update_workflow(&wf).await?;
        info!(workflow_id = %id, "workflow compensated");
        Ok(wf)
    }

    /// Fetch a workflow (admin/info path).
    pub async fn workflow(&self, id: Uuid) -> Result<Workflow, WorkflowError> {
        self.store
            .workflow(id)
            .await?
            .ok_or(WorkflowError::WorkflowNotFound(id))
    }

    /// Fetch a workflow's steps, ordered by index.
    pub async fn workflow_steps(&self, id: Uuid) -> Result<Vec<WorkflowStep>, WorkflowError> {
        self.store.steps(id).await
    }
}

/// Step input: the workflow input extended with `{stepName: output}` for
/// every completed prior step.
fn prepare_step_input(wf: &Workflow) -> Value {
    let mut map = match &wf.input {
        Value::Object(m) => m.clone(),
        other => {
            let mut m = Map::new();
            m.insert("input".to_string(), other.clone());
            m
        }
    };
    if let Value::Object(context) = &wf.context {
        for (name, output) in context {
            map.insert(name.clone(), output.clone());
        }
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepHandler;
    use crate::store::testing::InMemoryWorkflowStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn test_config() -> EngineConfig {
        EngineConfig {
            step_backoff_base: Duration::from_millis(5),
            ..Default::default()
        }
    }

    /// Records execution order and succeeds.
    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        calls: AtomicU32,
    }

    impl Record {
        fn def(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> StepDefinition {
            StepDefinition::new(
                name,
                Arc::new(Record {
                    name,
                    log: log.clone(),
                    calls: AtomicU32::new(0),
                }),
            )
        }
    }

    #[async_trait]
    impl StepHandler for Record {
        async fn execute(&self, _input: &Value, _context: &Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("exec:{}", self.name));
            Ok(json!({ "step": self.name }))
        }

        async fn compensate(
            &self,
            _input: &Value,
            _output: &Value,
            _context: &Value,
        ) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("comp:{}", self.name));
            Ok(())
        }
    }

    /// Fails N times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for Flaky {
        async fn execute(&self, _input: &Value, _context: &Value) -> anyhow::Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("transient wobble {call}");
            }
            Ok(json!({ "ok": true }))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl StepHandler for AlwaysFails {
        async fn execute(&self, _input: &Value, _context: &Value) -> anyhow::Result<Value> {
            anyhow::bail!("permanently broken")
        }
    }

    fn engine_with(definition: WorkflowDefinition) -> WorkflowEngine {
        let registry = DefinitionRegistry::new();
        registry.register(definition);
        WorkflowEngine::with_config(
            Arc::new(InMemoryWorkflowStore::new()),
            Arc::new(registry),
            test_config(),
        )
    }

    #[tokio::test]
    async fn happy_path_runs_steps_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            WorkflowDefinition::new("three_steps")
                .step(Record::def("a", &log))
                .step(Record::def("b", &log))
                .step(Record::def("c", &log)),
        );

        let wf = engine
            .start_workflow("three_steps", json!({ "x": 1 }), Some("u1"), None, None)
            .await
            .unwrap();

        assert_eq!(wf.state, WorkflowState::Completed);
        assert!(wf.completed_at.unwrap() > wf.started_at.unwrap());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["exec:a", "exec:b", "exec:c"]
        );
        assert_eq!(wf.context["a"], json!({ "step": "a" }));
        assert_eq!(wf.context["c"], json!({ "step": "c" }));

        // The observed step sequence is a dense prefix, all COMPLETED.
        let steps = engine.workflow_steps(wf.id).await.unwrap();
        for (i, step) in steps.iter().enumerate() {
            assert_eq!(step.step_index, i as i32);
            assert_eq!(step.state, StepState::Completed);
        }
    }

    #[tokio::test]
    async fn later_steps_see_prior_outputs_in_input() {
        struct AssertSeesA;
        #[async_trait]
        impl StepHandler for AssertSeesA {
            async fn execute(&self, input: &Value, _context: &Value) -> anyhow::Result<Value> {
                anyhow::ensure!(input["a"] == json!({ "step": "a" }), "missing prior output");
                anyhow::ensure!(input["x"] == json!(1), "missing workflow input");
                Ok(json!({}))
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            WorkflowDefinition::new("chained")
                .step(Record::def("a", &log))
                .step(StepDefinition::new("b", Arc::new(AssertSeesA))),
        );

        let wf = engine
            .start_workflow("chained", json!({ "x": 1 }), None, None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn duplicate_start_returns_existing_workflow() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            WorkflowDefinition::new("contract_deployment")
                .step(Record::def("validate_contract_code", &log))
                .step(Record::def("deploy_contract", &log)),
        );

        let input = json!({ "contractCode": "0x1", "contractName": "T" });
        let first = engine
            .start_workflow("contract_deployment", input.clone(), Some("u1"), None, None)
            .await
            .unwrap();
        let second = engine
            .start_workflow("contract_deployment", input, Some("u1"), None, None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        // Exactly one row per step persists.
        assert_eq!(engine.workflow_steps(first.id).await.unwrap().len(), 2);
        // The second call did not re-run anything.
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn different_users_get_distinct_workflows() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            WorkflowDefinition::new("t").step(Record::def("a", &log)),
        );

        let a = engine
            .start_workflow("t", json!({}), Some("u1"), None, None)
            .await
            .unwrap();
        let b = engine
            .start_workflow("t", json!({}), Some("u2"), None, None)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let engine = engine_with(WorkflowDefinition::new("known"));
        let err = engine
            .start_workflow("mystery", json!({}), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownWorkflowType(_)));
    }

    #[tokio::test]
    async fn step_retries_with_backoff_then_succeeds() {
        let engine = engine_with(
            WorkflowDefinition::new("flaky").step(StepDefinition::new(
                "wobbly",
                Arc::new(Flaky {
                    failures: 2,
                    calls: AtomicU32::new(0),
                }),
            )),
        );

        let wf = engine
            .start_workflow("flaky", json!({}), None, None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Completed);

        let steps = engine.workflow_steps(wf.id).await.unwrap();
        assert_eq!(steps[0].retry_count, 2);
        assert_eq!(steps[0].state, StepState::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_workflow() {
        let engine = engine_with(
            WorkflowDefinition::new("doomed").step(
                StepDefinition::new("broken", Arc::new(AlwaysFails)).with_retries(1),
            ),
        );

        let wf = engine
            .start_workflow("doomed", json!({}), None, None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);
        let reason = wf.failure_reason.unwrap();
        assert!(reason.contains("broken"));
        assert!(reason.contains("permanently broken"));

        let steps = engine.workflow_steps(wf.id).await.unwrap();
        assert_eq!(steps[0].state, StepState::Failed);
    }

    #[tokio::test]
    async fn retry_workflow_resumes_a_failed_run() {
        let flaky = Arc::new(Flaky {
            // Fails the first run (1 try + 1 retry), succeeds on manual retry.
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let engine = engine_with(
            WorkflowDefinition::new("recoverable").step(
                StepDefinition::new("wobbly", flaky.clone()).with_retries(1),
            ),
        );

        let wf = engine
            .start_workflow("recoverable", json!({}), None, None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);

        let retried = engine.retry_workflow(wf.id).await.unwrap();
        assert_eq!(retried.state, WorkflowState::Completed);
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn retry_requires_failed_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(WorkflowDefinition::new("t").step(Record::def("a", &log)));
        let wf = engine
            .start_workflow("t", json!({}), None, None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Completed);

        let err = engine.retry_workflow(wf.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NotRecoverable { .. }));
    }

    #[tokio::test]
    async fn cancel_requires_a_legal_edge() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(WorkflowDefinition::new("t").step(Record::def("a", &log)));
        let wf = engine
            .start_workflow("t", json!({}), None, None, None)
            .await
            .unwrap();

        // COMPLETED -> CANCELLED is not in the table.
        let err = engine.cancel_workflow(wf.id).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));
        assert_eq!(
            engine.workflow(wf.id).await.unwrap().state,
            WorkflowState::Completed
        );
    }

    #[tokio::test]
    async fn compensation_unwinds_in_reverse_order() {
        // Contract-deployment shape: three compensated steps complete, the
        // fourth fails, the saga unwinds 2 -> 1 -> 0.
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            WorkflowDefinition::new("contract_deployment")
                .step(Record::def("validate_contract_code", &log).compensated())
                .step(Record::def("deploy_contract", &log).compensated())
                .step(Record::def("verify_contract", &log).compensated())
                .step(
                    StepDefinition::new("index_contract", Arc::new(AlwaysFails)).with_retries(0),
                ),
        );

        let wf = engine
            .start_workflow(
                "contract_deployment",
                json!({ "contractCode": "0x1" }),
                Some("u1"),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Failed);

        let compensated = engine.compensate_workflow(wf.id, false).await.unwrap();
        assert_eq!(compensated.state, WorkflowState::Compensated);

        let entries = log.lock().unwrap().clone();
        let comps: Vec<&String> = entries.iter().filter(|e| e.starts_with("comp:")).collect();
        assert_eq!(
            comps,
            vec![
                "comp:verify_contract",
                "comp:deploy_contract",
                "comp:validate_contract_code"
            ]
        );

        // Compensation timestamps are non-increasing in step index.
        let steps = engine.workflow_steps(wf.id).await.unwrap();
        let mut comp_times: Vec<(i32, chrono::DateTime<Utc>)> = steps
            .iter()
            .filter(|s| s.is_compensated)
            .map(|s| (s.step_index, s.completed_at.unwrap()))
            .collect();
        comp_times.sort_by_key(|(index, _)| *index);
        for pair in comp_times.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[tokio::test]
    async fn compensation_requires_a_legal_state() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(WorkflowDefinition::new("t").step(Record::def("a", &log)));

        // A PENDING workflow (inserted but never run) cannot compensate.
        let wf = Workflow::new("t", "k-manual", None, json!({}), json!({}), 1, 3);
        let steps = vec![WorkflowStep::new(wf.id, 0, "a", 3, false, false)];
        engine.store().insert(&wf, &steps).await.unwrap();

        let err = engine.compensate_workflow(wf.id, false).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));

        // Force bypasses the guard.
        let forced = engine.compensate_workflow(wf.id, true).await.unwrap();
        assert_eq!(forced.state, WorkflowState::Compensated);
    }

    #[tokio::test]
    async fn failed_compensation_stops_progress() {
        struct CompBomb;
        #[async_trait]
        impl StepHandler for CompBomb {
            async fn execute(&self, _i: &Value, _c: &Value) -> anyhow::Result<Value> {
                Ok(json!({}))
            }
            async fn compensate(
                &self,
                _i: &Value,
                _o: &Value,
                _c: &Value,
            ) -> anyhow::Result<()> {
                anyhow::bail!("undo exploded")
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(
            WorkflowDefinition::new("t")
                .step(Record::def("a", &log).compensated())
                .step(StepDefinition::new("b", Arc::new(CompBomb)).compensated()),
        );

        let wf = engine
            .start_workflow("t", json!({}), None, None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Completed);

        let result = engine.compensate_workflow(wf.id, false).await.unwrap();
        assert_eq!(result.state, WorkflowState::Failed);
        assert!(result
            .failure_reason
            .unwrap()
            .starts_with("Compensation failed"));

        // The earlier step was never compensated: progress stopped at "b".
        let comps: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("comp:"))
            .cloned()
            .collect();
        assert!(comps.is_empty());
    }

    #[tokio::test]
    async fn idempotent_step_short_circuits_on_cached_output() {
        let counter = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let store = Arc::new(InMemoryWorkflowStore::new());
        let registry = DefinitionRegistry::new();
        registry.register(
            WorkflowDefinition::new("t")
                .step(StepDefinition::new("external_call", counter.clone()).idempotent()),
        );
        let engine = WorkflowEngine::with_config(store.clone(), Arc::new(registry), test_config());

        // Plant a completed execution with the exact key this workflow's
        // step will compute.
        let expected_wf_key = workflow_key(
            "t",
            Some("u1"),
            &json!({}),
            &json!({}),
            Utc::now().date_naive(),
        );
        let expected_step_key = step_key(&expected_wf_key, "external_call", &json!({}));
        let ghost = Workflow::new("t-ghost", "k-ghost", None, json!({}), json!({}), 1, 3);
        let mut ghost_step = WorkflowStep::new(ghost.id, 0, "external_call", 3, true, false);
        ghost_step.idempotency_key = Some(expected_step_key);
        ghost_step.state = StepState::Completed;
        ghost_step.output = Some(json!({ "receipt": "r-1" }));
        store.insert(&ghost, &[ghost_step]).await.unwrap();

        let wf = engine
            .start_workflow("t", json!({}), Some("u1"), None, None)
            .await
            .unwrap();
        assert_eq!(wf.state, WorkflowState::Completed);
        assert_eq!(wf.context["external_call"], json!({ "receipt": "r-1" }));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 0, "handler never ran");
    }

    #[tokio::test]
    async fn wallet_address_lands_in_context_and_key() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(WorkflowDefinition::new("t").step(Record::def("a", &log)));

        let with_wallet = engine
            .start_workflow("t", json!({}), Some("u1"), Some("0xabc"), None)
            .await
            .unwrap();
        let without = engine
            .start_workflow("t", json!({}), Some("u1"), None, None)
            .await
            .unwrap();

        assert_ne!(with_wallet.id, without.id);
        assert_eq!(with_wallet.context["walletAddress"], json!("0xabc"));
    }
}
