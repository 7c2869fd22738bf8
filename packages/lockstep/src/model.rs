//! Workflow and step rows.
//!
//! A workflow exclusively owns its steps (cascade delete). `context` is the
//! typed bag of step outputs keyed by step name; later steps see the
//! outputs of every completed predecessor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// States
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "workflow_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Compensating,
    Compensated,
}

impl WorkflowState {
    /// Terminal workflows never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Cancelled | WorkflowState::Compensated
        )
    }

    /// A workflow is recoverable iff it is FAILED.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, WorkflowState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
            WorkflowState::Compensating => "compensating",
            WorkflowState::Compensated => "compensated",
        }
    }

    pub const ALL: [WorkflowState; 7] = [
        WorkflowState::Pending,
        WorkflowState::Running,
        WorkflowState::Completed,
        WorkflowState::Failed,
        WorkflowState::Cancelled,
        WorkflowState::Compensating,
        WorkflowState::Compensated,
    ];
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "workflow_step_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Compensating,
    Compensated,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Skipped | StepState::Compensated
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::Compensating => "compensating",
            StepState::Compensated => "compensated",
        }
    }

    pub const ALL: [StepState; 7] = [
        StepState::Pending,
        StepState::Running,
        StepState::Completed,
        StepState::Failed,
        StepState::Skipped,
        StepState::Compensating,
        StepState::Compensated,
    ];
}

// ============================================================================
// Rows
// ============================================================================

/// One saga run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    /// Unique; collisions return the existing workflow unchanged.
    pub idempotency_key: String,
    pub workflow_type: String,
    pub user_id: Option<String>,
    pub input: serde_json::Value,
    /// Step outputs keyed by step name.
    pub context: serde_json::Value,
    pub current_step_index: i32,
    pub total_steps: i32,
    pub state: WorkflowState,
    pub retry_count: i32,
    pub max_retries: i32,
    pub requires_compensation: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    pub fn new(
        workflow_type: impl Into<String>,
        idempotency_key: impl Into<String>,
        user_id: Option<String>,
        input: serde_json::Value,
        context: serde_json::Value,
        total_steps: usize,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: idempotency_key.into(),
            workflow_type: workflow_type.into(),
            user_id,
            input,
            context,
            current_step_index: 0,
            total_steps: total_steps as i32,
            state: WorkflowState::Pending,
            retry_count: 0,
            max_retries: max_retries as i32,
            requires_compensation: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

/// One step row within a workflow. `step_index` is dense and 0-based.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_index: i32,
    pub name: String,
    pub state: StepState,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub is_idempotent: bool,
    pub idempotency_key: Option<String>,
    pub requires_compensation: bool,
    pub is_compensated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn new(
        workflow_id: Uuid,
        step_index: usize,
        name: impl Into<String>,
        max_retries: u32,
        is_idempotent: bool,
        requires_compensation: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            step_index: step_index as i32,
            name: name.into(),
            state: StepState::Pending,
            input: None,
            output: None,
            retry_count: 0,
            max_retries: max_retries as i32,
            next_retry_at: None,
            failure_reason: None,
            is_idempotent,
            idempotency_key: None,
            requires_compensation,
            is_compensated: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}
