//! Deterministic state machines for workflows and steps.
//!
//! The transition tables are the single source of truth. Any transition not
//! listed fails with `InvalidStateTransition` and mutates nothing.

use chrono::Utc;

use crate::error::WorkflowError;
use crate::model::{StepState, Workflow, WorkflowState, WorkflowStep};

impl WorkflowState {
    /// The workflow transition table.
    pub fn can_transition_to(self, to: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Compensating)
                | (Completed, Compensating)
                | (Failed, Running)
                | (Failed, Cancelled)
                | (Failed, Compensating)
                | (Cancelled, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }
}

impl StepState {
    /// The step transition table.
    pub fn can_transition_to(self, to: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Skipped)
                | (Completed, Compensating)
                | (Failed, Running)
                | (Failed, Skipped)
                | (Failed, Compensating)
                | (Skipped, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }
}

/// Move a workflow to `to`, stamping the lifecycle timestamps. Fails
/// without mutation when the edge is not in the table.
pub fn transition_workflow(wf: &mut Workflow, to: WorkflowState) -> Result<(), WorkflowError> {
    if !wf.state.can_transition_to(to) {
        return Err(WorkflowError::InvalidStateTransition {
            entity: "workflow",
            from: wf.state.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    let now = Utc::now();
    wf.state = to;
    wf.updated_at = now;
    match to {
        WorkflowState::Running if wf.started_at.is_none() => wf.started_at = Some(now),
        WorkflowState::Completed | WorkflowState::Compensated | WorkflowState::Cancelled => {
            wf.completed_at = Some(now)
        }
        _ => {}
    }
    Ok(())
}

/// Move a step to `to`, stamping the lifecycle timestamps. Fails without
/// mutation when the edge is not in the table.
pub fn transition_step(step: &mut WorkflowStep, to: StepState) -> Result<(), WorkflowError> {
    if !step.state.can_transition_to(to) {
        return Err(WorkflowError::InvalidStateTransition {
            entity: "step",
            from: step.state.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    let now = Utc::now();
    step.state = to;
    step.updated_at = now;
    match to {
        StepState::Running if step.started_at.is_none() => step.started_at = Some(now),
        StepState::Completed | StepState::Compensated => step.completed_at = Some(now),
        _ => {}
    }
    Ok(())
}
