//! Crash recovery.
//!
//! Runs at startup and on a periodic timer:
//!
//! - **Orphans**: RUNNING workflows untouched for 5 minutes. With a FAILED
//!   step they are marked FAILED ("service interruption"); otherwise the
//!   cursor moves past the last completed step and execution resumes.
//! - **Stuck steps**: RUNNING steps untouched for 10 minutes are failed
//!   ("step timed out during service interruption") and rescheduled while
//!   retries remain; past the budget the parent workflow fails.
//! - **Retention**: COMPLETED workflows past 30 days are logged as
//!   archival candidates.
//!
//! The driver is single-flighted by an in-process flag; overlapping
//! triggers are ignored while one pass runs.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::WorkflowEngine;
use crate::error::WorkflowError;
use crate::model::{StepState, WorkflowState};
use crate::state::{transition_step, transition_workflow};

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    pub orphans_resumed: usize,
    pub orphans_failed: usize,
    pub steps_timed_out: usize,
    pub archival_candidates: usize,
}

impl WorkflowEngine {
    /// Run one recovery pass. Concurrent calls are ignored while a pass is
    /// in flight.
    pub async fn recover(&self) -> Result<RecoveryReport, WorkflowError> {
        if self.recovery_running.swap(true, Ordering::SeqCst) {
            return Ok(RecoveryReport {
                skipped: true,
                ..Default::default()
            });
        }
        let result = self.recover_inner().await;
        self.recovery_running.store(false, Ordering::SeqCst);
        result
    }

    async fn recover_inner(&self) -> Result<RecoveryReport, WorkflowError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        // --- Orphaned workflows ---
        let wf_cutoff = now
            - chrono::Duration::from_std(self.config().workflow_stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(5));
        for mut wf in self.store().running_workflows_older_than(wf_cutoff).await? {
            let steps = self.store().steps(wf.id).await?;

            if steps.iter().any(|s| s.state == StepState::Failed) {
                transition_workflow(&mut wf, WorkflowState::Failed)?;
                wf.failure_reason = Some("service interruption".to_string());
                self.store().update_workflow(&wf).await?;
                warn!(workflow_id = %wf.id, "orphaned workflow marked failed");
                report.orphans_failed += 1;
                continue;
            }

            let last_completed = steps
                .iter()
                .filter(|s| s.state == StepState::Completed)
                .map(|s| s.step_index)
                .max();
            wf.current_step_index = last_completed.map(|i| i + 1).unwrap_or(0);
            wf.updated_at = now;
            self.store().update_workflow(&wf).await?;

            info!(
                workflow_id = %wf.id,
                resume_at = wf.current_step_index,
                "resuming orphaned workflow"
            );
            match self.execute(wf.id).await {
                Ok(_) => report.orphans_resumed += 1,
                Err(e) => {
                    error!(workflow_id = %wf.id, error = %e, "orphan resume failed");
                }
            }
        }

        // --- Stuck steps ---
        let step_cutoff = now
            - chrono::Duration::from_std(self.config().step_stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        for mut step in self.store().running_steps_older_than(step_cutoff).await? {
            transition_step(&mut step, StepState::Failed)?;
            step.failure_reason =
                Some("step timed out during service interruption".to_string());
            step.retry_count += 1;

            if step.retry_count <= step.max_retries {
                step.next_retry_at = Some(now + chrono::Duration::seconds(2));
                self.store().update_step(&step).await?;
                warn!(
                    workflow_id = %step.workflow_id,
                    step = %step.name,
                    retry = step.retry_count,
                    "stuck step rescheduled"
                );
            } else {
                self.store().update_step(&step).await?;
                if let Some(mut wf) = self.store().workflow(step.workflow_id).await? {
                    if wf.state.can_transition_to(WorkflowState::Failed) {
                        transition_workflow(&mut wf, WorkflowState::Failed)?;
                        wf.failure_reason =
                            Some("step timed out during service interruption".to_string());
                        self.store().update_workflow(&wf).await?;
                    }
                }
                warn!(
                    workflow_id = %step.workflow_id,
                    step = %step.name,
                    "stuck step out of retries, workflow failed"
                );
            }
            report.steps_timed_out += 1;
        }

        // --- Retention (archival boundary) ---
        let retention_cutoff =
            now - chrono::Duration::days(self.config().completed_retention_days);
        let aged = self
            .store()
            .completed_workflows_older_than(retention_cutoff)
            .await?;
        for wf in &aged {
            info!(
                workflow_id = %wf.id,
                workflow_type = %wf.workflow_type,
                completed_at = ?wf.completed_at,
                "completed workflow past retention"
            );
        }
        report.archival_candidates = aged.len();

        if report != RecoveryReport::default() {
            info!(
                resumed = report.orphans_resumed,
                failed = report.orphans_failed,
                timed_out = report.steps_timed_out,
                archival = report.archival_candidates,
                "recovery pass finished"
            );
        }
        Ok(report)
    }

    /// Spawn the periodic recovery loop (startup pass plus every 5 min).
    pub fn spawn_recovery_loop(
        self: Arc<Self>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let engine = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = engine.recover().await {
                            error!(error = %e, "recovery pass failed");
                        }
                    }
                }
            }
        })
    }
}
