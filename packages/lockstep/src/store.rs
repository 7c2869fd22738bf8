//! Workflow persistence.
//!
//! Workflow and step rows live in a relational store; `idempotency_key` is
//! unique. The engine writes timestamps itself (the recovery driver reads
//! `updated_at` to find orphans), so the SQL binds the struct's values
//! rather than `NOW()`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::model::{Workflow, WorkflowStep};

/// Persistence seam for workflows and their steps.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert a workflow together with all of its step rows.
    async fn insert(&self, wf: &Workflow, steps: &[WorkflowStep]) -> Result<(), WorkflowError>;

    /// Look a workflow up by its idempotency key.
    async fn find_by_key(&self, key: &str) -> Result<Option<Workflow>, WorkflowError>;

    async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>, WorkflowError>;

    async fn update_workflow(&self, wf: &Workflow) -> Result<(), WorkflowError>;

    /// All steps of a workflow, ordered by `step_index`.
    async fn steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, WorkflowError>;

    async fn update_step(&self, step: &WorkflowStep) -> Result<(), WorkflowError>;

    /// RUNNING workflows whose `updated_at` is older than `cutoff`.
    async fn running_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, WorkflowError>;

    /// RUNNING steps whose `updated_at` is older than `cutoff`.
    async fn running_steps_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowStep>, WorkflowError>;

    /// COMPLETED workflows older than `cutoff` (archival candidates).
    async fn completed_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, WorkflowError>;

    /// Output of a COMPLETED step persisted under this idempotency key, if
    /// any. Used to short-circuit duplicate executions of idempotent steps.
    async fn cached_step_output(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<serde_json::Value>, WorkflowError>;

    /// Delete a workflow and (by cascade) its steps.
    async fn delete(&self, id: Uuid) -> Result<(), WorkflowError>;
}

// ============================================================================
// Postgres
// ============================================================================

const WORKFLOW_COLUMNS: &str = "id, idempotency_key, workflow_type, user_id, input, context, \
     current_step_index, total_steps, state, retry_count, max_retries, requires_compensation, \
     failure_reason, created_at, updated_at, started_at, completed_at";

const STEP_COLUMNS: &str = "id, workflow_id, step_index, name, state, input, output, \
     retry_count, max_retries, next_retry_at, failure_reason, is_idempotent, idempotency_key, \
     requires_compensation, is_compensated, created_at, updated_at, started_at, completed_at";

/// PostgreSQL-backed workflow store.
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the bundled migrations.
    pub async fn migrate(&self) -> Result<(), WorkflowError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WorkflowError::Storage(e.into()))
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    async fn insert(&self, wf: &Workflow, steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (
                id, idempotency_key, workflow_type, user_id, input, context,
                current_step_index, total_steps, state, retry_count, max_retries,
                requires_compensation, failure_reason, created_at, updated_at,
                started_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(wf.id)
        .bind(&wf.idempotency_key)
        .bind(&wf.workflow_type)
        .bind(&wf.user_id)
        .bind(&wf.input)
        .bind(&wf.context)
        .bind(wf.current_step_index)
        .bind(wf.total_steps)
        .bind(wf.state)
        .bind(wf.retry_count)
        .bind(wf.max_retries)
        .bind(wf.requires_compensation)
        .bind(&wf.failure_reason)
        .bind(wf.created_at)
        .bind(wf.updated_at)
        .bind(wf.started_at)
        .bind(wf.completed_at)
        .execute(&mut *tx)
        .await?;

        for step in steps {
            sqlx::query(
                r#"
                INSERT INTO workflow_steps (
                    id, workflow_id, step_index, name, state, input, output,
                    retry_count, max_retries, next_retry_at, failure_reason,
                    is_idempotent, idempotency_key, requires_compensation,
                    is_compensated, created_at, updated_at, started_at, completed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                        $15, $16, $17, $18, $19)
                "#,
            )
            .bind(step.id)
            .bind(step.workflow_id)
            .bind(step.step_index)
            .bind(&step.name)
            .bind(step.state)
            .bind(&step.input)
            .bind(&step.output)
            .bind(step.retry_count)
            .bind(step.max_retries)
            .bind(step.next_retry_at)
            .bind(&step.failure_reason)
            .bind(step.is_idempotent)
            .bind(&step.idempotency_key)
            .bind(step.requires_compensation)
            .bind(step.is_compensated)
            .bind(step.created_at)
            .bind(step.updated_at)
            .bind(step.started_at)
            .bind(step.completed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<Workflow>, WorkflowError> {
        let wf = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wf)
    }

    async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>, WorkflowError> {
        let wf = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(wf)
    }

    async fn update_workflow(&self, wf: &Workflow) -> Result<(), WorkflowError> {
        sqlx::query(
            r#"
            UPDATE workflows SET
                context = $1, current_step_index = $2, state = $3, retry_count = $4,
                requires_compensation = $5, failure_reason = $6, updated_at = $7,
                started_at = $8, completed_at = $9
            WHERE id = $10
            "#,
        )
        .bind(&wf.context)
        .bind(wf.current_step_index)
        .bind(wf.state)
        .bind(wf.retry_count)
        .bind(wf.requires_compensation)
        .bind(&wf.failure_reason)
        .bind(wf.updated_at)
        .bind(wf.started_at)
        .bind(wf.completed_at)
        .bind(wf.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, WorkflowError> {
        let steps = sqlx::query_as::<_, WorkflowStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE workflow_id = $1 ORDER BY step_index"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(steps)
    }

    async fn update_step(&self, step: &WorkflowStep) -> Result<(), WorkflowError> {
        sqlx::query(
            r#"
            UPDATE workflow_steps SET
                state = $1, input = $2, output = $3, retry_count = $4, next_retry_at = $5,
                failure_reason = $6, idempotency_key = $7, is_compensated = $8,
                updated_at = $9, started_at = $10, completed_at = $11
            WHERE id = $12
            "#,
        )
        .bind(step.state)
        .bind(&step.input)
        .bind(&step.output)
        .bind(step.retry_count)
        .bind(step.next_retry_at)
        .bind(&step.failure_reason)
        .bind(&step.idempotency_key)
        .bind(step.is_compensated)
        .bind(step.updated_at)
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn running_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, WorkflowError> {
        let rows = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = 'running' AND updated_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn running_steps_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkflowStep>, WorkflowError> {
        let rows = sqlx::query_as::<_, WorkflowStep>(&format!(
            "SELECT {STEP_COLUMNS} FROM workflow_steps WHERE state = 'running' AND updated_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn completed_workflows_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Workflow>, WorkflowError> {
        let rows = sqlx::query_as::<_, Workflow>(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE state = 'completed' AND completed_at < $1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn cached_step_output(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<serde_json::Value>, WorkflowError> {
        let output = sqlx::query_scalar::<_, Option<serde_json::Value>>(
            r#"
            SELECT output FROM workflow_steps
            WHERE idempotency_key = $1 AND state = 'completed'
            LIMIT 1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(output.flatten())
    }

    async fn delete(&self, id: Uuid) -> Result<(), WorkflowError> {
        sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// In-memory store (for testing)
// ============================================================================

/// In-memory workflow store.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use crate::model::{StepState, WorkflowState};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Inner {
        workflows: HashMap<Uuid, Workflow>,
        steps: HashMap<Uuid, Vec<WorkflowStep>>,
    }

    /// Store backed by mutex-held maps, mirroring the relational contract
    /// (unique idempotency key, cascade delete).
    #[derive(Default)]
    pub struct InMemoryWorkflowStore {
        inner: Mutex<Inner>,
    }

    impl InMemoryWorkflowStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, WorkflowError> {
            self.inner
                .lock()
                .map_err(|e| WorkflowError::Storage(anyhow::anyhow!("mutex poisoned: {e}")))
        }
    }

    #[async_trait]
    impl WorkflowStore for InMemoryWorkflowStore {
        async fn insert(
            &self,
            wf: &Workflow,
            steps: &[WorkflowStep],
        ) -> Result<(), WorkflowError> {
            let mut inner = self.lock()?;
            if inner
                .workflows
                .values()
                .any(|w| w.idempotency_key == wf.idempotency_key)
            {
                return Err(WorkflowError::Storage(anyhow::anyhow!(
                    "duplicate idempotency key: {}",
                    wf.idempotency_key
                )));
            }
            inner.workflows.insert(wf.id, wf.clone());
            let mut rows = steps.to_vec();
            rows.sort_by_key(|s| s.step_index);
            inner.steps.insert(wf.id, rows);
            Ok(())
        }

        async fn find_by_key(&self, key: &str) -> Result<Option<Workflow>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner
                .workflows
                .values()
                .find(|w| w.idempotency_key == key)
                .cloned())
        }

        async fn workflow(&self, id: Uuid) -> Result<Option<Workflow>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner.workflows.get(&id).cloned())
        }

        async fn update_workflow(&self, wf: &Workflow) -> Result<(), WorkflowError> {
            let mut inner = self.lock()?;
            inner.workflows.insert(wf.id, wf.clone());
            Ok(())
        }

        async fn steps(&self, workflow_id: Uuid) -> Result<Vec<WorkflowStep>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner.steps.get(&workflow_id).cloned().unwrap_or_default())
        }

        async fn update_step(&self, step: &WorkflowStep) -> Result<(), WorkflowError> {
            let mut inner = self.lock()?;
            if let Some(rows) = inner.steps.get_mut(&step.workflow_id) {
                if let Some(row) = rows.iter_mut().find(|s| s.id == step.id) {
                    *row = step.clone();
                }
            }
            Ok(())
        }

        async fn running_workflows_older_than(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<Workflow>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner
                .workflows
                .values()
                .filter(|w| w.state == WorkflowState::Running && w.updated_at < cutoff)
                .cloned()
                .collect())
        }

        async fn running_steps_older_than(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<WorkflowStep>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner
                .steps
                .values()
                .flatten()
                .filter(|s| s.state == StepState::Running && s.updated_at < cutoff)
                .cloned()
                .collect())
        }

        async fn completed_workflows_older_than(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<Workflow>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner
                .workflows
                .values()
                .filter(|w| {
                    w.state == WorkflowState::Completed
                        && w.completed_at.map(|at| at < cutoff).unwrap_or(false)
                })
                .cloned()
                .collect())
        }

        async fn cached_step_output(
            &self,
            idempotency_key: &str,
        ) -> Result<Option<serde_json::Value>, WorkflowError> {
            let inner = self.lock()?;
            Ok(inner
                .steps
                .values()
                .flatten()
                .find(|s| {
                    s.state == StepState::Completed
                        && s.idempotency_key.as_deref() == Some(idempotency_key)
                })
                .and_then(|s| s.output.clone()))
        }

        async fn delete(&self, id: Uuid) -> Result<(), WorkflowError> {
            let mut inner = self.lock()?;
            inner.workflows.remove(&id);
            inner.steps.remove(&id);
            Ok(())
        }
    }

}
