use chrono::Utc;
use sqlx::Row;

use fundflow_core::domain::directory::{DepartmentId, Designation};
use fundflow_core::domain::workflow::{FinalReceiver, Workflow, WorkflowId, WorkflowStep};

use super::{encode_timestamp, parse_u32, RepositoryError, WorkflowRepository};
use crate::DbPool;

pub struct SqlWorkflowRepository {
    pool: DbPool,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load(&self, row: sqlx::sqlite::SqliteRow) -> Result<Workflow, RepositoryError> {
        let id: String = row.try_get("id")?;
        let active: i64 = row.try_get("active")?;

        let steps = sqlx::query(
            "SELECT sequence, designation, sla_hours, auto_approve
             FROM workflow_step
             WHERE workflow_id = ?
             ORDER BY sequence ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|step| -> Result<WorkflowStep, RepositoryError> {
            Ok(WorkflowStep {
                sequence: parse_u32("sequence", step.try_get("sequence")?)?,
                designation: Designation(step.try_get("designation")?),
                sla_hours: parse_u32("sla_hours", step.try_get("sla_hours")?)?,
                auto_approve: step.try_get::<i64, _>("auto_approve")? != 0,
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        let final_receivers = sqlx::query(
            "SELECT receiver_kind, receiver_ref
             FROM workflow_final_receiver
             WHERE workflow_id = ?
             ORDER BY position ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|receiver| -> Result<FinalReceiver, RepositoryError> {
            let kind: String = receiver.try_get("receiver_kind")?;
            let reference: String = receiver.try_get("receiver_ref")?;
            FinalReceiver::parse(&kind, reference).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown final receiver kind `{kind}`"))
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok(Workflow {
            id: WorkflowId(id),
            name: row.try_get("name")?,
            department_id: row.try_get::<Option<String>, _>("department_id")?.map(DepartmentId),
            active: active != 0,
            steps,
            final_receivers,
        })
    }
}

#[async_trait::async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, department_id, active FROM workflow WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.load(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_active(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, department_id, active FROM workflow WHERE active = 1 ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in rows {
            workflows.push(self.load(row).await?);
        }
        Ok(workflows)
    }

    /// Replaces the workflow definition, including its steps and receivers, in one transaction.
    async fn save(&self, workflow: Workflow) -> Result<(), RepositoryError> {
        let now = encode_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workflow (id, name, department_id, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                department_id = excluded.department_id,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(&workflow.id.0)
        .bind(&workflow.name)
        .bind(workflow.department_id.as_ref().map(|department| department.0.as_str()))
        .bind(i64::from(workflow.active))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workflow_step WHERE workflow_id = ?")
            .bind(&workflow.id.0)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow_final_receiver WHERE workflow_id = ?")
            .bind(&workflow.id.0)
            .execute(&mut *tx)
            .await?;

        for step in &workflow.steps {
            sqlx::query(
                "INSERT INTO workflow_step (workflow_id, sequence, designation, sla_hours, auto_approve)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&workflow.id.0)
            .bind(i64::from(step.sequence))
            .bind(&step.designation.0)
            .bind(i64::from(step.sla_hours))
            .bind(i64::from(step.auto_approve))
            .execute(&mut *tx)
            .await?;
        }

        for (position, receiver) in workflow.final_receivers.iter().enumerate() {
            sqlx::query(
                "INSERT INTO workflow_final_receiver (workflow_id, position, receiver_kind, receiver_ref)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&workflow.id.0)
            .bind(position as i64)
            .bind(receiver.kind_str())
            .bind(receiver.reference())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
