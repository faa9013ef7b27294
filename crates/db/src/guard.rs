//! Atomic application of transition plans.
//!
//! A plan is applied inside a single transaction. Approval rows are closed and the request row is
//! moved with compare-and-set updates, and new approval rows go in through conditional inserts, so
//! two racing actors can never both advance the same step. Transient storage failures are retried
//! with exponential backoff; business conflicts surface immediately.

use std::time::Duration;

use sqlx::sqlite::SqliteArguments;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fundflow_core::approvals::{RequestWrite, TransitionPlan};
use fundflow_core::config::WorkflowConfig;
use fundflow_core::domain::approval::{Approval, ApprovalId, ApprovalStatus};
use fundflow_core::errors::ApplicationError;

use crate::repositories::fund_request::encode_workflow_snapshot;
use crate::repositories::{encode_timestamp, RepositoryError};
use crate::DbPool;

const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("approval {} has already been processed", .0.0)]
    AlreadyProcessed(ApprovalId),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("operation cancelled before commit")]
    Cancelled,
    #[error("storage still failing after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<GuardError> for ApplicationError {
    fn from(value: GuardError) -> Self {
        match value {
            error @ GuardError::AlreadyProcessed(_) => Self::AlreadyProcessed(error.to_string()),
            GuardError::Conflict(message) => Self::Conflict(message),
            GuardError::Cancelled => Self::Cancelled,
            error @ GuardError::Exhausted { .. } => Self::Unavailable(error.to_string()),
            GuardError::Repository(error) => Self::from(error),
        }
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(source) if is_transient(&source) => {
                Self::Unavailable(source.to_string())
            }
            other => Self::Persistence(other.to_string()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            max_retries: config.transient_retry_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// `base * 2^retry`, capped at two seconds.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_millis(25) }
    }
}

/// Busy or locked database, exhausted pool, or broken connection.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(database) => database
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED)),
        _ => false,
    }
}

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

enum AttemptError {
    Rejected(GuardError),
    Database(sqlx::Error),
}

impl From<sqlx::Error> for AttemptError {
    fn from(error: sqlx::Error) -> Self {
        if error.as_database_error().is_some_and(|database| database.is_unique_violation()) {
            Self::Rejected(GuardError::Conflict(format!("uniqueness violated: {error}")))
        } else {
            Self::Database(error)
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyGuard {
    pool: DbPool,
    retry: RetryPolicy,
}

impl ConcurrencyGuard {
    pub fn new(pool: DbPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Applies `plan` exactly once or not at all and returns the approval rows it actually
    /// inserted. Cancelling `cancel` before the commit is sent drops the open transaction, which
    /// rolls it back; once the commit is sent it runs to completion and the outcome is reported.
    pub async fn apply(
        &self,
        plan: &TransitionPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<Approval>, GuardError> {
        let mut retry = 0;

        loop {
            let error = match self.apply_once(plan, cancel).await {
                Ok(inserted) => return Ok(inserted),
                Err(AttemptError::Rejected(error)) => return Err(error),
                Err(AttemptError::Database(error)) => error,
            };

            if !is_transient(&error) {
                return Err(GuardError::Repository(RepositoryError::Database(error)));
            }
            if retry >= self.retry.max_retries {
                return Err(GuardError::Exhausted { attempts: retry + 1, source: error });
            }

            let delay = self.retry.delay_for(retry);
            retry += 1;
            warn!(
                event_name = "approval.guard.retry",
                request_id = %plan.request_id.0,
                transition = plan.kind.as_str(),
                attempt = retry,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient storage failure, retrying transition"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GuardError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn apply_once(
        &self,
        plan: &TransitionPlan,
        cancel: &CancellationToken,
    ) -> Result<Vec<Approval>, AttemptError> {
        let (tx, inserted) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AttemptError::Rejected(GuardError::Cancelled)),
            staged = self.stage(plan) => staged?,
        };

        if cancel.is_cancelled() {
            // dropping the transaction rolls it back
            drop(tx);
            return Err(AttemptError::Rejected(GuardError::Cancelled));
        }

        // not raced against `cancel`: a sent COMMIT may already be durable
        tx.commit().await?;
        Ok(inserted)
    }

    /// Runs every write of `plan` inside a fresh transaction without committing it.
    async fn stage(
        &self,
        plan: &TransitionPlan,
    ) -> Result<(Transaction<'static, Sqlite>, Vec<Approval>), AttemptError> {
        let mut tx = self.pool.begin().await?;

        if let Some(close) = &plan.close {
            let result = sqlx::query(
                "UPDATE approval
                 SET status = ?, acted_by = ?, actioned_at = ?,
                     approved_at = COALESCE(?, approved_at), comments = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(close.status.as_str())
            .bind(close.acted_by.as_ref().map(|user| user.0.as_str()))
            .bind(encode_timestamp(close.actioned_at))
            .bind(close.approved_at.map(encode_timestamp))
            .bind(close.comments.as_deref())
            .bind(&close.approval_id.0)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                return Err(AttemptError::Rejected(GuardError::AlreadyProcessed(
                    close.approval_id.clone(),
                )));
            }
        }

        match &plan.request {
            RequestWrite::Create { request, workflow } => {
                let snapshot = encode_workflow_snapshot(workflow).map_err(|error| {
                    AttemptError::Rejected(GuardError::Repository(error))
                })?;
                sqlx::query(
                    "INSERT INTO fund_request
                        (id, title, description, amount, initiator_id, department_id, project_id,
                         workflow_id, status, current_level, needed_by, created_at, updated_at,
                         submitted_at, workflow_snapshot)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&request.id.0)
                .bind(&request.title)
                .bind(&request.description)
                .bind(request.amount.to_string())
                .bind(&request.initiator_id.0)
                .bind(&request.department_id.0)
                .bind(request.project_id.as_ref().map(|project| project.0.as_str()))
                .bind(&request.workflow_id.0)
                .bind(request.status.as_str())
                .bind(i64::from(request.current_level))
                .bind(request.needed_by.map(|date| date.format("%Y-%m-%d").to_string()))
                .bind(encode_timestamp(request.created_at))
                .bind(encode_timestamp(request.updated_at))
                .bind(encode_timestamp(request.submitted_at))
                .bind(snapshot)
                .execute(&mut *tx)
                .await?;
            }
            RequestWrite::Update {
                expected_status,
                expected_level,
                status,
                current_level,
                submitted_at,
            } => {
                let result = sqlx::query(
                    "UPDATE fund_request
                     SET status = ?, current_level = ?, updated_at = ?,
                         submitted_at = COALESCE(?, submitted_at)
                     WHERE id = ? AND status = ? AND current_level = ?",
                )
                .bind(status.as_str())
                .bind(i64::from(*current_level))
                .bind(encode_timestamp(plan.at))
                .bind(submitted_at.map(encode_timestamp))
                .bind(&plan.request_id.0)
                .bind(expected_status.as_str())
                .bind(i64::from(*expected_level))
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(AttemptError::Rejected(GuardError::Conflict(format!(
                        "request {} is no longer {} at level {expected_level}",
                        plan.request_id.0,
                        expected_status.as_str()
                    ))));
                }
            }
        }

        if plan.discard_pending {
            sqlx::query("DELETE FROM approval WHERE fund_request_id = ? AND status = 'pending'")
                .bind(&plan.request_id.0)
                .execute(&mut *tx)
                .await?;
        }

        let mut inserted = Vec::with_capacity(plan.inserts.len());
        for approval in &plan.inserts {
            if insert_approval(&mut tx, approval).await? {
                inserted.push(approval.clone());
            }
        }

        Ok((tx, inserted))
    }
}

const APPROVAL_INSERT_COLUMNS: &str = "id, fund_request_id, level, approver_id, acted_by, status, \
     assigned_at, actioned_at, approved_at, due_at, comments";

fn bind_approval<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    approval: &'q Approval,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&approval.id.0)
        .bind(&approval.fund_request_id.0)
        .bind(i64::from(approval.level))
        .bind(&approval.approver_id.0)
        .bind(approval.acted_by.as_ref().map(|user| user.0.as_str()))
        .bind(approval.status.as_str())
        .bind(encode_timestamp(approval.assigned_at))
        .bind(approval.actioned_at.map(encode_timestamp))
        .bind(approval.approved_at.map(encode_timestamp))
        .bind(approval.due_at.map(encode_timestamp))
        .bind(approval.comments.as_deref())
}

/// Returns `false` when an identical row already existed and nothing was written.
async fn insert_approval(
    tx: &mut Transaction<'_, Sqlite>,
    approval: &Approval,
) -> Result<bool, AttemptError> {
    match approval.status {
        ApprovalStatus::Pending => {
            let query = format!(
                "INSERT INTO approval ({APPROVAL_INSERT_COLUMNS})
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
                 WHERE NOT EXISTS (
                    SELECT 1 FROM approval
                    WHERE fund_request_id = ? AND level = ? AND status = 'pending'
                 )"
            );
            let result = bind_approval(sqlx::query(&query), approval)
                .bind(&approval.fund_request_id.0)
                .bind(i64::from(approval.level))
                .execute(&mut **tx)
                .await?;

            if result.rows_affected() == 1 {
                return Ok(true);
            }

            let holder: Option<String> = sqlx::query_scalar(
                "SELECT approver_id FROM approval
                 WHERE fund_request_id = ? AND level = ? AND status = 'pending'",
            )
            .bind(&approval.fund_request_id.0)
            .bind(i64::from(approval.level))
            .fetch_optional(&mut **tx)
            .await?;

            match holder {
                Some(holder) if holder == approval.approver_id.0 => Ok(false),
                holder => Err(AttemptError::Rejected(GuardError::Conflict(format!(
                    "level {} of request {} is already pending with {}",
                    approval.level,
                    approval.fund_request_id.0,
                    holder.as_deref().unwrap_or("another approver")
                )))),
            }
        }
        ApprovalStatus::FinalReceiver => {
            let query = format!(
                "INSERT INTO approval ({APPROVAL_INSERT_COLUMNS})
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
                 WHERE NOT EXISTS (
                    SELECT 1 FROM approval
                    WHERE fund_request_id = ? AND level = ? AND approver_id = ?
                      AND status = 'final_receiver'
                 )"
            );
            let result = bind_approval(sqlx::query(&query), approval)
                .bind(&approval.fund_request_id.0)
                .bind(i64::from(approval.level))
                .bind(&approval.approver_id.0)
                .execute(&mut **tx)
                .await?;
            Ok(result.rows_affected() == 1)
        }
        _ => {
            let query = format!(
                "INSERT INTO approval ({APPROVAL_INSERT_COLUMNS})
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            bind_approval(sqlx::query(&query), approval).execute(&mut **tx).await?;
            Ok(true)
        }
    }
}
