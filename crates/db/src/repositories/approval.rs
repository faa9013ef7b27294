use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use fundflow_core::domain::approval::{Approval, ApprovalId, ApprovalStatus, ListFilter};
use fundflow_core::domain::directory::UserId;
use fundflow_core::domain::fund_request::{FundRequest, FundRequestId};

use super::fund_request::{request_columns, request_from_row};
use super::{
    encode_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, ApprovalRepository,
    RepositoryError,
};
use crate::DbPool;

const APPROVAL_FIELDS: &[&str] = &[
    "id",
    "fund_request_id",
    "level",
    "approver_id",
    "acted_by",
    "status",
    "assigned_at",
    "actioned_at",
    "approved_at",
    "due_at",
    "comments",
];

/// One line of a user's request list. `approval` is absent for the `initiated` filter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    pub request: FundRequest,
    pub approval: Option<Approval>,
    pub overdue: bool,
}

pub(crate) fn approval_columns(alias: &str, prefix: &str) -> String {
    APPROVAL_FIELDS
        .iter()
        .map(|field| format!("{alias}.{field} AS {prefix}{field}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn approval_from_row(row: &SqliteRow, prefix: &str) -> Result<Approval, RepositoryError> {
    let column = |name: &str| format!("{prefix}{name}");

    let status_raw: String = row.try_get(column("status").as_str())?;
    let status = ApprovalStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown approval status `{status_raw}`"))
    })?;

    Ok(Approval {
        id: ApprovalId(row.try_get(column("id").as_str())?),
        fund_request_id: FundRequestId(row.try_get(column("fund_request_id").as_str())?),
        level: parse_u32("level", row.try_get(column("level").as_str())?)?,
        approver_id: UserId(row.try_get(column("approver_id").as_str())?),
        acted_by: row.try_get::<Option<String>, _>(column("acted_by").as_str())?.map(UserId),
        status,
        assigned_at: parse_timestamp("assigned_at", row.try_get(column("assigned_at").as_str())?)?,
        actioned_at: parse_optional_timestamp(
            "actioned_at",
            row.try_get(column("actioned_at").as_str())?,
        )?,
        approved_at: parse_optional_timestamp(
            "approved_at",
            row.try_get(column("approved_at").as_str())?,
        )?,
        due_at: parse_optional_timestamp("due_at", row.try_get(column("due_at").as_str())?)?,
        comments: row.try_get(column("comments").as_str())?,
    })
}

pub struct SqlApprovalRepository {
    pool: DbPool,
}

impl SqlApprovalRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn joined_entries(
        &self,
        predicate: &str,
        order_by: &str,
        binds: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEntry>, RepositoryError> {
        let query = format!(
            "SELECT {}, {}
             FROM approval a
             JOIN fund_request r ON r.id = a.fund_request_id
             WHERE {predicate}
             ORDER BY {order_by}",
            request_columns("r", "r_"),
            approval_columns("a", "a_"),
        );

        let mut statement = sqlx::query(&query);
        for value in binds {
            statement = statement.bind(value);
        }
        let rows = statement.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<InboxEntry, RepositoryError> {
                let request = request_from_row(row, "r_")?;
                let approval = approval_from_row(row, "a_")?;
                let overdue = approval.is_overdue(now);
                Ok(InboxEntry { request, approval: Some(approval), overdue })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ApprovalRepository for SqlApprovalRepository {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError> {
        let query = format!("SELECT {} FROM approval a WHERE a.id = ?", approval_columns("a", ""));
        let row = sqlx::query(&query).bind(&id.0).fetch_optional(&self.pool).await?;

        row.map(|row| approval_from_row(&row, "")).transpose()
    }

    async fn list_for_request(
        &self,
        request_id: &FundRequestId,
    ) -> Result<Vec<Approval>, RepositoryError> {
        let query = format!(
            "SELECT {} FROM approval a
             WHERE a.fund_request_id = ?
             ORDER BY a.level ASC, a.assigned_at ASC, a.id ASC",
            approval_columns("a", "")
        );
        let rows = sqlx::query(&query).bind(&request_id.0).fetch_all(&self.pool).await?;

        rows.iter().map(|row| approval_from_row(row, "")).collect()
    }

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: ListFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEntry>, RepositoryError> {
        let user = user_id.0.clone();

        match filter {
            ListFilter::AssignedPending => {
                // the caller qualifies directly or as the current substitute of the approver
                self.joined_entries(
                    "a.status = 'pending'
                     AND (a.approver_id = ?
                          OR ? = (SELECT d.delegate_id FROM delegation d
                                  WHERE d.delegator_id = a.approver_id
                                    AND d.active = 1
                                    AND d.starts_at <= ?
                                    AND d.ends_at > ?
                                  ORDER BY d.starts_at DESC
                                  LIMIT 1))",
                    "a.due_at IS NULL, a.due_at ASC, a.assigned_at ASC",
                    &[user.clone(), user, encode_timestamp(now), encode_timestamp(now)],
                    now,
                )
                .await
            }
            ListFilter::Initiated => {
                let query = format!(
                    "SELECT {} FROM fund_request r
                     WHERE r.initiator_id = ?
                     ORDER BY r.created_at DESC, r.id ASC",
                    request_columns("r", "")
                );
                let rows = sqlx::query(&query).bind(&user).fetch_all(&self.pool).await?;

                rows.iter()
                    .map(|row| -> Result<InboxEntry, RepositoryError> {
                        Ok(InboxEntry {
                            request: request_from_row(row, "")?,
                            approval: None,
                            overdue: false,
                        })
                    })
                    .collect()
            }
            ListFilter::ApprovedByMe => {
                self.joined_entries(
                    "a.status = 'approved' AND COALESCE(a.acted_by, a.approver_id) = ?",
                    "a.actioned_at DESC, a.id ASC",
                    &[user],
                    now,
                )
                .await
            }
            ListFilter::Rejected => {
                self.joined_entries(
                    "a.status = 'rejected'
                     AND (r.initiator_id = ? OR COALESCE(a.acted_by, a.approver_id) = ?)",
                    "a.actioned_at DESC, a.id ASC",
                    &[user.clone(), user],
                    now,
                )
                .await
            }
            ListFilter::SentBack => {
                self.joined_entries(
                    "a.status = 'sent_back'
                     AND (r.initiator_id = ? OR COALESCE(a.acted_by, a.approver_id) = ?)",
                    "a.actioned_at DESC, a.id ASC",
                    &[user.clone(), user],
                    now,
                )
                .await
            }
        }
    }
}
