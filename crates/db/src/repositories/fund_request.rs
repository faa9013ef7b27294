use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use fundflow_core::domain::directory::{DepartmentId, ProjectId, UserId};
use fundflow_core::domain::fund_request::{FundRequest, FundRequestId, RequestStatus};
use fundflow_core::domain::workflow::{Workflow, WorkflowId};

use super::{
    parse_decimal, parse_optional_date, parse_optional_timestamp, parse_timestamp, parse_u32,
    FundRequestRepository, RepositoryError,
};
use crate::DbPool;

const REQUEST_FIELDS: &[&str] = &[
    "id",
    "title",
    "description",
    "amount",
    "initiator_id",
    "department_id",
    "project_id",
    "workflow_id",
    "status",
    "current_level",
    "needed_by",
    "created_at",
    "updated_at",
    "submitted_at",
];

/// Serialized form of the workflow a request is pinned to.
pub(crate) fn encode_workflow_snapshot(workflow: &Workflow) -> Result<String, RepositoryError> {
    serde_json::to_string(workflow).map_err(|error| {
        RepositoryError::Decode(format!("failed to encode workflow `{}`: {error}", workflow.id.0))
    })
}

fn decode_workflow_snapshot(request_id: &str, raw: &str) -> Result<Workflow, RepositoryError> {
    serde_json::from_str(raw).map_err(|error| {
        RepositoryError::Decode(format!(
            "invalid workflow snapshot on request `{request_id}`: {error}"
        ))
    })
}

/// `alias.field AS {prefix}field` for every fund request column.
pub(crate) fn request_columns(alias: &str, prefix: &str) -> String {
    REQUEST_FIELDS
        .iter()
        .map(|field| format!("{alias}.{field} AS {prefix}{field}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn request_from_row(row: &SqliteRow, prefix: &str) -> Result<FundRequest, RepositoryError> {
    let column = |name: &str| format!("{prefix}{name}");

    let status_raw: String = row.try_get(column("status").as_str())?;
    let status = RequestStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown fund request status `{status_raw}`"))
    })?;

    let created_at = parse_timestamp("created_at", row.try_get(column("created_at").as_str())?)?;
    let submitted_at =
        parse_optional_timestamp("submitted_at", row.try_get(column("submitted_at").as_str())?)?
            .unwrap_or(created_at);

    Ok(FundRequest {
        id: FundRequestId(row.try_get(column("id").as_str())?),
        title: row.try_get(column("title").as_str())?,
        description: row.try_get(column("description").as_str())?,
        amount: parse_decimal("amount", row.try_get(column("amount").as_str())?)?,
        initiator_id: UserId(row.try_get(column("initiator_id").as_str())?),
        department_id: DepartmentId(row.try_get(column("department_id").as_str())?),
        project_id: row
            .try_get::<Option<String>, _>(column("project_id").as_str())?
            .map(ProjectId),
        workflow_id: WorkflowId(row.try_get(column("workflow_id").as_str())?),
        status,
        current_level: parse_u32("current_level", row.try_get(column("current_level").as_str())?)?,
        needed_by: parse_optional_date("needed_by", row.try_get(column("needed_by").as_str())?)?,
        created_at,
        updated_at: parse_timestamp("updated_at", row.try_get(column("updated_at").as_str())?)?,
        submitted_at,
    })
}

pub struct SqlFundRequestRepository {
    pool: DbPool,
}

impl SqlFundRequestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl FundRequestRepository for SqlFundRequestRepository {
    async fn find_by_id(
        &self,
        id: &FundRequestId,
    ) -> Result<Option<FundRequest>, RepositoryError> {
        let query = format!("SELECT {} FROM fund_request r WHERE r.id = ?", request_columns("r", ""));
        let row = sqlx::query(&query).bind(&id.0).fetch_optional(&self.pool).await?;

        row.map(|row| request_from_row(&row, "")).transpose()
    }

    async fn list_by_initiator(
        &self,
        initiator_id: &UserId,
    ) -> Result<Vec<FundRequest>, RepositoryError> {
        let query = format!(
            "SELECT {} FROM fund_request r WHERE r.initiator_id = ? ORDER BY r.created_at DESC, r.id ASC",
            request_columns("r", "")
        );
        let rows = sqlx::query(&query).bind(&initiator_id.0).fetch_all(&self.pool).await?;

        rows.iter().map(|row| request_from_row(row, "")).collect()
    }

    async fn workflow_snapshot(
        &self,
        id: &FundRequestId,
    ) -> Result<Option<Workflow>, RepositoryError> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT workflow_snapshot FROM fund_request WHERE id = ?")
                .bind(&id.0)
                .fetch_optional(&self.pool)
                .await?;

        raw.flatten().map(|raw| decode_workflow_snapshot(&id.0, &raw)).transpose()
    }
}
