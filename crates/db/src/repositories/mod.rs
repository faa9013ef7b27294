use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use fundflow_core::domain::approval::{Approval, ApprovalId, ListFilter};
use fundflow_core::domain::directory::{Delegation, DirectoryUser, UserId};
use fundflow_core::domain::fund_request::{FundRequest, FundRequestId};
use fundflow_core::domain::workflow::{Workflow, WorkflowId};

pub mod approval;
pub mod directory;
pub mod fund_request;
pub mod memory;
pub mod workflow;

pub use approval::{InboxEntry, SqlApprovalRepository};
pub use directory::SqlDirectoryRepository;
pub use fund_request::SqlFundRequestRepository;
pub use memory::InMemoryWorkflowRepository;
pub use workflow::SqlWorkflowRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError>;
    async fn list_active(&self) -> Result<Vec<Workflow>, RepositoryError>;
    async fn save(&self, workflow: Workflow) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait FundRequestRepository: Send + Sync {
    async fn find_by_id(&self, id: &FundRequestId)
        -> Result<Option<FundRequest>, RepositoryError>;
    async fn list_by_initiator(
        &self,
        initiator_id: &UserId,
    ) -> Result<Vec<FundRequest>, RepositoryError>;

    /// Workflow definition pinned at submission, `None` for requests stored before pinning.
    async fn workflow_snapshot(&self, id: &FundRequestId)
        -> Result<Option<Workflow>, RepositoryError>;
}

#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    async fn find_by_id(&self, id: &ApprovalId) -> Result<Option<Approval>, RepositoryError>;

    /// All rows of a request ordered by level, then assignment time.
    async fn list_for_request(
        &self,
        request_id: &FundRequestId,
    ) -> Result<Vec<Approval>, RepositoryError>;

    async fn list_for_user(
        &self,
        user_id: &UserId,
        filter: ListFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<InboxEntry>, RepositoryError>;
}

#[async_trait]
pub trait DirectoryRepository: Send + Sync {
    async fn save_user(&self, user: DirectoryUser) -> Result<(), RepositoryError>;
    async fn list_users(&self) -> Result<Vec<DirectoryUser>, RepositoryError>;
    async fn save_delegation(&self, delegation: Delegation) -> Result<(), RepositoryError>;
    async fn list_delegations_for(
        &self,
        delegator_id: &UserId,
    ) -> Result<Vec<Delegation>, RepositoryError>;
}

/// Fixed-width UTC encoding so stored timestamps order correctly as text.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("column `{column}` has out-of-range value `{value}`"))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|value| value.with_timezone(&Utc)).map_err(|error| {
        RepositoryError::Decode(format!("invalid `{column}` timestamp `{value}`: {error}"))
    })
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|value| parse_timestamp(column, value)).transpose()
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    value.parse::<Decimal>().map_err(|error| {
        RepositoryError::Decode(format!("invalid `{column}` decimal `{value}`: {error}"))
    })
}

pub(crate) fn parse_optional_date(
    column: &str,
    value: Option<String>,
) -> Result<Option<NaiveDate>, RepositoryError> {
    value
        .map(|value| {
            NaiveDate::parse_from_str(&value, "%Y-%m-%d").map_err(|error| {
                RepositoryError::Decode(format!("invalid `{column}` date `{value}`: {error}"))
            })
        })
        .transpose()
}
