use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::approval::{Approval, ApprovalStatus};
use crate::domain::directory::{DepartmentId, ProjectId, UserId};
use crate::domain::workflow::{WorkflowId, RETURNED_TO_INITIATOR_LEVEL};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FundRequestId(pub String);

impl FundRequestId {
    pub fn generate() -> Self {
        Self(format!("FR-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    SentBack,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::SentBack => "sent_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "sent_back" => Some(Self::SentBack),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn allows_resubmission(&self) -> bool {
        matches!(self, Self::Pending | Self::SentBack)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundRequest {
    pub id: FundRequestId,
    pub title: String,
    pub description: String,
    pub amount: Decimal,
    pub initiator_id: UserId,
    pub department_id: DepartmentId,
    pub project_id: Option<ProjectId>,
    pub workflow_id: WorkflowId,
    pub status: RequestStatus,
    pub current_level: u32,
    pub needed_by: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current submission cycle; moved forward by every resubmission.
    pub submitted_at: DateTime<Utc>,
}

impl FundRequest {
    /// Builds a request that has not entered the approval chain yet. Submission sets the real
    /// status and level.
    pub fn draft(input: NewFundRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: FundRequestId::generate(),
            title: input.title.trim().to_string(),
            description: input.description,
            amount: input.amount,
            initiator_id: input.initiator_id,
            department_id: input.department_id,
            project_id: input.project_id,
            workflow_id: input.workflow_id,
            status: RequestStatus::Pending,
            current_level: RETURNED_TO_INITIATOR_LEVEL,
            needed_by: input.needed_by,
            created_at: now,
            updated_at: now,
            submitted_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.title.trim().is_empty() {
            return Err(DomainError::InvalidFundRequest("title must not be empty".to_string()));
        }

        if self.amount <= Decimal::ZERO {
            return Err(DomainError::InvalidFundRequest(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }

        if self.initiator_id.0.trim().is_empty() {
            return Err(DomainError::InvalidFundRequest("initiator is required".to_string()));
        }

        if let Some(needed_by) = self.needed_by {
            if needed_by < self.created_at.date_naive() {
                return Err(DomainError::InvalidFundRequest(format!(
                    "needed-by date {needed_by} is in the past"
                )));
            }
        }

        Ok(())
    }

    /// Attachments stay editable while the request is open, sits with the initiator or at the
    /// first real step, and nobody has approved anything since the last (re)submission. A
    /// send-back to the first step therefore keeps them locked until the initiator resubmits.
    pub fn is_attachment_unlocked(&self, first_real_level: u32, approvals: &[Approval]) -> bool {
        let at_start = self.current_level == RETURNED_TO_INITIATOR_LEVEL
            || self.current_level == first_real_level;

        self.status.allows_resubmission() && at_start && !self.approved_this_cycle(approvals)
    }

    fn approved_this_cycle(&self, approvals: &[Approval]) -> bool {
        approvals.iter().any(|approval| {
            approval.fund_request_id == self.id
                && approval.status == ApprovalStatus::Approved
                && approval.approved_at.is_some_and(|at| at >= self.submitted_at)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFundRequest {
    pub title: String,
    pub description: String,
    pub amount: Decimal,
    pub initiator_id: UserId,
    pub department_id: DepartmentId,
    pub project_id: Option<ProjectId>,
    pub workflow_id: WorkflowId,
    pub needed_by: Option<NaiveDate>,
}
