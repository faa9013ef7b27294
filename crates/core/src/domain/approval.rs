use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::directory::UserId;
use crate::domain::fund_request::FundRequestId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl ApprovalId {
    pub fn generate() -> Self {
        Self(format!("APR-{}", Uuid::new_v4()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    SentBack,
    FinalReceiver,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::SentBack => "sent_back",
            Self::FinalReceiver => "final_receiver",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "sent_back" => Some(Self::SentBack),
            "final_receiver" => Some(Self::FinalReceiver),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    SendBack,
}

impl ApprovalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::SendBack => "send_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "send_back" | "sendback" => Some(Self::SendBack),
            _ => None,
        }
    }

    /// Status the acted-upon approval row is closed with.
    pub fn closing_status(&self) -> ApprovalStatus {
        match self {
            Self::Approve => ApprovalStatus::Approved,
            Self::Reject => ApprovalStatus::Rejected,
            Self::SendBack => ApprovalStatus::SentBack,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub fund_request_id: FundRequestId,
    pub level: u32,
    pub approver_id: UserId,
    pub acted_by: Option<UserId>,
    pub status: ApprovalStatus,
    pub assigned_at: DateTime<Utc>,
    pub actioned_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

impl Approval {
    pub fn pending(
        fund_request_id: FundRequestId,
        level: u32,
        approver_id: UserId,
        sla_hours: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let due_at = (sla_hours > 0).then(|| now + Duration::hours(i64::from(sla_hours)));
        Self {
            id: ApprovalId::generate(),
            fund_request_id,
            level,
            approver_id,
            acted_by: None,
            status: ApprovalStatus::Pending,
            assigned_at: now,
            actioned_at: None,
            approved_at: None,
            due_at,
            comments: None,
        }
    }

    pub fn auto_approved(
        fund_request_id: FundRequestId,
        level: u32,
        approver_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ApprovalId::generate(),
            fund_request_id,
            level,
            approver_id,
            acted_by: None,
            status: ApprovalStatus::Approved,
            assigned_at: now,
            actioned_at: Some(now),
            approved_at: Some(now),
            due_at: None,
            comments: Some("auto-approved".to_string()),
        }
    }

    pub fn final_receiver(
        fund_request_id: FundRequestId,
        level: u32,
        receiver_id: UserId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ApprovalId::generate(),
            fund_request_id,
            level,
            approver_id: receiver_id,
            acted_by: None,
            status: ApprovalStatus::FinalReceiver,
            assigned_at: now,
            actioned_at: None,
            approved_at: Some(now),
            due_at: None,
            comments: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.due_at.is_some_and(|due_at| due_at < now)
    }
}

/// Relationship between the caller and the rows returned by inbox listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFilter {
    AssignedPending,
    Initiated,
    ApprovedByMe,
    Rejected,
    SentBack,
}

impl ListFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignedPending => "assigned_pending",
            Self::Initiated => "initiated",
            Self::ApprovedByMe => "approved_by_me",
            Self::Rejected => "rejected",
            Self::SentBack => "sent_back",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "assigned_pending" | "assigned" => Some(Self::AssignedPending),
            "initiated" => Some(Self::Initiated),
            "approved_by_me" | "approved" => Some(Self::ApprovedByMe),
            "rejected" => Some(Self::Rejected),
            "sent_back" => Some(Self::SentBack),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{Approval, ApprovalAction, ApprovalStatus, ListFilter};
    use crate::domain::directory::UserId;
    use crate::domain::fund_request::FundRequestId;

    #[test]
    fn status_encoding_is_closed() {
        for status in [
            ApprovalStatus::Pending,
            ApprovalStatus::Approved,
            ApprovalStatus::Rejected,
            ApprovalStatus::SentBack,
            ApprovalStatus::FinalReceiver,
        ] {
            assert_eq!(ApprovalStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ApprovalStatus::parse("final"), None);
        assert_eq!(ApprovalStatus::parse("finalreceiver"), None);
    }

    #[test]
    fn actions_close_with_matching_status() {
        assert_eq!(ApprovalAction::Approve.closing_status(), ApprovalStatus::Approved);
        assert_eq!(ApprovalAction::Reject.closing_status(), ApprovalStatus::Rejected);
        assert_eq!(ApprovalAction::SendBack.closing_status(), ApprovalStatus::SentBack);
        assert_eq!(ApprovalAction::parse("Send_Back"), Some(ApprovalAction::SendBack));
    }

    #[test]
    fn pending_row_carries_sla_deadline() {
        let now = Utc::now();
        let approval =
            Approval::pending(FundRequestId("FR-1".to_string()), 2, UserId("u".into()), 48, now);

        assert_eq!(approval.due_at, Some(now + Duration::hours(48)));
        assert!(!approval.is_overdue(now));
        assert!(approval.is_overdue(now + Duration::hours(49)));
    }

    #[test]
    fn zero_sla_means_no_deadline() {
        let approval = Approval::pending(
            FundRequestId("FR-1".to_string()),
            2,
            UserId("u".into()),
            0,
            Utc::now(),
        );
        assert!(approval.due_at.is_none());
    }

    #[test]
    fn list_filter_accepts_short_aliases() {
        assert_eq!(ListFilter::parse("assigned"), Some(ListFilter::AssignedPending));
        assert_eq!(ListFilter::parse("approved_by_me"), Some(ListFilter::ApprovedByMe));
        assert_eq!(ListFilter::parse("everything"), None);
    }
}
