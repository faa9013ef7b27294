use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{Approval, ApprovalStatus};
use crate::domain::directory::{Designation, UserId};
use crate::domain::fund_request::{FundRequest, FundRequestId, RequestStatus};
use crate::domain::workflow::{FinalReceiver, Workflow};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailStepStatus {
    Created,
    Pending,
    Approved,
    Rejected,
    SentBack,
    Skipped,
    Upcoming,
}

impl TrailStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::SentBack => "sent_back",
            Self::Skipped => "skipped",
            Self::Upcoming => "upcoming",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailStep {
    pub sequence: u32,
    pub designation: Designation,
    pub status: TrailStepStatus,
    pub approver_id: Option<UserId>,
    pub acted_by: Option<UserId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub actioned_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub due_at: Option<DateTime<Utc>>,
    pub sla_hours: u32,
    pub comments: Option<String>,
    pub overdue: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailReceiver {
    pub receiver_id: UserId,
    pub level: u32,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTrail {
    pub request_id: FundRequestId,
    pub status: RequestStatus,
    pub current_level: u32,
    pub steps: Vec<TrailStep>,
    pub final_receivers: Vec<TrailReceiver>,
    pub configured_receivers: Vec<FinalReceiver>,
}

impl ApprovalTrail {
    pub fn step(&self, sequence: u32) -> Option<&TrailStep> {
        self.steps.iter().find(|step| step.sequence == sequence)
    }
}

/// Merges workflow steps with the request's approval rows. The latest row per level wins; levels
/// without a row are `Upcoming` while the request can still reach them and `Skipped` otherwise.
pub fn build_trail(
    request: &FundRequest,
    workflow: &Workflow,
    approvals: &[Approval],
    now: DateTime<Utc>,
) -> ApprovalTrail {
    let mut latest: BTreeMap<u32, &Approval> = BTreeMap::new();
    let mut final_receivers = Vec::new();

    for approval in approvals {
        if approval.status == ApprovalStatus::FinalReceiver {
            final_receivers.push(TrailReceiver {
                receiver_id: approval.approver_id.clone(),
                level: approval.level,
                received_at: approval.approved_at,
            });
            continue;
        }

        match latest.get(&approval.level) {
            Some(current) if current.assigned_at > approval.assigned_at => {}
            _ => {
                latest.insert(approval.level, approval);
            }
        }
    }

    let mut steps: Vec<_> = workflow.steps.iter().collect();
    steps.sort_by_key(|step| step.sequence);

    let steps = steps
        .into_iter()
        .map(|step| {
            if step.is_initiator() {
                return TrailStep {
                    sequence: step.sequence,
                    designation: step.designation.clone(),
                    status: TrailStepStatus::Created,
                    approver_id: Some(request.initiator_id.clone()),
                    acted_by: None,
                    assigned_at: Some(request.created_at),
                    actioned_at: Some(request.created_at),
                    approved_at: None,
                    due_at: None,
                    sla_hours: step.sla_hours,
                    comments: None,
                    overdue: false,
                };
            }

            match latest.get(&step.sequence) {
                Some(row) => TrailStep {
                    sequence: step.sequence,
                    designation: step.designation.clone(),
                    status: row_status(row.status),
                    approver_id: Some(row.approver_id.clone()),
                    acted_by: row.acted_by.clone(),
                    assigned_at: Some(row.assigned_at),
                    actioned_at: row.actioned_at,
                    approved_at: row.approved_at,
                    due_at: row.due_at,
                    sla_hours: step.sla_hours,
                    comments: row.comments.clone(),
                    overdue: row.is_overdue(now),
                },
                None => {
                    let reachable = !request.status.is_terminal()
                        && step.sequence >= request.current_level;
                    TrailStep {
                        sequence: step.sequence,
                        designation: step.designation.clone(),
                        status: if reachable {
                            TrailStepStatus::Upcoming
                        } else {
                            TrailStepStatus::Skipped
                        },
                        approver_id: None,
                        acted_by: None,
                        assigned_at: None,
                        actioned_at: None,
                        approved_at: None,
                        due_at: None,
                        sla_hours: step.sla_hours,
                        comments: None,
                        overdue: false,
                    }
                }
            }
        })
        .collect();

    ApprovalTrail {
        request_id: request.id.clone(),
        status: request.status,
        current_level: request.current_level,
        steps,
        final_receivers,
        configured_receivers: workflow.final_receivers.clone(),
    }
}

fn row_status(status: ApprovalStatus) -> TrailStepStatus {
    match status {
        ApprovalStatus::Pending => TrailStepStatus::Pending,
        ApprovalStatus::Approved => TrailStepStatus::Approved,
        ApprovalStatus::Rejected => TrailStepStatus::Rejected,
        ApprovalStatus::SentBack => TrailStepStatus::SentBack,
        // Final-receiver rows are routed to `final_receivers` before this is reached.
        ApprovalStatus::FinalReceiver => TrailStepStatus::Approved,
    }
}
