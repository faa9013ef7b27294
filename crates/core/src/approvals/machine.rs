//! Transition planning for fund requests.
//!
//! Every operation here is read-only: it inspects the current request, workflow and approval rows,
//! resolves whoever must act next, and returns a [`TransitionPlan`]. Applying the plan atomically
//! is the persistence layer's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::delegation::DelegationLookup;
use crate::approvals::fanout::FinalReceiverFanout;
use crate::approvals::resolver::{
    ApproverDirectory, ApproverResolver, ResolutionContext, ResolutionError, StepTarget,
};
use crate::domain::approval::{Approval, ApprovalAction, ApprovalId, ApprovalStatus};
use crate::domain::directory::UserId;
use crate::domain::fund_request::{FundRequest, FundRequestId, RequestStatus};
use crate::domain::workflow::{Workflow, INITIATOR_SEQUENCE, RETURNED_TO_INITIATOR_LEVEL};
use crate::errors::DomainError;
use crate::notify::{Notification, NotificationKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Submit,
    Approve,
    Reject,
    SendBack,
    Resubmit,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::SendBack => "send_back",
            Self::Resubmit => "resubmit",
        }
    }
}

impl From<ApprovalAction> for TransitionKind {
    fn from(value: ApprovalAction) -> Self {
        match value {
            ApprovalAction::Approve => Self::Approve,
            ApprovalAction::Reject => Self::Reject,
            ApprovalAction::SendBack => Self::SendBack,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("workflow configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("approval {} has already been processed", .approval_id.0)]
    AlreadyProcessed { approval_id: ApprovalId },
    #[error("user {} may not act on approval {}", .actor.0, .approval_id.0)]
    NotAuthorized { approval_id: ApprovalId, actor: UserId },
    #[error("only the initiator may resubmit request {} (caller {})", .request_id.0, .actor.0)]
    NotInitiator { request_id: FundRequestId, actor: UserId },
    #[error("request {} cannot be resubmitted while {}", .request_id.0, .status.as_str())]
    NotResubmittable { request_id: FundRequestId, status: RequestStatus },
    #[error("approval {} at level {level} is stale; request is at level {current_level}", .approval_id.0)]
    StaleApproval { approval_id: ApprovalId, level: u32, current_level: u32 },
}

/// Closing write for the approval row an actor acted upon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalClosure {
    pub approval_id: ApprovalId,
    pub status: ApprovalStatus,
    pub acted_by: Option<UserId>,
    pub actioned_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestWrite {
    /// New request together with the workflow it is pinned to for its whole life.
    Create { request: FundRequest, workflow: Workflow },
    /// Compare-and-set on `(status, current_level)`.
    Update {
        expected_status: RequestStatus,
        expected_level: u32,
        status: RequestStatus,
        current_level: u32,
        /// Set when the transition starts a new submission cycle.
        submitted_at: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionPlan {
    pub kind: TransitionKind,
    pub request_id: FundRequestId,
    pub actor_id: UserId,
    pub request: RequestWrite,
    pub close: Option<ApprovalClosure>,
    pub discard_pending: bool,
    pub inserts: Vec<Approval>,
    pub notification: Option<Notification>,
    pub at: DateTime<Utc>,
}

impl TransitionPlan {
    pub fn resulting_status(&self) -> RequestStatus {
        match &self.request {
            RequestWrite::Create { request, .. } => request.status,
            RequestWrite::Update { status, .. } => *status,
        }
    }

    pub fn resulting_level(&self) -> u32 {
        match &self.request {
            RequestWrite::Create { request, .. } => request.current_level,
            RequestWrite::Update { current_level, .. } => *current_level,
        }
    }

    pub fn pending_insert(&self) -> Option<&Approval> {
        self.inserts.iter().find(|approval| approval.is_pending())
    }

    pub fn final_receiver_inserts(&self) -> impl Iterator<Item = &Approval> {
        self.inserts.iter().filter(|approval| approval.status == ApprovalStatus::FinalReceiver)
    }
}

struct Advancement {
    status: RequestStatus,
    level: u32,
    inserts: Vec<Approval>,
    assignee: Option<UserId>,
}

pub struct ApprovalStateMachine<D, G> {
    resolver: ApproverResolver<D>,
    delegations: G,
}

impl<D, G> ApprovalStateMachine<D, G>
where
    D: ApproverDirectory,
    G: DelegationLookup,
{
    pub fn new(resolver: ApproverResolver<D>, delegations: G) -> Self {
        Self { resolver, delegations }
    }

    pub fn resolver(&self) -> &ApproverResolver<D> {
        &self.resolver
    }

    pub async fn plan_submit(
        &self,
        request: FundRequest,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, TransitionError> {
        request.validate()?;
        check_workflow(&request, workflow)?;
        workflow
            .ensure_accepts_submissions()
            .map_err(|error| TransitionError::Configuration(error.to_string()))?;

        let context = ResolutionContext::for_request(&request);
        let advancement =
            self.advance(&request.id, workflow, &context, INITIATOR_SEQUENCE, now).await?;
        let notification = advancement.assignee.clone().map(|to_user_id| Notification {
            kind: NotificationKind::Submitted,
            request_id: request.id.clone(),
            from_user_id: request.initiator_id.clone(),
            to_user_id,
        });

        let mut created = request;
        created.status = advancement.status;
        created.current_level = advancement.level;
        created.updated_at = now;
        created.submitted_at = now;

        Ok(TransitionPlan {
            kind: TransitionKind::Submit,
            request_id: created.id.clone(),
            actor_id: created.initiator_id.clone(),
            request: RequestWrite::Create { request: created, workflow: workflow.clone() },
            close: None,
            discard_pending: false,
            inserts: advancement.inserts,
            notification,
            at: now,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn plan_action(
        &self,
        request: &FundRequest,
        workflow: &Workflow,
        approval: &Approval,
        actor: &UserId,
        action: ApprovalAction,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, TransitionError> {
        if !approval.is_pending() {
            return Err(TransitionError::AlreadyProcessed { approval_id: approval.id.clone() });
        }

        if approval.fund_request_id != request.id {
            return Err(DomainError::InvariantViolation(format!(
                "approval {} does not belong to request {}",
                approval.id.0, request.id.0
            ))
            .into());
        }

        if request.status.is_terminal() || approval.level != request.current_level {
            return Err(TransitionError::StaleApproval {
                approval_id: approval.id.clone(),
                level: approval.level,
                current_level: request.current_level,
            });
        }

        let acted_by = self.authorize_actor(approval, actor, now).await?;
        check_workflow(request, workflow)?;

        let context = ResolutionContext::for_request(request);
        let comments = comments.map(|text| text.trim().to_string()).filter(|text| !text.is_empty());
        let close = ApprovalClosure {
            approval_id: approval.id.clone(),
            status: action.closing_status(),
            acted_by,
            actioned_at: now,
            approved_at: (action == ApprovalAction::Approve).then_some(now),
            comments,
        };

        let (status, level, inserts, notification) = match action {
            ApprovalAction::Approve => {
                let advancement =
                    self.advance(&request.id, workflow, &context, approval.level, now).await?;
                let notification = advancement.assignee.map(|to_user_id| Notification {
                    kind: NotificationKind::Advanced,
                    request_id: request.id.clone(),
                    from_user_id: actor.clone(),
                    to_user_id,
                });
                (advancement.status, advancement.level, advancement.inserts, notification)
            }
            ApprovalAction::Reject => (RequestStatus::Rejected, request.current_level, Vec::new(), None),
            ApprovalAction::SendBack => {
                let previous = approval.level.saturating_sub(1);
                if previous <= INITIATOR_SEQUENCE {
                    let notification = Notification {
                        kind: NotificationKind::SentBack,
                        request_id: request.id.clone(),
                        from_user_id: actor.clone(),
                        to_user_id: request.initiator_id.clone(),
                    };
                    (RequestStatus::SentBack, RETURNED_TO_INITIATOR_LEVEL, Vec::new(), Some(notification))
                } else {
                    let step = workflow.step_at(previous).ok_or_else(|| {
                        TransitionError::Configuration(format!(
                            "workflow {} has no step at sequence {previous}",
                            workflow.id.0
                        ))
                    })?;
                    let approver = self.resolver.resolve(StepTarget::Step(step), &context).await?;
                    let row = Approval::pending(
                        request.id.clone(),
                        previous,
                        approver.clone(),
                        step.sla_hours,
                        now,
                    );
                    let notification = Notification {
                        kind: NotificationKind::SentBack,
                        request_id: request.id.clone(),
                        from_user_id: actor.clone(),
                        to_user_id: approver,
                    };
                    (RequestStatus::SentBack, previous, vec![row], Some(notification))
                }
            }
        };

        Ok(TransitionPlan {
            kind: action.into(),
            request_id: request.id.clone(),
            actor_id: actor.clone(),
            request: RequestWrite::Update {
                expected_status: request.status,
                expected_level: request.current_level,
                status,
                current_level: level,
                submitted_at: None,
            },
            close: Some(close),
            discard_pending: false,
            inserts,
            notification,
            at: now,
        })
    }

    pub async fn plan_resubmit(
        &self,
        request: &FundRequest,
        workflow: &Workflow,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, TransitionError> {
        if actor != &request.initiator_id {
            return Err(TransitionError::NotInitiator {
                request_id: request.id.clone(),
                actor: actor.clone(),
            });
        }

        if !request.status.allows_resubmission() {
            return Err(TransitionError::NotResubmittable {
                request_id: request.id.clone(),
                status: request.status,
            });
        }

        check_workflow(request, workflow)?;

        let context = ResolutionContext::for_request(request);
        let advancement =
            self.advance(&request.id, workflow, &context, INITIATOR_SEQUENCE, now).await?;
        let notification = advancement.assignee.clone().map(|to_user_id| Notification {
            kind: NotificationKind::Resubmitted,
            request_id: request.id.clone(),
            from_user_id: actor.clone(),
            to_user_id,
        });

        Ok(TransitionPlan {
            kind: TransitionKind::Resubmit,
            request_id: request.id.clone(),
            actor_id: actor.clone(),
            request: RequestWrite::Update {
                expected_status: request.status,
                expected_level: request.current_level,
                status: advancement.status,
                current_level: advancement.level,
                submitted_at: Some(now),
            },
            close: None,
            discard_pending: true,
            inserts: advancement.inserts,
            notification,
            at: now,
        })
    }

    /// Returns the delegate recorded in `acted_by`, or `None` when the nominal approver acts.
    pub async fn authorize_actor(
        &self,
        approval: &Approval,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<UserId>, TransitionError> {
        if actor == &approval.approver_id {
            return Ok(None);
        }

        let substitute = self
            .delegations
            .substitute_for(&approval.approver_id, now)
            .await
            .map_err(ResolutionError::from)?;

        match substitute {
            Some(delegate) if &delegate == actor => Ok(Some(delegate)),
            _ => Err(TransitionError::NotAuthorized {
                approval_id: approval.id.clone(),
                actor: actor.clone(),
            }),
        }
    }

    /// Walks forward from `from_level`, auto-approving flagged steps, until a step needs a human
    /// or the chain completes with the final-receiver fan-out.
    async fn advance(
        &self,
        request_id: &FundRequestId,
        workflow: &Workflow,
        context: &ResolutionContext,
        from_level: u32,
        now: DateTime<Utc>,
    ) -> Result<Advancement, TransitionError> {
        let mut level = from_level;
        let mut inserts = Vec::new();

        while let Some(step) = workflow.next_step_after(level) {
            let approver = self.resolver.resolve(StepTarget::Step(step), context).await?;

            if step.auto_approve {
                inserts.push(Approval::auto_approved(request_id.clone(), step.sequence, approver, now));
                level = step.sequence;
                continue;
            }

            inserts.push(Approval::pending(
                request_id.clone(),
                step.sequence,
                approver.clone(),
                step.sla_hours,
                now,
            ));
            return Ok(Advancement {
                status: RequestStatus::Pending,
                level: step.sequence,
                inserts,
                assignee: Some(approver),
            });
        }

        let receivers =
            FinalReceiverFanout::new(&self.resolver).plan(request_id, workflow, context, level, now).await?;
        inserts.extend(receivers);

        Ok(Advancement { status: RequestStatus::Approved, level: level + 1, inserts, assignee: None })
    }
}

fn check_workflow(request: &FundRequest, workflow: &Workflow) -> Result<(), TransitionError> {
    if request.workflow_id != workflow.id {
        return Err(TransitionError::Configuration(format!(
            "request {} references workflow {}, got {}",
            request.id.0, request.workflow_id.0, workflow.id.0
        )));
    }

    workflow.validate().map_err(|error| TransitionError::Configuration(error.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{ApprovalStateMachine, RequestWrite, TransitionError, TransitionKind, TransitionPlan};
    use crate::approvals::delegation::InMemoryDelegations;
    use crate::approvals::resolver::{
        ApproverResolver, InMemoryDirectory, ResolutionError, ResolutionPolicy,
    };
    use crate::domain::approval::{Approval, ApprovalAction, ApprovalStatus};
    use crate::domain::directory::{
        DepartmentId, Delegation, DelegationId, Designation, DirectoryUser, UserId,
    };
    use crate::domain::fund_request::{FundRequest, NewFundRequest, RequestStatus};
    use crate::domain::workflow::{FinalReceiver, Workflow, WorkflowId, WorkflowStep};
    use crate::notify::NotificationKind;

    type Machine = ApprovalStateMachine<InMemoryDirectory, InMemoryDelegations>;

    fn user(id: &str, designation: &str, department: &str) -> DirectoryUser {
        DirectoryUser {
            id: UserId(id.to_string()),
            display_name: id.to_string(),
            designation: Designation(designation.to_string()),
            department_id: Some(DepartmentId(department.to_string())),
            project_id: None,
            active: true,
        }
    }

    fn step(sequence: u32, designation: &str, auto_approve: bool) -> WorkflowStep {
        WorkflowStep {
            sequence,
            designation: Designation(designation.to_string()),
            sla_hours: 24,
            auto_approve,
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: WorkflowId("WF-1".to_string()),
            name: "Capex".to_string(),
            department_id: None,
            active: true,
            steps,
            final_receivers: vec![
                FinalReceiver::User(UserId("u-a".to_string())),
                FinalReceiver::User(UserId("u-b".to_string())),
            ],
        }
    }

    fn three_step_workflow() -> Workflow {
        workflow(vec![step(1, "initiator", false), step(2, "manager", false), step(3, "director", false)])
    }

    fn machine_with(delegations: Vec<Delegation>) -> Machine {
        ApprovalStateMachine::new(
            ApproverResolver::new(
                InMemoryDirectory::with_users(vec![
                    user("u-mgr", "manager", "dept-ops"),
                    user("u-dir", "director", "dept-ops"),
                ]),
                ResolutionPolicy::Strict,
            ),
            InMemoryDelegations::new(delegations),
        )
    }

    fn machine() -> Machine {
        machine_with(Vec::new())
    }

    fn draft() -> FundRequest {
        FundRequest::draft(
            NewFundRequest {
                title: "Conference travel".to_string(),
                description: "Flights and hotel".to_string(),
                amount: Decimal::new(125_000, 2),
                initiator_id: UserId("u-init".to_string()),
                department_id: DepartmentId("dept-ops".to_string()),
                project_id: None,
                workflow_id: WorkflowId("WF-1".to_string()),
                needed_by: None,
            },
            Utc::now(),
        )
    }

    fn created(plan: &TransitionPlan) -> FundRequest {
        match &plan.request {
            RequestWrite::Create { request, .. } => request.clone(),
            RequestWrite::Update { .. } => panic!("expected a created request"),
        }
    }

    /// Applies the plan to in-memory state the way the store would.
    fn apply(request: &mut FundRequest, approval: &mut Approval, plan: &TransitionPlan) {
        request.status = plan.resulting_status();
        request.current_level = plan.resulting_level();
        if let Some(close) = &plan.close {
            approval.status = close.status;
        }
    }

    async fn submitted(machine: &Machine, workflow: &Workflow) -> (FundRequest, Approval) {
        let plan = machine.plan_submit(draft(), workflow, Utc::now()).await.expect("submit plan");
        let request = created(&plan);
        let pending = plan.pending_insert().cloned().expect("pending approval");
        (request, pending)
    }

    #[tokio::test]
    async fn submit_creates_single_pending_row_at_first_real_step() {
        let machine = machine();
        let plan =
            machine.plan_submit(draft(), &three_step_workflow(), Utc::now()).await.expect("plan");

        assert_eq!(plan.kind, TransitionKind::Submit);
        assert_eq!(plan.resulting_status(), RequestStatus::Pending);
        assert_eq!(plan.resulting_level(), 2);
        assert_eq!(plan.inserts.len(), 1);
        let pending = plan.pending_insert().expect("pending row");
        assert_eq!(pending.level, 2);
        assert_eq!(pending.approver_id.0, "u-mgr");

        let notification = plan.notification.expect("submit notifies");
        assert_eq!(notification.kind, NotificationKind::Submitted);
        assert_eq!(notification.from_user_id.0, "u-init");
        assert_eq!(notification.to_user_id.0, "u-mgr");
    }

    #[tokio::test]
    async fn submit_rejects_invalid_request_and_broken_workflow() {
        let machine = machine();

        let mut bad = draft();
        bad.amount = Decimal::ZERO;
        let error =
            machine.plan_submit(bad, &three_step_workflow(), Utc::now()).await.expect_err("amount");
        assert!(matches!(error, TransitionError::Validation(_)));

        let only_initiator = workflow(vec![step(1, "initiator", false)]);
        let error =
            machine.plan_submit(draft(), &only_initiator, Utc::now()).await.expect_err("no steps");
        assert!(matches!(error, TransitionError::Configuration(_)));
    }

    #[tokio::test]
    async fn deactivated_workflow_refuses_submissions_but_moves_existing_requests() {
        let machine = machine();
        let (request, pending) = submitted(&machine, &three_step_workflow()).await;
        let mut retired = three_step_workflow();
        retired.active = false;

        let error =
            machine.plan_submit(draft(), &retired, Utc::now()).await.expect_err("inactive");
        assert!(matches!(error, TransitionError::Configuration(ref m) if m.contains("inactive")));

        let plan = machine
            .plan_action(
                &request,
                &retired,
                &pending,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect("in-flight request still advances");
        assert_eq!(plan.resulting_level(), 3);

        machine
            .plan_resubmit(&request, &retired, &UserId("u-init".to_string()), Utc::now())
            .await
            .expect("in-flight request can still be resubmitted");
    }

    #[tokio::test]
    async fn submit_pins_the_workflow_and_starts_a_cycle() {
        let machine = machine();
        let workflow = three_step_workflow();
        let now = Utc::now();
        let plan = machine.plan_submit(draft(), &workflow, now).await.expect("plan");

        match &plan.request {
            RequestWrite::Create { request, workflow: pinned } => {
                assert_eq!(pinned, &workflow);
                assert_eq!(request.submitted_at, now);
            }
            RequestWrite::Update { .. } => panic!("submit creates the request"),
        }

        let request = created(&plan);
        let later = now + Duration::minutes(5);
        let plan = machine
            .plan_resubmit(&request, &workflow, &UserId("u-init".to_string()), later)
            .await
            .expect("resubmit");
        assert!(matches!(
            plan.request,
            RequestWrite::Update { submitted_at: Some(at), .. } if at == later
        ));
    }

    #[tokio::test]
    async fn unresolvable_approver_fails_submit() {
        let machine = machine();
        let workflow = workflow(vec![step(1, "initiator", false), step(2, "treasurer", false)]);

        let error = machine.plan_submit(draft(), &workflow, Utc::now()).await.expect_err("no user");
        assert_eq!(
            error,
            TransitionError::Resolution(ResolutionError::NoQualifyingUser {
                designation: "treasurer".to_string()
            })
        );
    }

    #[tokio::test]
    async fn end_to_end_chain_completes_with_fan_out() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (mut request, mut first) = submitted(&machine, &workflow).await;

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &first,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Approve,
                Some("  looks fine ".to_string()),
                Utc::now(),
            )
            .await
            .expect("approve level 2");
        assert_eq!(plan.resulting_level(), 3);
        assert_eq!(plan.resulting_status(), RequestStatus::Pending);
        let close = plan.close.clone().expect("closes row");
        assert_eq!(close.status, ApprovalStatus::Approved);
        assert_eq!(close.approved_at, Some(close.actioned_at));
        assert_eq!(close.comments.as_deref(), Some("looks fine"));
        let mut second = plan.pending_insert().cloned().expect("level 3 pending");
        assert_eq!(second.approver_id.0, "u-dir");
        apply(&mut request, &mut first, &plan);

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &second,
                &UserId("u-dir".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect("approve level 3");
        apply(&mut request, &mut second, &plan);

        assert_eq!(request.status, RequestStatus::Approved);
        assert_eq!(request.current_level, 4);
        assert!(plan.pending_insert().is_none());
        let receivers: Vec<(&str, u32)> = plan
            .final_receiver_inserts()
            .map(|row| (row.approver_id.0.as_str(), row.level))
            .collect();
        assert_eq!(receivers, vec![("u-a", 4), ("u-b", 4)]);
        assert!(plan.notification.is_none());
    }

    #[tokio::test]
    async fn auto_approve_steps_are_recorded_and_skipped_over() {
        let machine = machine();
        let workflow = workflow(vec![
            step(1, "initiator", false),
            step(2, "manager", true),
            step(3, "director", false),
        ]);

        let plan = machine.plan_submit(draft(), &workflow, Utc::now()).await.expect("plan");
        assert_eq!(plan.resulting_level(), 3);
        assert_eq!(plan.inserts.len(), 2);
        assert_eq!(plan.inserts[0].status, ApprovalStatus::Approved);
        assert_eq!(plan.inserts[0].comments.as_deref(), Some("auto-approved"));
        assert_eq!(plan.inserts[1].status, ApprovalStatus::Pending);
        assert_eq!(plan.inserts[1].level, 3);
    }

    #[tokio::test]
    async fn fully_automatic_chain_completes_on_submit() {
        let machine = machine();
        let workflow = workflow(vec![step(1, "initiator", false), step(2, "manager", true)]);

        let plan = machine.plan_submit(draft(), &workflow, Utc::now()).await.expect("plan");
        assert_eq!(plan.resulting_status(), RequestStatus::Approved);
        assert_eq!(plan.resulting_level(), 3);
        assert_eq!(plan.final_receiver_inserts().count(), 2);
        assert!(plan.notification.is_none());
    }

    #[tokio::test]
    async fn reject_keeps_level_and_creates_nothing() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (request, pending) = submitted(&machine, &workflow).await;

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Reject,
                Some("over budget".to_string()),
                Utc::now(),
            )
            .await
            .expect("reject");

        assert_eq!(plan.kind, TransitionKind::Reject);
        assert_eq!(plan.resulting_status(), RequestStatus::Rejected);
        assert_eq!(plan.resulting_level(), 2);
        assert!(plan.inserts.is_empty());
        assert_eq!(plan.close.as_ref().map(|close| close.status), Some(ApprovalStatus::Rejected));
        assert!(plan.close.as_ref().and_then(|close| close.approved_at).is_none());
    }

    #[tokio::test]
    async fn send_back_from_second_real_step_returns_to_previous_approver() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (mut request, mut first) = submitted(&machine, &workflow).await;
        let approve = machine
            .plan_action(
                &request,
                &workflow,
                &first,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect("approve");
        let second = approve.pending_insert().cloned().expect("level 3");
        apply(&mut request, &mut first, &approve);

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &second,
                &UserId("u-dir".to_string()),
                ApprovalAction::SendBack,
                Some("need quotes".to_string()),
                Utc::now(),
            )
            .await
            .expect("send back");

        assert_eq!(plan.resulting_status(), RequestStatus::SentBack);
        assert_eq!(plan.resulting_level(), 2);
        assert_eq!(plan.inserts.len(), 1);
        let returned = plan.pending_insert().expect("pending at level 2");
        assert_eq!((returned.level, returned.approver_id.0.as_str()), (2, "u-mgr"));
        assert_eq!(plan.notification.map(|n| n.kind), Some(NotificationKind::SentBack));
    }

    #[tokio::test]
    async fn send_back_from_first_real_step_returns_to_initiator() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (request, pending) = submitted(&machine, &workflow).await;

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-mgr".to_string()),
                ApprovalAction::SendBack,
                None,
                Utc::now(),
            )
            .await
            .expect("send back");

        assert_eq!(plan.resulting_status(), RequestStatus::SentBack);
        assert_eq!(plan.resulting_level(), 0);
        assert!(plan.inserts.is_empty());
        assert_eq!(plan.notification.map(|n| n.to_user_id.0), Some("u-init".to_string()));
    }

    #[tokio::test]
    async fn approving_after_send_back_resumes_pending_status() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (mut request, pending) = submitted(&machine, &workflow).await;
        request.status = RequestStatus::SentBack;

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect("approve");

        assert_eq!(
            plan.request,
            RequestWrite::Update {
                expected_status: RequestStatus::SentBack,
                expected_level: 2,
                status: RequestStatus::Pending,
                current_level: 3,
                submitted_at: None,
            }
        );
    }

    #[tokio::test]
    async fn processed_approval_cannot_be_acted_on_again() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (request, mut pending) = submitted(&machine, &workflow).await;
        pending.status = ApprovalStatus::Approved;

        let error = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect_err("already processed");
        assert!(matches!(error, TransitionError::AlreadyProcessed { .. }));
    }

    #[tokio::test]
    async fn approval_behind_current_level_is_stale() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (mut request, pending) = submitted(&machine, &workflow).await;
        request.current_level = 3;

        let error = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-mgr".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect_err("stale");
        assert!(matches!(error, TransitionError::StaleApproval { level: 2, current_level: 3, .. }));
    }

    #[tokio::test]
    async fn active_delegate_may_act_and_is_recorded() {
        let now = Utc::now();
        let machine = machine_with(vec![Delegation {
            id: DelegationId("DLG-1".to_string()),
            delegator_id: UserId("u-mgr".to_string()),
            delegate_id: UserId("u-deputy".to_string()),
            starts_at: now - Duration::hours(1),
            ends_at: now + Duration::hours(1),
            active: true,
        }]);
        let workflow = three_step_workflow();
        let (request, pending) = submitted(&machine, &workflow).await;

        let plan = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-deputy".to_string()),
                ApprovalAction::Approve,
                None,
                now,
            )
            .await
            .expect("delegate approves");
        assert_eq!(
            plan.close.and_then(|close| close.acted_by),
            Some(UserId("u-deputy".to_string()))
        );

        let error = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-deputy".to_string()),
                ApprovalAction::Approve,
                None,
                now + Duration::hours(2),
            )
            .await
            .expect_err("delegation expired");
        assert!(matches!(error, TransitionError::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn stranger_is_not_authorized() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (request, pending) = submitted(&machine, &workflow).await;

        let error = machine
            .plan_action(
                &request,
                &workflow,
                &pending,
                &UserId("u-dir".to_string()),
                ApprovalAction::Approve,
                None,
                Utc::now(),
            )
            .await
            .expect_err("wrong actor");
        assert!(matches!(error, TransitionError::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn resubmit_discards_pending_rows_and_restarts_chain() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (mut request, _) = submitted(&machine, &workflow).await;
        request.status = RequestStatus::SentBack;
        request.current_level = 0;

        let plan = machine
            .plan_resubmit(&request, &workflow, &UserId("u-init".to_string()), Utc::now())
            .await
            .expect("resubmit");

        assert!(plan.discard_pending);
        assert_eq!(plan.resulting_status(), RequestStatus::Pending);
        assert_eq!(plan.resulting_level(), 2);
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.notification.map(|n| n.kind), Some(NotificationKind::Resubmitted));
    }

    #[tokio::test]
    async fn resubmit_requires_initiator_and_open_request() {
        let machine = machine();
        let workflow = three_step_workflow();
        let (mut request, _) = submitted(&machine, &workflow).await;

        let error = machine
            .plan_resubmit(&request, &workflow, &UserId("u-mgr".to_string()), Utc::now())
            .await
            .expect_err("not initiator");
        assert!(matches!(error, TransitionError::NotInitiator { .. }));

        request.status = RequestStatus::Rejected;
        let error = machine
            .plan_resubmit(&request, &workflow, &UserId("u-init".to_string()), Utc::now())
            .await
            .expect_err("rejected requests stay closed");
        assert!(matches!(
            error,
            TransitionError::NotResubmittable { status: RequestStatus::Rejected, .. }
        ));
    }
}
