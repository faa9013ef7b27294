use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fundflow_core::approvals::{
    build_trail, ApprovalStateMachine, ApprovalTrail, ApproverDirectory, ApproverResolver,
    DelegationLookup, ResolutionPolicy, TransitionError, TransitionKind, TransitionPlan,
};
use fundflow_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use fundflow_core::domain::approval::{Approval, ApprovalAction, ApprovalId, ListFilter};
use fundflow_core::domain::directory::UserId;
use fundflow_core::domain::fund_request::{FundRequest, FundRequestId, NewFundRequest, RequestStatus};
use fundflow_core::domain::workflow::{Workflow, RETURNED_TO_INITIATOR_LEVEL};
use fundflow_core::errors::ApplicationError;
use fundflow_core::notify::NotificationDispatcher;

use crate::guard::{ConcurrencyGuard, RetryPolicy};
use crate::repositories::{
    ApprovalRepository, FundRequestRepository, InboxEntry, SqlApprovalRepository,
    SqlDirectoryRepository, SqlFundRequestRepository, SqlWorkflowRepository, WorkflowRepository,
};
use crate::DbPool;

type Machine = ApprovalStateMachine<Arc<dyn ApproverDirectory>, Arc<dyn DelegationLookup>>;

/// Collaborators the service does not own a fixed implementation of.
pub struct ServiceParts {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub directory: Arc<dyn ApproverDirectory>,
    pub delegations: Arc<dyn DelegationLookup>,
    pub policy: ResolutionPolicy,
    pub retry: RetryPolicy,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn NotificationDispatcher>,
}

impl ServiceParts {
    /// Workflows, users and delegations all read from `pool`.
    pub fn sql_backed(
        pool: &DbPool,
        policy: ResolutionPolicy,
        audit: Arc<dyn AuditSink>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        let directory = Arc::new(SqlDirectoryRepository::new(pool.clone()));
        Self {
            workflows: Arc::new(SqlWorkflowRepository::new(pool.clone())),
            directory: directory.clone(),
            delegations: directory,
            policy,
            retry: RetryPolicy::default(),
            audit,
            notifier,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionCommand {
    pub approval_id: ApprovalId,
    pub actor_id: UserId,
    pub action: ApprovalAction,
    pub comments: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransitionOutcome {
    pub request_id: FundRequestId,
    pub transition: TransitionKind,
    pub status: RequestStatus,
    pub current_level: u32,
    pub created: Vec<Approval>,
}

impl TransitionOutcome {
    /// `created` holds only the rows the commit wrote, not those an identical row already covered.
    fn committed(plan: &TransitionPlan, created: Vec<Approval>) -> Self {
        Self {
            request_id: plan.request_id.clone(),
            transition: plan.kind,
            status: plan.resulting_status(),
            current_level: plan.resulting_level(),
            created,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AttachmentGate {
    pub request_id: FundRequestId,
    pub unlocked: bool,
    pub status: RequestStatus,
    pub current_level: u32,
}

fn completed_event(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Submit => "approval.submit.completed",
        TransitionKind::Resubmit => "approval.resubmit.completed",
        TransitionKind::Approve | TransitionKind::Reject | TransitionKind::SendBack => {
            "approval.act.completed"
        }
    }
}

fn rejected_event(kind: TransitionKind) -> &'static str {
    match kind {
        TransitionKind::Submit => "approval.submit.rejected",
        TransitionKind::Resubmit => "approval.resubmit.rejected",
        TransitionKind::Approve | TransitionKind::Reject | TransitionKind::SendBack => {
            "approval.act.rejected"
        }
    }
}

/// Entry point for every fund request operation: plans with the state machine, commits through
/// the concurrency guard, then audits and notifies.
pub struct ApprovalService {
    requests: SqlFundRequestRepository,
    approvals: SqlApprovalRepository,
    workflows: Arc<dyn WorkflowRepository>,
    machine: Machine,
    guard: ConcurrencyGuard,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl ApprovalService {
    pub fn new(pool: DbPool, parts: ServiceParts) -> Self {
        Self {
            requests: SqlFundRequestRepository::new(pool.clone()),
            approvals: SqlApprovalRepository::new(pool.clone()),
            workflows: parts.workflows,
            machine: ApprovalStateMachine::new(
                ApproverResolver::new(parts.directory, parts.policy),
                parts.delegations,
            ),
            guard: ConcurrencyGuard::new(pool, parts.retry),
            audit: parts.audit,
            notifier: parts.notifier,
        }
    }

    pub async fn submit(
        &self,
        input: NewFundRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let now = Utc::now();
        let draft = FundRequest::draft(input, now);
        let context =
            AuditContext::new(Some(draft.id.clone()), correlation_id, draft.initiator_id.0.clone());

        let workflow = self.live_workflow(&draft).await?;
        let plan = match self.machine.plan_submit(draft, &workflow, now).await {
            Ok(plan) => plan,
            Err(error) => return Err(self.rejected(&context, TransitionKind::Submit, error)),
        };

        self.commit(plan, &context, cancel).await
    }

    pub async fn act(
        &self,
        command: ActionCommand,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let now = Utc::now();
        let kind = TransitionKind::from(command.action);

        let approval = self
            .approvals
            .find_by_id(&command.approval_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("approval {}", command.approval_id.0)))?;
        let context = AuditContext::new(
            Some(approval.fund_request_id.clone()),
            correlation_id,
            command.actor_id.0.clone(),
        );

        let request = self.request(&approval.fund_request_id).await?;
        let workflow = self.pinned_workflow(&request).await?;
        let plan = match self
            .machine
            .plan_action(
                &request,
                &workflow,
                &approval,
                &command.actor_id,
                command.action,
                command.comments,
                now,
            )
            .await
        {
            Ok(plan) => plan,
            Err(error) => return Err(self.rejected(&context, kind, error)),
        };

        self.commit(plan, &context, cancel).await
    }

    pub async fn resubmit(
        &self,
        request_id: &FundRequestId,
        actor_id: &UserId,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let now = Utc::now();
        let context = AuditContext::new(Some(request_id.clone()), correlation_id, actor_id.0.clone());

        let request = self.request(request_id).await?;
        let workflow = self.pinned_workflow(&request).await?;
        let plan = match self.machine.plan_resubmit(&request, &workflow, actor_id, now).await {
            Ok(plan) => plan,
            Err(error) => return Err(self.rejected(&context, TransitionKind::Resubmit, error)),
        };

        self.commit(plan, &context, cancel).await
    }

    pub async fn trail(&self, request_id: &FundRequestId) -> Result<ApprovalTrail, ApplicationError> {
        let request = self.request(request_id).await?;
        let workflow = self.pinned_workflow(&request).await?;
        let approvals = self.approvals.list_for_request(request_id).await?;

        Ok(build_trail(&request, &workflow, &approvals, Utc::now()))
    }

    pub async fn list(
        &self,
        user_id: &UserId,
        filter: ListFilter,
    ) -> Result<Vec<InboxEntry>, ApplicationError> {
        Ok(self.approvals.list_for_user(user_id, filter, Utc::now()).await?)
    }

    pub async fn attachment_gate(
        &self,
        request_id: &FundRequestId,
    ) -> Result<AttachmentGate, ApplicationError> {
        let request = self.request(request_id).await?;
        let workflow = self.pinned_workflow(&request).await?;
        let approvals = self.approvals.list_for_request(request_id).await?;
        let first_real_level = workflow
            .first_real_step()
            .map(|step| step.sequence)
            .unwrap_or(RETURNED_TO_INITIATOR_LEVEL);

        Ok(AttachmentGate {
            request_id: request.id.clone(),
            unlocked: request.is_attachment_unlocked(first_real_level, &approvals),
            status: request.status,
            current_level: request.current_level,
        })
    }

    async fn request(&self, request_id: &FundRequestId) -> Result<FundRequest, ApplicationError> {
        self.requests
            .find_by_id(request_id)
            .await?
            .ok_or_else(|| ApplicationError::NotFound(format!("fund request {}", request_id.0)))
    }

    /// Definition a stored request was submitted under. Requests stored before workflows were
    /// pinned fall back to the live definition.
    async fn pinned_workflow(&self, request: &FundRequest) -> Result<Workflow, ApplicationError> {
        match self.requests.workflow_snapshot(&request.id).await? {
            Some(workflow) => Ok(workflow),
            None => self.live_workflow(request).await,
        }
    }

    async fn live_workflow(&self, request: &FundRequest) -> Result<Workflow, ApplicationError> {
        self.workflows.find_by_id(&request.workflow_id).await?.ok_or_else(|| {
            ApplicationError::Configuration(format!(
                "workflow {} referenced by request {} does not exist",
                request.workflow_id.0, request.id.0
            ))
        })
    }

    fn rejected(
        &self,
        context: &AuditContext,
        kind: TransitionKind,
        error: TransitionError,
    ) -> ApplicationError {
        warn!(
            event_name = rejected_event(kind),
            correlation_id = %context.correlation_id,
            request_id = context.request_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            transition = kind.as_str(),
            error = %error,
            "transition rejected"
        );
        self.audit.emit(
            AuditEvent::new(
                context,
                rejected_event(kind),
                AuditCategory::Transition,
                AuditOutcome::Rejected,
            )
            .with_metadata("error", error.to_string()),
        );
        error.into()
    }

    async fn commit(
        &self,
        plan: TransitionPlan,
        context: &AuditContext,
        cancel: &CancellationToken,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let inserted = match self.guard.apply(&plan, cancel).await {
            Ok(inserted) => inserted,
            Err(error) => {
                warn!(
                    event_name = "approval.guard.failed",
                    correlation_id = %context.correlation_id,
                    request_id = %plan.request_id.0,
                    transition = plan.kind.as_str(),
                    error = %error,
                    "transition not committed"
                );
                self.audit.emit(
                    AuditEvent::new(
                        context,
                        "approval.guard.failed",
                        AuditCategory::Persistence,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("transition", plan.kind.as_str())
                    .with_metadata("error", error.to_string()),
                );
                return Err(error.into());
            }
        };

        let pending = inserted
            .iter()
            .find(|approval| approval.is_pending())
            .map(|approval| approval.id.0.clone());
        info!(
            event_name = completed_event(plan.kind),
            correlation_id = %context.correlation_id,
            request_id = %plan.request_id.0,
            approval_id = plan.close.as_ref().map(|close| close.approval_id.0.as_str()).unwrap_or("none"),
            transition = plan.kind.as_str(),
            status = plan.resulting_status().as_str(),
            current_level = plan.resulting_level(),
            next_approval_id = pending.as_deref().unwrap_or("none"),
            "transition committed"
        );

        let mut event = AuditEvent::new(
            context,
            completed_event(plan.kind),
            AuditCategory::Transition,
            AuditOutcome::Success,
        )
        .with_metadata("transition", plan.kind.as_str())
        .with_metadata("status", plan.resulting_status().as_str())
        .with_metadata("current_level", plan.resulting_level().to_string())
        .with_metadata("rows_created", inserted.len().to_string());
        if let Some(close) = &plan.close {
            event = event.with_metadata("approval_id", close.approval_id.0.clone());
            if let Some(delegate) = &close.acted_by {
                event = event.with_metadata("acted_by", delegate.0.clone());
            }
        }
        self.audit.emit(event);

        self.notify(&plan, context).await;
        Ok(TransitionOutcome::committed(&plan, inserted))
    }

    async fn notify(&self, plan: &TransitionPlan, context: &AuditContext) {
        let Some(notification) = &plan.notification else {
            return;
        };

        match self.notifier.dispatch(notification).await {
            Ok(()) => self.audit.emit(
                AuditEvent::new(
                    context,
                    "notification.dispatch.completed",
                    AuditCategory::Notification,
                    AuditOutcome::Success,
                )
                .with_metadata("kind", notification.kind.as_str())
                .with_metadata("to_user_id", notification.to_user_id.0.clone()),
            ),
            Err(error) => {
                warn!(
                    event_name = "notification.dispatch.failed",
                    correlation_id = %context.correlation_id,
                    request_id = %notification.request_id.0,
                    to_user_id = %notification.to_user_id.0,
                    kind = notification.kind.as_str(),
                    error = %error,
                    "notification dispatch failed; transition already committed"
                );
                self.audit.emit(
                    AuditEvent::new(
                        context,
                        "notification.dispatch.failed",
                        AuditCategory::Notification,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("kind", notification.kind.as_str())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
    }
}
