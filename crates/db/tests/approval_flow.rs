use std::sync::Arc;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use fundflow_core::approvals::{InMemoryDirectory, ResolutionPolicy, TrailStepStatus};
use fundflow_core::audit::{AuditOutcome, RingBufferAuditSink};
use fundflow_core::domain::approval::{Approval, ApprovalAction, ApprovalStatus, ListFilter};
use fundflow_core::domain::directory::{Designation, UserId};
use fundflow_core::domain::fund_request::{FundRequestId, RequestStatus};
use fundflow_core::domain::workflow::{FinalReceiver, Workflow, WorkflowId, WorkflowStep};
use fundflow_core::errors::ApplicationError;
use fundflow_core::notify::{NotificationKind, RecordingDispatcher};
use fundflow_db::repositories::{
    ApprovalRepository, InMemoryWorkflowRepository, SqlApprovalRepository,
};
use fundflow_db::{
    connect_with_settings, migrations, ActionCommand, ApprovalService, DbPool, DemoDataset,
    ServiceParts, TransitionOutcome,
};

struct Harness {
    pool: DbPool,
    service: ApprovalService,
    audit: RingBufferAuditSink,
    notifier: RecordingDispatcher,
}

async fn seeded_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    DemoDataset::load(&pool).await.expect("seed demo dataset");
    pool
}

async fn harness_with(notifier: RecordingDispatcher) -> Harness {
    let pool = seeded_pool().await;
    let audit = RingBufferAuditSink::new(64);
    let service = ApprovalService::new(
        pool.clone(),
        ServiceParts::sql_backed(
            &pool,
            ResolutionPolicy::Strict,
            Arc::new(audit.clone()),
            Arc::new(notifier.clone()),
        ),
    );
    Harness { pool, service, audit, notifier }
}

async fn harness() -> Harness {
    harness_with(RecordingDispatcher::default()).await
}

fn user(id: &str) -> UserId {
    UserId(id.to_string())
}

impl Harness {
    async fn submit(&self) -> TransitionOutcome {
        self.service
            .submit(
                DemoDataset::new_request("Thermal camera", Decimal::new(480_000, 2)),
                "corr-submit",
                &CancellationToken::new(),
            )
            .await
            .expect("submit")
    }

    async fn act(
        &self,
        approval: &Approval,
        actor: &str,
        action: ApprovalAction,
    ) -> Result<TransitionOutcome, ApplicationError> {
        self.service
            .act(
                ActionCommand {
                    approval_id: approval.id.clone(),
                    actor_id: user(actor),
                    action,
                    comments: Some(format!("{} by {actor}", action.as_str())),
                },
                "corr-act",
                &CancellationToken::new(),
            )
            .await
    }

    async fn rows(&self, request_id: &FundRequestId) -> Vec<Approval> {
        SqlApprovalRepository::new(self.pool.clone())
            .list_for_request(request_id)
            .await
            .expect("list rows")
    }
}

fn pending_of(outcome: &TransitionOutcome) -> Approval {
    outcome.created.iter().find(|row| row.is_pending()).cloned().expect("pending row created")
}

#[tokio::test]
async fn three_level_chain_completes_with_final_receiver_fan_out() {
    let harness = harness().await;

    let submitted = harness.submit().await;
    assert_eq!(submitted.status, RequestStatus::Pending);
    assert_eq!(submitted.current_level, 2);
    let manager_row = pending_of(&submitted);
    assert_eq!(manager_row.approver_id, user(DemoDataset::MANAGER));

    let advanced =
        harness.act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve).await.expect("L2");
    assert_eq!(advanced.current_level, 3);
    let director_row = pending_of(&advanced);
    assert_eq!(director_row.approver_id, user(DemoDataset::DIRECTOR));

    // the deputy holds an active delegation from the director
    let completed = harness
        .act(&director_row, DemoDataset::DEPUTY, ApprovalAction::Approve)
        .await
        .expect("L3 by delegate");
    assert_eq!(completed.status, RequestStatus::Approved);
    assert_eq!(completed.current_level, 4);

    let rows = harness.rows(&submitted.request_id).await;
    let mut receivers: Vec<(u32, String)> = rows
        .iter()
        .filter(|row| row.status == ApprovalStatus::FinalReceiver)
        .map(|row| (row.level, row.approver_id.0.clone()))
        .collect();
    receivers.sort();
    assert_eq!(receivers, vec![(4, "u-accounts".to_string()), (4, "u-treasurer".to_string())]);
    assert!(rows.iter().all(|row| !row.is_pending()));

    let director_closed = rows.iter().find(|row| row.id == director_row.id).expect("L3 row");
    assert_eq!(director_closed.approver_id, user(DemoDataset::DIRECTOR));
    assert_eq!(director_closed.acted_by, Some(user(DemoDataset::DEPUTY)));

    let trail = harness.service.trail(&submitted.request_id).await.expect("trail");
    let statuses: Vec<TrailStepStatus> = trail.steps.iter().map(|step| step.status).collect();
    assert_eq!(
        statuses,
        vec![TrailStepStatus::Created, TrailStepStatus::Approved, TrailStepStatus::Approved]
    );
    assert_eq!(trail.final_receivers.len(), 2);

    let kinds: Vec<NotificationKind> =
        harness.notifier.sent().into_iter().map(|notification| notification.kind).collect();
    assert_eq!(kinds, vec![NotificationKind::Submitted, NotificationKind::Advanced]);

    let completed_events = harness
        .audit
        .events_for(&submitted.request_id)
        .into_iter()
        .filter(|event| event.outcome == AuditOutcome::Success)
        .filter(|event| event.event_type.ends_with(".completed"))
        .filter(|event| event.event_type.starts_with("approval."))
        .count();
    assert_eq!(completed_events, 3);
}

#[tokio::test]
async fn reject_is_terminal_and_keeps_level() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let manager_row = pending_of(&submitted);

    let rejected =
        harness.act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Reject).await.expect("reject");
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.current_level, 2);
    assert!(rejected.created.is_empty());

    let rows = harness.rows(&submitted.request_id).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ApprovalStatus::Rejected);

    let error = harness
        .service
        .resubmit(
            &submitted.request_id,
            &user(DemoDataset::INITIATOR),
            "corr-resubmit",
            &CancellationToken::new(),
        )
        .await
        .expect_err("rejected requests cannot be resubmitted");
    assert!(matches!(error, ApplicationError::AlreadyProcessed(_)));

    let initiator_view = harness
        .service
        .list(&user(DemoDataset::INITIATOR), ListFilter::Rejected)
        .await
        .expect("rejected list");
    assert_eq!(initiator_view.len(), 1);
}

#[tokio::test]
async fn send_back_walks_down_then_resubmit_restarts_at_first_step() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let manager_row = pending_of(&submitted);
    let advanced = harness
        .act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve)
        .await
        .expect("approve L2");
    let director_row = pending_of(&advanced);

    let back_to_manager = harness
        .act(&director_row, DemoDataset::DIRECTOR, ApprovalAction::SendBack)
        .await
        .expect("send back L3");
    assert_eq!(back_to_manager.status, RequestStatus::SentBack);
    assert_eq!(back_to_manager.current_level, 2);
    let manager_again = pending_of(&back_to_manager);
    assert_eq!(manager_again.level, 2);
    assert_eq!(manager_again.approver_id, user(DemoDataset::MANAGER));

    let gate = harness.service.attachment_gate(&submitted.request_id).await.expect("gate");
    assert!(!gate.unlocked, "level 2 already approved this submission");

    let back_to_initiator = harness
        .act(&manager_again, DemoDataset::MANAGER, ApprovalAction::SendBack)
        .await
        .expect("send back L2");
    assert_eq!(back_to_initiator.current_level, 0);
    assert!(back_to_initiator.created.is_empty());

    let trail = harness.service.trail(&submitted.request_id).await.expect("trail");
    assert_eq!(trail.step(2).map(|step| step.status), Some(TrailStepStatus::SentBack));
    assert_eq!(trail.step(3).map(|step| step.status), Some(TrailStepStatus::SentBack));

    let history_before = harness.rows(&submitted.request_id).await.len();
    let resubmitted = harness
        .service
        .resubmit(
            &submitted.request_id,
            &user(DemoDataset::INITIATOR),
            "corr-resubmit",
            &CancellationToken::new(),
        )
        .await
        .expect("resubmit");
    assert_eq!(resubmitted.status, RequestStatus::Pending);
    assert_eq!(resubmitted.current_level, 2);
    let gate = harness.service.attachment_gate(&submitted.request_id).await.expect("gate");
    assert!(gate.unlocked, "resubmission starts a fresh cycle");

    let rows = harness.rows(&submitted.request_id).await;
    assert_eq!(rows.len(), history_before + 1, "history is preserved");
    let pending: Vec<&Approval> = rows.iter().filter(|row| row.is_pending()).collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].level, 2);

    let kinds: Vec<NotificationKind> =
        harness.notifier.sent().into_iter().map(|notification| notification.kind).collect();
    assert_eq!(kinds.last(), Some(&NotificationKind::Resubmitted));
}

#[tokio::test]
async fn resubmit_discards_stale_pending_rows() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let manager_row = pending_of(&submitted);
    let advanced = harness
        .act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve)
        .await
        .expect("approve L2");
    let director_row = pending_of(&advanced);
    let back = harness
        .act(&director_row, DemoDataset::DIRECTOR, ApprovalAction::SendBack)
        .await
        .expect("send back L3");
    let stale_pending = pending_of(&back);

    harness
        .service
        .resubmit(
            &submitted.request_id,
            &user(DemoDataset::INITIATOR),
            "corr-resubmit",
            &CancellationToken::new(),
        )
        .await
        .expect("resubmit");

    let rows = harness.rows(&submitted.request_id).await;
    assert!(rows.iter().all(|row| row.id != stale_pending.id), "old pending row deleted");
    assert_eq!(rows.iter().filter(|row| row.is_pending()).count(), 1);

    let error = harness
        .act(&stale_pending, DemoDataset::MANAGER, ApprovalAction::Approve)
        .await
        .expect_err("deleted row");
    assert!(matches!(error, ApplicationError::NotFound(_)));
}

#[tokio::test]
async fn actors_are_checked_and_repeats_are_already_processed() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let manager_row = pending_of(&submitted);

    let error = harness
        .act(&manager_row, DemoDataset::DEPUTY, ApprovalAction::Approve)
        .await
        .expect_err("deputy only covers the director");
    assert!(matches!(error, ApplicationError::NotAuthorized(_)));

    harness.act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve).await.expect("approve");
    let error = harness
        .act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve)
        .await
        .expect_err("second approval");
    assert!(matches!(error, ApplicationError::AlreadyProcessed(_)));
    assert!(!error.is_retryable());

    let error = harness
        .service
        .resubmit(
            &submitted.request_id,
            &user(DemoDataset::MANAGER),
            "corr-resubmit",
            &CancellationToken::new(),
        )
        .await
        .expect_err("only the initiator resubmits");
    assert!(matches!(error, ApplicationError::NotAuthorized(_)));

    let rejected_events = harness
        .audit
        .events()
        .into_iter()
        .filter(|event| event.outcome == AuditOutcome::Rejected)
        .count();
    assert_eq!(rejected_events, 3);
}

#[tokio::test]
async fn notification_failure_does_not_undo_the_transition() {
    let harness = harness_with(RecordingDispatcher::failing("smtp down")).await;
    let submitted = harness.submit().await;

    let rows = harness.rows(&submitted.request_id).await;
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_pending());
    assert!(harness
        .audit
        .events()
        .iter()
        .any(|event| event.event_type == "notification.dispatch.failed"));
}

#[tokio::test]
async fn cancelled_submit_persists_nothing() {
    let harness = harness().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = harness
        .service
        .submit(DemoDataset::new_request("Drone", Decimal::new(99_900, 2)), "corr-cancel", &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(error, ApplicationError::Cancelled));

    let requests: i64 = sqlx::query_scalar("SELECT COUNT(1) FROM fund_request")
        .fetch_one(&harness.pool)
        .await
        .expect("count");
    assert_eq!(requests, 0);
    assert!(harness.notifier.sent().is_empty());
}

#[tokio::test]
async fn inbox_lists_delegated_and_initiated_work() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let manager_row = pending_of(&submitted);
    harness.act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve).await.expect("approve");

    let deputy_inbox = harness
        .service
        .list(&user(DemoDataset::DEPUTY), ListFilter::AssignedPending)
        .await
        .expect("deputy inbox");
    assert_eq!(deputy_inbox.len(), 1);
    assert_eq!(deputy_inbox[0].approval.as_ref().map(|row| row.level), Some(3));

    let manager_history = harness
        .service
        .list(&user(DemoDataset::MANAGER), ListFilter::ApprovedByMe)
        .await
        .expect("approved by manager");
    assert_eq!(manager_history.len(), 1);

    let initiated = harness
        .service
        .list(&user(DemoDataset::INITIATOR), ListFilter::Initiated)
        .await
        .expect("initiated");
    assert_eq!(initiated.len(), 1);
    assert_eq!(initiated[0].request.current_level, 3);

    let gate = harness.service.attachment_gate(&submitted.request_id).await.expect("gate");
    assert!(!gate.unlocked, "attachments lock once the first real step approved");
}

#[tokio::test]
async fn unresolvable_designation_is_unprocessable_and_missing_workflow_is_configuration() {
    let pool = seeded_pool().await;
    let workflow = Workflow {
        id: WorkflowId(DemoDataset::WORKFLOW_ID.to_string()),
        name: "Orphaned chain".to_string(),
        department_id: None,
        active: true,
        steps: vec![
            WorkflowStep {
                sequence: 1,
                designation: Designation("initiator".to_string()),
                sla_hours: 0,
                auto_approve: false,
            },
            WorkflowStep {
                sequence: 2,
                designation: Designation("chief_scientist".to_string()),
                sla_hours: 24,
                auto_approve: false,
            },
        ],
        final_receivers: vec![FinalReceiver::User(user("u-accounts"))],
    };
    let service = ApprovalService::new(
        pool.clone(),
        ServiceParts {
            workflows: Arc::new(InMemoryWorkflowRepository::with_workflows([workflow])),
            directory: Arc::new(InMemoryDirectory::with_users(Vec::new())),
            delegations: Arc::new(fundflow_core::approvals::InMemoryDelegations::default()),
            policy: ResolutionPolicy::Strict,
            retry: fundflow_db::RetryPolicy::default(),
            audit: Arc::new(RingBufferAuditSink::new(8)),
            notifier: Arc::new(RecordingDispatcher::default()),
        },
    );

    let error = service
        .submit(
            DemoDataset::new_request("Cryostat", Decimal::new(1_000_000, 2)),
            "corr-unresolved",
            &CancellationToken::new(),
        )
        .await
        .expect_err("nobody holds chief_scientist");
    assert!(matches!(error, ApplicationError::Unprocessable(_)));

    let mut orphan = DemoDataset::new_request("Centrifuge", Decimal::new(50_000, 2));
    orphan.workflow_id = WorkflowId("WF-MISSING".to_string());
    let error = service
        .submit(orphan, "corr-missing", &CancellationToken::new())
        .await
        .expect_err("missing workflow");
    assert!(matches!(error, ApplicationError::Configuration(_)));
    assert_eq!(error.into_interface("corr-missing").status_code(), 500);
}

#[tokio::test]
async fn deactivated_workflow_still_moves_requests_in_flight() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let manager_row = pending_of(&submitted);

    sqlx::query("UPDATE workflow SET active = 0 WHERE id = ?")
        .bind(DemoDataset::WORKFLOW_ID)
        .execute(&harness.pool)
        .await
        .expect("deactivate workflow");

    let advanced = harness
        .act(&manager_row, DemoDataset::MANAGER, ApprovalAction::Approve)
        .await
        .expect("in-flight request keeps moving");
    assert_eq!(advanced.current_level, 3);

    let error = harness
        .service
        .submit(
            DemoDataset::new_request("Spare rig", Decimal::new(10_000, 2)),
            "corr-retired",
            &CancellationToken::new(),
        )
        .await
        .expect_err("retired workflow takes no new requests");
    assert!(matches!(error, ApplicationError::Configuration(_)));
}

#[tokio::test]
async fn in_flight_requests_follow_the_workflow_they_were_submitted_under() {
    let harness = harness().await;
    let submitted = harness.submit().await;
    let advanced = harness
        .act(&pending_of(&submitted), DemoDataset::MANAGER, ApprovalAction::Approve)
        .await
        .expect("approve L2");

    sqlx::query(
        "INSERT INTO workflow_step (workflow_id, sequence, designation, sla_hours, auto_approve)
         VALUES (?, 4, 'director', 24, 0)",
    )
    .bind(DemoDataset::WORKFLOW_ID)
    .execute(&harness.pool)
    .await
    .expect("extend workflow");

    let completed = harness
        .act(&pending_of(&advanced), DemoDataset::DIRECTOR, ApprovalAction::Approve)
        .await
        .expect("approve L3");
    assert_eq!(completed.status, RequestStatus::Approved);
    assert_eq!(completed.current_level, 4);
    assert_eq!(
        completed.created.iter().filter(|row| row.status == ApprovalStatus::FinalReceiver).count(),
        2
    );

    let trail = harness.service.trail(&submitted.request_id).await.expect("trail");
    assert!(trail.step(4).is_none(), "the added step is not part of this request");

    let later = harness.submit().await;
    let trail = harness.service.trail(&later.request_id).await.expect("trail");
    assert_eq!(trail.step(4).map(|step| step.status), Some(TrailStepStatus::Upcoming));
}
