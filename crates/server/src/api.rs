use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use fundflow_core::approvals::ApprovalTrail;
use fundflow_core::domain::approval::{ApprovalAction, ApprovalId, ListFilter};
use fundflow_core::domain::directory::{DepartmentId, ProjectId, UserId};
use fundflow_core::domain::fund_request::{FundRequestId, NewFundRequest};
use fundflow_core::domain::workflow::WorkflowId;
use fundflow_core::errors::{ApplicationError, InterfaceError};
use fundflow_db::repositories::InboxEntry;
use fundflow_db::{ActionCommand, ApprovalService, AttachmentGate, TransitionOutcome};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

pub const USER_HEADER: &str = "x-user-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    service: Arc<ApprovalService>,
    shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub amount: Decimal,
    pub department_id: String,
    pub project_id: Option<String>,
    pub workflow_id: String,
    pub needed_by: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ActionBody {
    pub action: String,
    pub comments: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InboxQuery {
    pub user_id: Option<String>,
    pub filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
    pub retryable: bool,
    pub correlation_id: String,
}

/// Interface error rendered as a JSON body with the matching status code.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn forbidden(message: impl Into<String>, correlation_id: &str) -> Self {
        Self(InterfaceError::Forbidden {
            message: message.into(),
            correlation_id: correlation_id.to_string(),
        })
    }

    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        let status =
            StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let retryable = matches!(
            error,
            InterfaceError::Conflict { retryable: true, .. }
                | InterfaceError::ServiceUnavailable { .. }
        );

        warn!(
            event_name = "http.request.failed",
            correlation_id = %error.correlation_id(),
            status = status.as_u16(),
            error = %error,
            "request failed"
        );

        let body = ErrorBody {
            error: error.user_message().to_string(),
            detail: error.message().to_string(),
            retryable,
            correlation_id: error.correlation_id().to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

pub fn router(service: Arc<ApprovalService>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/api/v1/requests", post(submit_request))
        .route("/api/v1/requests/{id}/resubmit", post(resubmit_request))
        .route("/api/v1/requests/{id}/trail", get(request_trail))
        .route("/api/v1/requests/{id}/attachments/unlocked", get(attachment_gate))
        .route("/api/v1/approvals/{id}/actions", post(act_on_approval))
        .route("/api/v1/inbox", get(inbox))
        .with_state(ApiState { service, shutdown })
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()))
}

fn caller(headers: &HeaderMap, correlation_id: &str) -> Result<UserId, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| UserId(value.to_string()))
        .ok_or_else(|| ApiError::bad_request(format!("missing `{USER_HEADER}` header"), correlation_id))
}

async fn submit_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<TransitionOutcome>), ApiError> {
    let correlation_id = correlation_id(&headers);
    let initiator_id = caller(&headers, &correlation_id)?;

    let new_request = NewFundRequest {
        title: body.title,
        description: body.description,
        amount: body.amount,
        initiator_id,
        department_id: DepartmentId(body.department_id),
        project_id: body.project_id.map(ProjectId),
        workflow_id: WorkflowId(body.workflow_id),
        needed_by: body.needed_by,
    };

    let outcome = state
        .service
        .submit(new_request, &correlation_id, &state.shutdown.child_token())
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn resubmit_request(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TransitionOutcome>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor = caller(&headers, &correlation_id)?;

    state
        .service
        .resubmit(&FundRequestId(id), &actor, &correlation_id, &state.shutdown.child_token())
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn act_on_approval(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ActionBody>,
) -> Result<Json<TransitionOutcome>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let actor_id = caller(&headers, &correlation_id)?;
    let action = ApprovalAction::parse(&body.action).ok_or_else(|| {
        ApiError::bad_request(
            format!("unknown action `{}`; expected approve, reject or send_back", body.action),
            &correlation_id,
        )
    })?;

    let command = ActionCommand {
        approval_id: ApprovalId(id),
        actor_id,
        action,
        comments: body.comments.filter(|comments| !comments.trim().is_empty()),
    };

    state
        .service
        .act(command, &correlation_id, &state.shutdown.child_token())
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn request_trail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ApprovalTrail>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .service
        .trail(&FundRequestId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn attachment_gate(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AttachmentGate>, ApiError> {
    let correlation_id = correlation_id(&headers);
    state
        .service
        .attachment_gate(&FundRequestId(id))
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}

async fn inbox(
    State(state): State<ApiState>,
    Query(query): Query<InboxQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<InboxEntry>>, ApiError> {
    let correlation_id = correlation_id(&headers);
    let caller = caller(&headers, &correlation_id)?;

    // callers may only list their own relationships
    if let Some(user_id) = query.user_id.as_deref().filter(|value| !value.is_empty()) {
        if user_id != caller.0 {
            return Err(ApiError::forbidden(
                format!("user {} may not list requests of {user_id}", caller.0),
                &correlation_id,
            ));
        }
    }

    let filter = match query.filter.as_deref() {
        None | Some("") => ListFilter::AssignedPending,
        Some(raw) => ListFilter::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown filter `{raw}`"), &correlation_id)
        })?,
    };

    state
        .service
        .list(&caller, filter)
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error, &correlation_id))
}
