use chrono::Utc;
use fundflow_core::approvals::{build_trail, ApprovalTrail};
use fundflow_core::domain::fund_request::FundRequestId;
use fundflow_db::repositories::{
    ApprovalRepository, FundRequestRepository, SqlApprovalRepository, SqlFundRequestRepository,
    SqlWorkflowRepository, WorkflowRepository,
};
use fundflow_db::{connect_from_config, DbPool};

use crate::commands::{load_config, runtime, CommandResult, StepError};

pub fn run(request_id: &str) -> CommandResult {
    let config = match load_config("trail") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("trail") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let trail = load_trail(&pool, &FundRequestId(request_id.to_string())).await;
        pool.close().await;
        trail
    });

    match result {
        Ok(trail) => {
            let message = format!(
                "request {} is {} at level {}",
                trail.request_id.0,
                trail.status.as_str(),
                trail.current_level
            );
            match serde_json::to_value(&trail) {
                Ok(data) => CommandResult::success_with("trail", message, Some(data)),
                Err(error) => CommandResult::failure("trail", "serialization", error.to_string(), 8),
            }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("trail", error_class, message, exit_code)
        }
    }
}

pub(crate) async fn load_trail(
    pool: &DbPool,
    request_id: &FundRequestId,
) -> Result<ApprovalTrail, StepError> {
    let request = SqlFundRequestRepository::new(pool.clone())
        .find_by_id(request_id)
        .await
        .map_err(|error| ("repository", error.to_string(), 5u8))?
        .ok_or_else(|| ("not_found", format!("fund request {} does not exist", request_id.0), 7u8))?;

    let workflow = SqlWorkflowRepository::new(pool.clone())
        .find_by_id(&request.workflow_id)
        .await
        .map_err(|error| ("repository", error.to_string(), 5u8))?
        .ok_or_else(|| {
            (
                "configuration",
                format!("workflow {} of request {} does not exist", request.workflow_id.0, request_id.0),
                6u8,
            )
        })?;

    let approvals = SqlApprovalRepository::new(pool.clone())
        .list_for_request(request_id)
        .await
        .map_err(|error| ("repository", error.to_string(), 5u8))?;

    Ok(build_trail(&request, &workflow, &approvals, Utc::now()))
}
