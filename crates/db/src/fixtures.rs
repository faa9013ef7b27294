use rust_decimal::Decimal;
use sqlx::Executor;

use fundflow_core::domain::directory::{DepartmentId, UserId};
use fundflow_core::domain::fund_request::NewFundRequest;
use fundflow_core::domain::workflow::WorkflowId;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

const DEMO_USER_IDS: &[&str] = &[
    "u-init",
    "u-mgr",
    "u-mgr-ops",
    "u-director",
    "u-deputy",
    "u-accounts",
    "u-treasurer",
];

/// Demo directory and the three-level capital-expense workflow:
/// initiator (1), manager (2), director (3), then fan-out to `u-accounts` and the treasurer.
/// `u-deputy` substitutes for `u-director` from one hour before seeding for fourteen days.
pub struct DemoDataset;

impl DemoDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_seed.sql");
    pub const WORKFLOW_ID: &str = "WF-CAPEX";
    pub const INITIATOR: &str = "u-init";
    pub const MANAGER: &str = "u-mgr";
    pub const DIRECTOR: &str = "u-director";
    pub const DEPUTY: &str = "u-deputy";
    pub const RECEIVERS: &[&str] = &["u-accounts", "u-treasurer"];

    /// Idempotent: rows that already exist are left untouched.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        Ok(SeedResult {
            workflow_id: Self::WORKFLOW_ID,
            users_seeded: DEMO_USER_IDS.len(),
            delegations_seeded: 1,
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let workflow_active: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM workflow WHERE id = ?1 AND active = 1)",
        )
        .bind(Self::WORKFLOW_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("workflow", workflow_active == 1));

        let step_count: i64 =
            sqlx::query_scalar("SELECT COUNT(1) FROM workflow_step WHERE workflow_id = ?1")
                .bind(Self::WORKFLOW_ID)
                .fetch_one(pool)
                .await?;
        checks.push(("workflow-steps", step_count == 3));

        let receiver_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM workflow_final_receiver WHERE workflow_id = ?1",
        )
        .bind(Self::WORKFLOW_ID)
        .fetch_one(pool)
        .await?;
        checks.push(("final-receivers", receiver_count == 2));

        let user_count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(1) FROM directory_user WHERE id IN {}",
            sql_array_from_ids(DEMO_USER_IDS)
        ))
        .fetch_one(pool)
        .await?;
        checks.push(("directory-users", user_count == DEMO_USER_IDS.len() as i64));

        let delegation_exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM delegation WHERE id = 'DLG-DEMO' AND active = 1)",
        )
        .fetch_one(pool)
        .await?;
        checks.push(("delegation", delegation_exists == 1));

        let all_present = checks.iter().all(|(_, passed)| *passed);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the demo rows, including any requests raised against the demo workflow.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "DELETE FROM approval
             WHERE fund_request_id IN (SELECT id FROM fund_request WHERE workflow_id = ?1)",
        )
        .bind(Self::WORKFLOW_ID)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM fund_request WHERE workflow_id = ?1")
            .bind(Self::WORKFLOW_ID)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM workflow WHERE id = ?1")
            .bind(Self::WORKFLOW_ID)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM delegation WHERE id = 'DLG-DEMO'").execute(&mut *tx).await?;
        sqlx::query(&format!(
            "DELETE FROM directory_user WHERE id IN {}",
            sql_array_from_ids(DEMO_USER_IDS)
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// A request from the demo initiator in the engineering department.
    pub fn new_request(title: &str, amount: Decimal) -> NewFundRequest {
        NewFundRequest {
            title: title.to_string(),
            description: format!("{title} for the engineering team"),
            amount,
            initiator_id: UserId(Self::INITIATOR.to_string()),
            department_id: DepartmentId("dept-eng".to_string()),
            project_id: None,
            workflow_id: WorkflowId(Self::WORKFLOW_ID.to_string()),
            needed_by: None,
        }
    }
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{id}'")).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug)]
pub struct SeedResult {
    pub workflow_id: &'static str,
    pub users_seeded: usize,
    pub delegations_seeded: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}
