use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use fundflow_core::approvals::delegation::select_substitute;
use fundflow_core::approvals::{ApproverDirectory, DelegationLookup, InMemoryDirectory};
use fundflow_core::domain::directory::{
    Delegation, DelegationId, DepartmentId, Designation, DirectoryUser, ProjectId, UserId,
};
use fundflow_core::lookup::LookupError;

use super::{encode_timestamp, parse_timestamp, DirectoryRepository, RepositoryError};
use crate::DbPool;

const USER_COLUMNS: &str = "id, display_name, designation, department_id, project_id, active";
const DELEGATION_COLUMNS: &str = "id, delegator_id, delegate_id, starts_at, ends_at, active";

fn user_from_row(row: &SqliteRow) -> Result<DirectoryUser, RepositoryError> {
    Ok(DirectoryUser {
        id: UserId(row.try_get("id")?),
        display_name: row.try_get("display_name")?,
        designation: Designation(row.try_get("designation")?),
        department_id: row.try_get::<Option<String>, _>("department_id")?.map(DepartmentId),
        project_id: row.try_get::<Option<String>, _>("project_id")?.map(ProjectId),
        active: row.try_get::<i64, _>("active")? != 0,
    })
}

fn delegation_from_row(row: &SqliteRow) -> Result<Delegation, RepositoryError> {
    Ok(Delegation {
        id: DelegationId(row.try_get("id")?),
        delegator_id: UserId(row.try_get("delegator_id")?),
        delegate_id: UserId(row.try_get("delegate_id")?),
        starts_at: parse_timestamp("starts_at", row.try_get("starts_at")?)?,
        ends_at: parse_timestamp("ends_at", row.try_get("ends_at")?)?,
        active: row.try_get::<i64, _>("active")? != 0,
    })
}

fn unavailable(error: RepositoryError) -> LookupError {
    LookupError::Unavailable(error.to_string())
}

/// User directory and delegation store backed by the local database.
#[derive(Clone)]
pub struct SqlDirectoryRepository {
    pool: DbPool,
}

impl SqlDirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Point-in-time copy of every user, used as the fallback lookup path.
    pub async fn snapshot(&self) -> Result<InMemoryDirectory, RepositoryError> {
        Ok(InMemoryDirectory::with_users(self.list_users().await?))
    }

    async fn users_by_designation_key(
        &self,
        key: &str,
    ) -> Result<Vec<DirectoryUser>, RepositoryError> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM directory_user
             WHERE lower(trim(designation)) = ?
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&query).bind(key).fetch_all(&self.pool).await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn user_by_id(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, RepositoryError> {
        let query = format!("SELECT {USER_COLUMNS} FROM directory_user WHERE id = ?");
        let row = sqlx::query(&query).bind(&user_id.0).fetch_optional(&self.pool).await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn covering_delegations(
        &self,
        delegator_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let at = encode_timestamp(at);
        let query = format!(
            "SELECT {DELEGATION_COLUMNS} FROM delegation
             WHERE delegator_id = ? AND active = 1 AND starts_at <= ? AND ends_at > ?"
        );
        let rows = sqlx::query(&query)
            .bind(&delegator_id.0)
            .bind(&at)
            .bind(&at)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(delegation_from_row).collect()
    }
}

#[async_trait]
impl DirectoryRepository for SqlDirectoryRepository {
    async fn save_user(&self, user: DirectoryUser) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO directory_user (id, display_name, designation, department_id, project_id, active)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                designation = excluded.designation,
                department_id = excluded.department_id,
                project_id = excluded.project_id,
                active = excluded.active",
        )
        .bind(&user.id.0)
        .bind(&user.display_name)
        .bind(&user.designation.0)
        .bind(user.department_id.as_ref().map(|department| department.0.as_str()))
        .bind(user.project_id.as_ref().map(|project| project.0.as_str()))
        .bind(i64::from(user.active))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, RepositoryError> {
        let query = format!("SELECT {USER_COLUMNS} FROM directory_user ORDER BY id ASC");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn save_delegation(&self, delegation: Delegation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO delegation (id, delegator_id, delegate_id, starts_at, ends_at, active)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                delegator_id = excluded.delegator_id,
                delegate_id = excluded.delegate_id,
                starts_at = excluded.starts_at,
                ends_at = excluded.ends_at,
                active = excluded.active",
        )
        .bind(&delegation.id.0)
        .bind(&delegation.delegator_id.0)
        .bind(&delegation.delegate_id.0)
        .bind(encode_timestamp(delegation.starts_at))
        .bind(encode_timestamp(delegation.ends_at))
        .bind(i64::from(delegation.active))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_delegations_for(
        &self,
        delegator_id: &UserId,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let query = format!(
            "SELECT {DELEGATION_COLUMNS} FROM delegation WHERE delegator_id = ? ORDER BY starts_at ASC"
        );
        let rows = sqlx::query(&query).bind(&delegator_id.0).fetch_all(&self.pool).await?;
        rows.iter().map(delegation_from_row).collect()
    }
}

#[async_trait]
impl ApproverDirectory for SqlDirectoryRepository {
    async fn users_with_designation(
        &self,
        designation: &Designation,
    ) -> Result<Vec<DirectoryUser>, LookupError> {
        self.users_by_designation_key(&designation.key()).await.map_err(unavailable)
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, LookupError> {
        self.user_by_id(user_id).await.map_err(unavailable)
    }

    async fn count_active_users(&self) -> Result<u64, LookupError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM directory_user WHERE active = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| unavailable(error.into()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl DelegationLookup for SqlDirectoryRepository {
    async fn substitute_for(
        &self,
        approver_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<UserId>, LookupError> {
        let delegations = self.covering_delegations(approver_id, at).await.map_err(unavailable)?;
        Ok(select_substitute(&delegations, approver_id, at))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use fundflow_core::approvals::{ApproverDirectory, DelegationLookup};
    use fundflow_core::domain::directory::{
        Delegation, DelegationId, DepartmentId, Designation, DirectoryUser, UserId,
    };

    use super::SqlDirectoryRepository;
    use crate::repositories::DirectoryRepository;
    use crate::{connect_with_settings, migrations};

    fn user(id: &str, designation: &str, active: bool) -> DirectoryUser {
        DirectoryUser {
            id: UserId(id.to_string()),
            display_name: id.to_uppercase(),
            designation: Designation(designation.to_string()),
            department_id: Some(DepartmentId("dept-1".to_string())),
            project_id: None,
            active,
        }
    }

    async fn repo() -> SqlDirectoryRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlDirectoryRepository::new(pool)
    }

    #[tokio::test]
    async fn designation_lookup_normalizes_case_and_whitespace() {
        let repo = repo().await;
        repo.save_user(user("u-1", "Finance Manager", true)).await.expect("save");
        repo.save_user(user("u-2", "finance manager ", false)).await.expect("save");
        repo.save_user(user("u-3", "director", true)).await.expect("save");

        let users = repo
            .users_with_designation(&Designation(" FINANCE MANAGER".to_string()))
            .await
            .expect("lookup");
        let ids: Vec<&str> = users.iter().map(|user| user.id.0.as_str()).collect();
        assert_eq!(ids, vec!["u-1", "u-2"]);

        assert_eq!(repo.count_active_users().await.expect("count"), 2);
        assert!(repo.find_user(&UserId("u-3".to_string())).await.expect("find").is_some());
        assert_eq!(repo.snapshot().await.expect("snapshot").count_active_users().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn substitute_is_the_most_recent_covering_delegation() {
        let repo = repo().await;
        let now = Utc::now();
        let delegation = |id: &str, delegate: &str, started: i64, ends: i64, active: bool| Delegation {
            id: DelegationId(id.to_string()),
            delegator_id: UserId("u-director".to_string()),
            delegate_id: UserId(delegate.to_string()),
            starts_at: now - Duration::hours(started),
            ends_at: now + Duration::hours(ends),
            active,
        };

        repo.save_delegation(delegation("DLG-1", "u-old", 72, 24, true)).await.expect("save");
        repo.save_delegation(delegation("DLG-2", "u-new", 1, 24, true)).await.expect("save");
        repo.save_delegation(delegation("DLG-3", "u-revoked", 0, 24, false)).await.expect("save");
        repo.save_delegation(delegation("DLG-4", "u-expired", 2, -1, true)).await.expect("save");

        let substitute = repo
            .substitute_for(&UserId("u-director".to_string()), now)
            .await
            .expect("lookup");
        assert_eq!(substitute, Some(UserId("u-new".to_string())));

        let none = repo.substitute_for(&UserId("u-mgr".to_string()), now).await.expect("lookup");
        assert!(none.is_none());
        assert_eq!(
            repo.list_delegations_for(&UserId("u-director".to_string())).await.expect("list").len(),
            4
        );
    }
}
