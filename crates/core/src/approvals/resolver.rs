use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::directory::{DepartmentId, Designation, DirectoryUser, ProjectId, UserId};
use crate::domain::fund_request::FundRequest;
use crate::domain::workflow::WorkflowStep;
use crate::lookup::LookupError;

#[async_trait]
pub trait ApproverDirectory: Send + Sync {
    async fn users_with_designation(
        &self,
        designation: &Designation,
    ) -> Result<Vec<DirectoryUser>, LookupError>;

    async fn find_user(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, LookupError>;

    async fn count_active_users(&self) -> Result<u64, LookupError>;
}

#[async_trait]
impl<T> ApproverDirectory for Arc<T>
where
    T: ApproverDirectory + ?Sized,
{
    async fn users_with_designation(
        &self,
        designation: &Designation,
    ) -> Result<Vec<DirectoryUser>, LookupError> {
        (**self).users_with_designation(designation).await
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, LookupError> {
        (**self).find_user(user_id).await
    }

    async fn count_active_users(&self) -> Result<u64, LookupError> {
        (**self).count_active_users().await
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    users: Vec<DirectoryUser>,
    failure: Option<String>,
}

impl InMemoryDirectory {
    pub fn with_users(users: Vec<DirectoryUser>) -> Self {
        Self { users, failure: None }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self { users: Vec::new(), failure: Some(reason.into()) }
    }

    fn check_available(&self) -> Result<(), LookupError> {
        match &self.failure {
            Some(reason) => Err(LookupError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ApproverDirectory for InMemoryDirectory {
    async fn users_with_designation(
        &self,
        designation: &Designation,
    ) -> Result<Vec<DirectoryUser>, LookupError> {
        self.check_available()?;
        let key = designation.key();
        Ok(self.users.iter().filter(|user| user.designation.key() == key).cloned().collect())
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, LookupError> {
        self.check_available()?;
        Ok(self.users.iter().find(|user| &user.id == user_id).cloned())
    }

    async fn count_active_users(&self) -> Result<u64, LookupError> {
        self.check_available()?;
        Ok(self.users.iter().filter(|user| user.active).count() as u64)
    }
}

/// How to pick among several users that hold the same designation at the same scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// More than one candidate is a resolution failure.
    Strict,
    /// Deterministically pick the lowest user id.
    LowestUserId,
    /// Rotate through candidates, one cursor per designation and scope.
    RoundRobin,
}

impl ResolutionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::LowestUserId => "lowest_user_id",
            Self::RoundRobin => "round_robin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "lowest_user_id" => Some(Self::LowestUserId),
            "round_robin" => Some(Self::RoundRobin),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("no active user holds designation `{designation}` for this request")]
    NoQualifyingUser { designation: String },
    #[error("designation `{designation}` is ambiguous: {candidates:?}")]
    Ambiguous { designation: String, candidates: Vec<String> },
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolutionContext {
    pub initiator_id: UserId,
    pub department_id: DepartmentId,
    pub project_id: Option<ProjectId>,
}

impl ResolutionContext {
    pub fn for_request(request: &FundRequest) -> Self {
        Self {
            initiator_id: request.initiator_id.clone(),
            department_id: request.department_id.clone(),
            project_id: request.project_id.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum StepTarget<'a> {
    Initiator,
    Step(&'a WorkflowStep),
}

#[derive(Clone, Debug, Default)]
pub struct RoundRobinCursor {
    positions: Arc<Mutex<HashMap<String, usize>>>,
}

impl RoundRobinCursor {
    fn next(&self, key: &str, len: usize) -> usize {
        let mut positions = match self.positions.lock() {
            Ok(positions) => positions,
            Err(poisoned) => poisoned.into_inner(),
        };
        let position = positions.entry(key.to_string()).or_insert(0);
        let selected = *position % len;
        *position = (selected + 1) % len;
        selected
    }
}

#[derive(Clone, Debug)]
pub struct ApproverResolver<D> {
    directory: D,
    policy: ResolutionPolicy,
    cursor: RoundRobinCursor,
}

impl<D> ApproverResolver<D>
where
    D: ApproverDirectory,
{
    pub fn new(directory: D, policy: ResolutionPolicy) -> Self {
        Self { directory, policy, cursor: RoundRobinCursor::default() }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    pub fn policy(&self) -> ResolutionPolicy {
        self.policy
    }

    pub async fn resolve(
        &self,
        target: StepTarget<'_>,
        context: &ResolutionContext,
    ) -> Result<UserId, ResolutionError> {
        match target {
            StepTarget::Initiator => Ok(context.initiator_id.clone()),
            StepTarget::Step(step) if step.is_initiator() => Ok(context.initiator_id.clone()),
            StepTarget::Step(step) => self.resolve_designation(&step.designation, context).await,
        }
    }

    /// Picks a user holding `designation`, preferring project scope, then department scope,
    /// then users without any scope. Users scoped elsewhere never qualify.
    pub async fn resolve_designation(
        &self,
        designation: &Designation,
        context: &ResolutionContext,
    ) -> Result<UserId, ResolutionError> {
        let key = designation.key();
        let users = self.directory.users_with_designation(designation).await?;

        let ranked: Vec<(ScopeRank, &DirectoryUser)> = users
            .iter()
            .filter(|user| user.active && user.designation.key() == key)
            .filter_map(|user| scope_rank(user, context).map(|rank| (rank, user)))
            .collect();

        let Some(best) = ranked.iter().map(|(rank, _)| *rank).min() else {
            return Err(ResolutionError::NoQualifyingUser { designation: designation.0.clone() });
        };

        let mut candidates: Vec<&DirectoryUser> =
            ranked.into_iter().filter(|(rank, _)| *rank == best).map(|(_, user)| user).collect();
        candidates.sort_by(|left, right| left.id.cmp(&right.id));
        candidates.dedup_by(|left, right| left.id == right.id);

        let selected = match self.policy {
            ResolutionPolicy::Strict if candidates.len() > 1 => {
                return Err(ResolutionError::Ambiguous {
                    designation: designation.0.clone(),
                    candidates: candidates.iter().map(|user| user.id.0.clone()).collect(),
                });
            }
            ResolutionPolicy::Strict | ResolutionPolicy::LowestUserId => candidates.first(),
            ResolutionPolicy::RoundRobin => {
                let cursor_key = format!("{key}|{}", best.scope_key(context));
                candidates.get(self.cursor.next(&cursor_key, candidates.len()))
            }
        };

        selected
            .map(|user| user.id.clone())
            .ok_or(ResolutionError::NoQualifyingUser { designation: designation.0.clone() })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ScopeRank {
    Project,
    Department,
    Unscoped,
}

impl ScopeRank {
    fn scope_key(&self, context: &ResolutionContext) -> String {
        match self {
            Self::Project => format!(
                "project:{}",
                context.project_id.as_ref().map(|id| id.0.as_str()).unwrap_or_default()
            ),
            Self::Department => format!("department:{}", context.department_id.0),
            Self::Unscoped => "global".to_string(),
        }
    }
}

fn scope_rank(user: &DirectoryUser, context: &ResolutionContext) -> Option<ScopeRank> {
    if user.project_id.is_some() && user.project_id == context.project_id {
        return Some(ScopeRank::Project);
    }

    if user.department_id.as_ref() == Some(&context.department_id) {
        return Some(ScopeRank::Department);
    }

    if user.project_id.is_none() && user.department_id.is_none() {
        return Some(ScopeRank::Unscoped);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::{
        ApproverResolver, InMemoryDirectory, ResolutionContext, ResolutionError, ResolutionPolicy,
        StepTarget,
    };
    use crate::domain::directory::{DepartmentId, Designation, DirectoryUser, ProjectId, UserId};
    use crate::domain::workflow::WorkflowStep;
    use crate::lookup::LookupError;

    fn user(id: &str, designation: &str, department: Option<&str>, project: Option<&str>) -> DirectoryUser {
        DirectoryUser {
            id: UserId(id.to_string()),
            display_name: id.to_uppercase(),
            designation: Designation(designation.to_string()),
            department_id: department.map(|d| DepartmentId(d.to_string())),
            project_id: project.map(|p| ProjectId(p.to_string())),
            active: true,
        }
    }

    fn context(project: Option<&str>) -> ResolutionContext {
        ResolutionContext {
            initiator_id: UserId("u-init".to_string()),
            department_id: DepartmentId("dept-ops".to_string()),
            project_id: project.map(|p| ProjectId(p.to_string())),
        }
    }

    fn step(sequence: u32, designation: &str) -> WorkflowStep {
        WorkflowStep {
            sequence,
            designation: Designation(designation.to_string()),
            sla_hours: 24,
            auto_approve: false,
        }
    }

    #[tokio::test]
    async fn initiator_target_skips_directory() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::unavailable("should not be called"),
            ResolutionPolicy::Strict,
        );

        let resolved = resolver
            .resolve(StepTarget::Initiator, &context(None))
            .await
            .expect("initiator resolves directly");
        assert_eq!(resolved, UserId("u-init".to_string()));

        let resolved = resolver
            .resolve(StepTarget::Step(&step(1, "initiator")), &context(None))
            .await
            .expect("initiator step resolves directly");
        assert_eq!(resolved, UserId("u-init".to_string()));
    }

    #[tokio::test]
    async fn project_scope_beats_department_and_unscoped() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::with_users(vec![
                user("u-global", "manager", None, None),
                user("u-dept", "manager", Some("dept-ops"), None),
                user("u-proj", "manager", Some("dept-ops"), Some("proj-apollo")),
            ]),
            ResolutionPolicy::Strict,
        );

        let with_project = resolver
            .resolve(StepTarget::Step(&step(2, "manager")), &context(Some("proj-apollo")))
            .await
            .expect("project-scoped manager");
        assert_eq!(with_project.0, "u-proj");

        let without_project = resolver
            .resolve(StepTarget::Step(&step(2, "manager")), &context(None))
            .await
            .expect("department-scoped manager");
        assert_eq!(without_project.0, "u-dept");
    }

    #[tokio::test]
    async fn users_scoped_to_other_departments_do_not_qualify() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::with_users(vec![user("u-other", "manager", Some("dept-hr"), None)]),
            ResolutionPolicy::Strict,
        );

        let error = resolver
            .resolve(StepTarget::Step(&step(2, "manager")), &context(None))
            .await
            .expect_err("no qualifying user");
        assert_eq!(error, ResolutionError::NoQualifyingUser { designation: "manager".to_string() });
    }

    #[tokio::test]
    async fn inactive_users_are_ignored() {
        let mut inactive = user("u-gone", "director", None, None);
        inactive.active = false;
        let resolver = ApproverResolver::new(
            InMemoryDirectory::with_users(vec![inactive]),
            ResolutionPolicy::LowestUserId,
        );

        let error = resolver
            .resolve_designation(&Designation("director".to_string()), &context(None))
            .await
            .expect_err("inactive user cannot act");
        assert!(matches!(error, ResolutionError::NoQualifyingUser { .. }));
    }

    #[tokio::test]
    async fn strict_policy_rejects_ambiguous_designation() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::with_users(vec![
                user("u-b", "director", None, None),
                user("u-a", "director", None, None),
            ]),
            ResolutionPolicy::Strict,
        );

        let error = resolver
            .resolve_designation(&Designation("director".to_string()), &context(None))
            .await
            .expect_err("ambiguous");
        assert_eq!(
            error,
            ResolutionError::Ambiguous {
                designation: "director".to_string(),
                candidates: vec!["u-a".to_string(), "u-b".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn lowest_user_id_policy_is_deterministic() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::with_users(vec![
                user("u-b", "director", None, None),
                user("u-a", "director", None, None),
            ]),
            ResolutionPolicy::LowestUserId,
        );

        for _ in 0..3 {
            let resolved = resolver
                .resolve_designation(&Designation("director".to_string()), &context(None))
                .await
                .expect("resolves");
            assert_eq!(resolved.0, "u-a");
        }
    }

    #[tokio::test]
    async fn round_robin_policy_rotates_candidates() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::with_users(vec![
                user("u-b", "director", None, None),
                user("u-a", "director", None, None),
            ]),
            ResolutionPolicy::RoundRobin,
        );
        let designation = Designation("director".to_string());

        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(resolver.resolve_designation(&designation, &context(None)).await.expect("rr").0);
        }
        assert_eq!(picks, vec!["u-a", "u-b", "u-a", "u-b"]);
    }

    #[tokio::test]
    async fn lookup_failure_surfaces_as_lookup_error() {
        let resolver = ApproverResolver::new(
            InMemoryDirectory::unavailable("directory offline"),
            ResolutionPolicy::Strict,
        );

        let error = resolver
            .resolve_designation(&Designation("director".to_string()), &context(None))
            .await
            .expect_err("lookup failure");
        assert_eq!(
            error,
            ResolutionError::Lookup(LookupError::Unavailable("directory offline".to_string()))
        );
    }

    #[test]
    fn policy_parses_config_values() {
        assert_eq!(ResolutionPolicy::parse("Round_Robin"), Some(ResolutionPolicy::RoundRobin));
        assert_eq!(ResolutionPolicy::parse("strict"), Some(ResolutionPolicy::Strict));
        assert_eq!(ResolutionPolicy::parse("first"), None);
    }
}
