use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepartmentId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub String);

/// Role or title that occupies a workflow step, e.g. `finance_manager`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Designation(pub String);

impl Designation {
    pub fn key(&self) -> String {
        self.0.trim().to_ascii_lowercase()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub display_name: String,
    pub designation: Designation,
    pub department_id: Option<DepartmentId>,
    pub project_id: Option<ProjectId>,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub String);

/// A time-boxed hand-over of approval authority from `delegator_id` to `delegate_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub delegator_id: UserId,
    pub delegate_id: UserId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub active: bool,
}

impl Delegation {
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.active && self.starts_at <= at && at < self.ends_at
    }
}
