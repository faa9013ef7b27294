use serde::{Deserialize, Serialize};

use crate::domain::directory::{DepartmentId, Designation, UserId};
use crate::errors::DomainError;

/// Sequence of the reserved initiator pseudo-step. No approval row is ever created for it.
pub const INITIATOR_SEQUENCE: u32 = 1;

/// Level a request returns to when it is sent back past the first real step.
pub const RETURNED_TO_INITIATOR_LEVEL: u32 = 0;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub sequence: u32,
    pub designation: Designation,
    pub sla_hours: u32,
    pub auto_approve: bool,
}

impl WorkflowStep {
    pub fn is_initiator(&self) -> bool {
        self.sequence == INITIATOR_SEQUENCE
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FinalReceiver {
    Designation(Designation),
    User(UserId),
}

impl FinalReceiver {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Designation(_) => "designation",
            Self::User(_) => "user",
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            Self::Designation(designation) => &designation.0,
            Self::User(user_id) => &user_id.0,
        }
    }

    pub fn parse(kind: &str, reference: impl Into<String>) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "designation" => Some(Self::Designation(Designation(reference.into()))),
            "user" => Some(Self::User(UserId(reference.into()))),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub department_id: Option<DepartmentId>,
    pub active: bool,
    pub steps: Vec<WorkflowStep>,
    pub final_receivers: Vec<FinalReceiver>,
}

impl Workflow {
    /// Checks that steps form a contiguous chain `1..=n` starting at the initiator step and that
    /// at least one real approver step follows it. The active flag is not part of the shape.
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut sequences: Vec<u32> = self.steps.iter().map(|step| step.sequence).collect();
        sequences.sort_unstable();

        if sequences.first() != Some(&INITIATOR_SEQUENCE) {
            return Err(self.invalid("first step must be the initiator step (sequence 1)"));
        }

        for (index, sequence) in sequences.iter().enumerate() {
            let expected = INITIATOR_SEQUENCE + index as u32;
            if *sequence != expected {
                return Err(self.invalid(&format!(
                    "step sequences must be contiguous; expected {expected}, found {sequence}"
                )));
            }
        }

        if self.real_steps().next().is_none() {
            return Err(self.invalid("workflow has no approver steps"));
        }

        Ok(())
    }

    /// Only active workflows take new requests; requests already in the chain keep moving.
    pub fn ensure_accepts_submissions(&self) -> Result<(), DomainError> {
        if !self.active {
            return Err(self.invalid("workflow is inactive and accepts no new requests"));
        }
        self.validate()
    }

    /// Approver steps in ascending sequence order, excluding the initiator pseudo-step.
    pub fn real_steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> =
            self.steps.iter().filter(|step| !step.is_initiator()).collect();
        steps.sort_by_key(|step| step.sequence);
        steps.into_iter()
    }

    pub fn first_real_step(&self) -> Option<&WorkflowStep> {
        self.real_steps().next()
    }

    pub fn last_real_step(&self) -> Option<&WorkflowStep> {
        self.real_steps().last()
    }

    pub fn step_at(&self, sequence: u32) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.sequence == sequence)
    }

    /// Lowest real step whose sequence is strictly greater than `level`.
    pub fn next_step_after(&self, level: u32) -> Option<&WorkflowStep> {
        self.real_steps().find(|step| step.sequence > level)
    }

    fn invalid(&self, reason: &str) -> DomainError {
        DomainError::InvalidWorkflow { workflow_id: self.id.0.clone(), reason: reason.to_string() }
    }
}
