use thiserror::Error;

use crate::approvals::machine::TransitionError;
use crate::approvals::resolver::ResolutionError;
use crate::lookup::LookupError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid workflow `{workflow_id}`: {reason}")]
    InvalidWorkflow { workflow_id: String, reason: String },
    #[error("invalid fund request: {0}")]
    InvalidFundRequest(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("already processed: {0}")]
    AlreadyProcessed(String),
    #[error("unprocessable: {0}")]
    Unprocessable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    /// Whether the caller may safely repeat the identical action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Unavailable(_) | Self::Cancelled)
    }
}

impl From<LookupError> for ApplicationError {
    fn from(value: LookupError) -> Self {
        Self::Unavailable(value.to_string())
    }
}

impl From<ResolutionError> for ApplicationError {
    fn from(value: ResolutionError) -> Self {
        match value {
            ResolutionError::Lookup(error) => Self::from(error),
            other => Self::Unprocessable(other.to_string()),
        }
    }
}

impl From<TransitionError> for ApplicationError {
    fn from(value: TransitionError) -> Self {
        match value {
            TransitionError::Validation(error) => Self::Domain(error),
            TransitionError::Configuration(message) => Self::Configuration(message),
            TransitionError::Resolution(error) => Self::from(error),
            error @ TransitionError::AlreadyProcessed { .. } => {
                Self::AlreadyProcessed(error.to_string())
            }
            error @ (TransitionError::NotAuthorized { .. }
            | TransitionError::NotInitiator { .. }) => Self::NotAuthorized(error.to_string()),
            error @ TransitionError::NotResubmittable { .. } => {
                Self::AlreadyProcessed(error.to_string())
            }
            error @ TransitionError::StaleApproval { .. } => Self::Conflict(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, retryable: bool, correlation_id: String },
    #[error("unprocessable: {message}")]
    Unprocessable { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The requested record does not exist.",
            Self::Forbidden { .. } => "You are not allowed to act on this record.",
            Self::Conflict { retryable: true, .. } => {
                "Another action on this request was in progress. Please retry."
            }
            Self::Conflict { retryable: false, .. } => "This item has already been processed.",
            Self::Unprocessable { .. } => {
                "No approver could be determined for the next step. Contact an administrator."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::Unprocessable { .. } => 422,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::NotFound { message, .. }
            | Self::Forbidden { message, .. }
            | Self::Conflict { message, .. }
            | Self::Unprocessable { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::Unprocessable { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::Unprocessable { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Domain(error) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            ApplicationError::NotFound(message) => Self::NotFound { message, correlation_id },
            ApplicationError::NotAuthorized(message) => Self::Forbidden { message, correlation_id },
            ApplicationError::AlreadyProcessed(message) => {
                Self::Conflict { message, retryable: false, correlation_id }
            }
            ApplicationError::Conflict(message) => {
                Self::Conflict { message, retryable: true, correlation_id }
            }
            ApplicationError::Unprocessable(message) => {
                Self::Unprocessable { message, correlation_id }
            }
            ApplicationError::Unavailable(message) | ApplicationError::Persistence(message) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Cancelled => Self::ServiceUnavailable {
                message: "operation cancelled before commit".to_owned(),
                correlation_id,
            },
            ApplicationError::Configuration(message) => Self::Internal { message, correlation_id },
        }
    }
}
