pub mod approvals;
pub mod audit;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod lookup;
pub mod notify;

pub use approvals::{
    build_trail, ApprovalStateMachine, ApprovalTrail, ApproverDirectory, ApproverResolver,
    DelegationLookup, ResolutionPolicy, TransitionError, TransitionPlan,
};
pub use audit::{AuditSink, RingBufferAuditSink};
pub use domain::approval::{Approval, ApprovalAction, ApprovalId, ApprovalStatus, ListFilter};
pub use domain::fund_request::{FundRequest, FundRequestId, NewFundRequest, RequestStatus};
pub use domain::workflow::{Workflow, WorkflowId, WorkflowStep};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use notify::{Notification, NotificationDispatcher};
