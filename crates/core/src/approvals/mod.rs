pub mod delegation;
pub mod fanout;
pub mod machine;
pub mod resolver;
pub mod trail;

pub use delegation::{DelegationLookup, InMemoryDelegations};
pub use fanout::FinalReceiverFanout;
pub use machine::{
    ApprovalClosure, ApprovalStateMachine, RequestWrite, TransitionError, TransitionKind,
    TransitionPlan,
};
pub use resolver::{
    ApproverDirectory, ApproverResolver, InMemoryDirectory, ResolutionContext, ResolutionError,
    ResolutionPolicy, StepTarget,
};
pub use trail::{build_trail, ApprovalTrail, TrailReceiver, TrailStep, TrailStepStatus};
