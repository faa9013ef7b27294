pub mod connection;
pub mod fixtures;
pub mod guard;
pub mod migrations;
pub mod repositories;
pub mod service;

pub use connection::{connect, connect_from_config, connect_with_settings, probe, DbPool, ProbeError};
pub use fixtures::{DemoDataset, SeedResult, VerificationResult};
pub use guard::{ConcurrencyGuard, GuardError, RetryPolicy};
pub use service::{ActionCommand, ApprovalService, AttachmentGate, ServiceParts, TransitionOutcome};
