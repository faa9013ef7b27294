pub mod approval;
pub mod directory;
pub mod fund_request;
pub mod workflow;
