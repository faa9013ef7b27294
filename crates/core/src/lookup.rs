//! Primary/fallback execution for directory lookups.
//!
//! Each lookup is attempted on the primary path under a short timeout. A timeout or an error
//! moves on to the fallback path under its own timeout. When both fail the caller receives
//! [`LookupError::Degraded`] instead of waiting indefinitely.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::approvals::resolver::ApproverDirectory;
use crate::domain::directory::{Designation, DirectoryUser, UserId};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
    #[error("service temporarily degraded (primary: {primary}; fallback: {fallback})")]
    Degraded { primary: String, fallback: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupTimeouts {
    pub primary: Duration,
    pub fallback: Duration,
}

impl Default for LookupTimeouts {
    fn default() -> Self {
        Self { primary: Duration::from_millis(750), fallback: Duration::from_millis(2_000) }
    }
}

pub async fn with_fallback<T, P, F>(
    timeouts: LookupTimeouts,
    primary: P,
    fallback: F,
) -> Result<T, LookupError>
where
    P: Future<Output = Result<T, LookupError>>,
    F: Future<Output = Result<T, LookupError>>,
{
    let primary_failure = match tokio::time::timeout(timeouts.primary, primary).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(error)) => error.to_string(),
        Err(_) => format!("timed out after {}ms", timeouts.primary.as_millis()),
    };

    match tokio::time::timeout(timeouts.fallback, fallback).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => {
            Err(LookupError::Degraded { primary: primary_failure, fallback: error.to_string() })
        }
        Err(_) => Err(LookupError::Degraded {
            primary: primary_failure,
            fallback: format!("timed out after {}ms", timeouts.fallback.as_millis()),
        }),
    }
}

/// Directory that answers from `primary` and falls back to `fallback` on timeout or error.
#[derive(Clone, Debug)]
pub struct FallbackDirectory<P, S> {
    primary: P,
    fallback: S,
    timeouts: LookupTimeouts,
}

impl<P, S> FallbackDirectory<P, S> {
    pub fn new(primary: P, fallback: S, timeouts: LookupTimeouts) -> Self {
        Self { primary, fallback, timeouts }
    }
}

#[async_trait]
impl<P, S> ApproverDirectory for FallbackDirectory<P, S>
where
    P: ApproverDirectory,
    S: ApproverDirectory,
{
    async fn users_with_designation(
        &self,
        designation: &Designation,
    ) -> Result<Vec<DirectoryUser>, LookupError> {
        with_fallback(
            self.timeouts,
            self.primary.users_with_designation(designation),
            self.fallback.users_with_designation(designation),
        )
        .await
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<DirectoryUser>, LookupError> {
        with_fallback(
            self.timeouts,
            self.primary.find_user(user_id),
            self.fallback.find_user(user_id),
        )
        .await
    }

    async fn count_active_users(&self) -> Result<u64, LookupError> {
        with_fallback(
            self.timeouts,
            self.primary.count_active_users(),
            self.fallback.count_active_users(),
        )
        .await
    }
}
