use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::directory::{Delegation, UserId};
use crate::lookup::LookupError;

#[async_trait]
pub trait DelegationLookup: Send + Sync {
    /// The user currently allowed to act in place of `approver_id`, if any.
    async fn substitute_for(
        &self,
        approver_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<UserId>, LookupError>;
}

#[async_trait]
impl<T> DelegationLookup for Arc<T>
where
    T: DelegationLookup + ?Sized,
{
    async fn substitute_for(
        &self,
        approver_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<UserId>, LookupError> {
        (**self).substitute_for(approver_id, at).await
    }
}

/// Picks the covering delegation that started most recently.
pub fn select_substitute<'a, I>(delegations: I, approver_id: &UserId, at: DateTime<Utc>) -> Option<UserId>
where
    I: IntoIterator<Item = &'a Delegation>,
{
    delegations
        .into_iter()
        .filter(|delegation| &delegation.delegator_id == approver_id && delegation.covers(at))
        .max_by_key(|delegation| delegation.starts_at)
        .map(|delegation| delegation.delegate_id.clone())
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDelegations {
    delegations: Vec<Delegation>,
}

impl InMemoryDelegations {
    pub fn new(delegations: Vec<Delegation>) -> Self {
        Self { delegations }
    }
}

#[async_trait]
impl DelegationLookup for InMemoryDelegations {
    async fn substitute_for(
        &self,
        approver_id: &UserId,
        at: DateTime<Utc>,
    ) -> Result<Option<UserId>, LookupError> {
        Ok(select_substitute(&self.delegations, approver_id, at))
    }
}
