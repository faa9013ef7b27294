use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::approvals::resolver::{ApproverDirectory, ApproverResolver, ResolutionContext, ResolutionError};
use crate::domain::approval::Approval;
use crate::domain::directory::UserId;
use crate::domain::fund_request::FundRequestId;
use crate::domain::workflow::{FinalReceiver, Workflow};

/// Produces the terminal `FinalReceiver` rows once the last real step is approved.
pub struct FinalReceiverFanout<'a, D> {
    resolver: &'a ApproverResolver<D>,
}

impl<'a, D> FinalReceiverFanout<'a, D>
where
    D: ApproverDirectory,
{
    pub fn new(resolver: &'a ApproverResolver<D>) -> Self {
        Self { resolver }
    }

    /// Distinct receivers in configuration order.
    pub async fn receivers(
        &self,
        workflow: &Workflow,
        context: &ResolutionContext,
    ) -> Result<Vec<UserId>, ResolutionError> {
        let mut seen = HashSet::new();
        let mut receivers = Vec::with_capacity(workflow.final_receivers.len());

        for receiver in &workflow.final_receivers {
            let user_id = match receiver {
                FinalReceiver::User(user_id) => user_id.clone(),
                FinalReceiver::Designation(designation) => {
                    self.resolver.resolve_designation(designation, context).await?
                }
            };
            if seen.insert(user_id.clone()) {
                receivers.push(user_id);
            }
        }

        Ok(receivers)
    }

    pub async fn plan(
        &self,
        request_id: &FundRequestId,
        workflow: &Workflow,
        context: &ResolutionContext,
        last_approved_level: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Approval>, ResolutionError> {
        let level = last_approved_level + 1;
        Ok(self
            .receivers(workflow, context)
            .await?
            .into_iter()
            .map(|receiver| Approval::final_receiver(request_id.clone(), level, receiver, now))
            .collect())
    }
}
