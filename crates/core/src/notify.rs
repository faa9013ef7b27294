use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::directory::UserId;
use crate::domain::fund_request::FundRequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Submitted,
    Resubmitted,
    Advanced,
    SentBack,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Resubmitted => "resubmitted",
            Self::Advanced => "advanced",
            Self::SentBack => "sent_back",
        }
    }
}

/// Tells `to_user_id` that a request now waits on them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub request_id: FundRequestId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

/// Delivery happens after commit. Failures are reported to the caller for logging only.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError>;
}

#[async_trait]
impl<T> NotificationDispatcher for Arc<T>
where
    T: NotificationDispatcher + ?Sized,
{
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
        (**self).dispatch(notification).await
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<Notification>>>,
    failure: Option<String>,
}

impl RecordingDispatcher {
    pub fn failing(reason: impl Into<String>) -> Self {
        Self { sent: Arc::default(), failure: Some(reason.into()) }
    }

    pub fn sent(&self) -> Vec<Notification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
        if let Some(reason) = &self.failure {
            return Err(NotificationError(reason.clone()));
        }

        match self.sent.lock() {
            Ok(mut sent) => sent.push(notification.clone()),
            Err(poisoned) => poisoned.into_inner().push(notification.clone()),
        }
        Ok(())
    }
}
