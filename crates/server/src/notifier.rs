use async_trait::async_trait;
use fundflow_core::notify::{Notification, NotificationDispatcher, NotificationError};
use tracing::info;

/// Delivers notifications into the structured log stream. Mail and chat transports live outside
/// this service and tail `notification.delivered` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn dispatch(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            event_name = "notification.delivered",
            kind = notification.kind.as_str(),
            request_id = %notification.request_id.0,
            from_user_id = %notification.from_user_id.0,
            to_user_id = %notification.to_user_id.0,
            "notification delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use fundflow_core::domain::directory::UserId;
    use fundflow_core::domain::fund_request::FundRequestId;
    use fundflow_core::notify::{Notification, NotificationDispatcher, NotificationKind};

    use super::TracingDispatcher;

    #[tokio::test]
    async fn tracing_dispatcher_always_succeeds() {
        let notification = Notification {
            kind: NotificationKind::Advanced,
            request_id: FundRequestId("FR-1".to_string()),
            from_user_id: UserId("u-mgr".to_string()),
            to_user_id: UserId("u-director".to_string()),
        };

        assert!(TracingDispatcher.dispatch(&notification).await.is_ok());
    }
}
