use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    RideRequest,
    RideUnavailable,
    OfferReceived,
    OfferAccepted,
    OfferRejected,
    OfferExpired,
    RideAccepted,
    DriverAssigned,
    DriverArrived,
    TripStarted,
    RideCompleted,
    RideCancelled,
    RideExpired,
}

impl NotificationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RideRequest => "ride_request",
            Self::RideUnavailable => "ride_unavailable",
            Self::OfferReceived => "offer_received",
            Self::OfferAccepted => "offer_accepted",
            Self::OfferRejected => "offer_rejected",
            Self::OfferExpired => "offer_expired",
            Self::RideAccepted => "ride_accepted",
            Self::DriverAssigned => "driver_assigned",
            Self::DriverArrived => "driver_arrived",
            Self::TripStarted => "trip_started",
            Self::RideCompleted => "ride_completed",
            Self::RideCancelled => "ride_cancelled",
            Self::RideExpired => "ride_expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub event: NotificationEvent,
    pub payload: Value,
}

impl Notification {
    pub fn new(user_id: Uuid, event: NotificationEvent, payload: Value) -> Self {
        Self {
            user_id,
            event,
            payload,
        }
    }
}

/// Best-effort delivery of ride events to riders and drivers.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        user_id: Uuid,
        event: NotificationEvent,
        payload: Value,
    ) -> Result<(), Error>;
}

/// Hands every notification to the notifier on its own task. Failures are
/// logged and never reach the caller.
pub fn dispatch(notifier: &Arc<dyn Notifier>, notifications: Vec<Notification>) {
    for notification in notifications {
        let notifier = notifier.clone();

        tokio::spawn(async move {
            let Notification {
                user_id,
                event,
                payload,
            } = notification;

            if let Err(err) = notifier.notify(user_id, event, payload).await {
                tracing::warn!(%user_id, event = event.name(), error = %err, "notification failed");
            }
        });
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        user_id: Uuid,
        event: NotificationEvent,
        payload: Value,
    ) -> Result<(), Error> {
        tracing::info!(%user_id, event = event.name(), %payload, "notification");

        Ok(())
    }
}

/// Posts each notification as JSON to a delivery service.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[tracing::instrument(skip(self, payload))]
    async fn notify(
        &self,
        user_id: Uuid,
        event: NotificationEvent,
        payload: Value,
    ) -> Result<(), Error> {
        let res = self
            .client
            .post(&self.url)
            .json(&Notification::new(user_id, event, payload))
            .send()
            .await?;

        let status_code = res.status().as_u16();

        if status_code >= 400 {
            return Err(Error::upstream(format!(
                "notification webhook responded with {}",
                status_code
            )));
        }

        Ok(())
    }
}

#[test]
fn notifications_serialize_with_snake_case_events() {
    use serde_json::json;

    let user_id = Uuid::nil();
    let notification = Notification::new(
        user_id,
        NotificationEvent::RideUnavailable,
        json!({ "ride_id": user_id }),
    );

    let value = serde_json::to_value(&notification).unwrap();
    assert_eq!(value["event"], "ride_unavailable");
    assert_eq!(value["payload"]["ride_id"], json!(user_id));
}
