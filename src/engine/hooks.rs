use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::entities::{Ride, RideHistoryEntry, RideStatus};
use crate::error::Error;
use crate::notifier::{dispatch, Notification, NotificationEvent, Notifier};

/// A transition that has been persisted.
#[derive(Clone, Debug)]
pub struct TransitionEvent {
    /// The ride as committed by the operation that made the transition.
    pub ride: Ride,
    pub entry: RideHistoryEntry,
}

impl TransitionEvent {
    pub fn status(&self) -> RideStatus {
        self.entry.new_status
    }
}

/// Side effect run after a transition commits and the ride lock is released.
///
/// Hooks run in registration order, once per history entry. An error is
/// logged by the engine and never undoes the transition.
#[async_trait]
pub trait TransitionHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_transition(&self, event: &TransitionEvent) -> Result<(), Error>;
}

/// Tells the rider and driver about lifecycle changes.
pub struct NotificationHook {
    notifier: Arc<dyn Notifier>,
}

impl NotificationHook {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    fn notifications(event: &TransitionEvent) -> Vec<Notification> {
        let ride = &event.ride;
        let entry = &event.entry;
        let rider = Some(ride.rider_id);
        let driver = entry.driver_id;

        let (kind, recipients) = match entry.new_status {
            RideStatus::Requested | RideStatus::Searching | RideStatus::Bargaining => {
                return vec![]
            }
            RideStatus::Accepted => (NotificationEvent::RideAccepted, vec![rider]),
            RideStatus::DriverAssigned => (NotificationEvent::DriverAssigned, vec![rider, driver]),
            RideStatus::DriverArrived => (NotificationEvent::DriverArrived, vec![rider]),
            RideStatus::InProgress => (NotificationEvent::TripStarted, vec![rider]),
            RideStatus::Completed => (NotificationEvent::RideCompleted, vec![rider, driver]),
            RideStatus::Cancelled => (NotificationEvent::RideCancelled, vec![rider, driver]),
            RideStatus::Expired => (NotificationEvent::RideExpired, vec![rider]),
        };

        let payload = json!({
            "ride_id": ride.id,
            "status": entry.new_status,
            "previous_status": entry.previous_status,
            "driver_id": driver,
            "final_fare": ride.final_fare,
            "details": entry.payload,
        });

        // whoever cancelled already knows
        let skip = match entry.new_status {
            RideStatus::Cancelled => entry.actor_id,
            _ => None,
        };

        recipients
            .into_iter()
            .flatten()
            .filter(|user_id| Some(*user_id) != skip)
            .map(|user_id| Notification::new(user_id, kind, payload.clone()))
            .collect()
    }
}

#[async_trait]
impl TransitionHook for NotificationHook {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn on_transition(&self, event: &TransitionEvent) -> Result<(), Error> {
        dispatch(&self.notifier, Self::notifications(event));

        Ok(())
    }
}

#[test]
fn cancellation_is_not_echoed_to_the_canceller() {
    use crate::entities::{Coordinates, HistoryEventType, RideRequest};
    use chrono::Utc;
    use uuid::Uuid;

    let rider_id = Uuid::new_v4();
    let driver_id = Uuid::new_v4();
    let request = RideRequest {
        rider_id,
        pickup: Coordinates::new(6.5, 3.4),
        dropoff: Coordinates::new(6.6, 3.5),
        estimated_fare: 1500.0,
        vehicle_type: None,
        schedule_time: None,
        notes: None,
    };
    let mut ride = Ride::new(request, 15.6, Utc::now());
    ride.status = RideStatus::Cancelled;

    let event = TransitionEvent {
        entry: RideHistoryEntry {
            ride_id: ride.id,
            seq: 3,
            event_type: HistoryEventType::Cancellation,
            previous_status: Some(RideStatus::DriverAssigned),
            new_status: RideStatus::Cancelled,
            actor_id: Some(rider_id),
            driver_id: Some(driver_id),
            payload: None,
            timestamp: Utc::now(),
        },
        ride,
    };

    let notifications = NotificationHook::notifications(&event);
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].user_id, driver_id);
    assert_eq!(notifications[0].event, NotificationEvent::RideCancelled);
}
