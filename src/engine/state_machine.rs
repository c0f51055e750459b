use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::Engine;
use crate::entities::{
    HistoryEventType, OfferStatus, Ride, RideHistoryEntry, RideRecord, RideStatus,
};
use crate::error::Error;

/// What caused a transition. Each trigger has exactly one target status.
#[derive(Clone, Debug, PartialEq)]
pub enum Trigger {
    BeginSearch { deadline: DateTime<Utc> },
    StartBargaining,
    Accept { driver_id: Uuid, agreed_fare: Option<f64> },
    ConfirmAssignment,
    DriverArrived,
    StartTrip,
    CompleteTrip,
    Cancel { reason: Option<String> },
    Expire { reason: String },
}

impl Trigger {
    pub fn target(&self) -> RideStatus {
        match self {
            Self::BeginSearch { .. } => RideStatus::Searching,
            Self::StartBargaining => RideStatus::Bargaining,
            Self::Accept { .. } => RideStatus::Accepted,
            Self::ConfirmAssignment => RideStatus::DriverAssigned,
            Self::DriverArrived => RideStatus::DriverArrived,
            Self::StartTrip => RideStatus::InProgress,
            Self::CompleteTrip => RideStatus::Completed,
            Self::Cancel { .. } => RideStatus::Cancelled,
            Self::Expire { .. } => RideStatus::Expired,
        }
    }

    fn event_type(&self) -> HistoryEventType {
        match self {
            Self::BeginSearch { .. } | Self::DriverArrived | Self::StartTrip => {
                HistoryEventType::StatusChange
            }
            Self::StartBargaining => HistoryEventType::Bargain,
            Self::Accept { .. } | Self::ConfirmAssignment => HistoryEventType::Assignment,
            Self::CompleteTrip => HistoryEventType::Completion,
            Self::Cancel { .. } => HistoryEventType::Cancellation,
            Self::Expire { .. } => HistoryEventType::Expiry,
        }
    }
}

fn merge(payload: Option<Value>, details: Option<Value>) -> Option<Value> {
    match (payload, details) {
        (Some(Value::Object(mut base)), Some(Value::Object(extra))) => {
            base.extend(extra);
            Some(Value::Object(base))
        }
        (payload, details) => payload.or(details),
    }
}

impl RideRecord {
    /// Moves the ride along one edge of the lifecycle graph and appends the
    /// matching history entry. Leaves the record untouched on error.
    pub fn apply(
        &mut self,
        trigger: Trigger,
        actor_id: Option<Uuid>,
        payload: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<&RideHistoryEntry, Error> {
        let from = self.ride.status;
        let to = trigger.target();

        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        let event_type = trigger.event_type();
        let ride = &mut self.ride;

        let details = match trigger {
            Trigger::BeginSearch { deadline } => {
                ride.search_deadline = Some(deadline);
                Some(json!({ "search_deadline": deadline }))
            }
            Trigger::Accept {
                driver_id,
                agreed_fare,
            } => {
                ride.driver_id = Some(driver_id);
                if agreed_fare.is_some() {
                    ride.agreed_fare = agreed_fare;
                }
                Some(json!({ "agreed_fare": ride.agreed_fare }))
            }
            Trigger::StartTrip => {
                ride.pickup_time = Some(now);
                None
            }
            Trigger::CompleteTrip => {
                let fare = ride.agreed_fare.unwrap_or(ride.estimated_fare);
                ride.final_fare = Some(fare);
                ride.dropoff_time = Some(now);
                Some(json!({ "final_fare": fare }))
            }
            Trigger::Cancel { reason } => Some(json!({ "reason": reason })),
            Trigger::Expire { reason } => Some(json!({ "reason": reason })),
            Trigger::StartBargaining | Trigger::ConfirmAssignment | Trigger::DriverArrived => None,
        };

        // the history entry keeps the driver even when the ride lets go of it
        let driver_id = ride.driver_id;
        if to == RideStatus::Cancelled {
            ride.driver_id = None;
        }

        ride.status = to;
        ride.updated_at = now;

        let leftover = match to {
            RideStatus::Accepted => Some(OfferStatus::Rejected),
            RideStatus::Cancelled | RideStatus::Expired => Some(OfferStatus::Expired),
            _ => None,
        };

        if let Some(status) = leftover {
            for offer in self.offers.iter_mut().filter(|offer| offer.is_pending()) {
                offer.resolve(status, now);
            }
        }

        let seq = self.next_seq();
        self.history.push(RideHistoryEntry {
            ride_id: self.ride.id,
            seq,
            event_type,
            previous_status: Some(from),
            new_status: to,
            actor_id,
            driver_id,
            payload: merge(payload, details),
            timestamp: now,
        });

        tracing::info!(ride_id = %self.ride.id, %from, %to, ?actor_id, "ride transitioned");

        Ok(&self.history[self.history.len() - 1])
    }
}

impl Engine {
    /// Applies a single transition under the ride's lock.
    #[tracing::instrument(skip(self, payload))]
    pub async fn apply_transition(
        &self,
        ride_id: Uuid,
        trigger: Trigger,
        actor_id: Option<Uuid>,
        payload: Option<Value>,
    ) -> Result<Ride, Error> {
        let now = self.clock.now();

        self.with_ride(ride_id, |record, _| {
            record.apply(trigger.clone(), actor_id, payload.clone(), now)?;

            Ok(record.ride.clone())
        })
        .await
    }
}

#[cfg(test)]
fn searching_record() -> RideRecord {
    use crate::entities::{Coordinates, RideRequest};

    let now = Utc::now();
    let request = RideRequest {
        rider_id: Uuid::new_v4(),
        pickup: Coordinates::new(6.5, 3.4),
        dropoff: Coordinates::new(6.6, 3.5),
        estimated_fare: 1500.0,
        vehicle_type: None,
        schedule_time: None,
        notes: None,
    };

    let mut record = RideRecord::new(Ride::new(request, 15.6, now), now);
    record
        .apply(Trigger::BeginSearch { deadline: now }, None, None, now)
        .unwrap();
    record
}

#[test]
fn full_trip_records_a_valid_walk() {
    use crate::entities::is_valid_walk;

    let now = Utc::now();
    let driver_id = Uuid::new_v4();
    let mut record = searching_record();

    for trigger in [
        Trigger::Accept {
            driver_id,
            agreed_fare: None,
        },
        Trigger::ConfirmAssignment,
        Trigger::DriverArrived,
        Trigger::StartTrip,
        Trigger::CompleteTrip,
    ] {
        record.apply(trigger, Some(driver_id), None, now).unwrap();
        record.ride.check_invariants().unwrap();
    }

    assert_eq!(record.status(), RideStatus::Completed);
    assert_eq!(record.ride.final_fare, Some(1500.0));
    assert!(record.ride.pickup_time.is_some());
    assert!(record.ride.dropoff_time.is_some());
    assert_eq!(record.history.len(), 7);
    assert!(is_valid_walk(&record.history));
}

#[test]
fn illegal_edges_leave_the_record_untouched() {
    let now = Utc::now();
    let mut record = searching_record();
    let before = record.clone();

    let err = record
        .apply(Trigger::StartTrip, None, None, now)
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: RideStatus::Searching,
            to: RideStatus::InProgress
        }
    ));
    assert_eq!(record, before);
}

#[test]
fn cancellation_releases_the_driver_but_keeps_it_in_history() {
    let now = Utc::now();
    let driver_id = Uuid::new_v4();
    let mut record = searching_record();

    record
        .apply(
            Trigger::Accept {
                driver_id,
                agreed_fare: Some(1300.0),
            },
            Some(driver_id),
            None,
            now,
        )
        .unwrap();

    let entry = record
        .apply(
            Trigger::Cancel {
                reason: Some("rider changed plans".into()),
            },
            Some(record.ride.rider_id),
            None,
            now,
        )
        .unwrap()
        .clone();

    assert_eq!(record.ride.driver_id, None);
    assert_eq!(entry.driver_id, Some(driver_id));
    assert_eq!(entry.payload.unwrap()["reason"], "rider changed plans");
    assert!(record.ride.check_invariants().is_ok());
}

#[test]
fn payloads_are_merged_with_trigger_details() {
    let merged = merge(
        Some(json!({ "source": "driver_app" })),
        Some(json!({ "final_fare": 1200.0 })),
    )
    .unwrap();

    assert_eq!(merged["source"], "driver_app");
    assert_eq!(merged["final_fare"], 1200.0);
    assert_eq!(merge(None, None), None);
}

#[tokio::test]
async fn engine_transitions_are_persisted_with_history() {
    use crate::api::RideAPI;
    use crate::testing::Harness;

    let h = Harness::new();
    let ride = h.request_ride(Uuid::new_v4()).await;

    let err = h
        .engine
        .apply_transition(ride.id, Trigger::ConfirmAssignment, None, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let expired = h
        .engine
        .apply_transition(
            ride.id,
            Trigger::Expire {
                reason: "operator closed the ride".into(),
            },
            None,
            Some(json!({ "source": "ops" })),
        )
        .await
        .unwrap();
    assert_eq!(expired.status, RideStatus::Expired);

    let history = h.engine.ride_history(ride.id).await.unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.new_status, RideStatus::Expired);
    assert_eq!(last.event_type, HistoryEventType::Expiry);
    assert_eq!(last.payload.as_ref().unwrap()["source"], "ops");
    assert_eq!(last.payload.as_ref().unwrap()["reason"], "operator closed the ride");
}
