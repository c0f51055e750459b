use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::Coordinates;
use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Searching,
    Bargaining,
    Accepted,
    DriverAssigned,
    DriverArrived,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

impl RideStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Searching => "searching",
            Self::Bargaining => "bargaining",
            Self::Accepted => "accepted",
            Self::DriverAssigned => "driver_assigned",
            Self::DriverArrived => "driver_arrived",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Statuses a driver can still win the ride from.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Searching | Self::Bargaining)
    }

    /// Statuses the expiry scheduler is allowed to move to EXPIRED.
    pub fn is_expirable(&self) -> bool {
        matches!(self, Self::Requested | Self::Searching | Self::Bargaining)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            Self::Requested
                | Self::Searching
                | Self::Bargaining
                | Self::Accepted
                | Self::DriverAssigned
        )
    }

    /// Statuses in which a ride must carry a driver.
    pub fn requires_driver(&self) -> bool {
        matches!(
            self,
            Self::Accepted
                | Self::DriverAssigned
                | Self::DriverArrived
                | Self::InProgress
                | Self::Completed
        )
    }

    pub fn can_transition_to(&self, target: RideStatus) -> bool {
        use RideStatus::*;

        matches!(
            (self, target),
            (Requested, Searching)
                | (Requested, Cancelled)
                | (Requested, Expired)
                | (Searching, Bargaining)
                | (Searching, Accepted)
                | (Searching, Expired)
                | (Searching, Cancelled)
                | (Bargaining, Accepted)
                | (Bargaining, Cancelled)
                | (Bargaining, Expired)
                | (Accepted, DriverAssigned)
                | (Accepted, Cancelled)
                | (DriverAssigned, DriverArrived)
                | (DriverAssigned, Cancelled)
                | (DriverArrived, InProgress)
                | (DriverArrived, Cancelled)
                | (InProgress, Completed)
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Sedan,
    Suv,
    Hatchback,
    Bus,
    Motorcycle,
    Tricycle,
}

impl VehicleType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sedan => "sedan",
            Self::Suv => "suv",
            Self::Hatchback => "hatchback",
            Self::Bus => "bus",
            Self::Motorcycle => "motorcycle",
            Self::Tricycle => "tricycle",
        }
    }
}

/// Input for a new ride.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RideRequest {
    pub rider_id: Uuid,
    pub pickup: Coordinates,
    pub dropoff: Coordinates,
    pub estimated_fare: f64,
    #[serde(default)]
    pub vehicle_type: Option<VehicleType>,
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: RideStatus,
    pub pickup: Coordinates,
    pub dropoff: Coordinates,
    pub distance_km: f64,
    pub estimated_fare: f64,
    /// Fare agreed through bargaining, applied when the ride completes.
    pub agreed_fare: Option<f64>,
    pub final_fare: Option<f64>,
    pub vehicle_type: Option<VehicleType>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub search_deadline: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub pickup_time: Option<DateTime<Utc>>,
    pub dropoff_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    pub fn new(request: RideRequest, distance_km: f64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rider_id: request.rider_id,
            driver_id: None,
            status: RideStatus::Requested,
            pickup: request.pickup,
            dropoff: request.dropoff,
            distance_km,
            estimated_fare: request.estimated_fare,
            agreed_fare: None,
            final_fare: None,
            vehicle_type: request.vehicle_type,
            schedule_time: request.schedule_time,
            search_deadline: None,
            notes: request.notes,
            pickup_time: None,
            dropoff_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_scheduled_after(&self, now: DateTime<Utc>) -> bool {
        matches!(self.schedule_time, Some(at) if at > now)
    }

    /// Checks the driver and fare invariants. A failure means the stored
    /// ride is corrupted and must not be processed further.
    pub fn check_invariants(&self) -> Result<(), Error> {
        if self.driver_id.is_some() != self.status.requires_driver() {
            tracing::error!(
                ride_id = %self.id,
                status = %self.status,
                driver_id = ?self.driver_id,
                "driver assignment does not match ride status"
            );
            return Err(Error::CorruptedRide(self.id));
        }

        if self.final_fare.is_some() != (self.status == RideStatus::Completed) {
            tracing::error!(
                ride_id = %self.id,
                status = %self.status,
                final_fare = ?self.final_fare,
                "final fare does not match ride status"
            );
            return Err(Error::CorruptedRide(self.id));
        }

        Ok(())
    }
}

#[test]
fn terminal_states_have_no_exits() {
    use RideStatus::*;

    let all = [
        Requested,
        Searching,
        Bargaining,
        Accepted,
        DriverAssigned,
        DriverArrived,
        InProgress,
        Completed,
        Cancelled,
        Expired,
    ];

    for from in [Completed, Cancelled, Expired] {
        for to in all {
            assert!(!from.can_transition_to(to), "{} -> {}", from, to);
        }
    }
}

#[test]
fn cancellation_is_closed_after_arrival() {
    assert!(RideStatus::DriverAssigned.can_cancel());
    assert!(!RideStatus::DriverArrived.can_cancel());
    assert!(!RideStatus::InProgress.can_cancel());
    assert!(!RideStatus::Completed.can_cancel());
}

#[test]
fn trip_must_pass_through_assignment() {
    assert!(!RideStatus::Searching.can_transition_to(RideStatus::DriverAssigned));
    assert!(!RideStatus::Accepted.can_transition_to(RideStatus::InProgress));
    assert!(!RideStatus::DriverAssigned.can_transition_to(RideStatus::Completed));
    assert!(RideStatus::InProgress.can_transition_to(RideStatus::Completed));
}

#[test]
fn driverless_trip_is_corrupted() {
    let request = RideRequest {
        rider_id: Uuid::new_v4(),
        pickup: Coordinates::new(6.5, 3.4),
        dropoff: Coordinates::new(6.6, 3.5),
        estimated_fare: 1500.0,
        vehicle_type: None,
        schedule_time: None,
        notes: None,
    };

    let mut ride = Ride::new(request, 15.6, Utc::now());
    assert!(ride.check_invariants().is_ok());

    ride.status = RideStatus::InProgress;
    assert!(matches!(ride.check_invariants(), Err(Error::CorruptedRide(_))));

    ride.driver_id = Some(Uuid::new_v4());
    assert!(ride.check_invariants().is_ok());
}
