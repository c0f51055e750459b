use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Coordinates, VehicleType};

/// A driver returned by a nearby search, nearest first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverCandidate {
    pub driver_id: Uuid,
    pub distance_km: f64,
}

/// Availability data the geo index keeps per driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    pub id: Uuid,
    pub position: Option<Coordinates>,
    pub vehicle_type: Option<VehicleType>,
    pub is_active: bool,
    pub is_verified: bool,
    pub is_online: bool,
    pub current_ride_id: Option<Uuid>,
}

impl DriverProfile {
    /// A verified, online driver with no ride.
    pub fn available(id: Uuid, position: Coordinates) -> Self {
        Self {
            id,
            position: Some(position),
            vehicle_type: None,
            is_active: true,
            is_verified: true,
            is_online: true,
            current_ride_id: None,
        }
    }

    pub fn with_vehicle(mut self, vehicle_type: VehicleType) -> Self {
        self.vehicle_type = Some(vehicle_type);
        self
    }

    pub fn is_eligible(&self) -> bool {
        self.is_active && self.is_verified && self.is_online && self.current_ride_id.is_none()
    }

    pub fn serves(&self, vehicle_type: Option<VehicleType>) -> bool {
        match vehicle_type {
            Some(wanted) => self.vehicle_type == Some(wanted),
            None => true,
        }
    }
}
