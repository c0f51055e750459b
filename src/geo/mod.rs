mod memory;
mod postgres;

pub use memory::InMemoryGeoIndex;
pub use postgres::PgGeoIndex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::{Coordinates, DriverCandidate, VehicleType};
use crate::error::Error;

/// Driver positions and availability, owned by the surrounding system.
///
/// A driver is available when they are active, verified, online and not on
/// another ride. The engine only reads this data; it never reserves drivers.
#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Available drivers within `radius_km` of `pickup`, nearest first.
    async fn find_nearby_available_drivers(
        &self,
        pickup: Coordinates,
        radius_km: f64,
        vehicle_type: Option<VehicleType>,
    ) -> Result<Vec<DriverCandidate>, Error>;

    async fn is_driver_eligible(&self, driver_id: Uuid) -> Result<bool, Error>;
}
