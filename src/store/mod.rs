mod memory;
mod postgres;

pub use memory::MemoryRideStore;
pub use postgres::PgRideStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::entities::RideRecord;
use crate::error::Error;

/// Durable storage for ride records, keyed by ride id.
///
/// `save` is a compare-and-swap on `version`: it only succeeds when the
/// stored record is still at `expected_version`, otherwise it fails with
/// `Error::Conflict` and writes nothing.
#[async_trait]
pub trait RideStore: Send + Sync {
    async fn insert(&self, record: &RideRecord) -> Result<(), Error>;

    async fn load(&self, ride_id: Uuid) -> Result<RideRecord, Error>;

    async fn save(&self, record: &RideRecord, expected_version: u64) -> Result<(), Error>;

    async fn find_ride_id_by_offer(&self, offer_id: Uuid) -> Result<Uuid, Error>;

    /// Rides that have not reached a terminal status.
    async fn active_ride_ids(&self) -> Result<Vec<Uuid>, Error>;
}
