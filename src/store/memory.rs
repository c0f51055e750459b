use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entities::RideRecord;
use crate::error::Error;
use crate::store::RideStore;

#[derive(Debug, Default)]
struct Tables {
    rides: HashMap<Uuid, RideRecord>,
    offers: HashMap<Uuid, Uuid>,
}

impl Tables {
    fn index_offers(&mut self, record: &RideRecord) {
        for offer in record.offers.iter() {
            self.offers.insert(offer.id, record.id());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRideStore {
    tables: RwLock<Tables>,
}

impl MemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn insert(&self, record: &RideRecord) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        if tables.rides.contains_key(&record.id()) {
            return Err(Error::Conflict);
        }

        tables.index_offers(record);
        tables.rides.insert(record.id(), record.clone());

        Ok(())
    }

    async fn load(&self, ride_id: Uuid) -> Result<RideRecord, Error> {
        self.tables
            .read()
            .await
            .rides
            .get(&ride_id)
            .cloned()
            .ok_or_else(|| Error::not_found("ride", ride_id))
    }

    async fn save(&self, record: &RideRecord, expected_version: u64) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        let stored = tables
            .rides
            .get(&record.id())
            .ok_or_else(|| Error::not_found("ride", record.id()))?;

        if stored.version != expected_version {
            tracing::debug!(
                ride_id = %record.id(),
                expected_version,
                stored_version = stored.version,
                "version mismatch"
            );
            return Err(Error::Conflict);
        }

        tables.index_offers(record);
        tables.rides.insert(record.id(), record.clone());

        Ok(())
    }

    async fn find_ride_id_by_offer(&self, offer_id: Uuid) -> Result<Uuid, Error> {
        self.tables
            .read()
            .await
            .offers
            .get(&offer_id)
            .copied()
            .ok_or_else(|| Error::not_found("offer", offer_id))
    }

    async fn active_ride_ids(&self) -> Result<Vec<Uuid>, Error> {
        Ok(self
            .tables
            .read()
            .await
            .rides
            .values()
            .filter(|record| !record.status().is_terminal())
            .map(|record| record.id())
            .collect())
    }
}

#[cfg(test)]
fn sample_record() -> RideRecord {
    use crate::entities::{Coordinates, Ride, RideRequest};
    use chrono::Utc;

    let request = RideRequest {
        rider_id: Uuid::new_v4(),
        pickup: Coordinates::new(6.5, 3.4),
        dropoff: Coordinates::new(6.6, 3.5),
        estimated_fare: 1500.0,
        vehicle_type: None,
        schedule_time: None,
        notes: None,
    };

    RideRecord::new(Ride::new(request, 15.6, Utc::now()), Utc::now())
}

#[tokio::test]
async fn stale_versions_are_rejected() {
    let store = MemoryRideStore::new();
    let record = sample_record();
    store.insert(&record).await.unwrap();

    let mut first = store.load(record.id()).await.unwrap();
    let mut second = first.clone();

    first.version = 1;
    first.ride.notes = Some("gate 2".into());
    store.save(&first, 0).await.unwrap();

    second.version = 1;
    assert!(matches!(store.save(&second, 0).await, Err(Error::Conflict)));

    let stored = store.load(record.id()).await.unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.ride.notes.as_deref(), Some("gate 2"));
}

#[tokio::test]
async fn offers_resolve_to_their_ride() {
    use crate::entities::{BargainOffer, Party};
    use chrono::Utc;

    let store = MemoryRideStore::new();
    let mut record = sample_record();
    store.insert(&record).await.unwrap();

    let offer = BargainOffer::new(
        record.id(),
        record.ride.rider_id,
        Party::Rider,
        1200.0,
        None,
        Utc::now(),
        Utc::now(),
    );
    let offer_id = offer.id;
    record.offers.push(offer);
    record.version = 1;
    store.save(&record, 0).await.unwrap();

    assert_eq!(store.find_ride_id_by_offer(offer_id).await.unwrap(), record.id());
    assert!(store
        .find_ride_id_by_offer(Uuid::new_v4())
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(store.active_ride_ids().await.unwrap(), vec![record.id()]);
}
