use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::api::RideAPI;
use crate::clock::ManualClock;
use crate::config::DispatchConfig;
use crate::engine::Engine;
use crate::entities::{
    Coordinates, DriverCandidate, DriverProfile, Ride, RideRecord, RideRequest, VehicleType,
};
use crate::error::Error;
use crate::geo::{GeoIndex, InMemoryGeoIndex};
use crate::notifier::{Notification, NotificationEvent, Notifier};
use crate::store::{MemoryRideStore, RideStore};

pub const PICKUP: Coordinates = Coordinates { lat: 6.5, lng: 3.4 };
pub const DROPOFF: Coordinates = Coordinates { lat: 6.6, lng: 3.5 };

pub fn test_config() -> DispatchConfig {
    DispatchConfig {
        geo_retry_backoff: Duration::from_millis(1),
        ..DispatchConfig::default()
    }
}

pub fn sample_request(rider_id: Uuid) -> RideRequest {
    RideRequest {
        rider_id,
        pickup: PICKUP,
        dropoff: DROPOFF,
        estimated_fare: 1500.0,
        vehicle_type: None,
        schedule_time: None,
        notes: None,
    }
}

/// Lets spawned notification tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn count(&self, user_id: Uuid, event: NotificationEvent) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.user_id == user_id && n.event == event)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        user_id: Uuid,
        event: NotificationEvent,
        payload: Value,
    ) -> Result<(), Error> {
        self.sent
            .lock()
            .unwrap()
            .push(Notification::new(user_id, event, payload));

        Ok(())
    }
}

/// Notifier whose every delivery fails.
#[derive(Debug, Default)]
pub struct BrokenNotifier;

#[async_trait]
impl Notifier for BrokenNotifier {
    async fn notify(&self, _: Uuid, _: NotificationEvent, _: Value) -> Result<(), Error> {
        Err(Error::upstream("push gateway unavailable"))
    }
}

/// Geo index that fails its first `failures` searches.
pub struct FlakyGeoIndex {
    inner: Arc<InMemoryGeoIndex>,
    failures: AtomicU32,
    pub calls: AtomicU32,
}

impl FlakyGeoIndex {
    pub fn new(inner: Arc<InMemoryGeoIndex>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl GeoIndex for FlakyGeoIndex {
    async fn find_nearby_available_drivers(
        &self,
        pickup: Coordinates,
        radius_km: f64,
        vehicle_type: Option<VehicleType>,
    ) -> Result<Vec<DriverCandidate>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if failing {
            return Err(Error::upstream("geo index timed out"));
        }

        self.inner
            .find_nearby_available_drivers(pickup, radius_km, vehicle_type)
            .await
    }

    async fn is_driver_eligible(&self, driver_id: Uuid) -> Result<bool, Error> {
        self.inner.is_driver_eligible(driver_id).await
    }
}

type Interference = Box<dyn FnOnce(&mut RideRecord) + Send>;

/// Store where other writers can be made to slip in a change just before
/// the engine saves, so the engine's save loses the version race.
pub struct ContendedRideStore {
    inner: Arc<MemoryRideStore>,
    rivals: Mutex<VecDeque<Interference>>,
}

impl ContendedRideStore {
    pub fn new(inner: Arc<MemoryRideStore>) -> Self {
        Self {
            inner,
            rivals: Mutex::new(VecDeque::new()),
        }
    }

    /// The next save is preceded by a write that applies `change`.
    pub fn interfere(&self, change: impl FnOnce(&mut RideRecord) + Send + 'static) {
        self.rivals.lock().unwrap().push_back(Box::new(change));
    }

    /// The next `saves` saves each lose to a write that changes nothing but
    /// the version.
    pub fn bump(&self, saves: usize) {
        for _ in 0..saves {
            self.interfere(|_| {});
        }
    }

    pub fn pending(&self) -> usize {
        self.rivals.lock().unwrap().len()
    }
}

#[async_trait]
impl RideStore for ContendedRideStore {
    async fn insert(&self, record: &RideRecord) -> Result<(), Error> {
        self.inner.insert(record).await
    }

    async fn load(&self, ride_id: Uuid) -> Result<RideRecord, Error> {
        self.inner.load(ride_id).await
    }

    async fn save(&self, record: &RideRecord, expected_version: u64) -> Result<(), Error> {
        let rival = self.rivals.lock().unwrap().pop_front();

        if let Some(change) = rival {
            let mut current = self.inner.load(record.id()).await?;
            let version = current.version;

            change(&mut current);
            current.version = version + 1;
            self.inner.save(&current, version).await?;
        }

        self.inner.save(record, expected_version).await
    }

    async fn find_ride_id_by_offer(&self, offer_id: Uuid) -> Result<Uuid, Error> {
        self.inner.find_ride_id_by_offer(offer_id).await
    }

    async fn active_ride_ids(&self) -> Result<Vec<Uuid>, Error> {
        self.inner.active_ride_ids().await
    }
}

/// An engine wired to in-memory collaborators and a manual clock.
pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryRideStore>,
    pub contention: Arc<ContendedRideStore>,
    pub drivers: Arc<InMemoryGeoIndex>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(test_config(), None, None, None)
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        Self::build(config, None, None, None)
    }

    /// Searches go through `geo`, which should wrap `drivers`.
    pub fn with_geo(drivers: Arc<InMemoryGeoIndex>, geo: Arc<dyn GeoIndex>) -> Self {
        Self::build(test_config(), Some(drivers), Some(geo), None)
    }

    pub fn with_notifier(notifier: Arc<dyn Notifier>) -> Self {
        Self::build(test_config(), None, None, Some(notifier))
    }

    fn build(
        config: DispatchConfig,
        drivers: Option<Arc<InMemoryGeoIndex>>,
        geo: Option<Arc<dyn GeoIndex>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let store = Arc::new(MemoryRideStore::new());
        let contention = Arc::new(ContendedRideStore::new(store.clone()));
        let drivers = drivers.unwrap_or_default();
        let recording = Arc::new(RecordingNotifier::default());
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let geo: Arc<dyn GeoIndex> = match geo {
            Some(geo) => geo,
            None => drivers.clone(),
        };
        let notifier: Arc<dyn Notifier> = match notifier {
            Some(notifier) => notifier,
            None => recording.clone(),
        };

        let engine = Engine::new(config, contention.clone(), geo, notifier, clock.clone())
            .with_hook(drivers.clone());

        Self {
            engine: Arc::new(engine),
            store,
            contention,
            drivers,
            notifier: recording,
            clock,
        }
    }

    /// Registers an available driver a few hundred metres from the pickup.
    pub fn add_driver(&self) -> Uuid {
        self.add_driver_at(Coordinates::new(PICKUP.lat + 0.003, PICKUP.lng))
    }

    pub fn add_driver_at(&self, position: Coordinates) -> Uuid {
        let driver_id = Uuid::new_v4();
        self.drivers
            .upsert(DriverProfile::available(driver_id, position));
        driver_id
    }

    pub async fn request_ride(&self, rider_id: Uuid) -> Ride {
        self.engine
            .request_ride(sample_request(rider_id))
            .await
            .unwrap()
    }

    /// Moves the clock forward and fires whatever became due.
    pub async fn advance(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.engine
            .scheduler()
            .run_due(self.engine.as_ref())
            .await
    }
}
