use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use uuid::Uuid;

use crate::engine::{TransitionEvent, TransitionHook};
use crate::entities::{Coordinates, DriverCandidate, DriverProfile, RideStatus, VehicleType};
use crate::error::Error;
use crate::geo::GeoIndex;

/// Geo index backed by a map of driver profiles.
///
/// Registered as a transition hook it also plays the driver service: an
/// assigned driver is marked as on a ride and released once the ride ends.
#[derive(Debug, Default)]
pub struct InMemoryGeoIndex {
    drivers: RwLock<HashMap<Uuid, DriverProfile>>,
}

impl InMemoryGeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, DriverProfile>> {
        self.drivers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, DriverProfile>> {
        self.drivers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn upsert(&self, profile: DriverProfile) {
        self.write().insert(profile.id, profile);
    }

    pub fn remove(&self, driver_id: Uuid) -> Option<DriverProfile> {
        self.write().remove(&driver_id)
    }

    pub fn profile(&self, driver_id: Uuid) -> Option<DriverProfile> {
        self.read().get(&driver_id).cloned()
    }

    pub fn update_location(&self, driver_id: Uuid, position: Coordinates) -> Result<(), Error> {
        self.update(driver_id, |profile| profile.position = Some(position))
    }

    pub fn set_online(&self, driver_id: Uuid, is_online: bool) -> Result<(), Error> {
        self.update(driver_id, |profile| profile.is_online = is_online)
    }

    fn update(&self, driver_id: Uuid, f: impl FnOnce(&mut DriverProfile)) -> Result<(), Error> {
        let mut drivers = self.write();
        let profile = drivers
            .get_mut(&driver_id)
            .ok_or_else(|| Error::not_found("driver", driver_id))?;

        f(profile);

        Ok(())
    }
}

#[async_trait]
impl GeoIndex for InMemoryGeoIndex {
    async fn find_nearby_available_drivers(
        &self,
        pickup: Coordinates,
        radius_km: f64,
        vehicle_type: Option<VehicleType>,
    ) -> Result<Vec<DriverCandidate>, Error> {
        let mut candidates: Vec<DriverCandidate> = self
            .read()
            .values()
            .filter(|profile| profile.is_eligible() && profile.serves(vehicle_type))
            .filter_map(|profile| {
                let distance_km = profile.position?.haversine_km(&pickup);

                (distance_km <= radius_km).then(|| DriverCandidate {
                    driver_id: profile.id,
                    distance_km,
                })
            })
            .collect();

        candidates.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));

        Ok(candidates)
    }

    async fn is_driver_eligible(&self, driver_id: Uuid) -> Result<bool, Error> {
        Ok(self
            .read()
            .get(&driver_id)
            .map_or(false, DriverProfile::is_eligible))
    }
}

#[async_trait]
impl TransitionHook for InMemoryGeoIndex {
    fn name(&self) -> &'static str {
        "driver_availability"
    }

    async fn on_transition(&self, event: &TransitionEvent) -> Result<(), Error> {
        let ride_id = event.ride.id;
        let mut drivers = self.write();

        let profile = match event.entry.driver_id.and_then(|id| drivers.get_mut(&id)) {
            Some(profile) => profile,
            None => return Ok(()),
        };

        match event.status() {
            RideStatus::DriverAssigned => {
                profile.current_ride_id = Some(ride_id);
            }
            RideStatus::Completed | RideStatus::Cancelled | RideStatus::Expired
                if profile.current_ride_id == Some(ride_id) =>
            {
                profile.current_ride_id = None;
            }
            _ => {}
        }

        Ok(())
    }
}

#[test]
fn nearby_drivers_are_filtered_and_ranked() {
    use tokio_test::block_on;

    let index = InMemoryGeoIndex::new();
    let pickup = Coordinates::new(6.5, 3.4);

    let near = Uuid::new_v4();
    let nearer = Uuid::new_v4();
    let offline = Uuid::new_v4();
    let far = Uuid::new_v4();
    let busy = Uuid::new_v4();

    index.upsert(DriverProfile::available(near, Coordinates::new(6.52, 3.4)));
    index.upsert(DriverProfile::available(nearer, Coordinates::new(6.505, 3.4)));
    index.upsert(DriverProfile::available(far, Coordinates::new(6.7, 3.4)));
    index.upsert(DriverProfile {
        is_online: false,
        ..DriverProfile::available(offline, pickup)
    });
    index.upsert(DriverProfile {
        current_ride_id: Some(Uuid::new_v4()),
        ..DriverProfile::available(busy, pickup)
    });

    let candidates = block_on(index.find_nearby_available_drivers(pickup, 5.0, None)).unwrap();
    let ids: Vec<Uuid> = candidates.iter().map(|c| c.driver_id).collect();

    assert_eq!(ids, vec![nearer, near]);
    assert!(candidates[0].distance_km < candidates[1].distance_km);

    assert!(block_on(index.is_driver_eligible(near)).unwrap());
    assert!(!block_on(index.is_driver_eligible(busy)).unwrap());
    assert!(!block_on(index.is_driver_eligible(Uuid::new_v4())).unwrap());
}

#[test]
fn vehicle_type_narrows_the_search() {
    use tokio_test::block_on;

    let index = InMemoryGeoIndex::new();
    let pickup = Coordinates::new(6.5, 3.4);
    let suv = Uuid::new_v4();

    index.upsert(DriverProfile::available(Uuid::new_v4(), pickup).with_vehicle(VehicleType::Sedan));
    index.upsert(DriverProfile::available(suv, pickup).with_vehicle(VehicleType::Suv));

    let candidates =
        block_on(index.find_nearby_available_drivers(pickup, 5.0, Some(VehicleType::Suv))).unwrap();

    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].driver_id, suv);
}

#[test]
fn drivers_can_move_and_leave() {
    use tokio_test::block_on;

    let index = InMemoryGeoIndex::new();
    let pickup = Coordinates::new(6.5, 3.4);
    let driver_id = Uuid::new_v4();

    index.upsert(DriverProfile::available(driver_id, Coordinates::new(6.8, 3.4)));
    assert!(block_on(index.find_nearby_available_drivers(pickup, 5.0, None))
        .unwrap()
        .is_empty());

    index
        .update_location(driver_id, Coordinates::new(6.51, 3.4))
        .unwrap();
    assert_eq!(
        block_on(index.find_nearby_available_drivers(pickup, 5.0, None))
            .unwrap()
            .len(),
        1
    );

    assert!(index.remove(driver_id).is_some());
    assert!(matches!(
        index.set_online(driver_id, true),
        Err(Error::NotFound { .. })
    ));
}
