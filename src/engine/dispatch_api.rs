use super::{until, Effects, Engine, Trigger};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::RideAPI,
    entities::{
        Coordinates, DriverCandidate, Ride, RideHistoryEntry, RideRecord, RideRequest, RideStatus,
        VehicleType,
    },
    error::Error,
    notifier::NotificationEvent,
    scheduler::ExpiryJob,
};

impl Engine {
    fn validate_request(&self, request: &RideRequest, now: DateTime<Utc>) -> Result<f64, Error> {
        request.pickup.validate()?;
        request.dropoff.validate()?;

        if !request.estimated_fare.is_finite() || request.estimated_fare <= 0.0 {
            return Err(Error::invalid_input("estimated fare must be a positive number"));
        }

        let distance_km = request.pickup.haversine_km(&request.dropoff);

        if distance_km < self.config.min_ride_distance_km {
            return Err(Error::invalid_input(format!(
                "ride distance must be at least {} km",
                self.config.min_ride_distance_km
            )));
        }

        if distance_km > self.config.max_ride_distance_km {
            return Err(Error::invalid_input(format!(
                "ride distance cannot exceed {} km",
                self.config.max_ride_distance_km
            )));
        }

        if let Some(at) = request.schedule_time {
            let lead = (at - now).to_std().unwrap_or(Duration::ZERO);

            if lead < self.config.min_schedule_lead {
                return Err(Error::invalid_input(
                    "scheduled rides must be booked further in advance",
                ));
            }

            if lead > self.config.max_schedule_ahead {
                return Err(Error::invalid_input("scheduled ride is too far in the future"));
            }
        }

        Ok(distance_km)
    }

    /// Moves a requested ride into SEARCHING and runs the first matching
    /// pass.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn begin_dispatch(&self, ride_id: Uuid) -> Result<Ride, Error> {
        let now = self.clock.now();
        let search_timeout = self.config.search_timeout;
        let deadline = now
            + chrono::Duration::from_std(search_timeout)
                .map_err(|_| Error::Config("search timeout is out of range".into()))?;

        let ride = self
            .with_ride(ride_id, |record, effects| {
                record.apply(Trigger::BeginSearch { deadline }, None, None, now)?;
                effects.schedule(search_timeout, ExpiryJob::SearchTimeout { ride_id });

                Ok(record.ride.clone())
            })
            .await?;

        if let Err(err) = self.matching_pass(ride_id).await {
            tracing::warn!(%ride_id, error = %err, "initial matching pass failed");
        }

        Ok(ride)
    }

    /// Queries the geo index, retrying with exponential backoff and jitter.
    async fn find_candidates(
        &self,
        pickup: Coordinates,
        vehicle_type: Option<VehicleType>,
    ) -> Result<Vec<DriverCandidate>, Error> {
        let mut attempt = 0;

        loop {
            let result = self
                .geo
                .find_nearby_available_drivers(pickup, self.config.search_radius_km, vehicle_type)
                .await;

            match result {
                Ok(candidates) => return Ok(candidates),
                Err(err) if attempt + 1 < self.config.geo_retry_attempts => {
                    let backoff = retry_backoff(self.config.geo_retry_backoff, attempt);
                    let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);

                    tracing::warn!(attempt, error = %err, "geo index query failed, retrying");

                    tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Offers the ride to nearby drivers who have not seen it yet. Another
    /// pass is scheduled whatever the outcome, for as long as the ride is
    /// open. Returns the drivers notified by this pass.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn matching_pass(&self, ride_id: Uuid) -> Result<Vec<Uuid>, Error> {
        let snapshot = self.load(ride_id).await?;

        if !snapshot.status().is_open() {
            return Ok(vec![]);
        }

        let ride = &snapshot.ride;
        let next_pass = ExpiryJob::MatchingPass { ride_id };

        let candidates = match self.find_candidates(ride.pickup, ride.vehicle_type).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(%ride_id, error = %err, "matching pass gave up, ride stays open");
                self.scheduler
                    .schedule_in(self.config.matching_interval, next_pass);
                return Err(err);
            }
        };

        let max_candidates = self.config.max_candidates;
        let matching_interval = self.config.matching_interval;

        self.with_ride(ride_id, |record, effects| {
            if !record.status().is_open() {
                return Ok(vec![]);
            }

            let fresh: Vec<Uuid> = candidates
                .iter()
                .map(|candidate| candidate.driver_id)
                .filter(|driver_id| !record.candidates.contains(driver_id))
                .take(max_candidates)
                .collect();

            let added = record.add_candidates(fresh);

            for driver_id in added.iter() {
                effects.notify(*driver_id, NotificationEvent::RideRequest, ride_request_payload(record));
            }

            effects.schedule(matching_interval, next_pass.clone());

            tracing::info!(
                %ride_id,
                found = candidates.len(),
                notified = added.len(),
                "matching pass finished"
            );

            Ok(added)
        })
        .await
    }

    pub(super) fn notify_unavailable(record: &RideRecord, effects: &mut Effects, except: &[Uuid]) {
        for driver_id in record.interested_drivers() {
            if !except.contains(&driver_id) {
                effects.notify(
                    driver_id,
                    NotificationEvent::RideUnavailable,
                    json!({ "ride_id": record.id() }),
                );
            }
        }
    }
}

/// Doubles `base` per attempt, saturating instead of overflowing.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

fn ride_request_payload(record: &RideRecord) -> serde_json::Value {
    let ride = &record.ride;

    json!({
        "ride_id": ride.id,
        "pickup": ride.pickup,
        "dropoff": ride.dropoff,
        "distance_km": ride.distance_km,
        "estimated_fare": ride.estimated_fare,
        "vehicle_type": ride.vehicle_type,
    })
}

#[async_trait]
impl RideAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn request_ride(&self, request: RideRequest) -> Result<Ride, Error> {
        let now = self.clock.now();
        let distance_km = self.validate_request(&request, now)?;

        let record = RideRecord::new(Ride::new(request, distance_km, now), now);
        let ride_id = record.id();

        self.store.insert(&record).await?;

        tracing::info!(%ride_id, rider_id = %record.ride.rider_id, distance_km, "ride requested");

        self.after_commit(&record.ride, record.history.clone(), Effects::default())
            .await;

        match record.ride.schedule_time {
            Some(at) if record.ride.is_scheduled_after(now) => {
                self.scheduler
                    .schedule_in(until(now, at), ExpiryJob::BeginDispatch { ride_id });

                Ok(record.ride)
            }
            _ => self.begin_dispatch(ride_id).await,
        }
    }

    #[tracing::instrument(skip(self))]
    async fn find_ride(&self, id: Uuid) -> Result<Ride, Error> {
        Ok(self.load(id).await?.ride)
    }

    #[tracing::instrument(skip(self))]
    async fn ride_history(&self, id: Uuid) -> Result<Vec<RideHistoryEntry>, Error> {
        Ok(self.load(id).await?.history)
    }

    #[tracing::instrument(skip(self))]
    async fn accept_ride(&self, id: Uuid, driver_id: Uuid) -> Result<Ride, Error> {
        if !self.geo.is_driver_eligible(driver_id).await? {
            tracing::info!(%driver_id, "driver is not eligible");
            return Err(Error::DriverNotEligible);
        }

        let now = self.clock.now();

        self.with_ride(id, |record, effects| {
            let status = record.status();

            if !status.is_open() {
                tracing::info!(ride_id = %id, %status, "ride is no longer available");
                return Err(Error::RideNoLongerAvailable);
            }

            record.apply(
                Trigger::Accept {
                    driver_id,
                    agreed_fare: None,
                },
                Some(driver_id),
                None,
                now,
            )?;
            record.apply(Trigger::ConfirmAssignment, None, None, now)?;

            Self::notify_unavailable(record, effects, &[driver_id]);

            Ok(record.ride.clone())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn cancel_ride(
        &self,
        id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Ride, Error> {
        let now = self.clock.now();

        self.with_ride(id, |record, effects| {
            let ride = &record.ride;
            let status = ride.status;

            let is_party = ride.rider_id == actor_id
                || ride.driver_id == Some(actor_id)
                || record.offers.iter().any(|offer| offer.offered_by == actor_id);

            if !is_party {
                return Err(Error::InvalidActor);
            }

            if !status.can_cancel() {
                return Err(Error::CannotCancelInCurrentState(status));
            }

            let assigned = ride.driver_id;

            record.apply(
                Trigger::Cancel {
                    reason: reason.clone(),
                },
                Some(actor_id),
                None,
                now,
            )?;

            // the assigned driver gets ride_cancelled instead
            let mut except = vec![actor_id];
            except.extend(assigned);
            Self::notify_unavailable(record, effects, &except);

            Ok(record.ride.clone())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn advance_trip_status(
        &self,
        id: Uuid,
        actor_id: Uuid,
        status: RideStatus,
    ) -> Result<Ride, Error> {
        let now = self.clock.now();

        self.with_ride(id, |record, _| {
            let from = record.status();

            let trigger = match status {
                RideStatus::DriverArrived => Trigger::DriverArrived,
                RideStatus::InProgress => Trigger::StartTrip,
                RideStatus::Completed => Trigger::CompleteTrip,
                _ => return Err(Error::InvalidTransition { from, to: status }),
            };

            if !from.can_transition_to(status) {
                return Err(Error::InvalidTransition { from, to: status });
            }

            if record.ride.driver_id != Some(actor_id) {
                return Err(Error::InvalidActor);
            }

            record.apply(trigger, Some(actor_id), None, now)?;

            Ok(record.ride.clone())
        })
        .await
    }
}

#[tokio::test]
async fn accepted_ride_is_assigned_to_the_first_driver() {
    use crate::entities::is_valid_walk;
    use crate::testing::{settle, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();

    let ride = h.request_ride(rider_id).await;
    assert_eq!(ride.status, RideStatus::Searching);
    assert!(ride.search_deadline.is_some());

    let ride = h.engine.accept_ride(ride.id, driver_id).await.unwrap();
    assert_eq!(ride.status, RideStatus::DriverAssigned);
    assert_eq!(ride.driver_id, Some(driver_id));
    assert_eq!(ride.final_fare, None);

    let history = h.engine.ride_history(ride.id).await.unwrap();
    let statuses: Vec<RideStatus> = history.iter().map(|entry| entry.new_status).collect();
    assert_eq!(
        statuses,
        vec![
            RideStatus::Requested,
            RideStatus::Searching,
            RideStatus::Accepted,
            RideStatus::DriverAssigned,
        ]
    );
    assert!(is_valid_walk(&history));

    // the driver service now sees the driver as busy
    let profile = h.drivers.profile(driver_id).unwrap();
    assert_eq!(profile.current_ride_id, Some(ride.id));

    settle().await;
    assert_eq!(h.notifier.count(driver_id, NotificationEvent::RideRequest), 1);
    assert_eq!(h.notifier.count(rider_id, NotificationEvent::DriverAssigned), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_have_exactly_one_winner() {
    use crate::testing::Harness;

    for _ in 0..20 {
        let h = Harness::new();
        let first = h.add_driver();
        let second = h.add_driver();
        let ride_id = h.request_ride(Uuid::new_v4()).await.id;

        let attempts: Vec<_> = [first, second]
            .into_iter()
            .map(|driver_id| {
                let engine = h.engine.clone();
                tokio::spawn(async move { engine.accept_ride(ride_id, driver_id).await })
            })
            .collect();

        let mut winners = vec![];
        let mut losers = 0;

        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(ride) => winners.push(ride.driver_id),
                Err(Error::RideNoLongerAvailable) => losers += 1,
                Err(err) => panic!("unexpected error: {}", err),
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(losers, 1);

        let stored = h.engine.find_ride(ride_id).await.unwrap();
        assert_eq!(stored.driver_id, winners[0]);

        let accepted = h
            .engine
            .ride_history(ride_id)
            .await
            .unwrap()
            .iter()
            .filter(|entry| entry.new_status == RideStatus::Accepted)
            .count();
        assert_eq!(accepted, 1);
    }
}

#[tokio::test]
async fn ineligible_drivers_cannot_accept() {
    use crate::testing::Harness;

    let h = Harness::new();
    let driver_id = h.add_driver();
    let ride = h.request_ride(Uuid::new_v4()).await;

    h.drivers.set_online(driver_id, false).unwrap();

    let err = h.engine.accept_ride(ride.id, driver_id).await.unwrap_err();
    assert!(matches!(err, Error::DriverNotEligible));

    let err = h.engine.accept_ride(ride.id, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::DriverNotEligible));

    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Searching
    );
}

#[tokio::test]
async fn cancellation_tells_candidates_the_ride_is_gone() {
    use crate::testing::{settle, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let candidate = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let err = h
        .engine
        .cancel_ride(ride.id, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidActor));

    let ride = h
        .engine
        .cancel_ride(ride.id, rider_id, Some("found another way".into()))
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(ride.driver_id, None);

    settle().await;
    assert_eq!(h.notifier.count(candidate, NotificationEvent::RideUnavailable), 1);
    assert_eq!(h.notifier.count(rider_id, NotificationEvent::RideCancelled), 0);
}

#[tokio::test]
async fn trip_progress_is_driven_by_the_assigned_driver() {
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let other_driver = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    h.engine.accept_ride(ride.id, driver_id).await.unwrap();

    let err = h
        .engine
        .advance_trip_status(ride.id, driver_id, RideStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: RideStatus::DriverAssigned,
            to: RideStatus::Completed
        }
    ));

    let err = h
        .engine
        .advance_trip_status(ride.id, other_driver, RideStatus::DriverArrived)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidActor));

    h.engine
        .advance_trip_status(ride.id, driver_id, RideStatus::DriverArrived)
        .await
        .unwrap();

    let err = h
        .engine
        .cancel_ride(ride.id, rider_id, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CannotCancelInCurrentState(RideStatus::DriverArrived)
    ));

    h.engine
        .advance_trip_status(ride.id, driver_id, RideStatus::InProgress)
        .await
        .unwrap();
    let ride = h
        .engine
        .advance_trip_status(ride.id, driver_id, RideStatus::Completed)
        .await
        .unwrap();

    assert_eq!(ride.status, RideStatus::Completed);
    assert_eq!(ride.final_fare, Some(1500.0));
    assert!(ride.check_invariants().is_ok());

    // the driver is free again
    assert!(h.drivers.profile(driver_id).unwrap().is_eligible());
}

#[tokio::test]
async fn invalid_requests_are_never_stored() {
    use crate::clock::Clock;
    use crate::store::RideStore;
    use crate::testing::{sample_request, Harness};

    let h = Harness::new();

    let mut too_short = sample_request(Uuid::new_v4());
    too_short.dropoff = Coordinates::new(6.5001, 3.4);

    let mut off_the_map = sample_request(Uuid::new_v4());
    off_the_map.pickup = Coordinates::new(95.0, 3.4);

    let mut free_ride = sample_request(Uuid::new_v4());
    free_ride.estimated_fare = 0.0;

    let mut too_soon = sample_request(Uuid::new_v4());
    too_soon.schedule_time = Some(h.clock.now() + chrono::Duration::minutes(10));

    for request in [too_short, off_the_map, free_ride, too_soon] {
        let err = h.engine.request_ride(request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "got {:?}", err);
    }

    assert!(h.store.active_ride_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn geo_failures_are_retried_then_left_to_the_next_pass() {
    use crate::geo::InMemoryGeoIndex;
    use crate::testing::{settle, FlakyGeoIndex, Harness};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    let drivers = Arc::new(InMemoryGeoIndex::new());
    let flaky = Arc::new(FlakyGeoIndex::new(drivers.clone(), 5));
    let h = Harness::with_geo(drivers, flaky.clone());
    let driver_id = h.add_driver();

    // all three attempts of the first pass fail
    let ride = h.request_ride(Uuid::new_v4()).await;
    assert_eq!(ride.status, RideStatus::Searching);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    // two more failures, then the third attempt of the next pass succeeds
    h.advance(h.engine.config().matching_interval).await;
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 6);

    settle().await;
    assert_eq!(h.notifier.count(driver_id, NotificationEvent::RideRequest), 1);
}

#[tokio::test]
async fn scheduled_rides_wait_for_their_time() {
    use crate::clock::Clock;
    use crate::testing::{sample_request, Harness};

    let h = Harness::new();
    let mut request = sample_request(Uuid::new_v4());
    request.schedule_time = Some(h.clock.now() + chrono::Duration::hours(1));

    let ride = h.engine.request_ride(request).await.unwrap();
    assert_eq!(ride.status, RideStatus::Requested);

    h.advance(Duration::from_secs(59 * 60)).await;
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Requested
    );

    h.advance(Duration::from_secs(60)).await;
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Searching
    );
}

#[tokio::test]
async fn reading_a_ride_never_changes_it() {
    use crate::store::RideStore;
    use crate::testing::Harness;

    let h = Harness::new();
    let ride = h.request_ride(Uuid::new_v4()).await;
    let version = h.store.load(ride.id).await.unwrap().version;

    let first = h.engine.find_ride(ride.id).await.unwrap();
    let second = h.engine.find_ride(ride.id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.store.load(ride.id).await.unwrap().version, version);
}

#[test]
fn retry_backoff_doubles_and_saturates() {
    let base = Duration::from_millis(200);

    assert_eq!(retry_backoff(base, 0), base);
    assert_eq!(retry_backoff(base, 2), Duration::from_millis(800));
    assert_eq!(retry_backoff(base, 40), base * u32::MAX);
    assert_eq!(retry_backoff(Duration::MAX, 1), Duration::MAX);
}
