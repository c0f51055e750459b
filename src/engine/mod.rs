mod bargain_api;
mod dispatch_api;
mod expiry;
mod hooks;
mod locks;
mod state_machine;

pub use hooks::{NotificationHook, TransitionEvent, TransitionHook};
pub use locks::RideLocks;
pub use state_machine::Trigger;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    api::API,
    clock::Clock,
    config::DispatchConfig,
    entities::{Ride, RideHistoryEntry, RideRecord, RideStatus},
    error::Error,
    geo::GeoIndex,
    notifier::{dispatch, Notification, NotificationEvent, Notifier},
    scheduler::{ExpiryHandler, ExpiryJob, ExpiryScheduler},
    store::RideStore,
};

/// Work queued by an operation while it holds a ride's lock, carried out
/// only once the operation has committed.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    notifications: Vec<Notification>,
    jobs: Vec<(Duration, ExpiryJob)>,
}

impl Effects {
    pub(crate) fn notify(&mut self, user_id: Uuid, event: NotificationEvent, payload: Value) {
        self.notifications
            .push(Notification::new(user_id, event, payload));
    }

    pub(crate) fn schedule(&mut self, delay: Duration, job: ExpiryJob) {
        self.jobs.push((delay, job));
    }
}

/// Time left until `at`, zero if it already passed.
pub(crate) fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// How many times a write that lost a version race is re-run.
pub(crate) const SAVE_ATTEMPTS: u32 = 3;

pub struct Engine {
    config: DispatchConfig,
    store: Arc<dyn RideStore>,
    geo: Arc<dyn GeoIndex>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<ExpiryScheduler>,
    locks: RideLocks,
    hooks: Vec<Arc<dyn TransitionHook>>,
    quarantine: Mutex<HashSet<Uuid>>,
}

impl Engine {
    #[tracing::instrument(name = "Engine::new", skip_all)]
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn RideStore>,
        geo: Arc<dyn GeoIndex>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let scheduler = Arc::new(ExpiryScheduler::new(clock.clone()));
        let notifications: Arc<dyn TransitionHook> =
            Arc::new(NotificationHook::new(notifier.clone()));

        Self {
            config,
            store,
            geo,
            notifier,
            clock,
            scheduler,
            locks: RideLocks::new(),
            hooks: vec![notifications],
            quarantine: Mutex::new(HashSet::new()),
        }
    }

    /// Registers a hook to run after every committed transition.
    pub fn with_hook(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<ExpiryScheduler> {
        &self.scheduler
    }

    /// Starts firing expiry jobs in the background until `shutdown` fires.
    pub fn spawn_scheduler(self: &Arc<Self>, shutdown: async_channel::Receiver<()>) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let handler = self.clone() as Arc<dyn ExpiryHandler>;
        let tick = self.config.scheduler_tick;

        tokio::spawn(async move { scheduler.run(handler, tick, shutdown).await })
    }

    fn is_quarantined(&self, ride_id: Uuid) -> bool {
        self.quarantine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&ride_id)
    }

    fn quarantine(&self, ride_id: Uuid) {
        tracing::error!(%ride_id, "ride quarantined, refusing further processing");

        self.quarantine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ride_id);
    }

    /// Loads a ride and verifies its invariants. A corrupted ride is
    /// quarantined for the lifetime of the process.
    pub(crate) async fn load(&self, ride_id: Uuid) -> Result<RideRecord, Error> {
        if self.is_quarantined(ride_id) {
            return Err(Error::CorruptedRide(ride_id));
        }

        let record = self.store.load(ride_id).await?;

        if let Err(err) = record.ride.check_invariants() {
            self.quarantine(ride_id);
            return Err(err);
        }

        Ok(record)
    }

    /// Runs `f` against the ride while holding its lock and persists the
    /// result if `f` changed anything.
    ///
    /// Nothing is written when `f` fails. A save that loses to a concurrent
    /// writer reloads the ride and runs `f` again against the fresh copy, up
    /// to [`SAVE_ATTEMPTS`] times. Hooks, jobs and notifications run only
    /// after the lock is released.
    pub(crate) async fn with_ride<T, F>(&self, ride_id: Uuid, mut f: F) -> Result<T, Error>
    where
        F: FnMut(&mut RideRecord, &mut Effects) -> Result<T, Error>,
    {
        let guard = self.locks.lock(ride_id).await;
        let mut attempt = 1;

        let (record, value, committed, effects) = loop {
            let mut record = self.load(ride_id).await?;
            let before = record.clone();
            let mut effects = Effects::default();

            let value = f(&mut record, &mut effects)?;

            if record == before {
                break (record, value, vec![], effects);
            }

            record.ride.check_invariants()?;
            record.version = before.version + 1;

            match self.store.save(&record, before.version).await {
                Ok(()) => {
                    let committed = record.history[before.history.len()..].to_vec();
                    break (record, value, committed, effects);
                }
                Err(Error::Conflict) if attempt < SAVE_ATTEMPTS => {
                    tracing::debug!(%ride_id, attempt, "ride changed underneath us, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        drop(guard);

        if record.status().is_terminal() {
            self.locks.forget(ride_id);
        }

        self.after_commit(&record.ride, committed, effects).await;

        Ok(value)
    }

    async fn after_commit(&self, ride: &Ride, entries: Vec<RideHistoryEntry>, effects: Effects) {
        for entry in entries {
            let event = TransitionEvent {
                ride: ride.clone(),
                entry,
            };

            for hook in self.hooks.iter() {
                if let Err(err) = hook.on_transition(&event).await {
                    tracing::warn!(
                        hook = hook.name(),
                        ride_id = %ride.id,
                        status = %event.status(),
                        error = %err,
                        "transition hook failed"
                    );
                }
            }
        }

        for (delay, job) in effects.jobs {
            self.scheduler.schedule_in(delay, job);
        }

        dispatch(&self.notifier, effects.notifications);
    }

    /// Re-registers the jobs of every unfinished ride, for use after a
    /// restart. Returns the number of jobs scheduled.
    #[tracing::instrument(skip(self))]
    pub async fn restore_schedule(&self) -> Result<usize, Error> {
        let now = self.clock.now();
        let before = self.scheduler.pending();

        for ride_id in self.store.active_ride_ids().await? {
            let record = match self.load(ride_id).await {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(%ride_id, error = %err, "skipping ride while restoring schedule");
                    continue;
                }
            };

            let ride = &record.ride;

            match ride.status {
                RideStatus::Requested => {
                    let delay = ride.schedule_time.map_or(Duration::ZERO, |at| until(now, at));
                    self.scheduler
                        .schedule_in(delay, ExpiryJob::BeginDispatch { ride_id });
                }
                RideStatus::Searching | RideStatus::Bargaining => {
                    let delay = ride.search_deadline.map_or(Duration::ZERO, |at| until(now, at));
                    self.scheduler
                        .schedule_in(delay, ExpiryJob::SearchTimeout { ride_id });
                    self.scheduler
                        .schedule_in(Duration::ZERO, ExpiryJob::MatchingPass { ride_id });

                    for offer in record.pending_offers() {
                        self.scheduler.schedule_in(
                            until(now, offer.expires_at),
                            ExpiryJob::OfferExpiry {
                                ride_id,
                                offer_id: offer.id,
                            },
                        );
                    }
                }
                _ => {}
            }
        }

        let restored = self.scheduler.pending().saturating_sub(before);
        tracing::info!(restored, "expiry schedule restored");

        Ok(restored)
    }
}

impl API for Engine {}

#[tokio::test]
async fn corrupted_rides_are_quarantined() {
    use crate::api::RideAPI;
    use crate::testing::{sample_request, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let now = h.clock.now();

    // a trip in progress with nobody driving it
    let mut ride = Ride::new(sample_request(rider_id), 15.6, now);
    ride.status = RideStatus::InProgress;
    let record = RideRecord::new(ride, now);
    let ride_id = record.id();

    h.store.insert(&record).await.unwrap();

    let err = h.engine.find_ride(ride_id).await.unwrap_err();
    assert!(matches!(err, Error::CorruptedRide(id) if id == ride_id));

    let err = h.engine.cancel_ride(ride_id, rider_id, None).await.unwrap_err();
    assert!(matches!(err, Error::CorruptedRide(_)));

    // other rides are unaffected
    let healthy = h.request_ride(Uuid::new_v4()).await;
    assert_eq!(healthy.status, RideStatus::Searching);
}

#[tokio::test]
async fn failed_deliveries_do_not_undo_transitions() {
    use crate::api::RideAPI;
    use crate::testing::{settle, BrokenNotifier, Harness};

    let h = Harness::with_notifier(Arc::new(BrokenNotifier));
    let driver_id = h.add_driver();
    let ride = h.request_ride(Uuid::new_v4()).await;

    let ride = h.engine.accept_ride(ride.id, driver_id).await.unwrap();
    assert_eq!(ride.status, RideStatus::DriverAssigned);

    settle().await;
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::DriverAssigned
    );
}

#[tokio::test]
async fn failing_hooks_are_logged_and_skipped() {
    use crate::api::RideAPI;
    use crate::testing::{sample_request, test_config, RecordingNotifier};
    use crate::clock::ManualClock;
    use crate::geo::InMemoryGeoIndex;
    use crate::store::MemoryRideStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FailingHook {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TransitionHook for FailingHook {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn on_transition(&self, _: &TransitionEvent) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::upstream("hook exploded"))
        }
    }

    let hook = Arc::new(FailingHook::default());
    let engine = Engine::new(
        test_config(),
        Arc::new(MemoryRideStore::new()),
        Arc::new(InMemoryGeoIndex::new()),
        Arc::new(RecordingNotifier::default()),
        Arc::new(ManualClock::new(Utc::now())),
    )
    .with_hook(hook.clone());

    let ride = engine
        .request_ride(sample_request(Uuid::new_v4()))
        .await
        .unwrap();

    assert_eq!(ride.status, RideStatus::Searching);
    // creation and the start of the search
    assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn restored_schedule_covers_every_open_ride() {
    use crate::api::BargainAPI;
    use crate::testing::{sample_request, Harness};
    use crate::api::RideAPI;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();

    let searching = h.request_ride(rider_id).await;
    h.engine
        .propose_offer(searching.id, rider_id, 1300.0, None)
        .await
        .unwrap();

    let mut request = sample_request(Uuid::new_v4());
    request.schedule_time = Some(h.clock.now() + chrono::Duration::hours(1));
    h.engine.request_ride(request).await.unwrap();

    let finished = h.request_ride(Uuid::new_v4()).await;
    h.engine
        .cancel_ride(finished.id, finished.rider_id, None)
        .await
        .unwrap();

    // search timeout, matching pass and offer expiry for the negotiation,
    // plus the scheduled start
    assert_eq!(h.engine.restore_schedule().await.unwrap(), 4);
}

#[tokio::test]
async fn writes_that_lose_a_version_race_are_retried() {
    use crate::api::RideAPI;
    use crate::entities::is_valid_walk;
    use crate::testing::Harness;

    let h = Harness::new();
    let driver_id = h.add_driver();
    let ride = h.request_ride(Uuid::new_v4()).await;

    h.contention.bump(SAVE_ATTEMPTS as usize - 1);

    let ride = h.engine.accept_ride(ride.id, driver_id).await.unwrap();
    assert_eq!(ride.status, RideStatus::DriverAssigned);
    assert_eq!(h.contention.pending(), 0);

    let history = h.engine.ride_history(ride.id).await.unwrap();
    assert!(is_valid_walk(&history));
}

#[tokio::test]
async fn accept_that_loses_to_another_writer_sees_the_ride_taken() {
    use crate::api::RideAPI;
    use crate::testing::Harness;

    let h = Harness::new();
    let first = h.add_driver();
    let second = h.add_driver();
    let ride = h.request_ride(Uuid::new_v4()).await;
    let now = h.clock.now();

    // another instance assigns the first driver while we hold our lock
    h.contention.interfere(move |record| {
        record
            .apply(
                Trigger::Accept {
                    driver_id: first,
                    agreed_fare: None,
                },
                Some(first),
                None,
                now,
            )
            .unwrap();
        record
            .apply(Trigger::ConfirmAssignment, None, None, now)
            .unwrap();
    });

    let err = h.engine.accept_ride(ride.id, second).await.unwrap_err();
    assert!(matches!(err, Error::RideNoLongerAvailable));

    let ride = h.engine.find_ride(ride.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::DriverAssigned);
    assert_eq!(ride.driver_id, Some(first));
}
