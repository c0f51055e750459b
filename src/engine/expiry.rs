use super::{Engine, Trigger};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::{
    entities::{OfferStatus, RideStatus},
    error::Error,
    notifier::NotificationEvent,
    scheduler::{ExpiryHandler, ExpiryJob},
};

impl Engine {
    async fn start_scheduled_dispatch(&self, ride_id: Uuid) -> Result<(), Error> {
        if self.load(ride_id).await?.status() != RideStatus::Requested {
            return Ok(());
        }

        self.begin_dispatch(ride_id).await.map(|_| ())
    }

    /// Expires a ride nobody took within the search window. A negotiation
    /// with live offers gets until those offers lapse.
    async fn expire_search(&self, ride_id: Uuid) -> Result<(), Error> {
        let now = self.clock.now();
        let offer_expiry = self.config.offer_expiry;

        self.with_ride(ride_id, |record, effects| {
            match record.status() {
                RideStatus::Bargaining if record.pending_offers().next().is_some() => {
                    tracing::debug!(%ride_id, "offers still pending, deferring search timeout");
                    effects.schedule(offer_expiry, ExpiryJob::SearchTimeout { ride_id });
                    return Ok(());
                }
                status if !status.is_expirable() => return Ok(()),
                _ => {}
            }

            record.apply(
                Trigger::Expire {
                    reason: "no driver found".into(),
                },
                None,
                None,
                now,
            )?;

            Self::notify_unavailable(record, effects, &[]);

            Ok(())
        })
        .await
    }

    async fn expire_offer(&self, ride_id: Uuid, offer_id: Uuid) -> Result<(), Error> {
        let now = self.clock.now();
        let max_rounds = self.config.max_bargain_rounds;

        self.with_ride(ride_id, |record, effects| {
            let offered_by = match record.offer_mut(offer_id) {
                Some(offer) if offer.is_pending() => {
                    offer.resolve(OfferStatus::Expired, now);
                    offer.offered_by
                }
                _ => return Ok(()),
            };

            record.ride.updated_at = now;

            effects.notify(
                offered_by,
                NotificationEvent::OfferExpired,
                json!({ "ride_id": ride_id, "offer_id": offer_id }),
            );

            tracing::info!(%ride_id, %offer_id, "offer expired");

            let settled = record.pending_offers().next().is_none();

            if record.status() == RideStatus::Bargaining && settled && record.rounds_exhausted(max_rounds) {
                record.apply(
                    Trigger::Expire {
                        reason: "bargain rounds exhausted".into(),
                    },
                    None,
                    None,
                    now,
                )?;

                Self::notify_unavailable(record, effects, &[]);
            }

            Ok(())
        })
        .await
    }
}

#[async_trait]
impl ExpiryHandler for Engine {
    #[tracing::instrument(skip(self))]
    async fn fire(&self, job: ExpiryJob) -> Result<(), Error> {
        let result = match job.clone() {
            ExpiryJob::BeginDispatch { ride_id } => self.start_scheduled_dispatch(ride_id).await,
            ExpiryJob::SearchTimeout { ride_id } => self.expire_search(ride_id).await,
            ExpiryJob::OfferExpiry { ride_id, offer_id } => self.expire_offer(ride_id, offer_id).await,
            ExpiryJob::MatchingPass { ride_id } => self.matching_pass(ride_id).await.map(|_| ()),
        };

        match result {
            // the ride kept changing underneath us, try again on the next tick
            Err(Error::Conflict) => {
                tracing::warn!(?job, "expiry job kept losing version races, rescheduling");
                self.scheduler.schedule_in(self.config.scheduler_tick, job);
                Ok(())
            }
            // a person got there first
            Err(err) if err.is_conflict() => {
                tracing::debug!(error = %err, "expiry job lost a race, nothing to do");
                Ok(())
            }
            other => other,
        }
    }
}

#[tokio::test]
async fn unanswered_rides_expire_after_the_search_window() {
    use crate::api::RideAPI;
    use crate::testing::{settle, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let candidate = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    h.advance(h.engine.config().search_timeout).await;

    let expired = h.engine.find_ride(ride.id).await.unwrap();
    assert_eq!(expired.status, RideStatus::Expired);

    let err = h.engine.accept_ride(ride.id, candidate).await.unwrap_err();
    assert!(matches!(err, Error::RideNoLongerAvailable));

    settle().await;
    assert_eq!(h.notifier.count(rider_id, NotificationEvent::RideExpired), 1);
    assert_eq!(h.notifier.count(candidate, NotificationEvent::RideUnavailable), 1);
}

#[tokio::test]
async fn timeout_after_acceptance_changes_nothing() {
    use crate::api::RideAPI;
    use crate::testing::Harness;

    let h = Harness::new();
    let driver_id = h.add_driver();
    let ride = h.request_ride(Uuid::new_v4()).await;

    let accepted = h.engine.accept_ride(ride.id, driver_id).await.unwrap();
    let entries = h.engine.ride_history(ride.id).await.unwrap().len();

    h.advance(h.engine.config().search_timeout).await;
    h.engine
        .fire(ExpiryJob::SearchTimeout { ride_id: ride.id })
        .await
        .unwrap();

    assert_eq!(h.engine.find_ride(ride.id).await.unwrap(), accepted);
    assert_eq!(h.engine.ride_history(ride.id).await.unwrap().len(), entries);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acceptance_racing_the_timeout_settles_one_way() {
    use crate::api::RideAPI;
    use crate::entities::is_valid_walk;
    use crate::testing::Harness;

    for _ in 0..20 {
        let h = Harness::new();
        let driver_id = h.add_driver();
        let ride_id = h.request_ride(Uuid::new_v4()).await.id;

        let accept = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.accept_ride(ride_id, driver_id).await })
        };
        let timeout = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.fire(ExpiryJob::SearchTimeout { ride_id }).await })
        };

        let accepted = accept.await.unwrap();
        timeout.await.unwrap().unwrap();

        let ride = h.engine.find_ride(ride_id).await.unwrap();

        match accepted {
            Ok(_) => assert_eq!(ride.status, RideStatus::DriverAssigned),
            Err(Error::RideNoLongerAvailable) => assert_eq!(ride.status, RideStatus::Expired),
            Err(err) => panic!("unexpected error: {}", err),
        }

        let history = h.engine.ride_history(ride_id).await.unwrap();
        assert!(is_valid_walk(&history));
        assert!(ride.check_invariants().is_ok());
    }
}

#[tokio::test]
async fn live_negotiation_holds_off_the_search_timeout() {
    use crate::api::{BargainAPI, RideAPI};
    use std::time::Duration;
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let ride = h.request_ride(rider_id).await;

    h.advance(Duration::from_secs(250)).await;
    let offer = h
        .engine
        .propose_offer(ride.id, rider_id, 1300.0, None)
        .await
        .unwrap();

    // search window closes while the offer is still open
    h.advance(Duration::from_secs(50)).await;
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Bargaining
    );

    // the offer lapses, the ride stays up for the deferred timeout
    h.advance(Duration::from_secs(70)).await;
    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers[0].id, offer.id);
    assert_eq!(offers[0].status, OfferStatus::Expired);
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Bargaining
    );

    h.advance(Duration::from_secs(50)).await;
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Expired
    );
}

#[tokio::test]
async fn cancelled_scheduled_rides_never_start() {
    use crate::api::RideAPI;
    use crate::clock::Clock;
    use crate::testing::{sample_request, Harness};
    use std::time::Duration;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let mut request = sample_request(rider_id);
    request.schedule_time = Some(h.clock.now() + chrono::Duration::hours(2));

    let ride = h.engine.request_ride(request).await.unwrap();
    h.engine.cancel_ride(ride.id, rider_id, None).await.unwrap();

    assert_eq!(h.advance(Duration::from_secs(2 * 60 * 60)).await, 1);
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Cancelled
    );
}

#[tokio::test]
async fn search_timeout_survives_repeated_version_races() {
    use crate::api::RideAPI;
    use crate::testing::Harness;
    use super::SAVE_ATTEMPTS;

    let h = Harness::new();
    let ride = h.request_ride(Uuid::new_v4()).await;

    h.contention.bump(SAVE_ATTEMPTS as usize);
    let pending = h.engine.scheduler().pending();

    h.engine
        .fire(ExpiryJob::SearchTimeout { ride_id: ride.id })
        .await
        .unwrap();
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Searching
    );
    assert_eq!(h.engine.scheduler().pending(), pending + 1);

    h.advance(h.engine.config().scheduler_tick).await;
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Expired
    );
}
