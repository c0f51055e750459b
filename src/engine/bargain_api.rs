use super::{Effects, Engine, Trigger};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::{
    api::BargainAPI,
    entities::{
        BargainOffer, BargainSummary, OfferDecision, OfferStatus, Party, Ride, RideRecord,
        RideStatus,
    },
    error::Error,
    notifier::NotificationEvent,
    scheduler::ExpiryJob,
};

fn offer_payload(offer: &BargainOffer) -> serde_json::Value {
    json!({
        "ride_id": offer.ride_id,
        "offer_id": offer.id,
        "offered_by": offer.offered_by,
        "party": offer.party,
        "amount": offer.amount,
        "message": offer.message,
        "expires_at": offer.expires_at,
    })
}

impl Engine {
    /// Works out which side of the negotiation `actor_id` is on. Drivers
    /// must be eligible to negotiate; the check runs outside the ride lock.
    async fn negotiating_party(
        &self,
        rider_id: Uuid,
        actor_id: Uuid,
        check_eligibility: bool,
    ) -> Result<Party, Error> {
        if actor_id == rider_id {
            return Ok(Party::Rider);
        }

        if check_eligibility && !self.geo.is_driver_eligible(actor_id).await? {
            tracing::info!(%actor_id, "driver is not eligible to negotiate");
            return Err(Error::DriverNotEligible);
        }

        Ok(Party::Driver)
    }

    fn check_offer_amount(&self, estimated_fare: f64, amount: f64) -> Result<(), Error> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(Error::invalid_input("offer amount must be a positive number"));
        }

        let (min, max) = self.config.offer_bounds(estimated_fare);

        if amount < min || amount > max {
            return Err(Error::OfferOutOfBounds { amount, min, max });
        }

        Ok(())
    }

    /// Adds a pending offer to the chain. `countering` names the offer it
    /// answers; without it the newest pending offer from the other side is
    /// superseded, if there is one.
    #[allow(clippy::too_many_arguments)]
    fn place_offer(
        &self,
        record: &mut RideRecord,
        effects: &mut Effects,
        actor_id: Uuid,
        party: Party,
        amount: f64,
        message: Option<String>,
        countering: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<BargainOffer, Error> {
        let status = record.status();

        if !status.is_open() {
            return Err(Error::InvalidRideState(status));
        }

        if record.rounds_exhausted(self.config.max_bargain_rounds) {
            return Err(Error::BargainRoundsExhausted);
        }

        if record.has_pending_offer_from(actor_id) {
            return Err(Error::DuplicateOffer);
        }

        let expires_at = now
            + chrono::Duration::from_std(self.config.offer_expiry)
                .map_err(|_| Error::Config("offer expiry is out of range".into()))?;

        let offer = BargainOffer::new(record.id(), actor_id, party, amount, message, now, expires_at);

        let opposite = match party {
            Party::Rider => Party::Driver,
            Party::Driver => Party::Rider,
        };
        let superseded = countering.or_else(|| record.latest_pending_from(opposite));

        let mut recipients = vec![];

        if let Some(previous) = superseded.and_then(|id| record.offer_mut(id)) {
            previous.resolve(OfferStatus::Countered, now);
            previous.counter_offer_id = Some(offer.id);
            recipients.push(previous.offered_by);
        }

        if status == RideStatus::Searching {
            record.apply(
                Trigger::StartBargaining,
                Some(actor_id),
                Some(json!({ "offer_id": offer.id, "amount": amount })),
                now,
            )?;
        }

        record.ride.updated_at = now;
        record.offers.push(offer.clone());

        if recipients.is_empty() {
            recipients = match party {
                Party::Driver => vec![record.ride.rider_id],
                Party::Rider => record.interested_drivers(),
            };
        }

        for user_id in recipients {
            effects.notify(user_id, NotificationEvent::OfferReceived, offer_payload(&offer));
        }

        effects.schedule(
            self.config.offer_expiry,
            ExpiryJob::OfferExpiry {
                ride_id: record.id(),
                offer_id: offer.id,
            },
        );

        tracing::info!(
            ride_id = %record.id(),
            offer_id = %offer.id,
            party = party.name(),
            amount,
            countered = ?superseded,
            "offer placed"
        );

        Ok(offer)
    }
}

#[async_trait]
impl BargainAPI for Engine {
    #[tracing::instrument(skip(self))]
    async fn propose_offer(
        &self,
        ride_id: Uuid,
        actor_id: Uuid,
        amount: f64,
        message: Option<String>,
    ) -> Result<BargainOffer, Error> {
        let snapshot = self.load(ride_id).await?;

        self.check_offer_amount(snapshot.ride.estimated_fare, amount)?;

        if !snapshot.status().is_open() {
            return Err(Error::InvalidRideState(snapshot.status()));
        }

        let party = self
            .negotiating_party(snapshot.ride.rider_id, actor_id, true)
            .await?;
        let now = self.clock.now();

        self.with_ride(ride_id, |record, effects| {
            self.place_offer(record, effects, actor_id, party, amount, message.clone(), None, now)
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn respond_to_offer(
        &self,
        offer_id: Uuid,
        actor_id: Uuid,
        decision: OfferDecision,
    ) -> Result<Ride, Error> {
        let ride_id = self.store.find_ride_id_by_offer(offer_id).await?;
        let snapshot = self.load(ride_id).await?;

        if let OfferDecision::Counter { amount, .. } = &decision {
            self.check_offer_amount(snapshot.ride.estimated_fare, *amount)?;
        }

        let rejecting = matches!(decision, OfferDecision::Reject { .. });
        let party = self
            .negotiating_party(snapshot.ride.rider_id, actor_id, !rejecting)
            .await?;

        // a rider accepting a driver's offer assigns that driver, who may
        // have taken another ride since offering
        if let (OfferDecision::Accept, Some(offer)) = (&decision, snapshot.offer(offer_id)) {
            if offer.party == Party::Driver
                && offer.offered_by != actor_id
                && !self.geo.is_driver_eligible(offer.offered_by).await?
            {
                tracing::info!(
                    %offer_id,
                    driver_id = %offer.offered_by,
                    "offering driver is no longer eligible"
                );
                return Err(Error::DriverNotEligible);
            }
        }

        let now = self.clock.now();
        let max_rounds = self.config.max_bargain_rounds;

        self.with_ride(ride_id, |record, effects| {
            let offer = record
                .offer(offer_id)
                .cloned()
                .ok_or_else(|| Error::not_found("offer", offer_id))?;

            if !offer.is_pending() || offer.is_expired_at(now) || !record.status().is_open() {
                tracing::info!(%offer_id, status = offer.status.name(), "offer is no longer pending");
                return Err(Error::OfferNoLongerPending);
            }

            if offer.party == party {
                return Err(Error::InvalidActor);
            }

            // only drivers the ride was offered to may turn the rider down
            if rejecting
                && party == Party::Driver
                && !record.interested_drivers().contains(&actor_id)
            {
                return Err(Error::InvalidActor);
            }

            match decision.clone() {
                OfferDecision::Accept => {
                    let driver_id = match offer.party {
                        Party::Driver => offer.offered_by,
                        Party::Rider => actor_id,
                    };

                    if let Some(accepted) = record.offer_mut(offer_id) {
                        accepted.resolve(OfferStatus::Accepted, now);
                    }

                    record.apply(
                        Trigger::Accept {
                            driver_id,
                            agreed_fare: Some(offer.amount),
                        },
                        Some(actor_id),
                        Some(json!({ "offer_id": offer_id })),
                        now,
                    )?;
                    record.apply(Trigger::ConfirmAssignment, None, None, now)?;

                    effects.notify(
                        offer.offered_by,
                        NotificationEvent::OfferAccepted,
                        offer_payload(&offer),
                    );

                    Self::notify_unavailable(record, effects, &[driver_id]);
                }
                OfferDecision::Reject { reason } => {
                    if let Some(rejected) = record.offer_mut(offer_id) {
                        rejected.resolve(OfferStatus::Rejected, now);
                        rejected.rejection_reason = reason.clone();
                    }
                    record.ride.updated_at = now;

                    effects.notify(
                        offer.offered_by,
                        NotificationEvent::OfferRejected,
                        json!({ "ride_id": ride_id, "offer_id": offer_id, "reason": reason }),
                    );

                    if record.rounds_exhausted(max_rounds) && record.pending_offers().next().is_none() {
                        record.apply(
                            Trigger::Expire {
                                reason: "bargain rounds exhausted".into(),
                            },
                            None,
                            None,
                            now,
                        )?;
                    }
                }
                OfferDecision::Counter { amount, message } => {
                    self.place_offer(
                        record,
                        effects,
                        actor_id,
                        party,
                        amount,
                        message,
                        Some(offer_id),
                        now,
                    )?;
                }
            }

            Ok(record.ride.clone())
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    async fn list_offers(&self, ride_id: Uuid) -> Result<Vec<BargainOffer>, Error> {
        Ok(self.load(ride_id).await?.offers)
    }

    #[tracing::instrument(skip(self))]
    async fn bargain_summary(&self, ride_id: Uuid) -> Result<BargainSummary, Error> {
        Ok(self.load(ride_id).await?.summary())
    }
}

#[tokio::test]
async fn negotiated_fare_carries_through_to_completion() {
    use crate::api::RideAPI;
    use crate::entities::is_valid_walk;
    use crate::testing::{settle, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let offer = h
        .engine
        .propose_offer(ride.id, rider_id, 1200.0, Some("short hop".into()))
        .await
        .unwrap();
    assert_eq!(offer.status, OfferStatus::Pending);
    assert_eq!(offer.party, Party::Rider);
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Bargaining
    );

    let ride = h
        .engine
        .respond_to_offer(offer.id, driver_id, OfferDecision::Accept)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::DriverAssigned);
    assert_eq!(ride.driver_id, Some(driver_id));
    assert_eq!(ride.agreed_fare, Some(1200.0));
    assert_eq!(ride.final_fare, None);

    for status in [
        RideStatus::DriverArrived,
        RideStatus::InProgress,
        RideStatus::Completed,
    ] {
        h.engine
            .advance_trip_status(ride.id, driver_id, status)
            .await
            .unwrap();
    }

    let ride = h.engine.find_ride(ride.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Completed);
    assert_eq!(ride.final_fare, Some(1200.0));

    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers[0].status, OfferStatus::Accepted);
    assert!(offers[0].resolved_at.is_some());

    let history = h.engine.ride_history(ride.id).await.unwrap();
    assert!(is_valid_walk(&history));
    assert!(history
        .iter()
        .any(|entry| entry.new_status == RideStatus::Bargaining));

    settle().await;
    assert_eq!(h.notifier.count(driver_id, NotificationEvent::OfferReceived), 1);
    assert_eq!(h.notifier.count(rider_id, NotificationEvent::OfferAccepted), 1);
}

#[tokio::test]
async fn driver_counter_supersedes_the_rider_offer() {
    use crate::testing::{settle, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let first = h
        .engine
        .propose_offer(ride.id, rider_id, 1200.0, None)
        .await
        .unwrap();
    let counter = h
        .engine
        .propose_offer(ride.id, driver_id, 1400.0, None)
        .await
        .unwrap();

    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers.len(), 2);
    assert_eq!(offers[0].id, first.id);
    assert_eq!(offers[0].status, OfferStatus::Countered);
    assert_eq!(offers[0].counter_offer_id, Some(counter.id));
    assert_eq!(offers[1].status, OfferStatus::Pending);
    assert_eq!(offers[1].amount, 1400.0);
    assert_eq!(offers[1].party, Party::Driver);

    let summary = h.engine.bargain_summary(ride.id).await.unwrap();
    assert_eq!(summary.total_offers, 2);
    assert_eq!(summary.pending_offers, 1);
    assert_eq!(summary.rider_offers, 1);
    assert_eq!(summary.driver_offers, 1);
    assert_eq!(summary.countered_offers, 1);
    assert_eq!(summary.bargain_rounds, 1);

    settle().await;
    assert_eq!(h.notifier.count(rider_id, NotificationEvent::OfferReceived), 1);
}

#[tokio::test]
async fn out_of_bounds_offers_leave_the_ride_alone() {
    use crate::api::RideAPI;
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let ride = h.request_ride(rider_id).await;

    let err = h
        .engine
        .propose_offer(ride.id, rider_id, 1500.0 * 3.5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OfferOutOfBounds { .. }));

    let err = h
        .engine
        .propose_offer(ride.id, rider_id, 1500.0 * 0.4, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OfferOutOfBounds { .. }));

    let err = h
        .engine
        .propose_offer(ride.id, rider_id, f64::NAN, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert!(h.engine.list_offers(ride.id).await.unwrap().is_empty());
    assert_eq!(
        h.engine.find_ride(ride.id).await.unwrap().status,
        RideStatus::Searching
    );
}

#[tokio::test]
async fn parties_cannot_answer_their_own_offers() {
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let offer = h
        .engine
        .propose_offer(ride.id, driver_id, 1600.0, None)
        .await
        .unwrap();

    let err = h
        .engine
        .respond_to_offer(offer.id, driver_id, OfferDecision::Accept)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidActor));

    // another driver is on the same side of the table
    let rival = h.add_driver();
    let err = h
        .engine
        .respond_to_offer(offer.id, rival, OfferDecision::Accept)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidActor));

    let err = h
        .engine
        .propose_offer(ride.id, driver_id, 1550.0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateOffer));

    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers.len(), 1);
    assert!(offers[0].is_pending());
}

#[tokio::test]
async fn accepting_a_busy_drivers_offer_is_refused() {
    use crate::api::RideAPI;
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let negotiating = h.request_ride(rider_id).await;
    let elsewhere = h.request_ride(Uuid::new_v4()).await;

    let offer = h
        .engine
        .propose_offer(negotiating.id, driver_id, 1600.0, None)
        .await
        .unwrap();

    // the driver takes another ride while the offer is still open
    h.engine.accept_ride(elsewhere.id, driver_id).await.unwrap();

    let err = h
        .engine
        .respond_to_offer(offer.id, rider_id, OfferDecision::Accept)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DriverNotEligible));

    let ride = h.engine.find_ride(negotiating.id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Bargaining);
    assert_eq!(ride.driver_id, None);
    assert!(h.engine.list_offers(negotiating.id).await.unwrap()[0].is_pending());

    assert_eq!(
        h.engine.find_ride(elsewhere.id).await.unwrap().driver_id,
        Some(driver_id)
    );
}

#[tokio::test]
async fn only_offered_drivers_can_reject_the_rider() {
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let candidate = h.add_driver();
    let ride = h.request_ride(rider_id).await;
    let latecomer = h.add_driver();

    let offer = h
        .engine
        .propose_offer(ride.id, rider_id, 1300.0, None)
        .await
        .unwrap();

    for outsider in [Uuid::new_v4(), latecomer] {
        let err = h
            .engine
            .respond_to_offer(offer.id, outsider, OfferDecision::Reject { reason: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidActor));
    }
    assert!(h.engine.list_offers(ride.id).await.unwrap()[0].is_pending());

    h.engine
        .respond_to_offer(
            offer.id,
            candidate,
            OfferDecision::Reject {
                reason: Some("too far".into()),
            },
        )
        .await
        .unwrap();

    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers[0].status, OfferStatus::Rejected);
    assert_eq!(offers[0].rejection_reason.as_deref(), Some("too far"));
}

#[tokio::test]
async fn rejecting_the_last_round_expires_the_ride() {
    use crate::api::RideAPI;
    use crate::config::DispatchConfig;
    use crate::testing::{test_config, Harness};

    let h = Harness::with_config(DispatchConfig {
        max_bargain_rounds: 2,
        ..test_config()
    });
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let opening = h
        .engine
        .propose_offer(ride.id, rider_id, 1200.0, None)
        .await
        .unwrap();

    let ride_after_counter = h
        .engine
        .respond_to_offer(
            opening.id,
            driver_id,
            OfferDecision::Counter {
                amount: 1450.0,
                message: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(ride_after_counter.status, RideStatus::Bargaining);

    let err = h
        .engine
        .propose_offer(ride.id, rider_id, 1300.0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BargainRoundsExhausted));

    let counter = h.engine.list_offers(ride.id).await.unwrap()[1].clone();
    let ride = h
        .engine
        .respond_to_offer(
            counter.id,
            rider_id,
            OfferDecision::Reject {
                reason: Some("too expensive".into()),
            },
        )
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Expired);

    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers[1].status, OfferStatus::Rejected);
    assert_eq!(offers[1].rejection_reason.as_deref(), Some("too expensive"));

    let err = h.engine.accept_ride(ride.id, driver_id).await.unwrap_err();
    assert!(matches!(err, Error::RideNoLongerAvailable));
}

#[tokio::test]
async fn lapsed_offers_cannot_be_accepted() {
    use crate::testing::{settle, Harness};

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let driver_id = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let offer = h
        .engine
        .propose_offer(ride.id, rider_id, 1300.0, None)
        .await
        .unwrap();

    h.advance(h.engine.config().offer_expiry).await;

    let err = h
        .engine
        .respond_to_offer(offer.id, driver_id, OfferDecision::Accept)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OfferNoLongerPending));

    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers[0].status, OfferStatus::Expired);

    settle().await;
    assert_eq!(h.notifier.count(rider_id, NotificationEvent::OfferExpired), 1);
}

#[tokio::test]
async fn offers_are_closed_once_a_driver_is_assigned() {
    use crate::api::RideAPI;
    use crate::testing::Harness;

    let h = Harness::new();
    let rider_id = Uuid::new_v4();
    let first = h.add_driver();
    let second = h.add_driver();
    let ride = h.request_ride(rider_id).await;

    let pending = h
        .engine
        .propose_offer(ride.id, second, 1700.0, None)
        .await
        .unwrap();

    h.engine.accept_ride(ride.id, first).await.unwrap();

    let err = h
        .engine
        .propose_offer(ride.id, rider_id, 1300.0, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidRideState(RideStatus::DriverAssigned)
    ));

    // the losing driver's offer was closed by the acceptance
    let offers = h.engine.list_offers(ride.id).await.unwrap();
    assert_eq!(offers[0].id, pending.id);
    assert_eq!(offers[0].status, OfferStatus::Rejected);

    let err = h
        .engine
        .respond_to_offer(pending.id, rider_id, OfferDecision::Accept)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OfferNoLongerPending));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accept_and_counter_race_for_the_same_offer() {
    use crate::testing::Harness;

    for _ in 0..20 {
        let h = Harness::new();
        let rider_id = Uuid::new_v4();
        let accepting = h.add_driver();
        let countering = h.add_driver();
        let ride_id = h.request_ride(rider_id).await.id;

        let offer_id = h
            .engine
            .propose_offer(ride_id, rider_id, 1300.0, None)
            .await
            .unwrap()
            .id;

        let accept = {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .respond_to_offer(offer_id, accepting, OfferDecision::Accept)
                    .await
            })
        };
        let counter = {
            let engine = h.engine.clone();
            tokio::spawn(async move {
                engine
                    .respond_to_offer(
                        offer_id,
                        countering,
                        OfferDecision::Counter {
                            amount: 1450.0,
                            message: None,
                        },
                    )
                    .await
            })
        };

        let results = [accept.await.unwrap(), counter.await.unwrap()];
        let won = results.iter().filter(|result| result.is_ok()).count();
        let lost = results
            .iter()
            .filter(|result| matches!(result, Err(Error::OfferNoLongerPending)))
            .count();

        assert_eq!((won, lost), (1, 1));

        let offers = h.engine.list_offers(ride_id).await.unwrap();
        assert!(matches!(
            offers[0].status,
            OfferStatus::Accepted | OfferStatus::Countered
        ));
    }
}
