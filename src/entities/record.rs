use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::entities::{
    BargainOffer, BargainSummary, HistoryEventType, Party, Ride, RideHistoryEntry, RideStatus,
};

/// Everything stored under one ride id: the ride, its offer chain, its
/// history log and the drivers it was broadcast to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RideRecord {
    pub ride: Ride,
    pub offers: Vec<BargainOffer>,
    pub history: Vec<RideHistoryEntry>,
    pub candidates: Vec<Uuid>,
    /// Bumped on every committed write.
    pub version: u64,
}

impl RideRecord {
    pub fn new(ride: Ride, now: DateTime<Utc>) -> Self {
        let creation = RideHistoryEntry {
            ride_id: ride.id,
            seq: 0,
            event_type: HistoryEventType::StatusChange,
            previous_status: None,
            new_status: RideStatus::Requested,
            actor_id: Some(ride.rider_id),
            driver_id: None,
            payload: Some(json!({ "estimated_fare": ride.estimated_fare })),
            timestamp: now,
        };

        Self {
            ride,
            offers: vec![],
            history: vec![creation],
            candidates: vec![],
            version: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.ride.id
    }

    pub fn status(&self) -> RideStatus {
        self.ride.status
    }

    pub fn next_seq(&self) -> u64 {
        self.history.len() as u64
    }

    pub fn offer(&self, offer_id: Uuid) -> Option<&BargainOffer> {
        self.offers.iter().find(|offer| offer.id == offer_id)
    }

    pub fn offer_mut(&mut self, offer_id: Uuid) -> Option<&mut BargainOffer> {
        self.offers.iter_mut().find(|offer| offer.id == offer_id)
    }

    pub fn pending_offers(&self) -> impl Iterator<Item = &BargainOffer> {
        self.offers.iter().filter(|offer| offer.is_pending())
    }

    pub fn has_pending_offer_from(&self, actor_id: Uuid) -> bool {
        self.pending_offers().any(|offer| offer.offered_by == actor_id)
    }

    /// Most recent pending offer made by `party`.
    pub fn latest_pending_from(&self, party: Party) -> Option<Uuid> {
        self.offers
            .iter()
            .rev()
            .find(|offer| offer.is_pending() && offer.party == party)
            .map(|offer| offer.id)
    }

    pub fn rounds_exhausted(&self, max_rounds: usize) -> bool {
        self.offers.len() >= max_rounds
    }

    /// Drivers who were shown the ride or negotiated on it.
    pub fn interested_drivers(&self) -> Vec<Uuid> {
        let mut drivers = self.candidates.clone();

        for offer in self.offers.iter().filter(|o| o.party == Party::Driver) {
            if !drivers.contains(&offer.offered_by) {
                drivers.push(offer.offered_by);
            }
        }

        drivers
    }

    /// Adds drivers not seen before and returns them.
    pub fn add_candidates(&mut self, drivers: impl IntoIterator<Item = Uuid>) -> Vec<Uuid> {
        let mut added = vec![];

        for driver_id in drivers {
            if !self.candidates.contains(&driver_id) {
                self.candidates.push(driver_id);
                added.push(driver_id);
            }
        }

        added
    }

    pub fn summary(&self) -> BargainSummary {
        BargainSummary::new(
            self.ride.id,
            self.ride.estimated_fare,
            self.ride.agreed_fare.or(self.ride.final_fare),
            &self.offers,
        )
    }
}
