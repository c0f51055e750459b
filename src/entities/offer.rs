use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Rider,
    Driver,
}

impl Party {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rider => "rider",
            Self::Driver => "driver",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Countered,
    Expired,
}

impl OfferStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Countered => "countered",
            Self::Expired => "expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BargainOffer {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub offered_by: Uuid,
    pub party: Party,
    pub amount: f64,
    pub status: OfferStatus,
    /// The offer that superseded this one.
    pub counter_offer_id: Option<Uuid>,
    pub message: Option<String>,
    pub rejection_reason: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl BargainOffer {
    pub fn new(
        ride_id: Uuid,
        offered_by: Uuid,
        party: Party,
        amount: f64,
        message: Option<String>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ride_id,
            offered_by,
            party,
            amount,
            status: OfferStatus::Pending,
            counter_offer_id: None,
            message,
            rejection_reason: None,
            expires_at,
            created_at: now,
            resolved_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OfferStatus::Pending
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn resolve(&mut self, status: OfferStatus, now: DateTime<Utc>) {
        self.status = status;
        self.resolved_at = Some(now);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OfferDecision {
    Accept,
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    Counter {
        amount: f64,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BargainSummary {
    pub ride_id: Uuid,
    pub total_offers: usize,
    pub pending_offers: usize,
    pub accepted_offers: usize,
    pub rejected_offers: usize,
    pub countered_offers: usize,
    pub expired_offers: usize,
    pub rider_offers: usize,
    pub driver_offers: usize,
    pub bargain_rounds: usize,
    pub agreed_fare: Option<f64>,
    pub estimated_fare: f64,
}

impl BargainSummary {
    pub fn new(
        ride_id: Uuid,
        estimated_fare: f64,
        agreed_fare: Option<f64>,
        offers: &[BargainOffer],
    ) -> Self {
        let count_status = |status: OfferStatus| offers.iter().filter(|o| o.status == status).count();
        let count_party = |party: Party| offers.iter().filter(|o| o.party == party).count();

        let rider_offers = count_party(Party::Rider);
        let driver_offers = count_party(Party::Driver);

        Self {
            ride_id,
            total_offers: offers.len(),
            pending_offers: count_status(OfferStatus::Pending),
            accepted_offers: count_status(OfferStatus::Accepted),
            rejected_offers: count_status(OfferStatus::Rejected),
            countered_offers: count_status(OfferStatus::Countered),
            expired_offers: count_status(OfferStatus::Expired),
            rider_offers,
            driver_offers,
            // a round is one offer from each side
            bargain_rounds: rider_offers.max(driver_offers),
            agreed_fare,
            estimated_fare,
        }
    }
}

#[test]
fn decisions_use_tagged_json() {
    let decision: OfferDecision =
        serde_json::from_str(r#"{"action":"counter","amount":1400.0}"#).unwrap();
    assert_eq!(
        decision,
        OfferDecision::Counter {
            amount: 1400.0,
            message: None
        }
    );

    let decision: OfferDecision = serde_json::from_str(r#"{"action":"accept"}"#).unwrap();
    assert_eq!(decision, OfferDecision::Accept);
}

#[test]
fn summary_counts_rounds_per_side() {
    let now = Utc::now();
    let ride_id = Uuid::new_v4();
    let rider = Uuid::new_v4();
    let driver = Uuid::new_v4();

    let mut first = BargainOffer::new(ride_id, rider, Party::Rider, 1200.0, None, now, now);
    first.resolve(OfferStatus::Countered, now);
    let mut second = BargainOffer::new(ride_id, driver, Party::Driver, 1400.0, None, now, now);
    second.resolve(OfferStatus::Countered, now);
    let third = BargainOffer::new(ride_id, rider, Party::Rider, 1300.0, None, now, now);

    let summary = BargainSummary::new(ride_id, 1500.0, None, &[first, second, third]);

    assert_eq!(summary.total_offers, 3);
    assert_eq!(summary.countered_offers, 2);
    assert_eq!(summary.pending_offers, 1);
    assert_eq!(summary.bargain_rounds, 2);
}
