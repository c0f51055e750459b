use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::{
    BargainOffer, BargainSummary, OfferDecision, Ride, RideHistoryEntry, RideRequest, RideStatus,
};
use crate::error::Error;

#[async_trait]
pub trait RideAPI {
    async fn request_ride(&self, request: RideRequest) -> Result<Ride, Error>;

    async fn find_ride(&self, id: Uuid) -> Result<Ride, Error>;

    async fn ride_history(&self, id: Uuid) -> Result<Vec<RideHistoryEntry>, Error>;

    async fn accept_ride(&self, id: Uuid, driver_id: Uuid) -> Result<Ride, Error>;

    async fn cancel_ride(
        &self,
        id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Ride, Error>;

    async fn advance_trip_status(
        &self,
        id: Uuid,
        actor_id: Uuid,
        status: RideStatus,
    ) -> Result<Ride, Error>;
}

#[async_trait]
pub trait BargainAPI {
    async fn propose_offer(
        &self,
        ride_id: Uuid,
        actor_id: Uuid,
        amount: f64,
        message: Option<String>,
    ) -> Result<BargainOffer, Error>;

    async fn respond_to_offer(
        &self,
        offer_id: Uuid,
        actor_id: Uuid,
        decision: OfferDecision,
    ) -> Result<Ride, Error>;

    async fn list_offers(&self, ride_id: Uuid) -> Result<Vec<BargainOffer>, Error>;

    async fn bargain_summary(&self, ride_id: Uuid) -> Result<BargainSummary, Error>;
}

pub trait API: RideAPI + BargainAPI {}

pub type DynAPI = Arc<dyn API + Send + Sync>;
