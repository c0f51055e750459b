use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::entities::{Ride, RideHistoryEntry, RideRequest, RideStatus};
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct AcceptParams {
    driver_id: Uuid,
}

#[derive(Serialize, Deserialize)]
pub struct CancelParams {
    actor_id: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StatusParams {
    actor_id: Uuid,
    status: RideStatus,
}

pub async fn create(
    Extension(api): Extension<DynAPI>,
    Json(request): Json<RideRequest>,
) -> Result<Json<Ride>, Error> {
    let ride = api.request_ride(request).await?;

    Ok(ride.into())
}

pub async fn find(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, Error> {
    let ride = api.find_ride(id).await?;

    Ok(ride.into())
}

pub async fn history(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<RideHistoryEntry>>, Error> {
    let history = api.ride_history(id).await?;

    Ok(history.into())
}

pub async fn accept(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<AcceptParams>,
) -> Result<Json<Ride>, Error> {
    let ride = api.accept_ride(id, params.driver_id).await?;

    Ok(ride.into())
}

pub async fn cancel(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<CancelParams>,
) -> Result<Json<Ride>, Error> {
    let ride = api.cancel_ride(id, params.actor_id, params.reason).await?;

    Ok(ride.into())
}

pub async fn advance_status(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<StatusParams>,
) -> Result<Json<Ride>, Error> {
    let ride = api
        .advance_trip_status(id, params.actor_id, params.status)
        .await?;

    Ok(ride.into())
}
