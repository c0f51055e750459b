use axum::extract::{Extension, Json, Path};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::DynAPI;
use crate::entities::{BargainOffer, BargainSummary, OfferDecision, Ride};
use crate::error::Error;

#[derive(Serialize, Deserialize)]
pub struct ProposeParams {
    actor_id: Uuid,
    amount: f64,
    #[serde(default)]
    message: Option<String>,
}

/// `{"actor_id": "...", "action": "counter", "amount": 1400.0}`
#[derive(Serialize, Deserialize)]
pub struct RespondParams {
    actor_id: Uuid,
    #[serde(flatten)]
    decision: OfferDecision,
}

pub async fn propose(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<ProposeParams>,
) -> Result<Json<BargainOffer>, Error> {
    let offer = api
        .propose_offer(id, params.actor_id, params.amount, params.message)
        .await?;

    Ok(offer.into())
}

pub async fn list(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<BargainOffer>>, Error> {
    let offers = api.list_offers(id).await?;

    Ok(offers.into())
}

pub async fn summary(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
) -> Result<Json<BargainSummary>, Error> {
    let summary = api.bargain_summary(id).await?;

    Ok(summary.into())
}

pub async fn respond(
    Extension(api): Extension<DynAPI>,
    Path(id): Path<Uuid>,
    Json(params): Json<RespondParams>,
) -> Result<Json<Ride>, Error> {
    let ride = api
        .respond_to_offer(id, params.actor_id, params.decision)
        .await?;

    Ok(ride.into())
}

#[test]
fn respond_params_carry_the_decision_inline() {
    let actor_id = Uuid::new_v4();
    let body = serde_json::json!({
        "actor_id": actor_id,
        "action": "reject",
        "reason": "too far",
    });

    let params: RespondParams = serde_json::from_value(body).unwrap();

    assert_eq!(params.actor_id, actor_id);
    assert_eq!(
        params.decision,
        OfferDecision::Reject {
            reason: Some("too far".into())
        }
    );
}
