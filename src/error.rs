use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::env;
use uuid::Uuid;

use crate::entities::RideStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: Uuid },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RideStatus, to: RideStatus },

    #[error("ride is no longer available")]
    RideNoLongerAvailable,

    #[error("offer is no longer pending")]
    OfferNoLongerPending,

    #[error("offer of {amount} is outside the allowed range [{min}, {max}]")]
    OfferOutOfBounds { amount: f64, min: f64, max: f64 },

    #[error("ride is in state {0}")]
    InvalidRideState(RideStatus),

    #[error("actor is not allowed to perform this action")]
    InvalidActor,

    #[error("driver is not eligible")]
    DriverNotEligible,

    #[error("ride cannot be cancelled while {0}")]
    CannotCancelInCurrentState(RideStatus),

    #[error("maximum bargain rounds reached")]
    BargainRoundsExhausted,

    #[error("actor already has a pending offer on this ride")]
    DuplicateOffer,

    #[error("ride was modified concurrently")]
    Conflict,

    #[error("ride {0} failed an integrity check")]
    CorruptedRide(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("environment variable error: {0}")]
    EnvVar(#[from] env::VarError),
}

impl Error {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn not_found(resource: &'static str, id: Uuid) -> Self {
        Self::NotFound { resource, id }
    }

    /// Numeric code surfaced to clients. 1..=99 are internal failures.
    pub fn code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::EnvVar(_) => 1,
            Self::Database(_) => 2,
            Self::Http(_) => 3,
            Self::Upstream(_) => 4,
            Self::CorruptedRide(_) => 5,
            Self::Server(_) => 6,
            Self::InvalidInput(_) => 101,
            Self::NotFound { .. } => 102,
            Self::InvalidTransition { .. } => 110,
            Self::RideNoLongerAvailable => 111,
            Self::OfferNoLongerPending => 112,
            Self::Conflict => 113,
            Self::OfferOutOfBounds { .. } => 120,
            Self::InvalidRideState(_) => 121,
            Self::BargainRoundsExhausted => 122,
            Self::DuplicateOffer => 123,
            Self::InvalidActor => 130,
            Self::DriverNotEligible => 131,
            Self::CannotCancelInCurrentState(_) => 132,
        }
    }

    /// Routine outcomes of two actors racing on the same ride.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. }
                | Self::RideNoLongerAvailable
                | Self::OfferNoLongerPending
                | Self::Conflict
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = self.to_string();

        let (status, error_message) = match code {
            1..=99 => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
            _ if self.is_not_found() => (StatusCode::NOT_FOUND, message.as_str()),
            _ if self.is_conflict() => (StatusCode::CONFLICT, message.as_str()),
            _ => (StatusCode::BAD_REQUEST, message.as_str()),
        };

        if code < 100 {
            tracing::error!(code, error = %message, "internal error");
        }

        let body = Json(json!({
            "code": code,
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

#[test]
fn race_outcomes_are_conflicts() {
    assert!(Error::RideNoLongerAvailable.is_conflict());
    assert!(Error::OfferNoLongerPending.is_conflict());
    assert!(Error::InvalidTransition {
        from: RideStatus::Completed,
        to: RideStatus::Cancelled,
    }
    .is_conflict());

    assert!(!Error::DriverNotEligible.is_conflict());
    assert!(!Error::CannotCancelInCurrentState(RideStatus::InProgress).is_conflict());
}

#[test]
fn internal_errors_hide_their_message() {
    let response = Error::upstream("geo index timed out").into_response();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = Error::RideNoLongerAvailable.into_response();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = Error::not_found("ride", Uuid::nil()).into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = Error::DriverNotEligible.into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
