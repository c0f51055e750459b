mod coordinates;
mod driver;
mod history;
mod offer;
mod record;
mod ride;

pub use coordinates::Coordinates;
pub use driver::{DriverCandidate, DriverProfile};
pub use history::{is_valid_walk, HistoryEventType, RideHistoryEntry};
pub use offer::{BargainOffer, BargainSummary, OfferDecision, OfferStatus, Party};
pub use record::RideRecord;
pub use ride::{Ride, RideRequest, RideStatus, VehicleType};
