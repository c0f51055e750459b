use geo_types::{Geometry, Point};
use serde::{Deserialize, Serialize};

use crate::error::Error;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::invalid_input("latitude must be between -90 and 90"));
        }

        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(Error::invalid_input("longitude must be between -180 and 180"));
        }

        Ok(())
    }

    /// Great-circle distance in kilometres.
    pub fn haversine_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);

        2.0 * a.sqrt().asin() * EARTH_RADIUS_KM
    }
}

impl From<Coordinates> for Point<f64> {
    fn from(coordinates: Coordinates) -> Self {
        Point::new(coordinates.lng, coordinates.lat)
    }
}

impl From<Coordinates> for Geometry<f64> {
    fn from(coordinates: Coordinates) -> Self {
        Geometry::Point(coordinates.into())
    }
}

#[test]
fn haversine_matches_known_distance() {
    // Lagos Island to Ikeja, roughly 15.6km
    let pickup = Coordinates::new(6.5, 3.4);
    let dropoff = Coordinates::new(6.6, 3.5);

    let distance = pickup.haversine_km(&dropoff);
    assert!((distance - 15.6).abs() < 0.2, "got {}", distance);
    assert_eq!(pickup.haversine_km(&pickup), 0.0);
}

#[test]
fn out_of_range_coordinates_are_rejected() {
    assert!(Coordinates::new(91.0, 0.0).validate().is_err());
    assert!(Coordinates::new(0.0, -180.5).validate().is_err());
    assert!(Coordinates::new(f64::NAN, 0.0).validate().is_err());
    assert!(Coordinates::new(-90.0, 180.0).validate().is_ok());
}

#[test]
fn geometry_uses_lng_as_x() {
    let point: Point<f64> = Coordinates::new(6.5, 3.4).into();
    assert_eq!(point.x(), 3.4);
    assert_eq!(point.y(), 6.5);
}
