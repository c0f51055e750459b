use async_trait::async_trait;
use chrono::{Duration, Utc};
use geo_types::Geometry;
use geozero::wkb;
use sqlx::{Executor, Pool, Postgres, Row};
use uuid::Uuid;

use crate::engine::{TransitionEvent, TransitionHook};
use crate::entities::{Coordinates, DriverCandidate, DriverProfile, RideStatus, VehicleType};
use crate::error::Error;
use crate::geo::GeoIndex;

/// How long a reported driver position stays searchable.
const LOCATION_TTL_SECS: i64 = 60;

/// PostGIS-backed geo index over the driver service's tables.
pub struct PgGeoIndex {
    pool: Pool<Postgres>,
}

impl PgGeoIndex {
    #[tracing::instrument(name = "PgGeoIndex::new", skip_all)]
    pub async fn new(pool: Pool<Postgres>) -> Result<Self, Error> {
        pool.execute("CREATE EXTENSION IF NOT EXISTS postgis").await?;

        pool.execute("CREATE TABLE IF NOT EXISTS drivers (id UUID PRIMARY KEY, vehicle_type VARCHAR, is_active BOOLEAN NOT NULL, is_verified BOOLEAN NOT NULL, is_online BOOLEAN NOT NULL, current_ride_id UUID)")
            .await?;
        pool.execute("CREATE TABLE IF NOT EXISTS driver_locations (driver_id UUID PRIMARY KEY REFERENCES drivers(id), location geometry(Point), expiry TIMESTAMPTZ)")
            .await?;
        pool.execute("CREATE INDEX IF NOT EXISTS driver_locations_location_idx ON driver_locations USING GIST (location)")
            .await?;

        Ok(Self { pool })
    }

    #[tracing::instrument(skip(self))]
    pub async fn upsert_driver(&self, profile: &DriverProfile) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        conn.execute(
            sqlx::query(
                "INSERT INTO drivers (id, vehicle_type, is_active, is_verified, is_online, current_ride_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET
                    vehicle_type = EXCLUDED.vehicle_type,
                    is_active = EXCLUDED.is_active,
                    is_verified = EXCLUDED.is_verified,
                    is_online = EXCLUDED.is_online,
                    current_ride_id = EXCLUDED.current_ride_id",
            )
            .bind(&profile.id)
            .bind(profile.vehicle_type.map(|v| v.name()))
            .bind(profile.is_active)
            .bind(profile.is_verified)
            .bind(profile.is_online)
            .bind(&profile.current_ride_id),
        )
        .await?;

        if let Some(position) = profile.position {
            self.update_location(profile.id, position).await?;
        }

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn update_location(&self, driver_id: Uuid, position: Coordinates) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        let location: Geometry<f64> = position.into();

        conn.execute(
            sqlx::query(
                "INSERT INTO driver_locations (driver_id, location, expiry)
                VALUES ($1, ST_SetSRID($2, 4326), $3)
                ON CONFLICT (driver_id) DO UPDATE SET location = EXCLUDED.location, expiry = EXCLUDED.expiry",
            )
            .bind(&driver_id)
            .bind(wkb::Encode(location))
            .bind(Utc::now() + Duration::seconds(LOCATION_TTL_SECS)),
        )
        .await?;

        Ok(())
    }

    async fn set_current_ride(
        &self,
        driver_id: Uuid,
        ride_id: Uuid,
        assigned: bool,
    ) -> Result<(), Error> {
        let mut conn = self.pool.acquire().await?;

        let query = if assigned {
            sqlx::query("UPDATE drivers SET current_ride_id = $2 WHERE id = $1")
        } else {
            sqlx::query("UPDATE drivers SET current_ride_id = NULL WHERE id = $1 AND current_ride_id = $2")
        };

        conn.execute(query.bind(&driver_id).bind(&ride_id)).await?;

        Ok(())
    }
}

#[async_trait]
impl GeoIndex for PgGeoIndex {
    #[tracing::instrument(skip(self))]
    async fn find_nearby_available_drivers(
        &self,
        pickup: Coordinates,
        radius_km: f64,
        vehicle_type: Option<VehicleType>,
    ) -> Result<Vec<DriverCandidate>, Error> {
        let pickup: Geometry<f64> = pickup.into();

        let query = "
            SELECT
                d.id AS driver_id,
                ST_DistanceSphere(l.location, ST_SetSRID($1, 4326)) / 1000.0::float8 AS distance_km
            FROM
                drivers d
                JOIN driver_locations l ON d.id = l.driver_id
            WHERE
                d.is_active
                AND d.is_verified
                AND d.is_online
                AND d.current_ride_id IS NULL
                AND l.location IS NOT NULL
                AND l.expiry > now()
                AND ($3::VARCHAR IS NULL OR d.vehicle_type = $3)
                AND ST_DWithin(l.location::geography, ST_SetSRID($1, 4326)::geography, $2 * 1000.0::float8)
            ORDER BY
                distance_km ASC
        ";

        let mut conn = self.pool.acquire().await?;
        let results = conn
            .fetch_all(
                sqlx::query(query)
                    .bind(wkb::Encode(pickup))
                    .bind(radius_km)
                    .bind(vehicle_type.map(|v| v.name())),
            )
            .await?;

        let mut candidates = vec![];

        for result in results.iter() {
            candidates.push(DriverCandidate {
                driver_id: result.try_get("driver_id")?,
                distance_km: result.try_get("distance_km")?,
            });
        }

        tracing::debug!(count = candidates.len(), "found nearby drivers");

        Ok(candidates)
    }

    #[tracing::instrument(skip(self))]
    async fn is_driver_eligible(&self, driver_id: Uuid) -> Result<bool, Error> {
        let mut conn = self.pool.acquire().await?;

        let eligible = conn
            .fetch_optional(
                sqlx::query(
                    "SELECT is_active AND is_verified AND is_online AND current_ride_id IS NULL AS eligible
                    FROM drivers WHERE id = $1",
                )
                .bind(&driver_id),
            )
            .await?
            .map(|row| row.try_get::<bool, _>("eligible"))
            .transpose()?
            .unwrap_or(false);

        Ok(eligible)
    }
}

#[async_trait]
impl TransitionHook for PgGeoIndex {
    fn name(&self) -> &'static str {
        "driver_availability"
    }

    async fn on_transition(&self, event: &TransitionEvent) -> Result<(), Error> {
        let driver_id = match event.entry.driver_id {
            Some(driver_id) => driver_id,
            None => return Ok(()),
        };

        match event.status() {
            RideStatus::DriverAssigned => self.set_current_ride(driver_id, event.ride.id, true).await,
            RideStatus::Completed | RideStatus::Cancelled | RideStatus::Expired => {
                self.set_current_ride(driver_id, event.ride.id, false).await
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test]
#[ignore]
async fn finds_drivers_with_fresh_locations() {
    use crate::db::PgPool;

    let PgPool(pool) = PgPool::new(&std::env::var("DATABASE_URL").unwrap(), 2)
        .await
        .unwrap();
    let index = PgGeoIndex::new(pool).await.unwrap();

    let pickup = Coordinates::new(6.5, 3.4);
    let driver_id = Uuid::new_v4();
    index
        .upsert_driver(&DriverProfile::available(driver_id, Coordinates::new(6.505, 3.4)))
        .await
        .unwrap();

    let candidates = index
        .find_nearby_available_drivers(pickup, 5.0, None)
        .await
        .unwrap();

    assert!(candidates.iter().any(|c| c.driver_id == driver_id));
    assert!(index.is_driver_eligible(driver_id).await.unwrap());
}
