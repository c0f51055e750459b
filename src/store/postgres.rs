use async_trait::async_trait;
use sqlx::{types::Json, Executor, Pool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::entities::{BargainOffer, Ride, RideHistoryEntry, RideRecord};
use crate::error::Error;
use crate::store::RideStore;

type Database = Postgres;

/// Ride records stored as JSONB documents, one row per ride, offer and
/// history entry.
pub struct PgRideStore {
    pool: Pool<Database>,
}

impl PgRideStore {
    #[tracing::instrument(name = "PgRideStore::new", skip_all)]
    pub async fn new(pool: Pool<Database>) -> Result<Self, Error> {
        pool.execute("CREATE TABLE IF NOT EXISTS rides (id UUID PRIMARY KEY, status VARCHAR NOT NULL, version BIGINT NOT NULL, data JSONB NOT NULL, candidates JSONB NOT NULL)")
            .await?;
        pool.execute("CREATE INDEX IF NOT EXISTS rides_status_idx ON rides (status)")
            .await?;
        pool.execute("CREATE TABLE IF NOT EXISTS bargain_offers (id UUID PRIMARY KEY, ride_id UUID NOT NULL REFERENCES rides(id), position INT4 NOT NULL, status VARCHAR NOT NULL, data JSONB NOT NULL)")
            .await?;
        pool.execute("CREATE TABLE IF NOT EXISTS ride_history (ride_id UUID NOT NULL REFERENCES rides(id), seq BIGINT NOT NULL, data JSONB NOT NULL, PRIMARY KEY (ride_id, seq))")
            .await?;

        Ok(Self { pool })
    }
}

#[tracing::instrument(skip(tx, record), fields(ride_id = %record.id()))]
async fn write_children(
    tx: &mut Transaction<'_, Database>,
    record: &RideRecord,
) -> Result<(), Error> {
    for (position, offer) in record.offers.iter().enumerate() {
        tx.execute(
            sqlx::query(
                "INSERT INTO bargain_offers (id, ride_id, position, status, data) VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, data = EXCLUDED.data",
            )
            .bind(&offer.id)
            .bind(&offer.ride_id)
            .bind(position as i32)
            .bind(offer.status.name())
            .bind(Json(offer)),
        )
        .await?;
    }

    // history is append-only, existing entries are never rewritten
    for entry in record.history.iter() {
        tx.execute(
            sqlx::query(
                "INSERT INTO ride_history (ride_id, seq, data) VALUES ($1, $2, $3)
                ON CONFLICT (ride_id, seq) DO NOTHING",
            )
            .bind(&entry.ride_id)
            .bind(entry.seq as i64)
            .bind(Json(entry)),
        )
        .await?;
    }

    Ok(())
}

#[async_trait]
impl RideStore for PgRideStore {
    #[tracing::instrument(skip(self, record), fields(ride_id = %record.id()))]
    async fn insert(&self, record: &RideRecord) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        tx.execute(
            sqlx::query(
                "INSERT INTO rides (id, status, version, data, candidates) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&record.ride.id)
            .bind(record.status().name())
            .bind(record.version as i64)
            .bind(Json(&record.ride))
            .bind(Json(&record.candidates)),
        )
        .await?;

        write_children(&mut tx, record).await?;

        tx.commit().await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn load(&self, ride_id: Uuid) -> Result<RideRecord, Error> {
        let mut conn = self.pool.acquire().await?;

        let row = conn
            .fetch_optional(
                sqlx::query("SELECT version, data, candidates FROM rides WHERE id = $1")
                    .bind(&ride_id),
            )
            .await?
            .ok_or_else(|| Error::not_found("ride", ride_id))?;

        let version: i64 = row.try_get("version")?;
        let Json(ride): Json<Ride> = row.try_get("data")?;
        let Json(candidates): Json<Vec<Uuid>> = row.try_get("candidates")?;

        let mut offers = vec![];
        for row in conn
            .fetch_all(
                sqlx::query("SELECT data FROM bargain_offers WHERE ride_id = $1 ORDER BY position")
                    .bind(&ride_id),
            )
            .await?
        {
            let Json(offer): Json<BargainOffer> = row.try_get("data")?;
            offers.push(offer);
        }

        let mut history = vec![];
        for row in conn
            .fetch_all(
                sqlx::query("SELECT data FROM ride_history WHERE ride_id = $1 ORDER BY seq")
                    .bind(&ride_id),
            )
            .await?
        {
            let Json(entry): Json<RideHistoryEntry> = row.try_get("data")?;
            history.push(entry);
        }

        Ok(RideRecord {
            ride,
            offers,
            history,
            candidates,
            version: version as u64,
        })
    }

    #[tracing::instrument(skip(self, record), fields(ride_id = %record.id()))]
    async fn save(&self, record: &RideRecord, expected_version: u64) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let updated = tx
            .execute(
                sqlx::query(
                    "UPDATE rides SET status = $2, version = $3, data = $4, candidates = $5
                    WHERE id = $1 AND version = $6",
                )
                .bind(&record.ride.id)
                .bind(record.status().name())
                .bind(record.version as i64)
                .bind(Json(&record.ride))
                .bind(Json(&record.candidates))
                .bind(expected_version as i64),
            )
            .await?
            .rows_affected();

        if updated == 0 {
            tracing::debug!(expected_version, "ride row changed underneath us");
            tx.rollback().await?;
            return Err(Error::Conflict);
        }

        write_children(&mut tx, record).await?;

        tx.commit().await?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn find_ride_id_by_offer(&self, offer_id: Uuid) -> Result<Uuid, Error> {
        let mut conn = self.pool.acquire().await?;

        let ride_id: Uuid = conn
            .fetch_optional(
                sqlx::query("SELECT ride_id FROM bargain_offers WHERE id = $1").bind(&offer_id),
            )
            .await?
            .ok_or_else(|| Error::not_found("offer", offer_id))?
            .try_get("ride_id")?;

        Ok(ride_id)
    }

    #[tracing::instrument(skip(self))]
    async fn active_ride_ids(&self) -> Result<Vec<Uuid>, Error> {
        let mut conn = self.pool.acquire().await?;

        let rows = conn
            .fetch_all(sqlx::query(
                "SELECT id FROM rides WHERE status NOT IN ('completed', 'cancelled', 'expired')",
            ))
            .await?;

        let mut ids = vec![];
        for row in rows.iter() {
            ids.push(row.try_get("id")?);
        }

        Ok(ids)
    }
}

#[tokio::test]
#[ignore]
async fn versioned_saves_round_trip_through_postgres() {
    use crate::entities::{Coordinates, RideRequest};
    use chrono::Utc;
    use crate::db::PgPool;

    let PgPool(pool) = PgPool::new(&std::env::var("DATABASE_URL").unwrap(), 2)
        .await
        .unwrap();
    let store = PgRideStore::new(pool).await.unwrap();

    let request = RideRequest {
        rider_id: Uuid::new_v4(),
        pickup: Coordinates::new(6.5, 3.4),
        dropoff: Coordinates::new(6.6, 3.5),
        estimated_fare: 1500.0,
        vehicle_type: None,
        schedule_time: None,
        notes: None,
    };
    let record = RideRecord::new(Ride::new(request, 15.6, Utc::now()), Utc::now());
    store.insert(&record).await.unwrap();

    let mut updated = store.load(record.id()).await.unwrap();
    assert_eq!(updated, record);

    updated.version = 1;
    updated.candidates.push(Uuid::new_v4());
    store.save(&updated, 0).await.unwrap();
    assert!(matches!(store.save(&updated, 0).await, Err(Error::Conflict)));

    assert_eq!(store.load(record.id()).await.unwrap(), updated);
    assert!(store.active_ride_ids().await.unwrap().contains(&record.id()));
}
