//! Durable booking history and operator directory on Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::geo::GeoPoint;
use crate::models::booking::{Booking, BookingStatus, NewBooking};
use crate::store::{BookingStore, OperatorDirectory, StoreError};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS bookings (
        id BIGSERIAL PRIMARY KEY,
        requester_id TEXT NOT NULL,
        requester_name TEXT NOT NULL,
        operator_id TEXT NOT NULL,
        operator_name TEXT NOT NULL,
        price DOUBLE PRECISION NOT NULL,
        pickup_lat DOUBLE PRECISION NOT NULL,
        pickup_lng DOUBLE PRECISION NOT NULL,
        pickup_label TEXT,
        dropoff_lat DOUBLE PRECISION NOT NULL,
        dropoff_lng DOUBLE PRECISION NOT NULL,
        dropoff_label TEXT,
        vehicle_class TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at TIMESTAMPTZ,
        status TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS bookings_one_active_per_pair
        ON bookings (requester_id, operator_id)
        WHERE status NOT IN ('completed', 'cancelled')",
    "CREATE INDEX IF NOT EXISTS bookings_by_operator ON bookings (operator_id)",
    "CREATE TABLE IF NOT EXISTS operators (
        id TEXT PRIMARY KEY,
        vehicle_class TEXT NOT NULL
    )",
];

const BOOKING_COLUMNS: &str = "id, requester_id, requester_name, operator_id, operator_name, \
     price, pickup_lat, pickup_lng, pickup_label, dropoff_lat, dropoff_lng, dropoff_label, \
     vehicle_class, created_at, completed_at, status";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(map_err)?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_many(&self, filter: &str, party_id: &str) -> Result<Vec<Booking>, StoreError> {
        let query = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE {filter} ORDER BY id DESC");
        let rows = sqlx::query(&query)
            .bind(party_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;

        rows.iter().map(booking_from_row).collect()
    }

    async fn fetch_active(&self, column: &str, party_id: &str) -> Result<Option<Booking>, StoreError> {
        let query = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE {column} = $1 AND status NOT IN ('completed', 'cancelled')
             ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(party_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;

        row.as_ref().map(booking_from_row).transpose()
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn insert(&self, new: NewBooking) -> Result<Booking, StoreError> {
        let query = format!(
            "INSERT INTO bookings (requester_id, requester_name, operator_id, operator_name, price,
                pickup_lat, pickup_lng, pickup_label, dropoff_lat, dropoff_lng, dropoff_label,
                vehicle_class, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING {BOOKING_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(&new.requester_id)
            .bind(&new.requester_name)
            .bind(&new.operator_id)
            .bind(&new.operator_name)
            .bind(new.price)
            .bind(new.pickup.lat)
            .bind(new.pickup.lng)
            .bind(&new.pickup.label)
            .bind(new.dropoff.lat)
            .bind(new.dropoff.lng)
            .bind(&new.dropoff.label)
            .bind(&new.vehicle_class)
            .bind(BookingStatus::EnrouteToPickup.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;

        booking_from_row(&row)
    }

    async fn transition(
        &self,
        requester_id: &str,
        operator_id: &str,
        next: BookingStatus,
    ) -> Result<Option<Booking>, StoreError> {
        let predecessors: Vec<&str> = next
            .allowed_predecessors()
            .iter()
            .map(|status| status.as_str())
            .collect();

        let query = format!(
            "UPDATE bookings
             SET status = $1,
                 completed_at = CASE WHEN $2 THEN now() ELSE completed_at END
             WHERE requester_id = $3 AND operator_id = $4 AND status = ANY($5)
             RETURNING {BOOKING_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(next.as_str())
            .bind(next.is_terminal())
            .bind(requester_id)
            .bind(operator_id)
            .bind(&predecessors)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;

        row.as_ref().map(booking_from_row).transpose()
    }

    async fn current_for_requester(
        &self,
        requester_id: &str,
    ) -> Result<Option<Booking>, StoreError> {
        self.fetch_active("requester_id", requester_id).await
    }

    async fn current_for_operator(&self, operator_id: &str) -> Result<Option<Booking>, StoreError> {
        self.fetch_active("operator_id", operator_id).await
    }

    async fn history_for_requester(&self, requester_id: &str) -> Result<Vec<Booking>, StoreError> {
        self.fetch_many("requester_id = $1", requester_id).await
    }

    async fn history_for_operator(&self, operator_id: &str) -> Result<Vec<Booking>, StoreError> {
        self.fetch_many("operator_id = $1", operator_id).await
    }
}

#[async_trait]
impl OperatorDirectory for PgStore {
    async fn vehicle_class(&self, operator_id: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT vehicle_class FROM operators WHERE id = $1")
            .bind(operator_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;

        Ok(row.map(|(class,)| class))
    }
}

fn booking_from_row(row: &PgRow) -> Result<Booking, StoreError> {
    let status: String = row.try_get("status").map_err(map_err)?;
    let status = status.parse::<BookingStatus>().map_err(StoreError::Backend)?;

    Ok(Booking {
        id: row.try_get("id").map_err(map_err)?,
        requester_id: row.try_get("requester_id").map_err(map_err)?,
        requester_name: row.try_get("requester_name").map_err(map_err)?,
        operator_id: row.try_get("operator_id").map_err(map_err)?,
        operator_name: row.try_get("operator_name").map_err(map_err)?,
        price: row.try_get("price").map_err(map_err)?,
        pickup: point_from_row(row, "pickup")?,
        dropoff: point_from_row(row, "dropoff")?,
        vehicle_class: row.try_get("vehicle_class").map_err(map_err)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(map_err)?,
        completed_at: row.try_get("completed_at").map_err(map_err)?,
        status,
    })
}

fn point_from_row(row: &PgRow, prefix: &str) -> Result<GeoPoint, StoreError> {
    Ok(GeoPoint {
        lat: row.try_get(format!("{prefix}_lat").as_str()).map_err(map_err)?,
        lng: row.try_get(format!("{prefix}_lng").as_str()).map_err(map_err)?,
        label: row.try_get(format!("{prefix}_label").as_str()).map_err(map_err)?,
    })
}

fn map_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::Duplicate(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
