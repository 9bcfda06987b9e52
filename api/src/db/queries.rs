use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use sqlx::PgPool;

use super::models::Event;

/// Parameters for inserting a new event.
pub struct InsertEventParams {
    pub event_name: String,
    pub city_name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub latitude: Decimal,
    pub longitude: Decimal,
}

/// Count events whose date falls in `[from, to]`.
pub async fn count_events_between(
    pool: &PgPool,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM events WHERE date BETWEEN $1 AND $2")
        .bind(from)
        .bind(to)
        .fetch_one(pool)
        .await
}

/// One page of events in `[from, to]`, in listing order (date, time, id).
pub async fn list_events_between(
    pool: &PgPool,
    from: NaiveDate,
    to: NaiveDate,
    limit: i64,
    offset: i64,
) -> Result<Vec<Event>, sqlx::Error> {
    sqlx::query_as::<_, Event>(
        "SELECT id, event_name, city_name, date, time, latitude, longitude, created_at
         FROM events
         WHERE date BETWEEN $1 AND $2
         ORDER BY date, time, id
         LIMIT $3 OFFSET $4",
    )
    .bind(from)
    .bind(to)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Insert a new event and return the stored row.
pub async fn insert_event(pool: &PgPool, params: InsertEventParams) -> Result<Event, sqlx::Error> {
    sqlx::query_as::<_, Event>(
        "INSERT INTO events (event_name, city_name, date, time, latitude, longitude)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, event_name, city_name, date, time, latitude, longitude, created_at",
    )
    .bind(params.event_name)
    .bind(params.city_name)
    .bind(params.date)
    .bind(params.time)
    .bind(params.latitude)
    .bind(params.longitude)
    .fetch_one(pool)
    .await
}
