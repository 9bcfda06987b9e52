use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

/// An event row. Coordinates are stored as `NUMERIC(20, 15)`.
#[derive(Debug, Clone, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub event_name: String,
    pub city_name: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub created_at: DateTime<Utc>,
}
