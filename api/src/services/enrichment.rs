//! Per-event enrichment: one weather call and one distance call, merged into
//! a derived record. Either both succeed or the event is marked failed.

use chrono::NaiveDate;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::db::models::Event;
use crate::helpers::{dec_to_f64, is_valid_latitude, is_valid_longitude};
use crate::services::client::{FetchError, ServiceClient, ServiceKind};

/// Read-only snapshot of an event row, as handed to the enrichment core.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub date: NaiveDate,
    pub latitude: f64,
    pub longitude: f64,
}

impl EventRecord {
    pub fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

impl From<Event> for EventRecord {
    fn from(e: Event) -> Self {
        Self {
            id: e.id,
            name: e.event_name,
            city: e.city_name,
            date: e.date,
            latitude: dec_to_f64(e.latitude),
            longitude: dec_to_f64(e.longitude),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("Latitude and Longitude parameters are required.")]
    MissingCoordinates,

    #[error("Invalid parameters: {0}")]
    InvalidCoordinates(String),
}

/// Where the requesting user is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UserLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl UserLocation {
    /// Parse raw query-string values. Both must be present, finite and in range.
    pub fn parse(latitude: Option<&str>, longitude: Option<&str>) -> Result<Self, InputError> {
        let (lat, lon) = match (latitude, longitude) {
            (Some(lat), Some(lon)) if !lat.trim().is_empty() && !lon.trim().is_empty() => {
                (lat.trim(), lon.trim())
            }
            _ => return Err(InputError::MissingCoordinates),
        };

        let latitude: f64 = lat
            .parse()
            .map_err(|_| InputError::InvalidCoordinates(format!("latitude '{}'", lat)))?;
        let longitude: f64 = lon
            .parse()
            .map_err(|_| InputError::InvalidCoordinates(format!("longitude '{}'", lon)))?;

        if !is_valid_latitude(latitude) {
            return Err(InputError::InvalidCoordinates(format!(
                "latitude {} is outside [-90, 90]",
                lat
            )));
        }
        if !is_valid_longitude(longitude) {
            return Err(InputError::InvalidCoordinates(format!(
                "longitude {} is outside [-180, 180]",
                lon
            )));
        }

        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }
}

/// Public subset of an event plus both enrichment fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEvent {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub date: NaiveDate,
    pub weather: String,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentErrorKind {
    /// Timeout or connection failure talking to a service.
    Transport,
    /// A service answered with a non-2xx status or an unusable body.
    Upstream,
    /// The batch deadline fired before this event finished.
    DeadlineExceeded,
}

/// Why one event could not be enriched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{detail}")]
pub struct EnrichmentError {
    pub kind: EnrichmentErrorKind,
    /// The service whose call failed; `None` when the deadline cut the task short.
    pub service: Option<ServiceKind>,
    pub detail: String,
}

impl EnrichmentError {
    pub fn deadline_exceeded() -> Self {
        Self {
            kind: EnrichmentErrorKind::DeadlineExceeded,
            service: None,
            detail: "enrichment deadline exceeded".to_string(),
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind == EnrichmentErrorKind::Transport
    }
}

impl From<FetchError> for EnrichmentError {
    fn from(err: FetchError) -> Self {
        let kind = if err.is_transport() {
            EnrichmentErrorKind::Transport
        } else {
            EnrichmentErrorKind::Upstream
        };
        Self {
            kind,
            service: Some(err.service()),
            detail: err.to_string(),
        }
    }
}

pub type EnrichmentOutcome = Result<EnrichedEvent, EnrichmentError>;

/// Enrich a single event for the given user.
///
/// Both calls run concurrently; the first failure drops the sibling call and
/// fails the whole event.
pub async fn enrich(
    client: &ServiceClient,
    event: &EventRecord,
    user: UserLocation,
) -> EnrichmentOutcome {
    let weather = client.weather(&event.city, event.date);
    let distance = client.distance(user.coordinates(), event.coordinates());

    let (weather, distance_km) = futures::future::try_join(weather, distance).await?;

    Ok(EnrichedEvent {
        id: event.id,
        name: event.name.clone(),
        city: event.city.clone(),
        date: event.date,
        weather,
        distance_km,
    })
}
