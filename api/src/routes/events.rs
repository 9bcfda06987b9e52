//! Event HTTP endpoints.
//!
//! - GET  /api/v1/events?latitude=&longitude=&page=&strategy=
//! - POST /api/v1/events

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::Json;
use chrono::{NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::db::models::Event;
use crate::db::queries::{self, InsertEventParams};
use crate::errors::{AppError, ErrorResponse};
use crate::helpers::{dec_to_f64, f64_to_decimal_full, is_valid_latitude, is_valid_longitude};
use crate::services::cache::{CacheKey, ResultCache};
use crate::services::client::ServiceKind;
use crate::services::enrichment::{
    EnrichmentError, EnrichmentErrorKind, EnrichmentOutcome, EventRecord, UserLocation,
};
use crate::services::scheduler::{FanOutResult, FanOutScheduler, Strategy};

/// Response header reporting whether the enrichment came from the result cache.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Longest accepted event or city name, matching the column width.
const MAX_NAME_LEN: usize = 254;

/// Listing and enrichment settings shared by the event handlers.
#[derive(Debug, Clone)]
pub(crate) struct ListingSettings {
    pub(crate) page_size: u32,
    pub(crate) window_days: i64,
    pub(crate) deadline: Duration,
    pub(crate) default_strategy: Strategy,
    pub(crate) default_workers: usize,
}

/// Shared application state.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) pool: PgPool,
    pub(crate) scheduler: FanOutScheduler,
    pub(crate) cache: Arc<ResultCache>,
    pub(crate) settings: ListingSettings,
}

// ---------------------------------------------------------------------------
// Query and request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct EventListQuery {
    /// User latitude in decimal degrees
    pub latitude: Option<String>,
    /// User longitude in decimal degrees
    pub longitude: Option<String>,
    /// Page number, starting at 1
    pub page: Option<String>,
    /// Enrichment strategy: sequential, pool, pool:N or cooperative
    pub strategy: Option<String>,
}

/// Payload for creating an event.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateEventRequest {
    pub event_name: String,
    pub city_name: String,
    /// Event date (YYYY-MM-DD)
    #[schema(value_type = String, example = "2026-10-20")]
    pub date: NaiveDate,
    /// Local start time (HH:MM:SS)
    #[schema(value_type = String, example = "18:30:00")]
    pub time: NaiveTime,
    pub latitude: f64,
    pub longitude: f64,
}

impl CreateEventRequest {
    fn validate(self) -> Result<InsertEventParams, AppError> {
        let event_name = self.event_name.trim().to_string();
        let city_name = self.city_name.trim().to_string();

        for (field, value) in [("event_name", &event_name), ("city_name", &city_name)] {
            if value.is_empty() {
                return Err(AppError::BadRequest(format!("{} must not be empty", field)));
            }
            if value.chars().count() > MAX_NAME_LEN {
                return Err(AppError::BadRequest(format!(
                    "{} must be at most {} characters",
                    field, MAX_NAME_LEN
                )));
            }
        }
        if !is_valid_latitude(self.latitude) {
            return Err(AppError::BadRequest(format!(
                "latitude {} is outside [-90, 90]",
                self.latitude
            )));
        }
        if !is_valid_longitude(self.longitude) {
            return Err(AppError::BadRequest(format!(
                "longitude {} is outside [-180, 180]",
                self.longitude
            )));
        }

        Ok(InsertEventParams {
            event_name,
            city_name,
            date: self.date,
            time: self.time,
            latitude: f64_to_decimal_full(self.latitude),
            longitude: f64_to_decimal_full(self.longitude),
        })
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Why an event could not be enriched.
#[derive(Debug, Serialize, ToSchema)]
pub struct EnrichmentFailure {
    pub kind: EnrichmentErrorKind,
    /// Service that failed; absent when the batch deadline expired first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceKind>,
    pub detail: String,
}

impl From<&EnrichmentError> for EnrichmentFailure {
    fn from(err: &EnrichmentError) -> Self {
        Self {
            kind: err.kind,
            service: err.service,
            detail: err.detail.clone(),
        }
    }
}

/// One event in the listing. `weather` and `distance_km` are present only
/// when enrichment succeeded; otherwise `error` explains why.
#[derive(Debug, Serialize, ToSchema)]
pub struct EventEntry {
    pub id: Uuid,
    pub event_name: String,
    pub city_name: String,
    /// Event date (YYYY-MM-DD)
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnrichmentFailure>,
}

impl EventEntry {
    fn from_outcome(record: &EventRecord, outcome: &EnrichmentOutcome) -> Self {
        match outcome {
            Ok(enriched) => Self {
                id: enriched.id,
                event_name: enriched.name.clone(),
                city_name: enriched.city.clone(),
                date: enriched.date.to_string(),
                weather: Some(enriched.weather.clone()),
                distance_km: Some(enriched.distance_km),
                error: None,
            },
            Err(err) => Self {
                id: record.id,
                event_name: record.name.clone(),
                city_name: record.city.clone(),
                date: record.date.to_string(),
                weather: None,
                distance_km: None,
                error: Some(err.into()),
            },
        }
    }
}

/// Counts and timing of the enrichment pass that produced this page.
#[derive(Debug, Serialize, ToSchema)]
pub struct EnrichmentSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

/// One page of enriched events.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<EventEntry>,
    pub page: u32,
    pub page_size: u32,
    pub total_events: u64,
    pub total_pages: u32,
    /// Next page number, or null on the last page
    pub next: Option<u32>,
    /// Previous page number, or null on the first page
    pub previous: Option<u32>,
    pub enrichment: EnrichmentSummary,
}

/// A stored event.
#[derive(Debug, Serialize, ToSchema)]
pub struct EventResponse {
    pub id: Uuid,
    pub event_name: String,
    pub city_name: String,
    pub date: String,
    pub time: String,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: String,
}

impl From<Event> for EventResponse {
    fn from(event: Event) -> Self {
        Self {
            id: event.id,
            event_name: event.event_name,
            city_name: event.city_name,
            date: event.date.to_string(),
            time: event.time.format("%H:%M:%S").to_string(),
            latitude: dec_to_f64(event.latitude),
            longitude: dec_to_f64(event.longitude),
            created_at: event.created_at.to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// Position of one page within the listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PageWindow {
    pub(crate) page: u32,
    pub(crate) total_pages: u32,
    pub(crate) offset: i64,
    pub(crate) limit: i64,
}

impl PageWindow {
    pub(crate) fn next(&self) -> Option<u32> {
        (self.page < self.total_pages).then_some(self.page + 1)
    }

    pub(crate) fn previous(&self) -> Option<u32> {
        (self.page > 1).then_some(self.page - 1)
    }
}

/// Parse the `page` query value; absent means the first page.
pub(crate) fn parse_page(raw: Option<&str>) -> Result<u32, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(1),
        Some(value) => value
            .parse()
            .map_err(|_| AppError::NotFound("Invalid page.".to_string())),
    }
}

/// Locate `page` among `total` rows split into pages of `page_size`.
///
/// An empty listing still has one (empty) page.
pub(crate) fn paginate(total: i64, page: u32, page_size: u32) -> Result<PageWindow, AppError> {
    let size = i64::from(page_size.max(1));
    let total_pages = u32::try_from(((total.max(0) + size - 1) / size).max(1))
        .map_err(|_| AppError::NotFound("Invalid page.".to_string()))?;

    if page == 0 || page > total_pages {
        return Err(AppError::NotFound("Invalid page.".to_string()));
    }

    Ok(PageWindow {
        page,
        total_pages,
        offset: i64::from(page - 1) * size,
        limit: size,
    })
}

fn resolve_strategy(raw: Option<&str>, settings: &ListingSettings) -> Result<Strategy, AppError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(settings.default_strategy),
        Some(value) => value
            .parse::<Strategy>()
            .map(|s| s.with_default_workers(settings.default_workers))
            .map_err(|e| AppError::BadRequest(e.to_string())),
    }
}

fn build_page(
    records: &[EventRecord],
    result: &FanOutResult,
    window: PageWindow,
    page_size: u32,
    total: i64,
) -> EventPage {
    // Every record is listed; a record without an outcome missed the batch.
    let missed: EnrichmentOutcome = Err(EnrichmentError::deadline_exceeded());
    let events: Vec<EventEntry> = records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            EventEntry::from_outcome(record, result.items.get(i).unwrap_or(&missed))
        })
        .collect();
    let failed = events.iter().filter(|e| e.error.is_some()).count();
    let succeeded = events.len() - failed;

    EventPage {
        events,
        page: window.page,
        page_size,
        total_events: total.max(0) as u64,
        total_pages: window.total_pages,
        next: window.next(),
        previous: window.previous(),
        enrichment: EnrichmentSummary {
            succeeded,
            failed,
            elapsed_ms: result.elapsed.as_millis() as u64,
        },
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// List upcoming events near the user, enriched with weather and distance.
///
/// Covers events from today through the configured forward window, in date
/// and time order. Events whose enrichment failed are still listed, with an
/// `error` object in place of the weather and distance.
#[utoipa::path(
    get,
    path = "/api/v1/events",
    tag = "Events",
    params(EventListQuery),
    responses(
        (status = 200, description = "One page of enriched events", body = EventPage,
         headers(
             ("X-Cache" = String, description = "HIT when the enrichment was served from the result cache, otherwise MISS")
         )),
        (status = 400, description = "Missing or invalid coordinates or strategy", body = ErrorResponse),
        (status = 404, description = "Page out of range", body = ErrorResponse),
        (status = 500, description = "Enrichment could not be scheduled", body = ErrorResponse),
    )
)]
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventListQuery>,
) -> Result<(HeaderMap, Json<EventPage>), AppError> {
    let user = UserLocation::parse(params.latitude.as_deref(), params.longitude.as_deref())?;
    let strategy = resolve_strategy(params.strategy.as_deref(), &state.settings)?;
    let page = parse_page(params.page.as_deref())?;
    let page_size = state.settings.page_size;

    let today = Utc::now().date_naive();
    let until = today + chrono::Duration::days(state.settings.window_days);

    let total = queries::count_events_between(&state.pool, today, until).await?;
    let window = paginate(total, page, page_size)?;

    let records: Vec<EventRecord> =
        queries::list_events_between(&state.pool, today, until, window.limit, window.offset)
            .await?
            .into_iter()
            .map(EventRecord::from)
            .collect();

    let key = CacheKey::new(user, today, page, page_size);
    let deadline = state.settings.deadline;
    let (result, status) = state
        .cache
        .get_or_compute(key, &records, || {
            state.scheduler.run(&records, user, strategy, deadline)
        })
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static(status.as_str()),
    );

    Ok((
        headers,
        Json(build_page(&records, &result, window, page_size, total)),
    ))
}

/// Create an event.
///
/// Cached listings are invalidated so the new event shows up on the next read.
#[utoipa::path(
    post,
    path = "/api/v1/events",
    tag = "Events",
    request_body = CreateEventRequest,
    responses(
        (status = 201, description = "Event created", body = EventResponse),
        (status = 400, description = "Invalid event payload", body = ErrorResponse),
    )
)]
pub async fn create_event(
    State(state): State<AppState>,
    Json(request): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<EventResponse>), AppError> {
    let params = request.validate()?;
    let event = queries::insert_event(&state.pool, params).await?;

    tracing::info!(
        "Created event {} ({}) in {} on {}",
        event.id,
        event.event_name,
        event.city_name,
        event.date
    );
    state.cache.invalidate_all().await;

    Ok((StatusCode::CREATED, Json(event.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::enrichment::testing::{sample_event, sample_events};
    use crate::services::enrichment::EnrichedEvent;

    fn settings(default_strategy: Strategy) -> ListingSettings {
        ListingSettings {
            page_size: 10,
            window_days: 14,
            deadline: Duration::from_secs(10),
            default_strategy,
            default_workers: 4,
        }
    }

    fn request() -> CreateEventRequest {
        CreateEventRequest {
            event_name: "  Street Food Market ".to_string(),
            city_name: "Zurich".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 10, 20).unwrap(),
            time: NaiveTime::from_hms_opt(18, 30, 0).unwrap(),
            latitude: 47.3769,
            longitude: 8.5417,
        }
    }

    fn enriched(record: &EventRecord) -> EnrichedEvent {
        EnrichedEvent {
            id: record.id,
            name: record.name.clone(),
            city: record.city.clone(),
            date: record.date,
            weather: "Sunny".to_string(),
            distance_km: 12.5,
        }
    }

    #[test]
    fn test_paginate_first_middle_last() {
        let first = paginate(25, 1, 10).unwrap();
        assert_eq!(first.total_pages, 3);
        assert_eq!((first.offset, first.limit), (0, 10));
        assert_eq!((first.previous(), first.next()), (None, Some(2)));

        let middle = paginate(25, 2, 10).unwrap();
        assert_eq!(middle.offset, 10);
        assert_eq!((middle.previous(), middle.next()), (Some(1), Some(3)));

        let last = paginate(25, 3, 10).unwrap();
        assert_eq!(last.offset, 20);
        assert_eq!((last.previous(), last.next()), (Some(2), None));
    }

    #[test]
    fn test_paginate_exact_multiple() {
        assert_eq!(paginate(20, 2, 10).unwrap().total_pages, 2);
        assert!(paginate(20, 3, 10).is_err());
    }

    #[test]
    fn test_paginate_empty_listing_has_one_page() {
        let window = paginate(0, 1, 10).unwrap();
        assert_eq!(window.total_pages, 1);
        assert_eq!((window.previous(), window.next()), (None, None));
    }

    #[test]
    fn test_paginate_out_of_range() {
        for page in [0, 4, 100] {
            let err = paginate(25, page, 10).unwrap_err();
            assert!(matches!(err, AppError::NotFound(ref m) if m == "Invalid page."));
        }
    }

    #[test]
    fn test_parse_page() {
        assert_eq!(parse_page(None).unwrap(), 1);
        assert_eq!(parse_page(Some("")).unwrap(), 1);
        assert_eq!(parse_page(Some(" 3 ")).unwrap(), 3);
        assert!(matches!(parse_page(Some("two")), Err(AppError::NotFound(_))));
        assert!(matches!(parse_page(Some("-1")), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_resolve_strategy() {
        let s = settings(Strategy::Cooperative);
        assert_eq!(resolve_strategy(None, &s).unwrap(), Strategy::Cooperative);
        assert_eq!(resolve_strategy(Some(" "), &s).unwrap(), Strategy::Cooperative);
        assert_eq!(
            resolve_strategy(Some("sequential"), &s).unwrap(),
            Strategy::Sequential
        );
        assert_eq!(
            resolve_strategy(Some("pool"), &s).unwrap(),
            Strategy::Pool { workers: 4 }
        );
        assert_eq!(
            resolve_strategy(Some("pool:2"), &s).unwrap(),
            Strategy::Pool { workers: 2 }
        );
        assert!(matches!(
            resolve_strategy(Some("threads"), &s),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_validate_trims_and_converts() {
        let params = request().validate().unwrap();
        assert_eq!(params.event_name, "Street Food Market");
        assert_eq!(params.city_name, "Zurich");
        assert!((dec_to_f64(params.latitude) - 47.3769).abs() < 1e-9);
        assert!((dec_to_f64(params.longitude) - 8.5417).abs() < 1e-9);
    }

    #[test]
    fn test_validate_rejects_bad_payloads() {
        let blank_name = CreateEventRequest {
            event_name: "   ".to_string(),
            ..request()
        };
        let long_city = CreateEventRequest {
            city_name: "x".repeat(MAX_NAME_LEN + 1),
            ..request()
        };
        let bad_lat = CreateEventRequest {
            latitude: 91.0,
            ..request()
        };
        let bad_lon = CreateEventRequest {
            longitude: f64::NAN,
            ..request()
        };

        for payload in [blank_name, long_city, bad_lat, bad_lon] {
            assert!(matches!(payload.validate(), Err(AppError::BadRequest(_))));
        }
    }

    #[test]
    fn test_build_page_marks_failed_events() {
        let records = sample_events(3);
        let result = FanOutResult {
            items: vec![
                Ok(enriched(&records[0])),
                Err(EnrichmentError::deadline_exceeded()),
                Ok(enriched(&records[2])),
            ],
            succeeded: 2,
            failed: 1,
            elapsed: Duration::from_millis(420),
        };
        let window = paginate(13, 2, 10).unwrap();

        let page = build_page(&records, &result, window, 10, 13);

        assert_eq!(page.events.len(), 3);
        assert_eq!(page.events[0].weather.as_deref(), Some("Sunny"));
        assert_eq!(page.events[0].distance_km, Some(12.5));
        assert!(page.events[0].error.is_none());

        let failed = &page.events[1];
        assert_eq!(failed.id, records[1].id);
        assert_eq!(failed.event_name, records[1].name);
        assert!(failed.weather.is_none() && failed.distance_km.is_none());
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.kind, EnrichmentErrorKind::DeadlineExceeded);
        assert!(error.service.is_none());

        assert_eq!((page.page, page.total_pages), (2, 2));
        assert_eq!((page.previous, page.next), (Some(1), None));
        assert_eq!(page.enrichment.elapsed_ms, 420);
    }

    #[test]
    fn test_build_page_lists_every_record_when_result_is_short() {
        let records = sample_events(3);
        let result = FanOutResult {
            items: vec![Ok(enriched(&records[0])), Ok(enriched(&records[1]))],
            succeeded: 2,
            failed: 0,
            elapsed: Duration::from_millis(30),
        };

        let page = build_page(&records, &result, paginate(3, 1, 10).unwrap(), 10, 3);

        assert_eq!(page.events.len(), 3);
        assert_eq!(page.total_events, 3);
        assert_eq!(page.events[2].id, records[2].id);
        let error = page.events[2].error.as_ref().unwrap();
        assert_eq!(error.kind, EnrichmentErrorKind::DeadlineExceeded);
        assert_eq!((page.enrichment.succeeded, page.enrichment.failed), (2, 1));
    }

    #[test]
    fn test_event_page_json_shape() {
        let record = sample_event(1);
        let result = FanOutResult {
            items: vec![Ok(enriched(&record))],
            succeeded: 1,
            failed: 0,
            elapsed: Duration::from_millis(5),
        };
        let page = build_page(
            std::slice::from_ref(&record),
            &result,
            paginate(1, 1, 10).unwrap(),
            10,
            1,
        );

        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["pageSize"], 10);
        assert_eq!(json["totalEvents"], 1);
        assert_eq!(json["totalPages"], 1);
        assert!(json["next"].is_null());
        assert!(json["previous"].is_null());
        assert_eq!(json["events"][0]["event_name"], "Event 1");
        assert_eq!(json["events"][0]["date"], "2026-10-20");
        assert!(json["events"][0].get("time").is_none());
        assert!(json["events"][0].get("error").is_none());
        assert_eq!(json["enrichment"]["succeeded"], 1);
    }
}
