//! Client for the weather and distance services.
//!
//! One GET per call, bounded by a per-call timeout. The client never retries;
//! retries are budgeted per batch by the scheduler.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::ServiceEndpoint;

/// Which downstream service a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Weather,
    Distance,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Weather => f.write_str("weather"),
            ServiceKind::Distance => f.write_str("distance"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("{0} service timed out")]
    Timeout(ServiceKind),

    #[error("{0} service unreachable: {1}")]
    Connection(ServiceKind, String),

    #[error("{0} service returned HTTP {1}")]
    BadStatus(ServiceKind, u16),

    #[error("{0} service response could not be decoded: {1}")]
    Decode(ServiceKind, String),
}

impl FetchError {
    pub fn service(&self) -> ServiceKind {
        match self {
            FetchError::Timeout(kind)
            | FetchError::Connection(kind, _)
            | FetchError::BadStatus(kind, _)
            | FetchError::Decode(kind, _) => *kind,
        }
    }

    /// Timeouts and connection failures; the request may succeed if re-sent.
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Connection(..))
    }

    fn from_reqwest(kind: ServiceKind, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(kind)
        } else {
            FetchError::Connection(kind, err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct WeatherReply {
    weather: String,
}

#[derive(Debug, Deserialize)]
struct DistanceReply {
    distance: f64,
}

/// HTTP client for both enrichment services. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    client: reqwest::Client,
    weather: ServiceEndpoint,
    distance: ServiceEndpoint,
}

impl ServiceClient {
    pub fn new(
        weather: ServiceEndpoint,
        distance: ServiceEndpoint,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            weather,
            distance,
        })
    }

    fn endpoint(&self, kind: ServiceKind) -> &ServiceEndpoint {
        match kind {
            ServiceKind::Weather => &self.weather,
            ServiceKind::Distance => &self.distance,
        }
    }

    /// Issue one GET against `kind` and decode the body as JSON.
    ///
    /// The service's access code is always sent as the `code` parameter.
    pub async fn fetch(
        &self,
        kind: ServiceKind,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, FetchError> {
        let endpoint = self.endpoint(kind);

        let response = self
            .client
            .get(&endpoint.url)
            .query(&[("code", endpoint.code.as_str())])
            .query(params)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(kind, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::BadStatus(kind, status.as_u16()));
        }

        // Read the body first so a stalled transfer still counts as transport failure.
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(kind, e))?;

        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(kind, e.to_string()))
    }

    async fn fetch_as<T: DeserializeOwned>(
        &self,
        kind: ServiceKind,
        params: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let value = self.fetch(kind, params).await?;
        serde_json::from_value(value).map_err(|e| FetchError::Decode(kind, e.to_string()))
    }

    /// Weather summary for a city on a given day.
    pub async fn weather(&self, city: &str, date: NaiveDate) -> Result<String, FetchError> {
        let params = [("city", city.to_string()), ("date", date.to_string())];
        let reply: WeatherReply = self.fetch_as(ServiceKind::Weather, &params).await?;
        Ok(reply.weather)
    }

    /// Distance in kilometres between the user and an event.
    pub async fn distance(
        &self,
        from: (f64, f64),
        to: (f64, f64),
    ) -> Result<f64, FetchError> {
        let params = [
            ("latitude1", from.0.to_string()),
            ("longitude1", from.1.to_string()),
            ("latitude2", to.0.to_string()),
            ("longitude2", to.1.to_string()),
        ];
        let reply: DistanceReply = self.fetch_as(ServiceKind::Distance, &params).await?;
        Ok(reply.distance)
    }
}

/// Helpers for building a `ServiceClient` against a wiremock server.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use wiremock::MockServer;

    pub(crate) const WEATHER_PATH: &str = "/api/Weather";
    pub(crate) const DISTANCE_PATH: &str = "/api/Distance";

    pub(crate) fn client_for(server: &MockServer, timeout: Duration) -> ServiceClient {
        ServiceClient::new(
            ServiceEndpoint {
                url: format!("{}{}", server.uri(), WEATHER_PATH),
                code: "weather-code".to_string(),
            },
            ServiceEndpoint {
                url: format!("{}{}", server.uri(), DISTANCE_PATH),
                code: "distance-code".to_string(),
            },
            timeout,
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
    }

    #[tokio::test]
    async fn test_weather_sends_code_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(WEATHER_PATH))
            .and(query_param("code", "weather-code"))
            .and(query_param("city", "Zurich"))
            .and(query_param("date", "2026-10-20"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"weather": "Sunny, 21C"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let weather = client.weather("Zurich", date()).await.unwrap();
        assert_eq!(weather, "Sunny, 21C");
    }

    #[tokio::test]
    async fn test_distance_sends_both_coordinate_pairs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISTANCE_PATH))
            .and(query_param("code", "distance-code"))
            .and(query_param("latitude1", "40.7128"))
            .and(query_param("longitude1", "-74.006"))
            .and(query_param("latitude2", "47.3769"))
            .and(query_param("longitude2", "8.5417"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"distance": 6326.5})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let km = client
            .distance((40.7128, -74.006), (47.3769, 8.5417))
            .await
            .unwrap();
        assert!((km - 6326.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_non_success_status_is_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(WEATHER_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let err = client.weather("Zurich", date()).await.unwrap_err();
        assert!(matches!(err, FetchError::BadStatus(ServiceKind::Weather, 503)));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_non_json_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISTANCE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let err = client.distance((0.0, 0.0), (1.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(ServiceKind::Distance, _)));
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISTANCE_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"distance": "far"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let err = client.distance((0.0, 0.0), (1.0, 1.0)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(ServiceKind::Distance, _)));
    }

    #[tokio::test]
    async fn test_fetch_returns_raw_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(WEATHER_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"weather": "Rain", "extra": 1})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_secs(5));
        let value = client
            .fetch(ServiceKind::Weather, &[("city", "Bern".to_string())])
            .await
            .unwrap();
        assert_eq!(value["extra"], 1);
    }

    #[tokio::test]
    async fn test_slow_response_is_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(WEATHER_PATH))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"weather": "Fog"}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, Duration::from_millis(50));
        let err = client.weather("Zurich", date()).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(ServiceKind::Weather)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let endpoint = |path: &str| ServiceEndpoint {
            url: format!("http://127.0.0.1:1{}", path),
            code: "code".to_string(),
        };
        let client = ServiceClient::new(
            endpoint(WEATHER_PATH),
            endpoint(DISTANCE_PATH),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = client.weather("Zurich", date()).await.unwrap_err();
        assert!(err.is_transport(), "expected transport error, got {:?}", err);
        assert_eq!(err.service(), ServiceKind::Weather);
    }
}
