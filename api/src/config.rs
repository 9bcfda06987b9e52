use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use crate::services::scheduler::{Strategy, DEFAULT_POOL_WORKERS};

/// Accepted forward window, in days.
const WINDOW_DAYS_RANGE: RangeInclusive<i64> = 0..=366;
/// Accepted page size.
const PAGE_SIZE_RANGE: RangeInclusive<u32> = 1..=100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// Endpoint and access code for one downstream service.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub url: String,
    pub code: String,
}

/// Tuning knobs for the enrichment fan-out.
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Per-call timeout applied by the service client.
    pub call_timeout: Duration,
    /// Aggregate budget for one page of events.
    pub deadline: Duration,
    pub workers: usize,
    pub default_strategy: Strategy,
    /// Transient-failure retries shared by every task of one batch.
    pub retry_budget: u32,
}

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub weather: ServiceEndpoint,
    pub distance: ServiceEndpoint,
    pub enrichment: EnrichmentConfig,
    pub cache_ttl: Duration,
    pub page_size: u32,
    /// Days ahead of today that count as "upcoming".
    pub window_days: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let workers = parsed("ENRICHMENT_WORKERS", DEFAULT_POOL_WORKERS)?;
        let default_strategy =
            parsed("ENRICHMENT_STRATEGY", Strategy::Cooperative)?.with_default_workers(workers);

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            port: parsed("PORT", 8080)?,
            weather: ServiceEndpoint {
                url: required("WEATHER_API_URL")?,
                code: required("WEATHER_API_CODE")?,
            },
            distance: ServiceEndpoint {
                url: required("DISTANCE_API_URL")?,
                code: required("DISTANCE_API_CODE")?,
            },
            enrichment: EnrichmentConfig {
                call_timeout: Duration::from_secs(parsed("ENRICHMENT_CALL_TIMEOUT_SECS", 5)?),
                deadline: Duration::from_millis(parsed("ENRICHMENT_DEADLINE_MS", 10_000)?),
                workers,
                default_strategy,
                retry_budget: parsed("ENRICHMENT_RETRY_BUDGET", 2)?,
            },
            cache_ttl: Duration::from_secs(parsed("CACHE_TTL_SECS", 900)?),
            page_size: bounded("EVENTS_PAGE_SIZE", 10, PAGE_SIZE_RANGE)?,
            window_days: bounded("EVENTS_WINDOW_DAYS", 14, WINDOW_DAYS_RANGE)?,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

fn bounded<T>(name: &'static str, default: T, range: RangeInclusive<T>) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + ToString,
{
    let value = parsed(name, default)?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        })
    }
}
