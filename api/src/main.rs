// Event Finder API v0.1
use axum::routing::get;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use routes::events::{AppState, ListingSettings, CACHE_STATUS_HEADER};
use services::cache::ResultCache;
use services::client::ServiceClient;
use services::scheduler::FanOutScheduler;

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

/// Event Finder API: OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Event Finder API",
        version = "0.1.0",
        description = "Lists upcoming events near a user location. Each event is enriched \
            with the forecast weather for its city and day and the distance from the user, \
            fetched concurrently from two external services under a per-request deadline. \
            Enriched pages are cached for a short time.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Events", description = "Upcoming events with weather and distance"),
    ),
    paths(
        routes::health::health_check,
        routes::events::list_events,
        routes::events::create_event,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::events::CreateEventRequest,
            routes::events::EventResponse,
            routes::events::EventEntry,
            routes::events::EnrichmentFailure,
            routes::events::EnrichmentSummary,
            routes::events::EventPage,
            services::enrichment::EnrichmentErrorKind,
            services::client::ServiceKind,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "event_finder_api=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Set up database connection pool
    let pool = PgPoolOptions::new()
        .max_connections(DB_POOL_MAX_CONNECTIONS)
        .min_connections(DB_POOL_MIN_CONNECTIONS)
        .connect(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!()
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Database migrations completed");

    let client = ServiceClient::new(
        config.weather.clone(),
        config.distance.clone(),
        config.enrichment.call_timeout,
    )
    .expect("Failed to build HTTP client");

    let app_state = AppState {
        pool,
        scheduler: FanOutScheduler::new(client, config.enrichment.retry_budget),
        cache: Arc::new(ResultCache::new(config.cache_ttl)),
        settings: ListingSettings {
            page_size: config.page_size,
            window_days: config.window_days,
            deadline: config.enrichment.deadline,
            default_strategy: config.enrichment.default_strategy,
            default_workers: config.enrichment.workers,
        },
    };

    tracing::info!(
        strategy = %config.enrichment.default_strategy,
        deadline_ms = config.enrichment.deadline.as_millis() as u64,
        cache_ttl_secs = config.cache_ttl.as_secs(),
        "Enrichment configured"
    );

    // CORS: GET for listing, POST for event creation; expose X-Cache
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static(CACHE_STATUS_HEADER)]);

    let api_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route(
            "/api/v1/events",
            get(routes::events::list_events).post(routes::events::create_event),
        )
        .with_state(app_state);

    let app = Router::new()
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
