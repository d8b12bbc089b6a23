//! seisws server library logic: application state, routing and handlers
//! for the FDSN availability and dataselect services.

pub mod api;
pub mod api_availability;
pub mod api_dataselect;
pub mod background;
pub mod config;
pub mod middleware;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::header,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use seisws_access::{load_rules, AccessControlList, AccessError, Snapshot, UserDb};
use seisws_availability::{
    ExtentIndexCache, ExtentSource, RestrictionPolicy, SegmentSource, SqliteArchive,
};
use seisws_db::DbPool;
use seisws_delivery::{FetchPool, RecordSource, SdsRecordSource};
use seisws_track::DbTrackWriter;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::{AvailabilityConfig, Config, DataselectConfig};

/// Maximum request body size (1 MiB). POST selections are line based and small.
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Tracking destinations shared by every request.
#[derive(Clone, Default)]
pub struct TrackingState {
    pub request_log: bool,
    pub db_writer: Option<DbTrackWriter>,
    pub default_user: Option<String>,
    pub user_salt: String,
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Lazily rebuilt extent snapshot.
    pub extents: Arc<ExtentIndexCache>,
    pub segments: Arc<dyn SegmentSource>,
    pub records: Arc<dyn RecordSource>,
    /// Access rules, swapped wholesale on reload.
    pub acl: Arc<Snapshot<AccessControlList>>,
    pub users: Arc<Snapshot<UserDb>>,
    /// Blocking workers shared by all dataselect deliveries.
    pub fetch_pool: FetchPool,
    pub availability: AvailabilityConfig,
    pub dataselect: DataselectConfig,
    pub tracking: TrackingState,
    pub users_file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Reads the access rules table into a fresh ACL.
pub fn load_acl(pool: &DbPool) -> Result<AccessControlList, StartupError> {
    let conn = pool.get()?;
    let rules = load_rules(&conn)?;
    Ok(AccessControlList::new(rules))
}

/// Loads the users file, or an empty user database when none is configured.
pub fn load_users(path: Option<&PathBuf>) -> Result<UserDb, StartupError> {
    match path {
        Some(path) => Ok(UserDb::from_path(path)?),
        None => Ok(UserDb::default()),
    }
}

impl AppState {
    /// Wires the SQLite archive, the SDS record source and the access
    /// snapshots from `config`.
    ///
    /// `db_writer` is only used when database tracking is enabled.
    pub fn build(
        config: &Config,
        pool: DbPool,
        db_writer: Option<DbTrackWriter>,
    ) -> Result<Self, StartupError> {
        let archive = Arc::new(SqliteArchive::new(pool.clone()));
        let policy = RestrictionPolicy {
            open_streams: config
                .availability
                .open_streams
                .as_ref()
                .map(|codes| codes.iter().cloned().collect::<HashSet<_>>()),
            allow_restricted: config.availability.allow_restricted,
        };
        let extents = ExtentIndexCache::new(
            Arc::clone(&archive) as Arc<dyn ExtentSource>,
            policy,
            chrono::Duration::seconds(config.availability.cache_duration_secs as i64),
            config.availability.cache_mode,
        );

        let users_file = config.access.users_file.as_ref().map(PathBuf::from);
        let acl = load_acl(&pool)?;
        tracing::info!(rules = acl.len(), "access rules loaded");
        let users = load_users(users_file.as_ref())?;

        Ok(Self {
            extents: Arc::new(extents),
            segments: archive,
            records: Arc::new(SdsRecordSource::new(&config.dataselect.archive_path)),
            acl: Arc::new(Snapshot::new(acl)),
            users: Arc::new(Snapshot::new(users)),
            fetch_pool: FetchPool::new(config.dataselect.workers),
            availability: config.availability.clone(),
            dataselect: config.dataselect.clone(),
            tracking: TrackingState {
                request_log: config.tracking.request_log,
                db_writer: db_writer.filter(|_| config.tracking.database),
                default_user: config.tracking.default_user.clone(),
                user_salt: config.tracking.user_salt.clone(),
            },
            users_file,
            pool,
        })
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn availability_version() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        api::AVAILABILITY_VERSION,
    )
}

async fn dataselect_version() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        api::DATASELECT_VERSION,
    )
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let mut public_routes = Router::new();
    let mut auth_routes = Router::new();

    if state.availability.enabled {
        public_routes = public_routes
            .route(
                "/fdsnws/ext/availability/1/extent",
                get(api_availability::extent_handler).post(api_availability::extent_handler),
            )
            .route(
                "/fdsnws/ext/availability/1/query",
                get(api_availability::query_handler).post(api_availability::query_handler),
            );
        auth_routes = auth_routes
            .route(
                "/fdsnws/ext/availability/1/extentauth",
                get(api_availability::extent_handler).post(api_availability::extent_handler),
            )
            .route(
                "/fdsnws/ext/availability/1/queryauth",
                get(api_availability::query_handler).post(api_availability::query_handler),
            );
    }
    if state.dataselect.enabled {
        public_routes = public_routes.route(
            "/fdsnws/dataselect/1/query",
            get(api_dataselect::query_handler).post(api_dataselect::query_handler),
        );
        auth_routes = auth_routes.route(
            "/fdsnws/dataselect/1/queryauth",
            get(api_dataselect::query_handler).post(api_dataselect::query_handler),
        );
    }

    let mut router = Router::new().route("/health", get(health));
    if state.availability.enabled {
        router = router.route("/fdsnws/ext/availability/1/version", get(availability_version));
    }
    if state.dataselect.enabled {
        router = router.route("/fdsnws/dataselect/1/version", get(dataselect_version));
    }

    // route_layer keeps unmatched paths on the plain 404 fallback and
    // panics on a router without routes.
    if state.availability.enabled || state.dataselect.enabled {
        router = router
            .merge(
                public_routes
                    .route_layer(axum::middleware::from_fn(middleware::caller_middleware)),
            )
            .merge(auth_routes.route_layer(axum::middleware::from_fn(middleware::auth_middleware)));
    }

    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
