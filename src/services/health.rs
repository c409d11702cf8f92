use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::database::connection::DatabaseManager;
use crate::database::models::{Campaign, CampaignId};
use crate::database::store::CampaignStore;
use crate::utils::logging::log_database_error;

const DEFAULT_LIST_LIMIT: i64 = 20;
const MAX_LIST_LIMIT: i64 = 200;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub database: DatabaseHealth,
    pub dispatch: Option<DispatchHealth>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub status: String,
    pub backend: String,
    pub connection_pool_size: u32,
    pub response_time_ms: u64,
}

/// Backlog and recent throughput, as seen from the store.
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchHealth {
    /// Campaigns in `pending` or `processing`.
    pub backlog: usize,
    pub delivered_last_hour: i64,
}

#[derive(Debug, Deserialize)]
pub struct CampaignListQuery {
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseManager>,
    pub store: Arc<dyn CampaignStore>,
    pub start_time: DateTime<Utc>,
}

/// Health probes plus a read-only view of campaign progress.
pub struct HealthService {
    pub router: Router,
}

impl HealthService {
    pub fn new(db: Arc<DatabaseManager>, store: Arc<dyn CampaignStore>) -> Self {
        let state = AppState {
            db,
            store,
            start_time: Utc::now(),
        };

        let router = Router::new()
            .route("/health", get(health_check))
            .route("/health/ready", get(readiness_check))
            .route("/health/live", get(|| async { Json("alive") }))
            .route("/campaigns", get(list_campaigns))
            .route("/campaigns/:id", get(get_campaign))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        Self { router }
    }
}

/// Pings the database, returning whether it answered and how long it took.
async fn probe_database(db: &DatabaseManager) -> (bool, u64) {
    let start = Instant::now();
    let healthy = db.ping().await.is_ok();
    (healthy, start.elapsed().as_millis() as u64)
}

async fn dispatch_health(store: &dyn CampaignStore) -> Option<DispatchHealth> {
    let backlog = store.dispatchable_campaign_ids().await.ok()?.len();
    let delivered_last_hour = store
        .delivered_since(None, Utc::now() - Duration::hours(1))
        .await
        .ok()?;
    Some(DispatchHealth {
        backlog,
        delivered_last_hour,
    })
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, StatusCode> {
    let (healthy, response_time_ms) = probe_database(&state.db).await;
    if !healthy {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let now = Utc::now();
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: now,
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: DatabaseHealth {
            status: "healthy".to_string(),
            backend: state.db.backend().to_string(),
            connection_pool_size: state.db.pool_size(),
            response_time_ms,
        },
        dispatch: dispatch_health(state.store.as_ref()).await,
        uptime_seconds: now.signed_duration_since(state.start_time).num_seconds().max(0) as u64,
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<&'static str>, StatusCode> {
    match probe_database(&state.db).await {
        (true, _) => Ok(Json("ready")),
        (false, _) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn list_campaigns(
    State(state): State<AppState>,
    Query(query): Query<CampaignListQuery>,
) -> Result<Json<Vec<Campaign>>, StatusCode> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    state.store.recent_campaigns(limit).await.map(Json).map_err(|e| {
        log_database_error("SELECT", "campaigns", &e.to_string(), Some("campaign list"));
        StatusCode::SERVICE_UNAVAILABLE
    })
}

async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<CampaignId>,
) -> Result<Json<Campaign>, StatusCode> {
    match state.store.find_campaign(id).await {
        Ok(Some(campaign)) => Ok(Json(campaign)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            log_database_error("SELECT", "campaigns", &e.to_string(), Some(&format!("id={id}")));
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
