use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures::stream::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use ordo_core::protocol::{
    PullResponse, PushRequest, PushResponse, SnapshotResponse, WirePartner, WireProduct, WireUnit,
};

use crate::broadcast::EventBroadcaster;
use crate::config::AppConfig;
use crate::db::ServerStore;
use crate::error::AppError;
use crate::sync::SyncService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: ServerStore,
    pub sync: SyncService,
    pub broadcaster: EventBroadcaster,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, store: ServerStore) -> Self {
        let broadcaster = EventBroadcaster::new();
        let sync = SyncService::new(store.clone(), broadcaster.clone());
        Self {
            config,
            store,
            sync,
            broadcaster,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .route("/sync/snapshot", get(snapshot))
        .route("/sync/events", get(events))
        .route("/partners", get(partners))
        .route("/products", get(products))
        .route("/units", get(units))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn push(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Json<PushResponse> {
    Json(state.sync.process_push(request).await)
}

#[derive(Debug, Deserialize)]
struct PullParams {
    #[serde(default)]
    since: i64,
    limit: Option<i64>,
}

async fn pull(
    State(state): State<AppState>,
    Query(params): Query<PullParams>,
) -> Result<Json<PullResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(100)
        .clamp(1, state.config.pull_page_cap);
    Ok(Json(state.sync.pull(params.since, limit).await?))
}

async fn snapshot(State(state): State<AppState>) -> Result<Json<SnapshotResponse>, AppError> {
    Ok(Json(state.sync.snapshot().await?))
}

/// `GET /sync/events`: one `sync` event per accepted operation, plus
/// periodic `ping` keepalives.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let changes = BroadcastStream::new(state.broadcaster.subscribe()).filter_map(|item| async {
        match item {
            Ok(event) => serde_json::to_string(&event)
                .ok()
                .map(|data| Ok::<_, Infallible>(Event::default().event("sync").data(data))),
            // A lagged receiver just skips; the client recovers via pull.
            Err(_) => None,
        }
    });

    let keepalive = IntervalStream::new(tokio::time::interval(state.config.sse_keepalive))
        .map(|_| Ok::<_, Infallible>(Event::default().event("ping").data("{\"event\":\"ping\"}")));

    Sse::new(futures::stream::select(changes, keepalive))
}

async fn partners(State(state): State<AppState>) -> Result<Json<Vec<WirePartner>>, AppError> {
    Ok(Json(state.store.list_partners().await?))
}

async fn products(State(state): State<AppState>) -> Result<Json<Vec<WireProduct>>, AppError> {
    Ok(Json(state.store.list_products().await?))
}

async fn units(State(state): State<AppState>) -> Result<Json<Vec<WireUnit>>, AppError> {
    Ok(Json(state.store.list_units().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_router_builds_with_in_memory_store() {
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            pull_page_cap: 500,
            sse_keepalive: std::time::Duration::from_secs(30),
            seed_demo_data: false,
        });
        let store = ServerStore::open_in_memory().unwrap();
        let _router = app_router(AppState::new(config, store));
    }
}
