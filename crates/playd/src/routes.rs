//! REST API surface: session lifecycle, platform profiles, placement
//! queries, billing reads, and the agent callback endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use play_billing::{evaluate_caps, rollup, RateTable, UsageFilter, UsageWindow};
use play_orchestrator::{Orchestrator, OrchestratorError, SessionRequest};
use play_persist::{HostStore, ProfileStore};
use play_proto::{
    Coord, EndedEvent, ErrorKind, Host, HostProvider, HostState, IdleEvent, PlatformProfile,
    SaveEvent, StartedEvent,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub orch: Arc<Orchestrator>,
    pub hosts: Arc<HostStore>,
    pub profiles: Arc<ProfileStore>,
    pub rates: Arc<RateTable>,
    pub monthly_soft_cap_usd: f64,
    pub monthly_hard_cap_usd: f64,
}

// ─── Error surface ───────────────────────────────────────────────────────────

pub struct ApiError {
    kind: ErrorKind,
    detail: String,
}

impl ApiError {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { kind, detail: detail.into() }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, detail)
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self { kind: e.kind(), detail: e.to_string() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.kind.to_string(),
            "detail": self.detail,
        });
        (status, Json(body)).into_response()
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health))
        // Sessions
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{host_id}", get(get_session).delete(destroy_session))
        .route("/sessions/{host_id}/stop", post(stop_session))
        .route("/sessions/{host_id}/start", post(start_session))
        // Platform profiles
        .route("/platforms", get(list_platforms))
        .route("/platforms/{platform}", get(get_platform).put(put_platform))
        // Placement optimizer (read-only)
        .route("/placements/candidates", get(placement_candidates))
        // Billing
        .route("/billing", get(billing_report))
        .route("/billing/alerts", get(billing_alerts))
        .route("/fleet/status", get(fleet_status))
        // Agent callbacks
        .route("/hosts/{vm_token}/manifest", get(agent_manifest))
        .route("/hosts/{host_id}/started", post(agent_started))
        .route("/hosts/{host_id}/save_event", post(agent_save_event))
        .route("/hosts/{host_id}/idle", post(agent_idle))
        .route("/hosts/{host_id}/ended", post(agent_ended))
        .layer(build_cors(cors_origins))
        .with_state(state)
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(parsed).allow_methods(Any).allow_headers(Any)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy", "service": "playd" }))
}

// ─── Sessions ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    user_id: String,
    platform: String,
    user_coord: Option<Coord>,
    rom_ref: Option<String>,
    save_ref: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<Host>), ApiError> {
    let host = state
        .orch
        .request_session(SessionRequest {
            user_id: body.user_id,
            platform: body.platform,
            user_coord: body.user_coord,
            rom_ref: body.rom_ref,
            save_ref: body.save_ref,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(host)))
}

#[derive(Debug, Deserialize)]
struct SessionListQuery {
    state: Option<HostState>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionListQuery>,
) -> Json<Vec<Host>> {
    Json(state.orch.list_sessions(query.state))
}

async fn get_session(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<Json<Host>, ApiError> {
    Ok(Json(state.orch.describe_session(&host_id)?))
}

async fn stop_session(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<(StatusCode, Json<Host>), ApiError> {
    let host = state.orch.stop_session(&host_id).await?;
    Ok((StatusCode::ACCEPTED, Json(host)))
}

async fn start_session(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<(StatusCode, Json<Host>), ApiError> {
    let host = state.orch.start_session(&host_id).await?;
    Ok((StatusCode::ACCEPTED, Json(host)))
}

async fn destroy_session(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<(StatusCode, Json<Host>), ApiError> {
    let host = state.orch.destroy_session(&host_id).await?;
    Ok((StatusCode::ACCEPTED, Json(host)))
}

// ─── Platform profiles ───────────────────────────────────────────────────────

async fn list_platforms(State(state): State<AppState>) -> Json<Vec<PlatformProfile>> {
    Json(state.profiles.list())
}

async fn get_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
) -> Result<Json<PlatformProfile>, ApiError> {
    state
        .profiles
        .get(&platform)
        .map(Json)
        .ok_or_else(|| ApiError::new(ErrorKind::UnknownPlatform, format!("unknown platform '{platform}'")))
}

async fn put_platform(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    Json(mut profile): Json<PlatformProfile>,
) -> Result<Json<PlatformProfile>, ApiError> {
    if profile.platform != platform {
        return Err(ApiError::bad_request(format!(
            "body platform '{}' does not match path '{platform}'",
            profile.platform
        )));
    }
    if let Some(existing) = state.profiles.get(&platform) {
        profile.created_at = existing.created_at;
    }
    profile.updated_at = Utc::now();
    state
        .profiles
        .upsert(profile.clone())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(profile))
}

// ─── Placement ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PlacementQuery {
    provider: HostProvider,
    lat: Option<f64>,
    lon: Option<f64>,
    platform: Option<String>,
}

async fn placement_candidates(
    State(state): State<AppState>,
    Query(query): Query<PlacementQuery>,
) -> Result<Json<play_orchestrator::PlacementCandidates>, ApiError> {
    let coord = match (query.lat, query.lon) {
        (Some(lat), Some(lon)) => {
            let coord = Coord::new(lat, lon);
            if !coord.is_valid() {
                return Err(ApiError::bad_request(format!("coordinate out of range: ({lat}, {lon})")));
            }
            Some(coord)
        }
        (None, None) => None,
        _ => return Err(ApiError::bad_request("lat and lon must be supplied together")),
    };

    let candidates = state
        .orch
        .placement_candidates(query.provider, coord, query.platform.as_deref())
        .await?;
    Ok(Json(candidates))
}

// ─── Billing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BillingQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    provider: Option<HostProvider>,
    user_id: Option<String>,
}

async fn billing_report(
    State(state): State<AppState>,
    Query(query): Query<BillingQuery>,
) -> Result<Json<play_billing::UsageReport>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::days(30));
    let window = UsageWindow::new(from, to).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let filter = UsageFilter { provider: query.provider, user_id: query.user_id };
    let report = rollup(&state.hosts.list(), window, &filter, &state.rates);
    Ok(Json(report))
}

async fn billing_alerts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let report = rollup(
        &state.hosts.list(),
        UsageWindow::current_month(),
        &UsageFilter::default(),
        &state.rates,
    );
    let (status, alerts) = evaluate_caps(
        report.totals.estimated_cost,
        state.monthly_soft_cap_usd,
        state.monthly_hard_cap_usd,
    );
    Json(serde_json::json!({
        "status": status,
        "monthly_estimate_usd": report.totals.estimated_cost,
        "soft_cap_usd": state.monthly_soft_cap_usd,
        "hard_cap_usd": state.monthly_hard_cap_usd,
        "alerts": alerts,
    }))
}

async fn fleet_status(State(state): State<AppState>) -> Json<play_proto::FleetStatus> {
    Json(state.orch.fleet_status())
}

// ─── Agent callbacks ─────────────────────────────────────────────────────────

async fn agent_manifest(
    State(state): State<AppState>,
    Path(vm_token): Path<String>,
) -> Result<Json<play_proto::SessionManifest>, ApiError> {
    Ok(Json(state.orch.manifest_for(&vm_token)?))
}

async fn agent_started(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(ev): Json<StartedEvent>,
) -> Result<Json<Host>, ApiError> {
    Ok(Json(state.orch.agent_started(&host_id, ev).await?))
}

async fn agent_save_event(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(ev): Json<SaveEvent>,
) -> Result<Json<Host>, ApiError> {
    Ok(Json(state.orch.agent_save_event(&host_id, ev).await?))
}

async fn agent_idle(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(ev): Json<IdleEvent>,
) -> Result<Json<Host>, ApiError> {
    Ok(Json(state.orch.agent_idle(&host_id, ev).await?))
}

async fn agent_ended(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(ev): Json<EndedEvent>,
) -> Result<Json<Host>, ApiError> {
    Ok(Json(state.orch.agent_ended(&host_id, ev).await?))
}
