//! ==============================================================================
//! server.rs - dashboard json api
//! ==============================================================================
//!
//! purpose:
//!     serves the derived views (filtered list, proximity groups, map
//!     features) and forwards ui commands to the hub.
//!
//! relationships:
//!     - reads: hub.rs (HubView through HubHandle)
//!     - uses: filter.rs, proximity.rs, projector.rs (pure, per request)
//!     - forwards: sensor writes to loader.rs (SensorApi); the push channel
//!       brings the result back into the collection
//!
//! routes:
//!     GET    /api/sensors            filtered collection
//!     POST   /api/sensors            create (backend)
//!     GET    /api/sensors/:id        one sensor (local, else backend)
//!     PUT    /api/sensors/:id        update (backend)
//!     DELETE /api/sensors/:id        delete (backend)
//!     GET    /api/groups             proximity groups of the filtered list
//!     GET    /api/map                geojson + cluster options + style url
//!     POST   /api/map/click          map interaction -> camera instruction
//!     GET    /api/selection          focused sensor
//!     PUT    /api/selection          focus / clear
//!     POST   /api/reload             manual snapshot re-load
//!     GET    /api/status             sync + connection state, banner
//!
//! ==============================================================================

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::channel::ConnectionState;
use crate::domain::{SensorId, SensorRecord};
use crate::error::{ConfigurationError, FetchFailure, HubError};
use crate::filter::SensorFilter;
use crate::hub::HubHandle;
use crate::loader::SensorApi;
use crate::projector::{
    project_records, CameraInstruction, ClusterSourceOptions, FeatureCollection, MapInteraction,
};
use crate::proximity::{group_by_proximity, SensorGroup};
use crate::sync::SyncState;

// ==============================================================================
// shared state
// ==============================================================================
// handlers only hold a HubHandle: reads come from the watched view, writes
// go through the hub's command queue. nothing here locks sensor state.

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub api: SensorApi,
    /// resolved once at startup; an error only disables the map views
    pub map_style: Result<String, ConfigurationError>,
    pub threshold_km: f64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sensors", get(list_sensors).post(create_sensor))
        .route(
            "/api/sensors/:id",
            get(get_sensor).put(update_sensor).delete(delete_sensor),
        )
        .route("/api/groups", get(list_groups))
        .route("/api/map", get(map_data))
        .route("/api/map/click", post(map_click))
        .route("/api/selection", get(get_selection).put(put_selection))
        .route("/api/reload", post(reload))
        .route("/api/status", get(status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==============================================================================
// errors
// ==============================================================================

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Backend(#[from] FetchFailure),

    #[error(transparent)]
    Config(#[from] ConfigurationError),

    #[error("Sensor {0} not found")]
    NotFound(SensorId),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Hub(_) | ApiError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Backend(FetchFailure::Status { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::Backend(FetchFailure::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Backend(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, %status, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

// ==============================================================================
// list views
// ==============================================================================

/// GET /api/sensors?status=&search=&tempMin=...
async fn list_sensors(
    State(state): State<AppState>,
    Query(filter): Query<SensorFilter>,
) -> Json<Vec<SensorRecord>> {
    let view = state.hub.view();
    Json(filter.apply(view.sensors.records()).into_iter().cloned().collect())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupParams {
    threshold_km: Option<f64>,
}

/// GET /api/groups?thresholdKm=&...filters
async fn list_groups(
    State(state): State<AppState>,
    Query(filter): Query<SensorFilter>,
    Query(params): Query<GroupParams>,
) -> Result<Json<Vec<SensorGroup>>, ApiError> {
    let threshold = params.threshold_km.unwrap_or(state.threshold_km);
    if !(threshold.is_finite() && threshold >= 0.0) {
        return Err(ApiError::BadRequest(format!(
            "thresholdKm must be a non-negative distance, got {threshold}"
        )));
    }
    let view = state.hub.view();
    let filtered = filter.apply(view.sensors.records());
    Ok(Json(group_by_proximity(filtered, threshold)))
}

// ==============================================================================
// map views
// ==============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MapBody {
    style_url: String,
    source: ClusterSourceOptions,
    data: FeatureCollection,
    selection: Option<SensorId>,
}

/// GET /api/map?...filters
async fn map_data(
    State(state): State<AppState>,
    Query(filter): Query<SensorFilter>,
) -> Result<Json<MapBody>, ApiError> {
    let style_url = state.map_style.clone()?;
    let view = state.hub.view();
    Ok(Json(MapBody {
        style_url,
        source: ClusterSourceOptions::default(),
        data: project_records(filter.apply(view.sensors.records())),
        selection: view.selection.clone(),
    }))
}

/// POST /api/map/click
async fn map_click(
    State(state): State<AppState>,
    Json(interaction): Json<MapInteraction>,
) -> Result<Json<CameraInstruction>, ApiError> {
    Ok(Json(state.hub.map_click(interaction).await?))
}

// ==============================================================================
// selection
// ==============================================================================

#[derive(Debug, Serialize)]
struct SelectionBody {
    selection: Option<SensorId>,
    sensor: Option<SensorRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct SelectionRequest {
    #[serde(default)]
    id: Option<SensorId>,
}

async fn get_selection(State(state): State<AppState>) -> Json<SelectionBody> {
    let view = state.hub.view();
    Json(SelectionBody {
        sensor: view.selected_record().cloned(),
        selection: view.selection,
    })
}

async fn put_selection(
    State(state): State<AppState>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<SelectionBody>, ApiError> {
    let sensor = state.hub.set_selection(request.id.clone()).await?;
    Ok(Json(SelectionBody {
        selection: request.id,
        sensor,
    }))
}

// ==============================================================================
// sync control + status
// ==============================================================================

/// POST /api/reload
async fn reload(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.hub.reload().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "reloading" })),
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    sync_state: SyncState,
    connection: ConnectionState,
    loading: bool,
    sensors: usize,
    revision: u64,
    pending_deltas: usize,
    last_error: Option<String>,
    map_configured: bool,
}

/// GET /api/status
async fn status(State(state): State<AppState>) -> Json<StatusBody> {
    let view = state.hub.view();
    Json(StatusBody {
        sync_state: view.sync_state,
        connection: view.connection,
        loading: view.loading,
        sensors: view.sensors.len(),
        revision: view.revision,
        pending_deltas: view.pending_deltas,
        last_error: view.last_error,
        map_configured: state.map_style.is_ok(),
    })
}

// ==============================================================================
// sensor crud (forwarded)
// ==============================================================================

/// local copy first; an id the hub has not seen yet may still exist upstream
async fn get_sensor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SensorRecord>, ApiError> {
    if let Some(record) = state.hub.view().sensors.find(&id) {
        return Ok(Json(record.clone()));
    }
    let id = SensorId::parse(&id);
    match state.api.fetch_sensor(&id).await {
        Ok(record) => Ok(Json(record)),
        Err(FetchFailure::Status { status: 404, .. }) => Err(ApiError::NotFound(id)),
        Err(e) => Err(e.into()),
    }
}

async fn create_sensor(
    State(state): State<AppState>,
    Json(record): Json<SensorRecord>,
) -> Result<(StatusCode, Json<SensorRecord>), ApiError> {
    let created = state.api.create_sensor(&record).await?;
    tracing::info!(id = %created.id, "sensor created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_sensor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(record): Json<SensorRecord>,
) -> Result<Json<SensorRecord>, ApiError> {
    let id = SensorId::parse(&id);
    if !record.id.same_key(&id) {
        return Err(ApiError::BadRequest(format!(
            "body id {} does not match path id {id}",
            record.id
        )));
    }
    let updated = state.api.update_sensor(&record.id, &record).await?;
    tracing::info!(id = %record.id, "sensor updated");
    Ok(Json(updated))
}

async fn delete_sensor(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = SensorId::parse(&id);
    state.api.delete_sensor(&id).await?;
    tracing::info!(%id, "sensor deleted");
    Ok(StatusCode::NO_CONTENT)
}
