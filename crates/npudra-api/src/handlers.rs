//! REST API handlers.
//!
//! Each handler calls into `DeviceState` on the blocking pool and returns
//! JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use npudra_partition::PhysicalDevice;
use npudra_plugin::{PluginError, ResourceClaim};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// Caller mistakes map to 4xx, everything else is ours.
fn status_for(err: &PluginError) -> StatusCode {
    match err {
        PluginError::NotAllocatable(_)
        | PluginError::InvalidClaim(_)
        | PluginError::ClaimNotAllocated(_) => StatusCode::BAD_REQUEST,
        PluginError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PluginError::Persistence(_)
        | PluginError::Cdi(_)
        | PluginError::Discovery(_)
        | PluginError::DeviceClass(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn plugin_error(err: &PluginError) -> axum::response::Response {
    error_response(&err.to_string(), status_for(err)).into_response()
}

fn join_error(err: tokio::task::JoinError) -> axum::response::Response {
    warn!(error = %err, "blocking task failed");
    error_response("internal task failed", StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

// ── Claims ─────────────────────────────────────────────────────

/// GET /api/v1/claims
pub async fn list_claims(State(api): State<ApiState>) -> impl IntoResponse {
    let state = api.state.clone();
    match tokio::task::spawn_blocking(move || state.prepared_claims()).await {
        Ok(Ok(claims)) => ApiResponse::ok(claims).into_response(),
        Ok(Err(e)) => plugin_error(&e),
        Err(e) => join_error(e),
    }
}

/// POST /api/v1/claims
pub async fn prepare_claim(
    State(api): State<ApiState>,
    Json(claim): Json<ResourceClaim>,
) -> impl IntoResponse {
    let state = api.state.clone();
    match tokio::task::spawn_blocking(move || state.prepare(&claim)).await {
        Ok(Ok(devices)) => ApiResponse::ok(devices).into_response(),
        Ok(Err(e)) => plugin_error(&e),
        Err(e) => join_error(e),
    }
}

/// DELETE /api/v1/claims/:uid
pub async fn unprepare_claim(
    State(api): State<ApiState>,
    Path(uid): Path<String>,
) -> impl IntoResponse {
    let state = api.state.clone();
    let claim_uid = uid.clone();
    match tokio::task::spawn_blocking(move || state.unprepare(&claim_uid)).await {
        Ok(Ok(warnings)) => ApiResponse::ok(serde_json::json!({
            "claim": uid,
            "warnings": warnings.iter().map(|w| w.to_string()).collect::<Vec<_>>(),
        }))
        .into_response(),
        Ok(Err(e)) => plugin_error(&e),
        Err(e) => join_error(e),
    }
}

// ── Devices ────────────────────────────────────────────────────

/// GET /api/v1/devices
pub async fn list_devices(State(api): State<ApiState>) -> impl IntoResponse {
    let devices: Vec<_> = api.state.allocatable_devices().into_values().collect();
    ApiResponse::ok(devices)
}

/// GET /api/v1/partitions
pub async fn list_partitions(State(api): State<ApiState>) -> impl IntoResponse {
    let cards: Vec<PhysicalDevice> = api
        .state
        .partitions()
        .map(|p| p.physical_devices())
        .unwrap_or_default();
    ApiResponse::ok(cards)
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
