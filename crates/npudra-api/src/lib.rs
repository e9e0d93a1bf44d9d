//! npudra-api: REST API for the NPU driver.
//!
//! Exposes claim preparation and the node's device and partition state
//! over HTTP. Controller calls block on the checkpoint store, so every
//! handler runs them on the blocking pool.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/claims` | List prepared claims |
//! | POST | `/api/v1/claims` | Prepare a resource claim |
//! | DELETE | `/api/v1/claims/{uid}` | Unprepare a claim |
//! | GET | `/api/v1/devices` | List allocatable devices |
//! | GET | `/api/v1/partitions` | Snapshot of physical NPUs and slices |
//! | GET | `/healthz` | Liveness |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get};
use npudra_plugin::DeviceState;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub state: Arc<DeviceState>,
}

/// Build the complete API router.
pub fn build_router(state: Arc<DeviceState>) -> Router {
    let api_state = ApiState { state };

    let api_routes = Router::new()
        .route(
            "/claims",
            get(handlers::list_claims).post(handlers::prepare_claim),
        )
        .route("/claims/{uid}", delete(handlers::unprepare_claim))
        .route("/devices", get(handlers::list_devices))
        .route("/partitions", get(handlers::list_partitions))
        .with_state(api_state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
