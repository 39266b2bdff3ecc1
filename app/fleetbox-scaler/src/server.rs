//! The controller's HTTP surface.
//!
//! Two internal endpoints: `POST /assign`, through which the frontend's
//! webserver requests a mandelbox for a user, and `POST /image_upgrade`,
//! through which the deploy pipeline announces new machine images per
//! region. Assignment blocks on the action's result slot and always
//! answers with the result structure; its `error` field carries the short
//! reason string on rejection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use fleetbox_scaling::{AssignRequest, EventKind, ScalingEvent};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::dispatch::Regions;

/// How long an assign request may sit in the per-region queue before the
/// client gets an error.
const ASSIGN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ServerState {
    pub regions: Arc<Regions>,
}

/// Builds the controller router.
pub fn router(regions: Arc<Regions>) -> Router {
    Router::new()
        .route("/assign", post(assign))
        .route("/image_upgrade", post(image_upgrade))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(ServerState { regions })
}

#[derive(Debug, Deserialize)]
struct AssignBody {
    user_email: String,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default)]
    commit_hash: String,
    #[serde(default)]
    version: String,
}

async fn assign(
    State(state): State<ServerState>,
    Json(body): Json<AssignBody>,
) -> impl IntoResponse {
    let request = AssignRequest::new(
        body.user_email.clone(),
        body.regions.clone(),
        body.commit_hash,
        body.version,
    );
    let result_slot = Arc::clone(&request.result);

    // The assign action scans every requested region itself; routing only
    // chooses which region's task runs it.
    let target_region = body.regions.first().cloned().unwrap_or_default();
    let event = ScalingEvent::new(target_region.clone(), EventKind::MandelboxAssign(request));
    if state.regions.route(&target_region, event).await.is_err() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": fleetbox_scaling::assign::SERVICE_UNAVAILABLE })),
        );
    }

    match tokio::time::timeout(ASSIGN_TIMEOUT, result_slot.wait()).await {
        Ok(Ok(result)) => {
            info!(user = %body.user_email, error = %result.error, "assign request answered");
            (StatusCode::OK, Json(json!(result)))
        }
        Ok(Err(_)) | Err(_) => {
            error!(user = %body.user_email, "assign request never resolved");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": fleetbox_scaling::assign::SERVICE_UNAVAILABLE })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageUpgradeBody {
    region_image_map: HashMap<String, String>,
}

async fn image_upgrade(
    State(state): State<ServerState>,
    Json(body): Json<ImageUpgradeBody>,
) -> impl IntoResponse {
    for (region, image_id) in body.region_image_map {
        let event = ScalingEvent::new(
            region.clone(),
            EventKind::ScheduledImageUpgrade { image_id },
        );
        if state.regions.route(&region, event).await.is_err() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    StatusCode::ACCEPTED
}
