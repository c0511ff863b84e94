use axum::{routing::get, Router};

use crate::wisp::{wisp_ws_handler, WispConfig, WispState};

async fn healthz() -> &'static str {
    "ok"
}

/// Register all routes
pub async fn build_router() -> anyhow::Result<Router> {
    // Create Wisp state from the environment-derived configuration
    let config = WispConfig::from_env()?;
    let wisp_state = WispState::new(config);

    Ok(Router::new()
        // Wisp WebSocket endpoint
        .route("/wisp/", get(wisp_ws_handler).with_state(wisp_state))
        .route("/healthz", get(healthz)))
}
