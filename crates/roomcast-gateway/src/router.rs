//! Axum router wiring (HTTP -> WS upgrade, ops endpoints).

use axum::{middleware, routing::get, Router};

use crate::{app_state::AppState, context, ops, transport};

pub fn build_router(state: AppState) -> Router {
    let ws = Router::new()
        .route("/v1/ws", get(transport::ws::ws_upgrade))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            context::require_identity,
        ));

    Router::new()
        .merge(ws)
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .route("/metrics", get(ops::metrics))
        .with_state(state)
}
