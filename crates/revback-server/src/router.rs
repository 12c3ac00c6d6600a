use crate::state::AppState;
use crate::webhook::{health, receive_webhook};
use axum::{routing::get, routing::post, Router};
use tower_http::trace::TraceLayer;

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/:org_slug/:source", post(receive_webhook))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
