use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use relay_common::metrics::setup_metrics_routes;
use relay_common::store::ResponseStore;

use crate::{events, sink};

#[derive(Clone)]
pub struct State {
    pub sink: Arc<dyn sink::EventSink + Send + Sync>,
    pub store: Arc<dyn ResponseStore + Send + Sync>,
}

async fn index() -> &'static str {
    "relay-api"
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

pub fn router<
    S: sink::EventSink + Send + Sync + 'static,
    R: ResponseStore + Send + Sync + 'static,
>(
    sink: S,
    store: R,
    metrics: bool,
) -> Router {
    let state = State {
        sink: Arc::new(sink),
        store: Arc::new(store),
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/events", post(events::events))
        .route("/responses/:request_id", get(events::response_lookup))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the library is used in tests
    // does not work well.
    if metrics {
        setup_metrics_routes(router)
    } else {
        router
    }
}
