use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use crate::http::proxy::VhostMap;

// Runtime introspection endpoints, served on a separate listener when the
// debug server is enabled.
pub(crate) fn debug_router(vhosts: Arc<VhostMap>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/debug/vhosts", get(vhost_list))
        .with_state(vhosts)
}

async fn vhost_list(State(vhosts): State<Arc<VhostMap>>) -> Json<Vec<String>> {
    let mut hosts: Vec<String> = vhosts.iter().map(|entry| entry.key().clone()).collect();
    hosts.sort();
    Json(hosts)
}
