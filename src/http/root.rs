use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use tracing::error;

use crate::stats::StatsDb;

const TOP_LIMIT: i64 = 10;
const ATTEMPTS_DAYS: i64 = 30;

#[derive(Clone)]
struct RootState {
    domain_name: Arc<str>,
    stats: Option<Arc<StatsDb>>,
}

// Built-in handler for the apex domain: a landing page plus the dashboard
// endpoints backed by the statistics store, when one is configured.
pub(crate) fn root_router(domain_name: &str, stats: Option<Arc<StatsDb>>) -> Router {
    let state = RootState {
        domain_name: domain_name.into(),
        stats,
    };
    Router::new()
        .route("/", get(landing))
        .route("/api/stats/top-countries", get(top_countries))
        .route("/api/stats/top-users", get(top_users))
        .route("/api/stats/top-passwords", get(top_passwords))
        .route("/api/stats/attempts-by-day", get(attempts_by_day))
        .with_state(state)
}

async fn landing(State(state): State<RootState>) -> Html<String> {
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>{domain}</title></head>
<body>
<h1>{domain}</h1>
<p>Expose a local HTTP service with:</p>
<pre>ssh -R &lt;subdomain&gt;:80:localhost:&lt;port&gt; {domain}</pre>
</body>
</html>
"#,
        domain = state.domain_name,
    ))
}

macro_rules! stats_endpoint {
    ($name:ident, $method:ident, $arg:expr) => {
        async fn $name(State(state): State<RootState>) -> axum::response::Response {
            let Some(stats) = state.stats.as_ref() else {
                return StatusCode::NOT_FOUND.into_response();
            };
            match stats.$method($arg).await {
                Ok(data) => Json(data).into_response(),
                Err(err) => {
                    error!(error = %err, "Failed to query statistics.");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
    };
}

stats_endpoint!(top_countries, top_countries, TOP_LIMIT);
stats_endpoint!(top_users, top_users, TOP_LIMIT);
stats_endpoint!(top_passwords, top_passwords, TOP_LIMIT);
stats_endpoint!(attempts_by_day, attempts_by_day, ATTEMPTS_DAYS);

#[cfg(test)]
mod root_router_tests {
    use axum::body::Body;
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::root_router;

    #[tokio::test]
    async fn landing_page_names_the_domain() {
        let router = root_router("example.test", None);
        let response = router
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("example.test"));
    }

    #[tokio::test]
    async fn stats_endpoints_require_a_database() {
        let router = root_router("example.test", None);
        let response = router
            .oneshot(
                Request::get("/api/stats/top-users")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
