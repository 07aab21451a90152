//! HTTP route handlers.
//!
//! | Method | Path                                          | Auth  |
//! |--------|-----------------------------------------------|-------|
//! | GET    | `/api/health`                                 | No    |
//! | GET    | `/api/targets`                                | Yes*  |
//! | POST   | `/api/targets/proxy`                          | Yes*  |
//! | POST   | `/api/targets/unproxy`                        | Yes*  |
//! | GET    | `/cdp/{instance}/{alias}/json[/list]`         | No    |
//! | GET    | `/cdp/{instance}/{alias}/json/version`        | No    |
//! | GET    | `/cdp/{instance}/{alias}/json/protocol`       | No    |
//! | PUT    | `/cdp/{instance}/{alias}/json/new`            | No    |
//! | GET    | `/cdp/{instance}/{alias}/json/activate/{id}`  | No    |
//! | GET    | `/cdp/{instance}/{alias}/json/close/{id}`     | No    |
//! | GET    | `/cdp/{instance}/{alias}/devtools/inspector.html` | No |
//!
//! *Only when `auth.api_key` is set.
//!
//! Everything is mounted under `server.base_path`. WebSocket relays are not
//! listed here: they are registered at runtime and dispatched by
//! [`crate::ws::ws_fallback`].

pub mod cdp;
pub mod health;
pub mod targets;

use axum::{
    middleware,
    routing::{get, post, put},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::ws::ws_fallback;
use crate::AppState;

const SESSION_ROOT: &str = "/cdp/{instance}/{alias}";

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let mut command_routes = Router::new()
        .route("/api/targets", get(targets::list))
        .route("/api/targets/proxy", post(targets::proxy))
        .route("/api/targets/unproxy", post(targets::unproxy));
    if let Some(key) = state.config.auth.api_key.clone() {
        command_routes = command_routes
            .layer(middleware::from_fn(auth::require_api_key))
            .layer(Extension(ApiKey(key)));
    }

    let cdp_routes = Router::new()
        .route(&format!("{SESSION_ROOT}/json/version"), get(cdp::version))
        .route(&format!("{SESSION_ROOT}/json"), get(cdp::list))
        .route(&format!("{SESSION_ROOT}/json/list"), get(cdp::list))
        .route(&format!("{SESSION_ROOT}/json/protocol"), get(cdp::protocol))
        .route(&format!("{SESSION_ROOT}/json/new"), put(cdp::open_tab))
        .route(
            &format!("{SESSION_ROOT}/json/activate/{{target_id}}"),
            get(cdp::activate),
        )
        .route(
            &format!("{SESSION_ROOT}/json/close/{{target_id}}"),
            get(cdp::close),
        )
        .route(
            &format!("{SESSION_ROOT}/devtools/inspector.html"),
            get(cdp::inspector),
        );

    let api = Router::new()
        .merge(public_routes)
        .merge(command_routes)
        .merge(cdp_routes);

    let base_path = state.config.server.normalized_base_path();
    let app = if base_path.is_empty() {
        api
    } else {
        Router::new().nest(&base_path, api)
    };

    app.fallback(ws_fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
