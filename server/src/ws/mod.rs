//! Dynamic WebSocket routes.
//!
//! Proxy sessions come and go at runtime, so their WebSocket endpoints can't
//! be declared on the axum `Router` up front. [`WsRoutes`] is a small route
//! table keyed by path templates such as
//! `/cdp/{instance}/{alias}/devtools/page/{pageId}`. It is consulted by
//! [`ws_fallback`], the router's fallback handler: when a request path
//! matches a registered template, the upgrade completes and the socket is
//! handed to the route's handler together with the captured parameters.
//! Anything else gets a JSON 404.

pub mod relay;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket},
        OriginalUri, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Named captures of a matched template.
pub type RouteParams = HashMap<String, String>;

/// Called with the upgraded socket once a route matches.
pub type WsHandler = Arc<dyn Fn(WebSocket, RouteParams) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid route template {template:?}: {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("Route {0} is already registered")]
    Duplicate(String),
    #[error("Route {0} is not registered")]
    NotFound(String),
}

/// A path with `{name}` placeholders, matched with the same `matchit`
/// router axum uses. Each placeholder matches one non-empty path segment.
pub struct PathTemplate {
    template: String,
    router: matchit::Router<()>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };
        if !template.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                return Err(invalid("unclosed '{'"));
            };
            let name = &rest[open + 1..open + close];
            let valid_name = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_name {
                return Err(invalid(&format!("bad parameter name {name:?}")));
            }
            if rest[..open].contains('}') {
                return Err(invalid("unmatched '}'"));
            }
            rest = &rest[open + close + 1..];
        }
        if rest.contains('}') {
            return Err(invalid("unmatched '}'"));
        }
        let mut router = matchit::Router::new();
        router
            .insert(template, ())
            .map_err(|e| invalid(&e.to_string()))?;
        Ok(Self {
            template: template.to_string(),
            router,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Captured parameters when `path` matches.
    pub fn matches(&self, path: &str) -> Option<RouteParams> {
        let matched = self.router.at(path).ok()?;
        Some(
            matched
                .params
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        )
    }
}

impl fmt::Debug for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathTemplate").field(&self.template).finish()
    }
}

struct WsRoute {
    template: PathTemplate,
    handler: WsHandler,
}

/// Runtime WebSocket route table.
///
/// Cloneable; all clones share the same table.
#[derive(Clone, Default)]
pub struct WsRoutes {
    routes: Arc<RwLock<Vec<WsRoute>>>,
}

impl WsRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `template`. Fails if the exact template is
    /// already registered.
    pub async fn add(&self, template: &str, handler: WsHandler) -> Result<(), RouteError> {
        let template = PathTemplate::parse(template)?;
        let mut routes = self.routes.write().await;
        if routes.iter().any(|r| r.template.as_str() == template.as_str()) {
            return Err(RouteError::Duplicate(template.as_str().to_string()));
        }
        debug!(route = template.as_str(), "Registered WebSocket route");
        routes.push(WsRoute { template, handler });
        Ok(())
    }

    pub async fn remove(&self, template: &str) -> Result<(), RouteError> {
        let mut routes = self.routes.write().await;
        let before = routes.len();
        routes.retain(|r| r.template.as_str() != template);
        if routes.len() == before {
            return Err(RouteError::NotFound(template.to_string()));
        }
        debug!(route = template, "Removed WebSocket route");
        Ok(())
    }

    /// First route, in registration order, whose template matches `path`.
    pub async fn resolve(&self, path: &str) -> Option<(WsHandler, RouteParams)> {
        let routes = self.routes.read().await;
        routes.iter().find_map(|r| {
            r.template
                .matches(path)
                .map(|params| (Arc::clone(&r.handler), params))
        })
    }

    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    pub async fn contains(&self, template: &str) -> bool {
        self.routes
            .read()
            .await
            .iter()
            .any(|r| r.template.as_str() == template)
    }
}

/// Router fallback: upgrade and dispatch to a registered route, or 404.
///
/// Templates hold full paths (base path included), so matching uses the
/// original request URI even when the fallback runs inside a nested router.
pub async fn ws_fallback(
    State(routes): State<WsRoutes>,
    OriginalUri(uri): OriginalUri,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some((handler, params)) = routes.resolve(uri.path()).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("No route for {}", uri.path()), "code": "not_found"})),
        )
            .into_response();
    };
    match upgrade {
        Ok(ws) => ws.on_upgrade(move |socket| handler(socket, params)),
        Err(rejection) => rejection.into_response(),
    }
}
