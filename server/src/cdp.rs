//! Metadata client for a forwarded DevTools HTTP endpoint.
//!
//! Each method issues exactly one request to `http://127.0.0.1:<port>/...`
//! with a bounded timeout and no retries; callers decide whether a failure is
//! fatal. Responses are returned as `serde_json::Value`. Bodies that are not
//! JSON (`/json/activate` answers with plain text, the inspector page is HTML)
//! come back as a `Value::String` so they can flow through the same rewrite
//! path as everything else.
//!
//! See <https://chromedevtools.github.io/devtools-protocol/> for the endpoints.

use std::time::Duration;

use reqwest::{header, Method};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by [`CdpClient`] methods.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport failure: connection refused, reset, or timeout.
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    /// The endpoint answered with a non-2xx status.
    #[error("{url} responded with HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
}

/// HTTP client for the DevTools endpoints behind a local forward.
#[derive(Clone)]
pub struct CdpClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl CdpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// `GET /json/version`: browser info including `webSocketDebuggerUrl`.
    pub async fn version(&self, port: u16) -> Result<Value, FetchError> {
        self.request(Method::GET, port, "/json/version").await
    }

    /// `GET /json/list`: the debuggable pages.
    pub async fn list(&self, port: u16) -> Result<Value, FetchError> {
        self.request(Method::GET, port, "/json/list").await
    }

    /// `GET /json/protocol`: the protocol schema.
    pub async fn protocol(&self, port: u16) -> Result<Value, FetchError> {
        self.request(Method::GET, port, "/json/protocol").await
    }

    /// `PUT /json/new?<url>`: open a new tab, optionally at `url`.
    pub async fn open_tab(&self, port: u16, url: Option<&str>) -> Result<Value, FetchError> {
        let path = match url.filter(|u| !u.is_empty()) {
            Some(u) => format!("/json/new?{}", urlencoding::encode(u)),
            None => "/json/new".to_string(),
        };
        self.request(Method::PUT, port, &path).await
    }

    /// `GET /json/activate/<id>`: bring a target to the foreground.
    pub async fn activate_tab(&self, port: u16, target_id: &str) -> Result<Value, FetchError> {
        let path = format!("/json/activate/{}", urlencoding::encode(target_id));
        self.request(Method::GET, port, &path).await
    }

    /// `GET /json/close/<id>`: close a target.
    pub async fn close_tab(&self, port: u16, target_id: &str) -> Result<Value, FetchError> {
        let path = format!("/json/close/{}", urlencoding::encode(target_id));
        self.request(Method::GET, port, &path).await
    }

    /// `GET /devtools/inspector.html`: the bundled front-end entry page.
    pub async fn inspector(&self, port: u16) -> Result<Value, FetchError> {
        self.request(Method::GET, port, "/devtools/inspector.html")
            .await
    }

    async fn request(&self, method: Method, port: u16, path: &str) -> Result<Value, FetchError> {
        let url = format!("http://127.0.0.1:{port}{path}");
        // The same local port is re-pointed at different device sockets during
        // discovery, so a pooled connection could reach the previous target.
        let resp = self
            .http
            .request(method, &url)
            .header(header::CONNECTION, "close")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;
        let status = resp.status();
        let body = resp.text().await.map_err(|source| FetchError::Request {
            url: url.clone(),
            source,
        })?;
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }
        Ok(parse_body(body))
    }
}

/// JSON when the body parses, otherwise the raw text as a string value.
fn parse_body(body: String) -> Value {
    serde_json::from_str(&body).unwrap_or(Value::String(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, RawQuery},
        routing::{get, put},
        Json, Router,
    };
    use serde_json::json;

    async fn serve(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[test]
    fn test_parse_body_falls_back_to_text() {
        assert_eq!(parse_body("{\"a\":1}".to_string()), json!({"a": 1}));
        assert_eq!(
            parse_body("Target activated".to_string()),
            json!("Target activated")
        );
    }

    #[tokio::test]
    async fn test_endpoints_round_trip() {
        let app = Router::new()
            .route(
                "/json/version",
                get(|| async { Json(json!({"Browser": "Chrome/120"})) }),
            )
            .route(
                "/json/new",
                put(|RawQuery(q): RawQuery| async move { Json(json!({"query": q})) }),
            )
            .route(
                "/json/activate/{id}",
                get(|Path(id): Path<String>| async move { format!("Target {id} activated") }),
            );
        let port = serve(app).await;
        let client = CdpClient::new(Duration::from_secs(2));

        assert_eq!(
            client.version(port).await.unwrap(),
            json!({"Browser": "Chrome/120"})
        );
        assert_eq!(
            client.open_tab(port, Some("https://example.com/?a=b")).await.unwrap(),
            json!({"query": "https%3A%2F%2Fexample.com%2F%3Fa%3Db"})
        );
        assert_eq!(
            client.open_tab(port, None).await.unwrap(),
            json!({"query": null})
        );
        assert_eq!(
            client.activate_tab(port, "ABC").await.unwrap(),
            json!("Target ABC activated")
        );
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let port = serve(Router::new()).await;
        let client = CdpClient::new(Duration::from_secs(2));
        let err = client.list(port).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = CdpClient::new(Duration::from_secs(2));
        let err = client.version(port).await.unwrap_err();
        assert!(matches!(err, FetchError::Request { .. }));
    }
}
