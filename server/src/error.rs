//! Error taxonomy for proxy operations.
//!
//! Orchestrator operations return [`ProxyError`]. Lower layers have their own
//! error types ([`BridgeError`] for the device bridge, [`FetchError`] for the
//! metadata client), which are wrapped with the socket name that was being
//! worked on when they surface here.
//!
//! Every variant maps to an HTTP status and a stable machine-readable code,
//! so command-layer callers receive the message in a JSON body of the form
//! `{"error": "...", "code": "..."}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::adb::BridgeError;
use crate::cdp::FetchError;

/// Errors raised by [`crate::engine::ProxyEngine`] operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("The target '{name}' is already being proxied")]
    AlreadyProxied { name: String },

    #[error("The target '{name}' is not being proxied")]
    UnknownTarget { name: String },

    #[error(
        "The selected port number #{port} to forward the Devtools socket '{name}' is busy. \
         Try to provide another free port number instead"
    )]
    PortUnavailable { port: u16, name: String },

    #[error("Cannot find any free port in range {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Could not create a port forward to the '{socket}' socket: {source}")]
    ForwardCreation {
        socket: String,
        #[source]
        source: BridgeError,
    },

    #[error("The target '{name}' cannot be proxied: {source}")]
    MetadataFetch {
        name: String,
        #[source]
        source: FetchError,
    },

    #[error(
        "The target '{name}' cannot be proxied. The response to /json/version did not \
         contain the required 'webSocketDebuggerUrl' key"
    )]
    MissingDebuggerUrl { name: String },

    #[error(
        "The target '{name}' cannot be proxied. The 'webSocketDebuggerUrl' value '{url}' \
         in the /json/version response is not a valid URL"
    )]
    InvalidUrl { name: String, url: String },

    #[error("Cannot register the websocket route '{template}': {reason}")]
    RouteRegistration { template: String, reason: String },

    #[error("No device session is bound to this proxy engine")]
    NotBound,

    #[error("The operation on '{name}' was aborted before it finished")]
    Aborted { name: String },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl ProxyError {
    /// Stable code included in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyProxied { .. } => "ALREADY_PROXIED",
            Self::UnknownTarget { .. } => "UNKNOWN_TARGET",
            Self::PortUnavailable { .. } => "PORT_UNAVAILABLE",
            Self::PortExhausted { .. } => "PORT_EXHAUSTED",
            Self::ForwardCreation { .. } => "FORWARD_FAILED",
            Self::MetadataFetch { .. } => "METADATA_FETCH_FAILED",
            Self::MissingDebuggerUrl { .. } => "MISSING_DEBUGGER_URL",
            Self::InvalidUrl { .. } => "INVALID_URL",
            Self::RouteRegistration { .. } => "ROUTE_REGISTRATION_FAILED",
            Self::NotBound => "NOT_BOUND",
            Self::Aborted { .. } => "ABORTED",
            Self::Bridge(_) => "BRIDGE_FAILED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AlreadyProxied { .. } | Self::PortUnavailable { .. } => StatusCode::CONFLICT,
            Self::UnknownTarget { .. } => StatusCode::NOT_FOUND,
            Self::PortExhausted { .. } | Self::NotBound | Self::Aborted { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::ForwardCreation { .. }
            | Self::MetadataFetch { .. }
            | Self::MissingDebuggerUrl { .. }
            | Self::InvalidUrl { .. }
            | Self::Bridge(_) => StatusCode::BAD_GATEWAY,
            Self::RouteRegistration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}
