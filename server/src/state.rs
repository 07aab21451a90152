//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRef;

use crate::config::Config;
use crate::engine::ProxyEngine;
use crate::host::DeviceHost;
use crate::ws::WsRoutes;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub engine: Arc<ProxyEngine>,
    /// Keeps the device session alive; the engine only holds a weak reference.
    pub host: Arc<DeviceHost>,
}

impl FromRef<AppState> for WsRoutes {
    fn from_ref(state: &AppState) -> Self {
        state.host.server.routes.clone()
    }
}
