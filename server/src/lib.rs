#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! devtools-proxy library: the building blocks behind the binary.
//!
//! - `engine` - proxy orchestration: discovery, start/stop, session lifecycle
//! - `adb` - device bridge trait and the `adb` executable implementation
//! - `ports` / `forward` - local port reservations and device port forwards
//! - `cdp` - DevTools metadata client
//! - `rewrite` - literal and pattern rewriting of metadata responses
//! - `ws` - runtime WebSocket route table and the relay
//! - `routes` - REST API route handlers
//! - `auth` - API key authentication middleware
//! - `config` - configuration loading

pub mod adb;
pub mod auth;
pub mod cdp;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod forward;
pub mod host;
pub mod ports;
pub mod registry;
pub mod rewrite;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod ws;

#[cfg(test)]
mod testing;

// Re-export key types at crate root for convenience.
pub use adb::{AdbBridge, DeviceBridge};
pub use auth::ApiKey;
pub use config::Config;
pub use engine::{EngineSettings, ProxyEngine};
pub use error::ProxyError;
pub use host::{DeviceHost, ServerInfo};
pub use sessions::ProxyInfo;
pub use state::AppState;
pub use ws::WsRoutes;
