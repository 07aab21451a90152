//! The device session a proxy engine is attached to.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::adb::DeviceBridge;
use crate::config::ServerConfig;
use crate::ws::WsRoutes;

/// Where the HTTP server can be reached from outside, for building public URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Host name or IP literal (IPv6 without brackets).
    pub host: String,
    pub port: u16,
    /// Normalized: empty, or a leading `/` and no trailing `/`.
    pub base_path: String,
    pub secure: bool,
}

impl ServerInfo {
    /// Public address of a server bound to `bound`.
    ///
    /// `public_host` wins when configured. Otherwise a wildcard bind
    /// (`0.0.0.0` / `::`) is advertised as the matching loopback address.
    pub fn from_bound(config: &ServerConfig, bound: SocketAddr) -> Self {
        let host = match &config.public_host {
            Some(h) if !h.is_empty() => h.clone(),
            _ => advertised_ip(bound.ip()).to_string(),
        };
        Self {
            host,
            port: bound.port(),
            base_path: config.normalized_base_path(),
            secure: config.secure,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn ws_scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    pub fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

fn advertised_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other,
    }
}

/// Server-side capabilities handed to an engine: public address plus the
/// dynamic WebSocket route table.
#[derive(Clone)]
pub struct ServerHandle {
    pub info: ServerInfo,
    pub routes: WsRoutes,
}

/// A connected device together with the server exposing it.
pub struct DeviceHost {
    pub bridge: Arc<dyn DeviceBridge>,
    pub server: ServerHandle,
}

impl DeviceHost {
    pub fn new(bridge: Arc<dyn DeviceBridge>, info: ServerInfo, routes: WsRoutes) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            server: ServerHandle { info, routes },
        })
    }
}
