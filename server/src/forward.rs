//! Port forward lifecycle.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::adb::DeviceBridge;
use crate::error::ProxyError;

/// A live `tcp:<local_port>` → `localabstract:<socket>` forward.
///
/// Whoever creates a handle must pass it to [`ForwardManager::remove`] before
/// letting it go, on error paths too.
#[derive(Debug)]
#[must_use = "a forward must be removed before its handle is dropped"]
pub struct ForwardHandle {
    local_port: u16,
    remote_socket: String,
}

impl ForwardHandle {
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Socket name as discovered, including the leading `@`.
    pub fn remote_socket(&self) -> &str {
        &self.remote_socket
    }

    /// A handle with no forward behind it.
    #[cfg(test)]
    pub(crate) fn unmanaged(local_port: u16, remote_socket: &str) -> Self {
        Self {
            local_port,
            remote_socket: remote_socket.to_string(),
        }
    }
}

/// Creates and removes forwards through a [`DeviceBridge`].
#[derive(Clone)]
pub struct ForwardManager {
    bridge: Arc<dyn DeviceBridge>,
}

impl ForwardManager {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self { bridge }
    }

    /// Forward `local_port` to the abstract socket `socket_name` (`@` is stripped).
    pub async fn create(&self, local_port: u16, socket_name: &str) -> Result<ForwardHandle, ProxyError> {
        let remote = socket_name.strip_prefix('@').unwrap_or(socket_name);
        self.bridge
            .forward(local_port, remote)
            .await
            .map_err(|source| ProxyError::ForwardCreation {
                socket: socket_name.to_string(),
                source,
            })?;
        debug!(port = local_port, socket = %socket_name, "Created port forward");
        Ok(ForwardHandle {
            local_port,
            remote_socket: socket_name.to_string(),
        })
    }

    /// Remove a forward. Failures are logged and swallowed: this runs on
    /// cleanup paths where another error may already be in flight.
    pub async fn remove(&self, handle: &ForwardHandle) {
        match self.bridge.remove_forward(handle.local_port).await {
            Ok(()) => debug!(
                port = handle.local_port,
                socket = %handle.remote_socket,
                "Removed port forward"
            ),
            Err(e) => warn!(
                port = handle.local_port,
                socket = %handle.remote_socket,
                "Cannot remove the port forward: {e}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBridge;

    #[tokio::test]
    async fn test_create_strips_marker() {
        let bridge = Arc::new(FakeBridge::new());
        let forwards = ForwardManager::new(bridge.clone());
        let handle = forwards.create(43200, "@com.x_devtools_remote").await.unwrap();
        assert_eq!(handle.local_port(), 43200);
        assert_eq!(handle.remote_socket(), "@com.x_devtools_remote");
        assert_eq!(
            bridge.forward_calls(),
            vec![(43200, "com.x_devtools_remote".to_string())]
        );
        forwards.remove(&handle).await;
        assert_eq!(bridge.removed_ports(), vec![43200]);
    }

    #[tokio::test]
    async fn test_create_failure_is_typed() {
        let bridge = Arc::new(FakeBridge::new().failing_forward("@broken_devtools_remote"));
        let forwards = ForwardManager::new(bridge);
        let err = forwards.create(43201, "@broken_devtools_remote").await.unwrap_err();
        assert!(matches!(err, ProxyError::ForwardCreation { ref socket, .. } if socket == "@broken_devtools_remote"));
    }

    #[tokio::test]
    async fn test_remove_failure_is_swallowed() {
        let bridge = Arc::new(FakeBridge::new().failing_removal());
        let forwards = ForwardManager::new(bridge.clone());
        let handle = forwards.create(43202, "@a_devtools_remote").await.unwrap();
        forwards.remove(&handle).await;
        assert!(bridge.removed_ports().is_empty());
    }
}
