//! Device bridge capability.
//!
//! Everything this crate needs from the device goes through the three
//! primitives of [`DeviceBridge`]: run a shell command, map a local TCP port
//! to a device-local abstract socket, and drop that mapping again.
//!
//! [`AdbBridge`] implements them on top of the `adb` executable; tests plug
//! in their own implementation.

pub mod process;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::config::AdbConfig;
use process::run_adb;

/// Primitive operations offered by a connected device.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Run `args` through the device shell and return its stdout.
    async fn shell(&self, args: &[&str]) -> Result<String, BridgeError>;

    /// Map `tcp:<local_port>` on this host to `localabstract:<remote_socket>`
    /// on the device. `remote_socket` has no leading `@`.
    async fn forward(&self, local_port: u16, remote_socket: &str) -> Result<(), BridgeError>;

    /// Drop the mapping for `tcp:<local_port>`.
    async fn remove_forward(&self, local_port: u16) -> Result<(), BridgeError>;
}

/// Errors raised by a [`DeviceBridge`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The adb binary could not be started (not found, permission denied).
    #[error("Failed to spawn adb: {0}")]
    SpawnFailed(String),
    /// adb ran but exited unsuccessfully.
    #[error("`adb {command}` exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    /// The invocation exceeded its timeout and was killed.
    #[error("adb command timed out")]
    Timeout,
}

/// [`DeviceBridge`] backed by the `adb` command-line tool.
pub struct AdbBridge {
    binary: String,
    serial: Option<String>,
    timeout_ms: u64,
}

impl AdbBridge {
    pub fn new(config: &AdbConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            serial: config.serial.clone(),
            timeout_ms: config.command_timeout_ms,
        }
    }

    /// Full argument vector for one invocation, including `-s <serial>`.
    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = Vec::with_capacity(rest.len() + 2);
        if let Some(serial) = self.serial.as_deref() {
            args.push("-s");
            args.push(serial);
        }
        args.extend_from_slice(rest);
        args
    }

    async fn exec(&self, rest: &[&str]) -> Result<String, BridgeError> {
        let args = self.args(rest);
        debug!(binary = %self.binary, ?args, "Running adb");
        run_adb(&self.binary, &args, self.timeout_ms).await
    }
}

/// `tcp:<port>` endpoint spec.
pub fn tcp_spec(port: u16) -> String {
    format!("tcp:{port}")
}

/// `localabstract:<name>` endpoint spec.
pub fn local_abstract_spec(socket: &str) -> String {
    format!("localabstract:{socket}")
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn shell(&self, args: &[&str]) -> Result<String, BridgeError> {
        let mut rest = Vec::with_capacity(args.len() + 1);
        rest.push("shell");
        rest.extend_from_slice(args);
        self.exec(&rest).await
    }

    async fn forward(&self, local_port: u16, remote_socket: &str) -> Result<(), BridgeError> {
        let local = tcp_spec(local_port);
        let remote = local_abstract_spec(remote_socket);
        self.exec(&["forward", &local, &remote]).await.map(drop)
    }

    async fn remove_forward(&self, local_port: u16) -> Result<(), BridgeError> {
        let local = tcp_spec(local_port);
        self.exec(&["forward", "--remove", &local]).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_include_serial() {
        let bridge = AdbBridge::new(&AdbConfig {
            serial: Some("emulator-5554".to_string()),
            ..AdbConfig::default()
        });
        assert_eq!(
            bridge.args(&["forward", "--remove", "tcp:15900"]),
            ["-s", "emulator-5554", "forward", "--remove", "tcp:15900"]
        );
    }

    #[test]
    fn test_args_without_serial() {
        let bridge = AdbBridge::new(&AdbConfig::default());
        assert_eq!(bridge.args(&["shell", "cat"]), ["shell", "cat"]);
    }

    #[test]
    fn test_endpoint_specs() {
        assert_eq!(tcp_spec(12900), "tcp:12900");
        assert_eq!(
            local_abstract_spec("webview_devtools_remote_42"),
            "localabstract:webview_devtools_remote_42"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let bridge = AdbBridge::new(&AdbConfig {
            binary: "/nonexistent/adb-binary".to_string(),
            ..AdbConfig::default()
        });
        let err = bridge.shell(&["true"]).await.unwrap_err();
        assert!(matches!(err, BridgeError::SpawnFailed(_)));
    }
}
