//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `DEVTOOLS_PROXY_LISTEN`,
//!    `DEVTOOLS_PROXY_API_KEY`, `DEVTOOLS_PROXY_PUBLIC_HOST`,
//!    `DEVTOOLS_PROXY_ADB`, `DEVTOOLS_PROXY_ADB_SERIAL` (or `ANDROID_SERIAL`)
//! 2. **Config file**: path via `--config <path>`, or `devtools-proxy.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4780"
//! public_host = "192.168.1.20"   # optional, advertised in rewritten URLs
//! base_path = ""
//! secure = false                 # true = advertise https:// and wss://
//!
//! [auth]
//! api_key = "your-secret-key"    # optional, guards /api/targets*
//!
//! [adb]
//! binary = "adb"
//! serial = "emulator-5554"
//! command_timeout_ms = 20000
//!
//! [ports]
//! lookup_range = [12900, 13000]  # transient forwards used by discovery
//! bind_range = [15900, 16000]    # forwards owned by proxied sessions
//!
//! [cdp]
//! request_timeout_ms = 5000
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "devtools-proxy.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub cdp: CdpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings and the shape of the public URLs it advertises.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4780`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host written into rewritten debugger URLs. When unset, the bound
    /// address is used, with unspecified addresses mapped to loopback.
    pub public_host: Option<String>,
    /// Prefix every route is mounted under (default empty).
    #[serde(default)]
    pub base_path: String,
    /// Advertise `https://` / `wss://` URLs, e.g. behind a TLS terminator.
    #[serde(default)]
    pub secure: bool,
}

/// Authentication for the command endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. `None` leaves the command layer open.
    pub api_key: Option<String>,
}

/// How to reach the device bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct AdbConfig {
    /// `adb` executable (default `adb`, resolved through `PATH`).
    #[serde(default = "default_adb_binary")]
    pub binary: String,
    /// Device serial passed as `adb -s <serial>`.
    pub serial: Option<String>,
    /// Timeout for a single adb invocation in milliseconds (default 20 000).
    #[serde(default = "default_adb_timeout_ms")]
    pub command_timeout_ms: u64,
}

/// Local port ranges used for forwards.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    /// Range scanned by discovery; one port is reused across all candidates.
    #[serde(default = "default_lookup_range")]
    pub lookup_range: PortRange,
    /// Range scanned for forwards that live as long as a proxied session.
    #[serde(default = "default_bind_range")]
    pub bind_range: PortRange,
}

/// Metadata client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CdpConfig {
    /// Per-request timeout in milliseconds (default 5000).
    #[serde(default = "default_cdp_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Inclusive port range, written as `[start, end]` in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "[u16; 2]")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, String> {
        if start == 0 || start > end {
            return Err(format!("invalid port range {start}..{end}"));
        }
        Ok(Self { start, end })
    }

    pub fn ports(self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl TryFrom<[u16; 2]> for PortRange {
    type Error = String;

    fn try_from([start, end]: [u16; 2]) -> Result<Self, Self::Error> {
        Self::new(start, end)
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

fn default_listen() -> String {
    "0.0.0.0:4780".to_string()
}
fn default_adb_binary() -> String {
    "adb".to_string()
}
fn default_adb_timeout_ms() -> u64 {
    20_000
}
fn default_lookup_range() -> PortRange {
    PortRange {
        start: 12900,
        end: 13000,
    }
}
fn default_bind_range() -> PortRange {
    PortRange {
        start: 15900,
        end: 16000,
    }
}
fn default_cdp_timeout_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_host: None,
            base_path: String::new(),
            secure: false,
        }
    }
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            binary: default_adb_binary(),
            serial: None,
            command_timeout_ms: default_adb_timeout_ms(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            lookup_range: default_lookup_range(),
            bind_range: default_bind_range(),
        }
    }
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_cdp_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// `base_path` with a leading `/` and no trailing `/`; empty stays empty.
    pub fn normalized_base_path(&self) -> String {
        let trimmed = self.base_path.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}

impl CdpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// [`DEFAULT_CONFIG_FILE`] in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("DEVTOOLS_PROXY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(host) = std::env::var("DEVTOOLS_PROXY_PUBLIC_HOST") {
            config.server.public_host = Some(host);
        }
        if let Ok(key) = std::env::var("DEVTOOLS_PROXY_API_KEY") {
            config.auth.api_key = Some(key);
        }
        if let Ok(binary) = std::env::var("DEVTOOLS_PROXY_ADB") {
            config.adb.binary = binary;
        }
        if let Ok(serial) =
            std::env::var("DEVTOOLS_PROXY_ADB_SERIAL").or_else(|_| std::env::var("ANDROID_SERIAL"))
        {
            config.adb.serial = Some(serial);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        Self::parse(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:4780");
        assert_eq!(config.ports.lookup_range, PortRange::new(12900, 13000).unwrap());
        assert_eq!(config.ports.bind_range, PortRange::new(15900, 16000).unwrap());
        assert_eq!(config.cdp.request_timeout(), Duration::from_secs(5));
        assert!(config.auth.api_key.is_none());
        assert!(!config.server.secure);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::parse(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            base_path = "/wd/hub/"
            secure = true

            [adb]
            serial = "emulator-5554"

            [ports]
            bind_range = [20000, 20010]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.normalized_base_path(), "/wd/hub");
        assert!(config.server.secure);
        assert_eq!(config.adb.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(config.adb.binary, "adb");
        assert_eq!(config.ports.bind_range.start, 20000);
        assert_eq!(config.ports.lookup_range.start, 12900);
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let err = Config::parse("[ports]\nlookup_range = [13000, 12900]\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_base_path_normalization() {
        let mut server = ServerConfig::default();
        assert_eq!(server.normalized_base_path(), "");
        server.base_path = "/".to_string();
        assert_eq!(server.normalized_base_path(), "");
        server.base_path = "proxy".to_string();
        assert_eq!(server.normalized_base_path(), "/proxy");
    }
}
