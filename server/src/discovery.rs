//! Debug socket discovery.
//!
//! Webview and Chrome processes on the device listen on abstract unix sockets
//! named `@<something>_devtools_remote[...]`. They are found by reading the
//! socket table from `/proc/net/unix`. Their metadata is then collected one
//! at a time through a single reused forward. See
//! <https://cs.chromium.org/chromium/src/chrome/browser/devtools/device/android_device_info_query.cc>.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::adb::{BridgeError, DeviceBridge};
use crate::cdp::{CdpClient, FetchError};
use crate::config::PortRange;
use crate::error::ProxyError;
use crate::forward::ForwardManager;
use crate::ports::PortAllocator;

/// Socket paths in `/proc/net/unix` that are abstract start with this marker.
const ABSTRACT_SOCKET_MARKER: char = '@';
/// `__SO_ACCEPTCON`: the socket is listening.
const LISTENING_FLAGS: &str = "00010000";
/// `SS_UNCONNECTED`.
const UNCONNECTED_STATE: &str = "01";

static DEVTOOLS_SOCKET_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@[\w.]+_devtools_remote").expect("valid regex"));

/// Metadata of one debuggable process.
#[derive(Debug, Clone, Serialize)]
pub struct TargetDetails {
    /// `/json/version` output.
    pub info: Value,
    /// `/json/list` output.
    pub pages: Value,
}

/// Parse `/proc/net/unix` output into de-duplicated devtools socket names,
/// in first-seen order. Also returns every other abstract socket seen, for
/// diagnostics.
///
/// Columns: `Num RefCount Protocol Flags Type St Inode Path`.
pub fn parse_socket_table(table: &str) -> (Vec<String>, Vec<String>) {
    let mut names: Vec<String> = Vec::new();
    let mut others = Vec::new();
    for line in table.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        let (Some(flags), Some(state), Some(path)) = (cols.get(3), cols.get(5), cols.get(7)) else {
            continue;
        };
        if !path.starts_with(ABSTRACT_SOCKET_MARKER) {
            continue;
        }
        let matches = *flags == LISTENING_FLAGS
            && *state == UNCONNECTED_STATE
            && DEVTOOLS_SOCKET_PATTERN.is_match(path);
        if !matches {
            others.push(line.trim().to_string());
            continue;
        }
        // A webview process may register its socket more than once.
        if !names.iter().any(|n| n == path) {
            names.push((*path).to_string());
        }
    }
    (names, others)
}

/// List devtools socket names currently listening on the device.
pub async fn list_candidate_sockets(bridge: &dyn DeviceBridge) -> Result<Vec<String>, BridgeError> {
    debug!("Getting a list of candidate devtools sockets");
    let table = bridge.shell(&["cat", "/proc/net/unix"]).await?;
    let (names, others) = parse_socket_table(&table);
    if names.is_empty() {
        debug!("Found no active devtools sockets");
        if !others.is_empty() {
            debug!("Other sockets are: {others:#?}");
        }
    } else {
        debug!(
            "Parsed {} active devtools socket(s): {names:?}",
            names.len()
        );
    }
    Ok(names)
}

/// Fetch `/json/version` and `/json/list` for a single forwarded socket.
async fn collect_single(cdp: &CdpClient, socket: &str, port: u16) -> Result<TargetDetails, FetchError> {
    debug!(socket, port, "Collecting CDP data");
    let (info, pages) = tokio::try_join!(cdp.version(port), cdp.list(port))?;
    Ok(TargetDetails { info, pages })
}

/// Collect metadata for each socket, sequentially, through one local port
/// leased from `range` for the whole loop.
///
/// A socket whose forward or fetch fails is logged and left out of the
/// result. Only failing to lease the port aborts the whole collection.
pub async fn collect_details(
    bridge: Arc<dyn DeviceBridge>,
    ports: &PortAllocator,
    range: PortRange,
    cdp: &CdpClient,
    socket_names: &[String],
) -> Result<BTreeMap<String, TargetDetails>, ProxyError> {
    let mut details = BTreeMap::new();
    if socket_names.is_empty() {
        return Ok(details);
    }
    debug!(
        "Collecting CDP data of {} candidate webview(s)",
        socket_names.len()
    );
    let lease = ports.find_free_port(range)?;
    let forwards = ForwardManager::new(bridge);
    for name in socket_names {
        let forward = match forwards.create(lease.port(), name).await {
            Ok(f) => f,
            Err(e) => {
                debug!(socket = %name, "Skipping: {e}");
                continue;
            }
        };
        match collect_single(cdp, name, lease.port()).await {
            Ok(d) => {
                details.insert(name.clone(), d);
            }
            Err(e) => debug!(socket = %name, "Could not fetch the CDP details: {e}"),
        }
        forwards.remove(&forward).await;
    }
    info!("Collected CDP details of {} webview(s)", details.len());
    Ok(details)
}
