//! In-process device double for tests.
//!
//! [`FakeBridge`] records every adb call. A forward to a known target binds
//! the local port and serves a small DevTools endpoint on it, so the HTTP and
//! WebSocket paths run against real sockets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, RawQuery,
    },
    response::{Html, IntoResponse},
    routing::{any, get, put},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::adb::{BridgeError, DeviceBridge};

pub const FAKE_BROWSER_ID: &str = "b0b8a4fb-bb17-4359-9533-a8d9f3908bd8";

/// Text frame that makes the fake endpoint close the socket with 4001.
pub const CLOSE_REQUEST: &str = "close-me";

/// Text frame that makes the fake endpoint drop the connection without a
/// close handshake.
pub const DROP_REQUEST: &str = "drop-me";

/// Entity kind whose upgrade the fake endpoint answers only after
/// [`SLOW_UPGRADE`].
pub const SLOW_KIND: &str = "slow";
pub const SLOW_UPGRADE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone)]
enum DebuggerUrl {
    Default,
    Missing,
    Custom(String),
}

/// What a fake target serves. `{port}` in pages or a custom debugger URL is
/// replaced with the forwarded local port.
#[derive(Debug, Clone)]
pub struct FakeTarget {
    label: String,
    pages: Option<Value>,
    debugger_url: DebuggerUrl,
}

impl FakeTarget {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            pages: None,
            debugger_url: DebuggerUrl::Default,
        }
    }

    pub fn with_pages(mut self, pages: Value) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn with_debugger_url(mut self, url: &str) -> Self {
        self.debugger_url = DebuggerUrl::Custom(url.to_string());
        self
    }

    pub fn without_debugger_url(mut self) -> Self {
        self.debugger_url = DebuggerUrl::Missing;
        self
    }

    fn version(&self, port: u16) -> Value {
        let mut info = json!({
            "Browser": self.label,
            "Protocol-Version": "1.3",
            "User-Agent": "Mozilla/5.0 (Linux; Android 14)",
        });
        let url = match &self.debugger_url {
            DebuggerUrl::Default => Some(format!(
                "ws://127.0.0.1:{port}/devtools/browser/{FAKE_BROWSER_ID}"
            )),
            DebuggerUrl::Missing => None,
            DebuggerUrl::Custom(u) => Some(u.replace("{port}", &port.to_string())),
        };
        if let Some(url) = url {
            info["webSocketDebuggerUrl"] = Value::String(url);
        }
        info
    }

    fn pages(&self, port: u16) -> Value {
        match &self.pages {
            Some(pages) => with_port(pages, port),
            None => json!([{"id": format!("{}-page", self.label), "type": "page"}]),
        }
    }
}

fn with_port(value: &Value, port: u16) -> Value {
    let text = value.to_string().replace("{port}", &port.to_string());
    serde_json::from_str(&text).unwrap_or(Value::Null)
}

#[derive(Default)]
struct Calls {
    shell: Vec<Vec<String>>,
    forwards: Vec<(u16, String)>,
    removed: Vec<u16>,
}

#[derive(Default)]
pub struct FakeBridge {
    socket_table: String,
    targets: HashMap<String, FakeTarget>,
    failing_forwards: HashSet<String>,
    fail_removal: bool,
    forward_delay: Option<Duration>,
    removal_delay: Option<Duration>,
    calls: Mutex<Calls>,
    servers: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket_table(mut self, table: &str) -> Self {
        self.socket_table = table.to_string();
        self
    }

    /// Serve `target` behind forwards to `socket` (with the leading `@`).
    pub fn with_target(mut self, socket: &str, target: FakeTarget) -> Self {
        self.targets.insert(socket.to_string(), target);
        self
    }

    pub fn failing_forward(mut self, socket: &str) -> Self {
        self.failing_forwards.insert(socket.to_string());
        self
    }

    pub fn failing_removal(mut self) -> Self {
        self.fail_removal = true;
        self
    }

    /// Sleep after a successful forward, before returning.
    pub fn slow_forward(mut self, delay: Duration) -> Self {
        self.forward_delay = Some(delay);
        self
    }

    /// Sleep before removing a forward.
    pub fn slow_removal(mut self, delay: Duration) -> Self {
        self.removal_delay = Some(delay);
        self
    }

    pub fn shell_calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().shell.clone()
    }

    /// `(local_port, socket without '@')` for every forward attempt.
    pub fn forward_calls(&self) -> Vec<(u16, String)> {
        self.calls.lock().unwrap().forwards.clone()
    }

    /// Ports whose forward was removed successfully.
    pub fn removed_ports(&self) -> Vec<u16> {
        self.calls.lock().unwrap().removed.clone()
    }

    pub fn live_forwards(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

#[async_trait]
impl DeviceBridge for FakeBridge {
    async fn shell(&self, args: &[&str]) -> Result<String, BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .shell
            .push(args.iter().map(|a| a.to_string()).collect());
        if args == ["cat", "/proc/net/unix"] {
            return Ok(self.socket_table.clone());
        }
        Ok(String::new())
    }

    async fn forward(&self, local_port: u16, remote_socket: &str) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap()
            .forwards
            .push((local_port, remote_socket.to_string()));
        let socket = format!("@{remote_socket}");
        if self.failing_forwards.contains(&socket) {
            return Err(BridgeError::Failed {
                command: format!("forward tcp:{local_port} localabstract:{remote_socket}"),
                exit_code: 1,
                stderr: "error: cannot bind listener".to_string(),
            });
        }
        let Some(target) = self.targets.get(&socket).cloned() else {
            return Ok(());
        };
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", local_port))
            .await
            .map_err(|e| BridgeError::SpawnFailed(e.to_string()))?;
        let app = fake_cdp_router(local_port, target);
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        self.servers.lock().unwrap().insert(local_port, handle);
        if let Some(delay) = self.forward_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn remove_forward(&self, local_port: u16) -> Result<(), BridgeError> {
        if let Some(delay) = self.removal_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_removal {
            return Err(BridgeError::Failed {
                command: format!("forward --remove tcp:{local_port}"),
                exit_code: 1,
                stderr: format!("error: listener 'tcp:{local_port}' not found"),
            });
        }
        let server = self.servers.lock().unwrap().remove(&local_port);
        if let Some(server) = server {
            server.abort();
            let _ = server.await;
        }
        self.calls.lock().unwrap().removed.push(local_port);
        Ok(())
    }
}

fn fake_cdp_router(port: u16, target: FakeTarget) -> Router {
    let target = Arc::new(target);
    let version = {
        let t = target.clone();
        move || async move { Json(t.version(port)) }
    };
    let list = {
        let t = target.clone();
        move || async move { Json(t.pages(port)) }
    };
    Router::new()
        .route("/json/version", get(version))
        .route("/json", get(list.clone()))
        .route("/json/list", get(list))
        .route(
            "/json/protocol",
            get(|| async { Json(json!({"version": {"major": "1", "minor": "3"}, "domains": []})) }),
        )
        .route(
            "/json/new",
            put(move |RawQuery(q): RawQuery| async move {
                Json(json!({
                    "id": "new-tab",
                    "type": "page",
                    "url": q.unwrap_or_default(),
                    "webSocketDebuggerUrl": format!("ws://127.0.0.1:{port}/devtools/page/new-tab"),
                }))
            }),
        )
        .route(
            "/json/activate/{id}",
            get(|Path(id): Path<String>| async move { format!("Target {id} activated") }),
        )
        .route(
            "/json/close/{id}",
            get(|Path(id): Path<String>| async move { format!("Target {id} is closing") }),
        )
        .route(
            "/devtools/inspector.html",
            get(|| async {
                Html("<html><link rel=\"stylesheet\" href=\"/devtools/inspector.css\"></html>")
            }),
        )
        .route("/devtools/{kind}/{id}", any(echo_upgrade))
}

async fn echo_upgrade(
    Path((kind, id)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if kind == SLOW_KIND {
        tokio::time::sleep(SLOW_UPGRADE).await;
    }
    ws.on_upgrade(move |socket| echo(socket, kind, id))
}

/// Echo data frames prefixed with the target path. [`CLOSE_REQUEST`] closes
/// the socket with 4001 and [`DROP_REQUEST`] drops it without a close frame.
async fn echo(mut socket: WebSocket, kind: String, id: String) {
    while let Some(Ok(msg)) = socket.recv().await {
        let reply = match msg {
            Message::Text(text) if text.as_str() == CLOSE_REQUEST => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 4001,
                        reason: "done".into(),
                    })))
                    .await;
                return;
            }
            Message::Text(text) if text.as_str() == DROP_REQUEST => return,
            Message::Text(text) => Message::Text(format!("{kind}/{id}:{}", text.as_str()).into()),
            Message::Binary(data) => Message::Binary(data),
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if socket.send(reply).await.is_err() {
            return;
        }
    }
}
