//! Bidirectional relay between a client socket and a device socket.
//!
//! The client side ("upstream") is the socket accepted by axum. The device
//! side ("downstream") is dialed with `tokio-tungstenite` once the upstream
//! upgrade has completed. Frames the client sends before the downstream
//! connection is open are dropped.

use std::sync::{Arc, LazyLock};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{FutureExt, SinkExt, StreamExt};
use regex::Regex;
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame as TungsteniteCloseFrame},
};
use tracing::{debug, info, warn};

use super::{RouteParams, WsHandler};

/// Close reasons are limited to 123 bytes by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

static ENTITY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Fa-f0-9-]+$").expect("valid regex"));

/// Where a relay connects to.
///
/// `destination` may contain `{<param>}`, replaced with the route parameter
/// of the same name. The parameter must look like a DevTools entity id.
#[derive(Debug, Clone)]
pub struct RelayTarget {
    pub destination: String,
    pub param: Option<String>,
}

impl RelayTarget {
    pub fn new(destination: impl Into<String>, param: Option<&str>) -> Self {
        Self {
            destination: destination.into(),
            param: param.map(str::to_string),
        }
    }

    /// Downstream URL for a matched route, or `None` if the entity id is
    /// missing or malformed.
    pub fn resolve(&self, params: &RouteParams) -> Option<String> {
        let Some(param) = &self.param else {
            return Some(self.destination.clone());
        };
        let id = params.get(param)?;
        if !ENTITY_ID.is_match(id) {
            return None;
        }
        Some(self.destination.replacen(&format!("{{{param}}}"), id, 1))
    }

    /// Route handler that relays every accepted socket to this target.
    pub fn handler(self) -> WsHandler {
        let target = Arc::new(self);
        Arc::new(move |socket: WebSocket, params: RouteParams| {
            let target = Arc::clone(&target);
            async move { run(socket, &target, &params).await }.boxed()
        })
    }
}

/// Relay one client connection until either side closes.
pub async fn run(mut upstream: WebSocket, target: &RelayTarget, params: &RouteParams) {
    let Some(dst) = target.resolve(params) else {
        debug!(?params, "Rejecting WebSocket: missing or invalid entity id");
        close(&mut upstream, close_code::POLICY, "Invalid entity id").await;
        return;
    };
    debug!("Forwarding WebSocket to {dst}");

    let connect = tokio_tungstenite::connect_async(dst.as_str());
    tokio::pin!(connect);
    let downstream = loop {
        tokio::select! {
            res = &mut connect => match res {
                Ok((ws, _)) => break ws,
                Err(e) => {
                    warn!("Cannot connect to the downstream socket {dst}: {e}");
                    close(&mut upstream, close_code::ERROR, &e.to_string()).await;
                    return;
                }
            },
            msg = upstream.recv() => match msg {
                Some(Ok(Message::Close(_)) | Err(_)) | None => {
                    debug!("The client left before {dst} was connected");
                    return;
                }
                Some(Ok(_)) => debug!("Dropping a frame, {dst} is not connected yet"),
            },
        }
    };

    let (mut down_tx, mut down_rx) = downstream.split();
    loop {
        tokio::select! {
            msg = upstream.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = down_tx.send(tungstenite::Message::Text(text.as_str().into())).await {
                        debug!("Dropped a frame for {dst}: {e}");
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = down_tx.send(tungstenite::Message::Binary(data)).await {
                        debug!("Dropped a frame for {dst}: {e}");
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!("The upstream socket has been closed: {}", describe(frame.as_ref()));
                    let frame = frame.map(|f| TungsteniteCloseFrame {
                        code: CloseCode::from(f.code),
                        reason: f.reason.as_str().into(),
                    });
                    let _ = down_tx.send(tungstenite::Message::Close(frame)).await;
                    break;
                }
                Some(Err(e)) => {
                    info!("Got an error from the upstream socket: {e}");
                    let _ = down_tx.close().await;
                    break;
                }
                None => {
                    let _ = down_tx.close().await;
                    break;
                }
            },
            msg = down_rx.next() => match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    if let Err(e) = upstream.send(Message::Text(text.as_str().into())).await {
                        debug!("Dropped a frame from {dst}: {e}");
                    }
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    if let Err(e) = upstream.send(Message::Binary(data)).await {
                        debug!("Dropped a frame from {dst}: {e}");
                    }
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let frame = frame.map(|f| CloseFrame {
                        code: u16::from(f.code),
                        reason: truncate(f.reason.as_str()).into(),
                    });
                    info!("The downstream socket {dst} has been closed: {}", describe(frame.as_ref()));
                    let _ = upstream.send(Message::Close(frame)).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Got an error from the downstream socket {dst}: {e}");
                    close(&mut upstream, close_code::ERROR, &e.to_string()).await;
                    break;
                }
                None => {
                    info!("The downstream socket {dst} has been closed");
                    let _ = upstream.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: truncate(reason).into(),
        })))
        .await;
}

fn describe(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) if !f.reason.as_str().is_empty() => format!("{}, {}", f.code, f.reason.as_str()),
        Some(f) => format!("{}, (no reason given)", f.code),
        None => "(no close frame)".to_string(),
    }
}

/// Cut `reason` to at most [`MAX_CLOSE_REASON`] bytes on a char boundary.
fn truncate(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        FakeBridge, FakeTarget, CLOSE_REQUEST, DROP_REQUEST, SLOW_KIND, SLOW_UPGRADE,
    };
    use crate::adb::DeviceBridge;
    use crate::ws::{ws_fallback, WsRoutes};
    use axum::Router;
    use tokio_tungstenite::tungstenite::Message as TMessage;

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    fn params(pairs: &[(&str, &str)]) -> RouteParams {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    async fn serve_routes(routes: WsRoutes) -> u16 {
        let app = Router::new().fallback(ws_fallback).with_state(routes);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn connect(port: u16, path: &str) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}{path}"))
            .await
            .unwrap();
        client
    }

    async fn next_close(client: &mut Client) -> Option<u16> {
        next_close_frame(client).await.map(|(code, _)| code)
    }

    async fn next_close_frame(client: &mut Client) -> Option<(u16, String)> {
        while let Some(msg) = client.next().await {
            if let Ok(TMessage::Close(frame)) = msg {
                return frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
            }
        }
        None
    }

    /// Forward `port` to a fake target and serve a relay for `kind` at
    /// `/r/devtools/<kind>/{id}`. Returns the bridge and the relay port.
    async fn relay_to_fake(forward_port: u16, kind: &str) -> (FakeBridge, u16) {
        let bridge = FakeBridge::new().with_target("@t_devtools_remote", FakeTarget::new("t"));
        bridge.forward(forward_port, "t_devtools_remote").await.unwrap();
        let routes = WsRoutes::new();
        routes
            .add(
                &format!("/r/devtools/{kind}/{{id}}"),
                RelayTarget::new(
                    format!("ws://127.0.0.1:{forward_port}/devtools/{kind}/{{id}}"),
                    Some("id"),
                )
                .handler(),
            )
            .await
            .unwrap();
        (bridge, serve_routes(routes).await)
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let long = "é".repeat(100);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert_eq!(cut.len(), 122);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn test_resolve_substitutes_entity_id() {
        let target = RelayTarget::new("ws://h:1/devtools/page/{pageId}", Some("pageId"));
        assert_eq!(
            target.resolve(&params(&[("pageId", "DAB7-12")])).as_deref(),
            Some("ws://h:1/devtools/page/DAB7-12")
        );
        assert!(target.resolve(&params(&[("pageId", "xyz")])).is_none());
        assert!(target.resolve(&params(&[])).is_none());

        let fixed = RelayTarget::new("ws://h:1/devtools/browser", None);
        assert_eq!(
            fixed.resolve(&params(&[])).as_deref(),
            Some("ws://h:1/devtools/browser")
        );
    }

    #[tokio::test]
    async fn test_relays_frames_both_ways() {
        let bridge = FakeBridge::new().with_target("@t_devtools_remote", FakeTarget::new("t"));
        bridge.forward(43500, "t_devtools_remote").await.unwrap();

        let routes = WsRoutes::new();
        routes
            .add(
                "/r/devtools/page/{pageId}",
                RelayTarget::new("ws://127.0.0.1:43500/devtools/page/{pageId}", Some("pageId")).handler(),
            )
            .await
            .unwrap();
        let port = serve_routes(routes).await;

        let mut client = connect(port, "/r/devtools/page/ABC1").await;
        // Give the relay time to finish dialing the device side.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        client.send(TMessage::Text("hello".into())).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, TMessage::Text("page/ABC1:hello".into()));

        client
            .send(TMessage::Binary(vec![1u8, 2, 3].into()))
            .await
            .unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, TMessage::Binary(vec![1u8, 2, 3].into()));

        client.send(TMessage::Text(CLOSE_REQUEST.into())).await.unwrap();
        assert_eq!(
            next_close_frame(&mut client).await,
            Some((4001, "done".to_string()))
        );
        bridge.remove_forward(43500).await.unwrap();
    }

    #[tokio::test]
    async fn test_downstream_error_closes_with_error() {
        let (bridge, port) = relay_to_fake(43510, "page").await;
        let mut client = connect(port, "/r/devtools/page/ABC2").await;
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        client.send(TMessage::Text("hello".into())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            TMessage::Text("page/ABC2:hello".into())
        );

        client.send(TMessage::Text(DROP_REQUEST.into())).await.unwrap();
        assert_eq!(next_close(&mut client).await, Some(close_code::ERROR));
        bridge.remove_forward(43510).await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_before_downstream_opens_are_dropped() {
        let (bridge, port) = relay_to_fake(43520, SLOW_KIND).await;
        let mut client = connect(port, "/r/devtools/slow/ABC3").await;
        client.send(TMessage::Text("early".into())).await.unwrap();
        tokio::time::sleep(SLOW_UPGRADE * 2).await;
        client.send(TMessage::Text("late".into())).await.unwrap();
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            TMessage::Text("slow/ABC3:late".into())
        );
        bridge.remove_forward(43520).await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_entity_id_closes_with_policy() {
        let routes = WsRoutes::new();
        routes
            .add(
                "/r/devtools/page/{pageId}",
                RelayTarget::new("ws://127.0.0.1:1/devtools/page/{pageId}", Some("pageId")).handler(),
            )
            .await
            .unwrap();
        let port = serve_routes(routes).await;
        let mut client = connect(port, "/r/devtools/page/not-hex!").await;
        assert_eq!(next_close(&mut client).await, Some(close_code::POLICY));
    }

    #[tokio::test]
    async fn test_unreachable_downstream_closes_with_error() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);

        let routes = WsRoutes::new();
        routes
            .add(
                "/r/devtools/browser",
                RelayTarget::new(format!("ws://127.0.0.1:{dead_port}/devtools/browser"), None).handler(),
            )
            .await
            .unwrap();
        let port = serve_routes(routes).await;
        let mut client = connect(port, "/r/devtools/browser").await;
        assert_eq!(next_close(&mut client).await, Some(close_code::ERROR));
    }
}
