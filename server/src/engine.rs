//! Proxy orchestration.
//!
//! [`ProxyEngine`] turns a debug socket name into a proxied session:
//!
//! 1. claim the name in the [`SessionRegistry`]
//! 2. lease a local port and forward it to the socket
//! 3. read `/json/version` to learn the device-side debugger URL
//! 4. derive the rewrite rules and the two WebSocket relay routes
//! 5. register the routes and publish the session
//!
//! Any failure after the forward exists removes it again before the error is
//! returned, and the claim is released, so a failed start leaves nothing
//! behind. Stopping is the reverse and is best-effort per step.
//!
//! An engine is attached to a [`DeviceHost`] through a weak reference. The
//! host owns the device bridge and the HTTP server; when it goes away every
//! operation fails with [`ProxyError::NotBound`].

use std::sync::{Arc, LazyLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use regex::{NoExpand, Regex};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cdp::CdpClient;
use crate::config::{Config, PortRange};
use crate::discovery;
use crate::error::ProxyError;
use crate::forward::ForwardManager;
use crate::host::{DeviceHost, ServerInfo};
use crate::ports::PortAllocator;
use crate::registry;
use crate::rewrite::RewriteRule;
use crate::sessions::{socket_alias, ActiveTarget, ProxiedSession, ProxyInfo, SessionRegistry};
use crate::ws::relay::RelayTarget;
use crate::ws::{RouteError, WsRoutes};

/// Key of the debugger URL in `/json/version`.
const DEBUGGER_URL_KEY: &str = "webSocketDebuggerUrl";
/// First path segment of every per-session endpoint.
pub const CDP_ROOT: &str = "cdp";

const BROWSER_ID_PARAM: &str = "browserId";
const PAGE_ID_PARAM: &str = "pageId";

static WS_ENTITY_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/devtools/(browser|page)/([a-fA-F0-9-]+)").expect("valid regex"));
static BROWSER_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/browser/?").expect("valid regex"));

/// Tunables taken from the configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Ports used transiently by discovery.
    pub lookup_ports: PortRange,
    /// Ports held by proxied sessions.
    pub bind_ports: PortRange,
    pub cdp_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lookup_ports: config.ports.lookup_range,
            bind_ports: config.ports.bind_range,
            cdp_timeout: config.cdp.request_timeout(),
        }
    }
}

/// One debuggable process on the device, as returned by [`ProxyEngine::list_targets`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetEntry {
    pub name: String,
    pub info: Value,
    pub pages: Value,
    pub is_proxied: bool,
    pub proxy_info: Option<ProxyInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetList {
    pub targets: Vec<TargetEntry>,
}

/// Rules and routes computed for a session before it is published.
struct SessionRoutes {
    rewrites: Vec<RewriteRule>,
    browser_route: String,
    page_route: String,
    public_root: String,
}

pub struct ProxyEngine {
    id: String,
    host: RwLock<Weak<DeviceHost>>,
    sessions: SessionRegistry,
    ports: PortAllocator,
    cdp: CdpClient,
    settings: EngineSettings,
}

impl ProxyEngine {
    /// Create an engine with a fresh instance id and register it process-wide.
    pub fn new(settings: EngineSettings) -> Arc<Self> {
        let engine = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            host: RwLock::new(Weak::new()),
            sessions: SessionRegistry::new(),
            ports: PortAllocator::shared(),
            cdp: CdpClient::new(settings.cdp_timeout),
            settings,
        });
        registry::register(&engine);
        engine
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cdp(&self) -> &CdpClient {
        &self.cdp
    }

    /// Attach to a device session. Replaces any previous binding.
    pub fn bind(&self, host: &Arc<DeviceHost>) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(host);
        info!(instance = %self.id, "Bound to a device session");
    }

    /// Stop every active proxy, then detach from the device session.
    pub async fn unbind(self: &Arc<Self>) {
        let names = self.sessions.active_names();
        if !names.is_empty() {
            info!("Stopping {} active proxy session(s)", names.len());
        }
        let results = join_all(names.iter().map(|name| self.stop_proxy(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(name = %name, "Cannot stop the proxy: {e}");
            }
        }
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Weak::new();
        debug!(instance = %self.id, "Unbound from the device session");
    }

    pub fn host(&self) -> Result<Arc<DeviceHost>, ProxyError> {
        self.host
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
            .ok_or(ProxyError::NotBound)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.active_names().len()
    }

    /// Session data for the per-session HTTP endpoints.
    pub fn active_target(&self, alias: &str) -> Option<ActiveTarget> {
        self.sessions.find_by_alias(alias)
    }

    /// Discover debuggable processes on the device and report which are proxied.
    pub async fn list_targets(&self) -> Result<TargetList, ProxyError> {
        let host = self.host()?;
        let names = discovery::list_candidate_sockets(host.bridge.as_ref()).await?;
        let details = discovery::collect_details(
            Arc::clone(&host.bridge),
            &self.ports,
            self.settings.lookup_ports,
            &self.cdp,
            &names,
        )
        .await?;
        let targets = details
            .into_iter()
            .map(|(name, d)| {
                let proxy_info = self.sessions.proxy_info(&name);
                TargetEntry {
                    is_proxied: proxy_info.is_some(),
                    proxy_info,
                    info: d.info,
                    pages: d.pages,
                    name,
                }
            })
            .collect();
        Ok(TargetList { targets })
    }

    /// Proxy the debug socket `name` through a local port: `port` when given
    /// (and non-zero), otherwise the first free one in the bind range.
    ///
    /// The work runs on its own task and completes even if the returned
    /// future is dropped.
    pub async fn start_proxy(
        self: &Arc<Self>,
        name: &str,
        port: Option<u16>,
    ) -> Result<ProxyInfo, ProxyError> {
        let engine = Arc::clone(self);
        let owned = name.to_string();
        detached(name, tokio::spawn(async move { engine.start(&owned, port).await })).await
    }

    async fn start(&self, name: &str, port: Option<u16>) -> Result<ProxyInfo, ProxyError> {
        let host = self.host()?;
        let alias = socket_alias(name);
        let reservation = self.sessions.reserve(name).ok_or_else(|| ProxyError::AlreadyProxied {
            name: name.to_string(),
        })?;
        debug!(name, alias = %alias, "Starting the proxy");

        let lease = match port.filter(|p| *p != 0) {
            Some(p) => self.ports.reserve(p).ok_or_else(|| ProxyError::PortUnavailable {
                port: p,
                name: name.to_string(),
            })?,
            None => self.ports.find_free_port(self.settings.bind_ports)?,
        };

        let forwards = ForwardManager::new(Arc::clone(&host.bridge));
        let forward = forwards.create(lease.port(), name).await?;
        let routes = match self.prepare_routes(&host, name, &alias, lease.port()).await {
            Ok(routes) => routes,
            Err(e) => {
                forwards.remove(&forward).await;
                return Err(e);
            }
        };

        let session = ProxiedSession {
            name: name.to_string(),
            alias,
            lease,
            forward,
            rewrites: Arc::new(routes.rewrites),
            browser_route: routes.browser_route,
            page_route: routes.page_route,
            public_root: routes.public_root,
        };
        let proxy_info = session.info();
        info!(
            name,
            alias = %proxy_info.alias,
            port = session.lease.port(),
            "Started the proxy at {}",
            proxy_info.public_root
        );
        reservation.commit(session);
        Ok(proxy_info)
    }

    /// Steps 3-5 of a start: everything between the forward and publication.
    async fn prepare_routes(
        &self,
        host: &DeviceHost,
        name: &str,
        alias: &str,
        local_port: u16,
    ) -> Result<SessionRoutes, ProxyError> {
        let version = self
            .cdp
            .version(local_port)
            .await
            .map_err(|source| ProxyError::MetadataFetch {
                name: name.to_string(),
                source,
            })?;
        let Some(debugger_url) = version.get(DEBUGGER_URL_KEY).and_then(Value::as_str) else {
            debug!(name, "Unexpected /json/version response: {version}");
            return Err(ProxyError::MissingDebuggerUrl {
                name: name.to_string(),
            });
        };
        let invalid_url = || ProxyError::InvalidUrl {
            name: name.to_string(),
            url: debugger_url.to_string(),
        };
        let parsed = Url::parse(debugger_url).map_err(|_| invalid_url())?;
        let device_authority = match (parsed.host_str(), parsed.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(invalid_url()),
        };

        let server = &host.server.info;
        let root_path = self.root_path(server, alias);
        let public_authority = server.authority();
        let forward_to = format!("{}://{public_authority}{root_path}", server.ws_scheme());
        let public_root = format!("{}://{public_authority}{root_path}", server.http_scheme());

        let ws_token = Regex::new(&format!("ws={}", regex::escape(&device_authority)))
            .map_err(|_| invalid_url())?;
        let rewrites = vec![
            RewriteRule::literal(format!("{}://{device_authority}", parsed.scheme()), forward_to),
            RewriteRule::pattern(
                ws_token,
                format!("{}={public_authority}{root_path}", server.ws_scheme()),
            ),
            RewriteRule::literal("\"/devtools/", format!("\"{root_path}/devtools/")),
        ];

        let browser_id = WS_ENTITY_ID
            .captures(debugger_url)
            .and_then(|c| c.get(2))
            .map(|m| m.as_str().to_string());
        let (browser_route, browser_target) = match &browser_id {
            Some(id) => (
                format!("{root_path}/devtools/browser/{{{BROWSER_ID_PARAM}}}"),
                RelayTarget::new(
                    debugger_url.replacen(id.as_str(), &format!("{{{BROWSER_ID_PARAM}}}"), 1),
                    Some(BROWSER_ID_PARAM),
                ),
            ),
            None => (
                format!("{root_path}/devtools/browser"),
                RelayTarget::new(debugger_url, None),
            ),
        };
        let page_placeholder = format!("/page/{{{PAGE_ID_PARAM}}}");
        let page_destination = match &browser_id {
            Some(id) => debugger_url.replacen(&format!("/browser/{id}"), &page_placeholder, 1),
            None => BROWSER_SEGMENT
                .replacen(debugger_url, 1, NoExpand(&page_placeholder))
                .into_owned(),
        };
        let page_route = format!("{root_path}/devtools/page/{{{PAGE_ID_PARAM}}}");
        let page_target = RelayTarget::new(page_destination, Some(PAGE_ID_PARAM));

        let ws_routes = &host.server.routes;
        ws_routes
            .add(&browser_route, browser_target.handler())
            .await
            .map_err(|e| route_error(&browser_route, &e))?;
        if let Err(e) = ws_routes.add(&page_route, page_target.handler()).await {
            remove_route(ws_routes, &browser_route).await;
            return Err(route_error(&page_route, &e));
        }
        debug!(name, "Registered relays {browser_route} and {page_route}");

        Ok(SessionRoutes {
            rewrites,
            browser_route,
            page_route,
            public_root,
        })
    }

    /// Stop proxying `name`. Each cleanup step is attempted even if an
    /// earlier one failed, and the session is always forgotten afterwards.
    /// Runs on its own task, like [`ProxyEngine::start_proxy`].
    pub async fn stop_proxy(self: &Arc<Self>, name: &str) -> Result<(), ProxyError> {
        let engine = Arc::clone(self);
        let owned = name.to_string();
        detached(name, tokio::spawn(async move { engine.stop(&owned).await })).await
    }

    async fn stop(&self, name: &str) -> Result<(), ProxyError> {
        let session = self
            .sessions
            .begin_stop(name)
            .ok_or_else(|| ProxyError::UnknownTarget {
                name: name.to_string(),
            })?;
        debug!(name, alias = %session.alias, "Stopping the proxy");
        match self.host() {
            Ok(host) => {
                let ws_routes = &host.server.routes;
                remove_route(ws_routes, &session.browser_route).await;
                remove_route(ws_routes, &session.page_route).await;
                ForwardManager::new(Arc::clone(&host.bridge))
                    .remove(&session.forward)
                    .await;
            }
            Err(e) => warn!(name, "Skipping the cleanup of routes and the port forward: {e}"),
        }
        drop(session);
        self.sessions.finish_stop(name);
        info!(name, "Stopped the proxy");
        Ok(())
    }

    /// `<base>/cdp/<instance>/<alias>`
    fn root_path(&self, server: &ServerInfo, alias: &str) -> String {
        format!("{}/{CDP_ROOT}/{}/{alias}", server.base_path, self.id)
    }
}

/// Await a spawned engine operation. A panic in the task is resumed here.
async fn detached<T>(name: &str, task: JoinHandle<Result<T, ProxyError>>) -> Result<T, ProxyError> {
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(ProxyError::Aborted {
            name: name.to_string(),
        }),
    }
}

async fn remove_route(routes: &WsRoutes, template: &str) {
    if let Err(e) = routes.remove(template).await {
        warn!("Cannot remove the websocket route: {e}");
    }
}

fn route_error(template: &str, e: &RouteError) -> ProxyError {
    ProxyError::RouteRegistration {
        template: template.to_string(),
        reason: e.to_string(),
    }
}
