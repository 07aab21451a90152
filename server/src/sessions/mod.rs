//! Proxied session bookkeeping.
//!
//! [`SessionRegistry`] is the single authority for which debug sockets are
//! proxied. A name moves through `Starting -> Active -> Stopping` and is
//! removed afterwards. The slot is taken before any side effect, under the
//! same lock as the existence check, so two concurrent starts for one name
//! cannot both proceed. A start that fails drops its [`Reservation`], which
//! frees the slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::forward::ForwardHandle;
use crate::ports::PortLease;
use crate::rewrite::RewriteRule;

/// Length of the alias digest in bytes before hex encoding.
const ALIAS_BYTES: usize = 20;

/// URL-safe stable alias for a socket name: the first 20 bytes of its
/// SHA-256, lower-case hex. Socket names contain `@` and `.`, which do not
/// belong in a path segment.
pub fn socket_alias(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    digest[..ALIAS_BYTES].iter().fold(
        String::with_capacity(ALIAS_BYTES * 2),
        |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
            s
        },
    )
}

/// Public view of a proxied session, as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInfo {
    pub name: String,
    pub alias: String,
    /// `http(s)://<public host>:<port><base>/cdp/<instance>/<alias>`
    pub public_root: String,
}

/// Everything a live proxy owns.
#[derive(Debug)]
pub struct ProxiedSession {
    pub name: String,
    pub alias: String,
    pub lease: PortLease,
    pub forward: ForwardHandle,
    pub rewrites: Arc<Vec<RewriteRule>>,
    pub browser_route: String,
    pub page_route: String,
    pub public_root: String,
}

impl ProxiedSession {
    pub fn info(&self) -> ProxyInfo {
        ProxyInfo {
            name: self.name.clone(),
            alias: self.alias.clone(),
            public_root: self.public_root.clone(),
        }
    }
}

/// What the HTTP proxy routes need to serve a request for an alias.
#[derive(Debug, Clone)]
pub struct ActiveTarget {
    pub name: String,
    pub local_port: u16,
    pub rewrites: Arc<Vec<RewriteRule>>,
}

#[derive(Debug)]
enum Slot {
    Starting,
    Active(ProxiedSession),
    Stopping,
}

/// Name-keyed map of proxy slots.
///
/// Cloneable; all clones share the same map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for a start. `None` if it is starting, active or stopping.
    pub fn reserve(&self, name: &str) -> Option<Reservation> {
        let mut slots = self.lock();
        if slots.contains_key(name) {
            return None;
        }
        slots.insert(name.to_string(), Slot::Starting);
        Some(Reservation {
            registry: self.clone(),
            name: name.to_string(),
            committed: false,
        })
    }

    /// Move an active session to `Stopping` and hand it to the caller.
    /// `None` if `name` is not active.
    pub fn begin_stop(&self, name: &str) -> Option<ProxiedSession> {
        let mut slots = self.lock();
        match slots.get(name) {
            Some(Slot::Active(_)) => {}
            _ => return None,
        }
        match slots.insert(name.to_string(), Slot::Stopping) {
            Some(Slot::Active(session)) => Some(session),
            _ => None,
        }
    }

    /// Drop the `Stopping` slot for `name`.
    pub fn finish_stop(&self, name: &str) {
        let mut slots = self.lock();
        if matches!(slots.get(name), Some(Slot::Stopping)) {
            slots.remove(name);
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        matches!(self.lock().get(name), Some(Slot::Active(_)))
    }

    pub fn proxy_info(&self, name: &str) -> Option<ProxyInfo> {
        match self.lock().get(name) {
            Some(Slot::Active(session)) => Some(session.info()),
            _ => None,
        }
    }

    /// Names of all active sessions, sorted.
    pub fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<ActiveTarget> {
        self.lock().values().find_map(|slot| match slot {
            Slot::Active(s) if s.alias == alias => Some(ActiveTarget {
                name: s.name.clone(),
                local_port: s.forward.local_port(),
                rewrites: Arc::clone(&s.rewrites),
            }),
            _ => None,
        })
    }

    /// Number of slots in any state.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A `Starting` slot. Dropping it without [`Reservation::commit`] frees the
/// name again.
#[must_use = "dropping a reservation releases the name"]
pub struct Reservation {
    registry: SessionRegistry,
    name: String,
    committed: bool,
}

impl Reservation {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish the session as active.
    pub fn commit(mut self, session: ProxiedSession) {
        self.registry
            .lock()
            .insert(self.name.clone(), Slot::Active(session));
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = self.registry.lock();
        if matches!(slots.get(&self.name), Some(Slot::Starting)) {
            slots.remove(&self.name);
        }
    }
}
