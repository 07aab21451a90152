//! Local port allocation for forwards.
//!
//! A port is handed out as a [`PortLease`]: it is free on the loopback
//! interface at probe time and reserved inside this process until the lease
//! is dropped. The reservation set is what keeps two concurrent callers from
//! probing the same free port and both forwarding it. Nothing can stop an
//! unrelated process from grabbing the port between probe and forward; that
//! race is accepted.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use crate::config::PortRange;
use crate::error::ProxyError;

/// Outcome of [`check_port`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortStatus {
    Free,
    Busy,
}

/// Reports whether `port` can currently be bound on `127.0.0.1`.
pub fn check_port(port: u16) -> PortStatus {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(_) => PortStatus::Free,
        Err(_) => PortStatus::Busy,
    }
}

/// Hands out local ports and tracks in-process reservations.
///
/// Cloneable; all clones share the same reservation set.
#[derive(Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

static SHARED: LazyLock<PortAllocator> = LazyLock::new(PortAllocator::default);

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The allocator every engine in the process draws from.
    pub fn shared() -> Self {
        SHARED.clone()
    }

    /// Lease the first port in `range` that is neither reserved nor bound.
    pub fn find_free_port(&self, range: PortRange) -> Result<PortLease, ProxyError> {
        let mut reserved = self.lock();
        for port in range.ports() {
            if reserved.contains(&port) || check_port(port) == PortStatus::Busy {
                continue;
            }
            reserved.insert(port);
            return Ok(self.lease(port));
        }
        Err(ProxyError::PortExhausted {
            start: range.start,
            end: range.end,
        })
    }

    /// Lease an explicitly requested port. Returns `None` if it is reserved
    /// by this process or bound by anyone.
    pub fn reserve(&self, port: u16) -> Option<PortLease> {
        let mut reserved = self.lock();
        if port == 0 || reserved.contains(&port) || check_port(port) == PortStatus::Busy {
            return None;
        }
        reserved.insert(port);
        Some(self.lease(port))
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    fn lease(&self, port: u16) -> PortLease {
        PortLease {
            port,
            reserved: Arc::clone(&self.reserved),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved local port. The reservation is released on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}
