//! Process-wide lookup of live engines by instance id.
//!
//! The per-session HTTP endpoints carry the engine instance id in their path
//! and use it to find the engine that owns the session. Entries are weak so
//! the registry never keeps an engine alive. Expired entries are pruned on
//! lookup.

use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};

use crate::engine::ProxyEngine;

static ENGINES: LazyLock<Mutex<Vec<Weak<ProxyEngine>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

pub fn register(engine: &Arc<ProxyEngine>) {
    ENGINES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Arc::downgrade(engine));
}

/// The live engine with instance id `id`, if any.
pub fn find(id: &str) -> Option<Arc<ProxyEngine>> {
    let mut engines = ENGINES.lock().unwrap_or_else(PoisonError::into_inner);
    let mut found = None;
    engines.retain(|weak| match weak.upgrade() {
        Some(engine) => {
            if found.is_none() && engine.id() == id {
                found = Some(engine);
            }
            true
        }
        None => false,
    });
    found
}
