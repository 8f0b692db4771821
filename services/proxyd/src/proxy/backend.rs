//! Backend registry and least-connections selection.
//!
//! Backends come from two writers: synthetic `bootstrap-<n>` entries from the
//! bootstrap prober, and API-server pods from the discovery watcher. The
//! accept path only reads the cached selection.
//!
//! Selection rules:
//! - The cached backend always has the minimum live connection count
//! - Ties go to the lowest backend id
//! - No backend is selected iff the registry is empty
//!
//! Every mutation rescans the whole map. Backend counts are bounded by the
//! number of control-plane replicas.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Where a backend entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOrigin {
    /// Registered by a bootstrap probe.
    Bootstrap,
    /// Registered from a pod watch event.
    Discovered,
}

impl BackendOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendOrigin::Bootstrap => "bootstrap",
            BackendOrigin::Discovered => "discovered",
        }
    }
}

/// A routable API-server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    /// Unique id (pod UID or `bootstrap-<n>`).
    pub id: String,
    /// Host or IP, without port.
    pub addr: String,
    /// Live proxied connections.
    pub connections: u32,
    pub origin: BackendOrigin,
}

impl Backend {
    /// Create a backend with no live connections.
    pub fn new(id: impl Into<String>, addr: impl Into<String>, origin: BackendOrigin) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            connections: 0,
            origin,
        }
    }

    /// Dial target for this backend on the given port.
    pub fn target(&self, port: u16) -> String {
        join_host_port(&self.addr, port)
    }
}

/// Combine a host and port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn least_loaded(a: &Backend, b: &Backend) -> Ordering {
    a.connections
        .cmp(&b.connections)
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Default)]
struct RegistryState {
    backends: HashMap<String, Backend>,
    /// Id of the cached selection.
    current: Option<String>,
}

impl RegistryState {
    fn recompute(&mut self) {
        self.current = self
            .backends
            .values()
            .min_by(|a, b| least_loaded(a, b))
            .map(|b| b.id.clone());
    }
}

/// Concurrency-safe backend store.
///
/// One exclusive lock covers the map and the cached selection. Nothing
/// performs I/O while holding it.
#[derive(Default)]
pub struct BackendRegistry {
    state: Mutex<RegistryState>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a backend. Returns false and leaves state untouched if `id` is
    /// already registered.
    pub fn add_backend(&self, id: &str, addr: &str, origin: BackendOrigin) -> bool {
        let mut state = self.state.lock();
        if state.backends.contains_key(id) {
            return false;
        }
        state
            .backends
            .insert(id.to_string(), Backend::new(id, addr, origin));
        state.recompute();

        debug!(
            backend_id = %id,
            addr = %addr,
            origin = origin.as_str(),
            backend_count = state.backends.len(),
            "Backend added"
        );
        true
    }

    /// Remove a backend. Returns whether it was present.
    pub fn delete_backend(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let deleted = state.backends.remove(id).is_some();
        state.recompute();

        if deleted {
            debug!(
                backend_id = %id,
                backend_count = state.backends.len(),
                "Backend deleted"
            );
        }
        deleted
    }

    /// Count one more live connection against `id`. No-op if absent.
    pub fn increment_connections(&self, id: &str) {
        let mut state = self.state.lock();
        let Some(backend) = state.backends.get_mut(id) else {
            return;
        };
        backend.connections = backend.connections.saturating_add(1);
        state.recompute();
    }

    /// Release one live connection from `id`. No-op if absent or already zero.
    pub fn decrement_connections(&self, id: &str) {
        let mut state = self.state.lock();
        let Some(backend) = state.backends.get_mut(id) else {
            return;
        };
        if backend.connections == 0 {
            return;
        }
        backend.connections -= 1;
        state.recompute();
    }

    /// Snapshot of the least-loaded backend, if any.
    pub fn select_backend(&self) -> Option<Backend> {
        let state = self.state.lock();
        state
            .current
            .as_ref()
            .and_then(|id| state.backends.get(id))
            .cloned()
    }

    /// Increment `id` and return a guard that releases it on drop.
    pub fn lease(self: &Arc<Self>, id: &str) -> ConnectionLease {
        self.increment_connections(id);
        ConnectionLease {
            registry: Arc::clone(self),
            id: id.to_string(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Backend> {
        self.state.lock().backends.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().backends.is_empty()
    }

    /// All backends ordered by id.
    pub fn snapshot(&self) -> Vec<Backend> {
        let mut backends: Vec<Backend> = self.state.lock().backends.values().cloned().collect();
        backends.sort_by(|a, b| a.id.cmp(&b.id));
        backends
    }
}

/// Holds one live connection against a backend.
///
/// Dropping the lease decrements the count exactly once, whichever way the
/// owning connection handler exits.
pub struct ConnectionLease {
    registry: Arc<BackendRegistry>,
    id: String,
}

impl ConnectionLease {
    pub fn backend_id(&self) -> &str {
        &self.id
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.registry.decrement_connections(&self.id);
    }
}
