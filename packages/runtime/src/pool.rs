// ABOUTME: Process-wide adapter pool keyed by (container id, endpoint)
// ABOUTME: Amortizes meta-probe cost by reusing adapter instances across requests

use crate::{GullAdapter, RuntimeAdapter, RuntimeKind, ShipAdapter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Builds an adapter for (container id, endpoint, kind). The default factory
/// constructs the real HTTP adapters; tests substitute scripted ones.
pub type AdapterFactory =
    dyn Fn(&str, &str, RuntimeKind) -> Arc<dyn RuntimeAdapter> + Send + Sync;

/// Keyed cache of live adapters.
///
/// Keying on both container id and endpoint means a replaced container (same
/// sandbox, new endpoint) never reuses the stale adapter or its cached meta.
/// Entries are inserted idempotently; concurrent callers converge on the
/// entry that won the insert.
pub struct AdapterPool {
    entries: Mutex<HashMap<(String, String), Arc<dyn RuntimeAdapter>>>,
    factory: Box<AdapterFactory>,
}

impl Default for AdapterPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterPool {
    pub fn new() -> Self {
        Self::with_factory(Box::new(|_, endpoint, kind| match kind {
            RuntimeKind::Ship => Arc::new(ShipAdapter::new(endpoint)),
            RuntimeKind::Gull => Arc::new(GullAdapter::new(endpoint)),
        }))
    }

    pub fn with_factory(factory: Box<AdapterFactory>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            factory,
        }
    }

    /// Get the adapter for a container, creating it if absent.
    pub fn get_or_create(
        &self,
        container_id: &str,
        endpoint: &str,
        kind: RuntimeKind,
    ) -> Arc<dyn RuntimeAdapter> {
        let key = (container_id.to_string(), endpoint.to_string());
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(key)
            .or_insert_with(|| (self.factory)(container_id, endpoint, kind))
            .clone()
    }

    /// Drop every adapter bound to a container. Called when its session
    /// leaves the running state so cached meta cannot go stale.
    pub fn invalidate_container(&self, container_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(cid, _), _| cid != container_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
