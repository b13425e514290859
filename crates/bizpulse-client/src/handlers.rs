//! Per-kind handler table for inbound server messages.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, warn};

/// Synthetic kinds the agent dispatches about its own connection.
pub mod lifecycle {
    /// Reconnect attempts exhausted. Payload is `null`.
    pub const MAX_RECONNECT_ATTEMPTS: &str = "max_reconnect_attempts";
    /// Connect attempt or open socket failed. Payload is `{"message": ...}`.
    pub const CONNECTION_ERROR: &str = "connection_error";
    /// Server closed with 1008. Payload is `{"code": 1008, "reason": ...}`.
    pub const AUTH_FAILED: &str = "auth_failed";
}

pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Returned by [`HandlerRegistry::on`]; pass to `off` to unregister.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove one handler. Returns false if it was not registered for `kind`.
    pub fn off(&self, kind: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            let _ = handlers.remove(kind);
        }
        removed
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.read().get(kind).map_or(0, Vec::len)
    }

    /// Invoke every handler for `kind` in registration order. A failing or
    /// panicking handler is logged and does not stop the rest.
    ///
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, kind: &str, payload: &Value) -> usize {
        let snapshot: Vec<Handler> = match self.handlers.read().get(kind) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(kind, error = %e, "message handler failed"),
                Err(_) => error!(kind, "message handler panicked"),
            }
        }
        snapshot.len()
    }
}
