//! Live connections grouped by business.

use std::collections::HashMap;
use std::sync::Arc;

use bizpulse_core::{BusinessId, ConnectionId, ServerMessage};
use bizpulse_telemetry::metrics::{FANOUT_DELIVERIES_TOTAL, FANOUT_DROPS_TOTAL};
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::connection::ClientConnection;

/// Outcome of one [`ConnectionRegistry::fan_out`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Frames enqueued.
    pub delivered: usize,
    /// Connections not Open at send time.
    pub skipped: usize,
    /// Enqueue failures (queue full or writer gone).
    pub failed: usize,
}

impl FanOutReport {
    pub fn recipients(&self) -> usize {
        self.delivered + self.skipped + self.failed
    }
}

type Members = HashMap<ConnectionId, Arc<ClientConnection>>;

/// `BusinessId → {ConnectionId → connection}`.
///
/// The lock is only held to mutate or snapshot the map, never while
/// sending, and never across an `.await`. Businesses with no connections
/// have no entry.
pub struct ConnectionRegistry {
    businesses: Mutex<HashMap<BusinessId, Members>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            businesses: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection under its own business.
    pub fn add(&self, connection: Arc<ClientConnection>) {
        let business_id = connection.business_id().clone();
        let conn_id = connection.id.clone();
        let members = {
            let mut businesses = self.businesses.lock();
            let entry = businesses.entry(business_id.clone()).or_default();
            let _ = entry.insert(conn_id.clone(), connection);
            entry.len()
        };
        debug!(%business_id, %conn_id, members, "connection registered");
    }

    /// Unregister a connection. Returns `false` if it was not registered.
    pub fn remove(&self, business_id: &BusinessId, conn_id: &ConnectionId) -> bool {
        let mut businesses = self.businesses.lock();
        let Some(members) = businesses.get_mut(business_id) else {
            return false;
        };
        let removed = members.remove(conn_id).is_some();
        if members.is_empty() {
            let _ = businesses.remove(business_id);
        }
        drop(businesses);
        if removed {
            debug!(%business_id, %conn_id, "connection unregistered");
        }
        removed
    }

    /// Snapshot of the connections for a business.
    pub fn get(&self, business_id: &BusinessId) -> Vec<Arc<ClientConnection>> {
        self.businesses
            .lock()
            .get(business_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Send `message` to every Open connection of `business_id`.
    ///
    /// The frame is serialized once. A failed enqueue is logged and counted
    /// and never stops delivery to the remaining connections.
    pub fn fan_out(&self, business_id: &BusinessId, message: &ServerMessage) -> FanOutReport {
        let mut report = FanOutReport::default();
        let targets = self.get(business_id);
        if targets.is_empty() {
            debug!(%business_id, kind = message.type_name(), "no connections for business");
            return report;
        }

        let json: Arc<str> = match message.to_json() {
            Ok(json) => Arc::from(json),
            Err(e) => {
                warn!(kind = message.type_name(), error = %e, "failed to serialize message");
                return report;
            }
        };

        for conn in &targets {
            if !conn.is_open() {
                report.skipped += 1;
                continue;
            }
            if conn.send(json.clone()) {
                report.delivered += 1;
            } else {
                report.failed += 1;
                warn!(
                    %business_id,
                    conn_id = %conn.id,
                    kind = message.type_name(),
                    dropped = conn.drop_count(),
                    "failed to enqueue message"
                );
            }
        }

        counter!(FANOUT_DELIVERIES_TOTAL).increment(report.delivered as u64);
        if report.failed > 0 {
            counter!(FANOUT_DROPS_TOTAL).increment(report.failed as u64);
        }
        debug!(
            %business_id,
            kind = message.type_name(),
            recipients = report.recipients(),
            delivered = report.delivered,
            "fan-out complete"
        );
        report
    }

    pub fn business_count(&self) -> usize {
        self.businesses.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.businesses.lock().values().map(HashMap::len).sum()
    }

    /// Ask every registered connection to close. Returns how many were asked.
    ///
    /// Sessions unregister themselves as their sockets close.
    pub fn close_all(&self) -> usize {
        let all: Vec<Arc<ClientConnection>> = self
            .businesses
            .lock()
            .values()
            .flat_map(|members| members.values().cloned())
            .collect();
        for conn in &all {
            conn.request_close();
        }
        all.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
