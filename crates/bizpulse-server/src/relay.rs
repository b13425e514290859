//! Bridge from the event bus to connected dashboards.

use std::sync::Arc;

use bizpulse_core::{EventKind, ServerMessage, SubscriptionId};
use tracing::debug;

use crate::bus::EventBus;
use crate::registry::ConnectionRegistry;

/// Subscribes one listener per [`EventKind`] that forwards each event to the
/// connections of its business. Unsubscribes on drop.
pub struct RelayBridge {
    bus: Arc<EventBus>,
    subscriptions: Vec<SubscriptionId>,
}

impl RelayBridge {
    pub fn new(bus: Arc<EventBus>, registry: Arc<ConnectionRegistry>) -> Self {
        let subscriptions = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let registry = registry.clone();
                bus.subscribe(kind, move |event| {
                    let message = ServerMessage::from(event.payload.clone());
                    let report = registry.fan_out(&event.business_id, &message);
                    debug!(
                        %kind,
                        business_id = %event.business_id,
                        delivered = report.delivered,
                        "relayed event"
                    );
                    Ok(())
                })
            })
            .collect();
        Self { bus, subscriptions }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Stop relaying. Same as dropping the bridge.
    pub fn detach(self) {}
}

impl Drop for RelayBridge {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            let _ = self.bus.unsubscribe(&id);
        }
    }
}
