//! In-process event bus.
//!
//! Business logic publishes [`BusinessEvent`]s through [`BusinessEvents`];
//! listeners subscribe per [`EventKind`]. Dispatch is synchronous and runs on
//! the publisher's thread, so events of one kind reach every listener in
//! publish order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bizpulse_core::{
    AlertPayload, BusinessEvent, BusinessId, ComplianceUpdate, DocumentUpdate, EventKind,
    EventPayload, FinancialUpdate, ProtocolError, SubscriptionId, TaxUpdate,
};
use bizpulse_telemetry::metrics::{BUS_EVENTS_PUBLISHED_TOTAL, BUS_LISTENER_FAILURES_TOTAL};
use metrics::counter;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

/// Error returned by a listener. Logged by the bus, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ListenerError(String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

type Listener = Arc<dyn Fn(&BusinessEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Outcome of one [`EventBus::publish`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Listeners invoked.
    pub listeners: usize,
    /// Listeners that returned an error or panicked.
    pub failed: usize,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `listener` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&BusinessEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id.clone(), Arc::new(listener)));
        debug!(%kind, subscription_id = %id, "listener subscribed");
        id
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        for listeners in subscribers.values_mut() {
            if let Some(pos) = listeners.iter().position(|(sub, _)| sub == id) {
                let _ = listeners.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Deliver `event` to every listener subscribed to its kind.
    ///
    /// Listeners run against a snapshot taken before the first call, so a
    /// listener may subscribe or unsubscribe without deadlocking. A failing
    /// or panicking listener is logged and skipped.
    pub fn publish(&self, event: &BusinessEvent) -> PublishReport {
        let kind = event.kind();
        let listeners: Vec<(SubscriptionId, Listener)> = self
            .subscribers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        counter!(BUS_EVENTS_PUBLISHED_TOTAL, "kind" => kind.as_str()).increment(1);

        let mut report = PublishReport {
            listeners: listeners.len(),
            failed: 0,
        };
        for (id, listener) in &listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        %kind,
                        business_id = %event.business_id,
                        subscription_id = %id,
                        error = %e,
                        "event listener failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    error!(
                        %kind,
                        business_id = %event.business_id,
                        subscription_id = %id,
                        "event listener panicked"
                    );
                }
            }
        }
        if report.failed > 0 {
            counter!(BUS_LISTENER_FAILURES_TOTAL, "kind" => kind.as_str())
                .increment(report.failed as u64);
        }
        debug!(
            %kind,
            business_id = %event.business_id,
            listeners = report.listeners,
            "event published"
        );
        report
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry points for business logic to announce state changes.
#[derive(Clone)]
pub struct BusinessEvents {
    bus: Arc<EventBus>,
}

impl BusinessEvents {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }

    pub fn emit(&self, event: &BusinessEvent) -> PublishReport {
        self.bus.publish(event)
    }

    pub fn emit_financial_update(
        &self,
        business_id: impl Into<BusinessId>,
        data: FinancialUpdate,
    ) -> PublishReport {
        self.emit_payload(business_id, EventPayload::FinancialUpdate(data))
    }

    pub fn emit_compliance_update(
        &self,
        business_id: impl Into<BusinessId>,
        data: ComplianceUpdate,
    ) -> PublishReport {
        self.emit_payload(business_id, EventPayload::ComplianceUpdate(data))
    }

    pub fn emit_tax_update(
        &self,
        business_id: impl Into<BusinessId>,
        data: TaxUpdate,
    ) -> PublishReport {
        self.emit_payload(business_id, EventPayload::TaxUpdate(data))
    }

    pub fn emit_document_update(
        &self,
        business_id: impl Into<BusinessId>,
        data: DocumentUpdate,
    ) -> PublishReport {
        self.emit_payload(business_id, EventPayload::DocumentUpdate(data))
    }

    pub fn emit_alert(
        &self,
        business_id: impl Into<BusinessId>,
        data: AlertPayload,
    ) -> PublishReport {
        self.emit_payload(business_id, EventPayload::Alert(data))
    }

    /// Publish untyped JSON as the payload for `kind`.
    pub fn emit_json(
        &self,
        kind: EventKind,
        business_id: impl Into<BusinessId>,
        data: Value,
    ) -> Result<PublishReport, ProtocolError> {
        let payload = EventPayload::from_json(kind, data)?;
        Ok(self.emit_payload(business_id, payload))
    }

    fn emit_payload(&self, business_id: impl Into<BusinessId>, payload: EventPayload) -> PublishReport {
        self.bus.publish(&BusinessEvent::new(business_id, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::{json, Number};

    fn recorder(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<BusinessEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _ = bus.subscribe(kind, move |event| {
            sink.lock().push(event.clone());
            Ok(())
        });
        seen
    }

    fn compliance(status: &str) -> ComplianceUpdate {
        ComplianceUpdate {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    #[test]
    fn publish_reaches_only_matching_kind() {
        let bus = Arc::new(EventBus::new());
        let compliance_seen = recorder(&bus, EventKind::ComplianceUpdate);
        let alert_seen = recorder(&bus, EventKind::Alert);

        let events = BusinessEvents::new(bus);
        let report = events.emit_compliance_update("biz1", compliance("At Risk"));

        assert_eq!(report.listeners, 1);
        assert_eq!(compliance_seen.lock().len(), 1);
        assert!(alert_seen.lock().is_empty());
        assert_eq!(compliance_seen.lock()[0].business_id.as_str(), "biz1");
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        let report = bus.publish(&BusinessEvent::new(
            "biz1",
            EventPayload::Alert(AlertPayload::default()),
        ));
        assert_eq!(report, PublishReport::default());
    }

    #[test]
    fn same_kind_events_keep_publish_order() {
        let bus = Arc::new(EventBus::new());
        let seen = recorder(&bus, EventKind::ComplianceUpdate);
        let events = BusinessEvents::new(bus);
        for status in ["Good", "At Risk", "Critical"] {
            let _ = events.emit_compliance_update("biz1", compliance(status));
        }
        let statuses: Vec<_> = seen
            .lock()
            .iter()
            .map(|e| match &e.payload {
                EventPayload::ComplianceUpdate(c) => c.status.clone().unwrap_or_default(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(statuses, ["Good", "At Risk", "Critical"]);
    }

    #[test]
    fn failing_listener_does_not_block_siblings() {
        let bus = EventBus::new();
        let _ = bus.subscribe(EventKind::Alert, |_| Err(ListenerError::new("nope")));
        let seen = recorder(&bus, EventKind::Alert);

        let report = bus.publish(&BusinessEvent::new(
            "biz1",
            EventPayload::Alert(AlertPayload::default()),
        ));
        assert_eq!(report.listeners, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let bus = EventBus::new();
        let _ = bus.subscribe(EventKind::TaxUpdate, |_| panic!("listener bug"));
        let seen = recorder(&bus, EventKind::TaxUpdate);

        let report = bus.publish(&BusinessEvent::new(
            "biz1",
            EventPayload::TaxUpdate(TaxUpdate::default()),
        ));
        assert_eq!(report.failed, 1);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = bus.subscribe(EventKind::Alert, move |_| {
            *c.lock() += 1;
            Ok(())
        });
        assert_eq!(bus.subscriber_count(EventKind::Alert), 1);

        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        assert_eq!(bus.subscriber_count(EventKind::Alert), 0);

        let _ = bus.publish(&BusinessEvent::new(
            "biz1",
            EventPayload::Alert(AlertPayload::default()),
        ));
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn listener_may_unsubscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (b, s) = (bus.clone(), slot.clone());
        let id = bus.subscribe(EventKind::Alert, move |_| {
            if let Some(id) = s.lock().take() {
                let _ = b.unsubscribe(&id);
            }
            Ok(())
        });
        *slot.lock() = Some(id);

        let event = BusinessEvent::new("biz1", EventPayload::Alert(AlertPayload::default()));
        assert_eq!(bus.publish(&event).listeners, 1);
        assert_eq!(bus.publish(&event).listeners, 0);
    }

    #[test]
    fn emit_json_builds_typed_payload() {
        let bus = Arc::new(EventBus::new());
        let seen = recorder(&bus, EventKind::FinancialUpdate);
        let events = BusinessEvents::new(bus);

        let report = events
            .emit_json(
                EventKind::FinancialUpdate,
                "biz7",
                json!({"cashFlow": 1200.5, "region": "west"}),
            )
            .unwrap();
        assert_eq!(report.listeners, 1);

        let event = seen.lock()[0].clone();
        let EventPayload::FinancialUpdate(update) = event.payload else {
            panic!("wrong variant");
        };
        assert_eq!(update.cash_flow, Number::from_f64(1200.5));
        assert_eq!(update.extra["region"], "west");
    }

    #[test]
    fn emit_json_rejects_bad_payload() {
        let events = BusinessEvents::new(Arc::new(EventBus::new()));
        let err = events
            .emit_json(EventKind::TaxUpdate, "biz1", json!({"totalDue": "many"}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn every_emit_helper_tags_its_kind() {
        let bus = Arc::new(EventBus::new());
        let seen: Vec<_> = EventKind::ALL.iter().map(|k| recorder(&bus, *k)).collect();
        let events = BusinessEvents::new(bus);

        let _ = events.emit_financial_update("b", FinancialUpdate::default());
        let _ = events.emit_compliance_update("b", ComplianceUpdate::default());
        let _ = events.emit_tax_update("b", TaxUpdate::default());
        let _ = events.emit_document_update("b", DocumentUpdate::default());
        let _ = events.emit_alert("b", AlertPayload::default());

        for (kind, seen) in EventKind::ALL.iter().zip(&seen) {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1, "{kind}");
            assert_eq!(seen[0].kind(), *kind);
        }
    }
}
