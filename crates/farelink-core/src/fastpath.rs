// ── Webhook fast path ──
//
// Normalized payment events land here: the ledger moves first, then a
// targeted wake-up skips the tick latency for the affected router.
// Purely a latency optimization -- the periodic tick independently
// discovers and grants any PAID order, so correctness never depends on
// an event arriving.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::ledger::Ledger;
use crate::model::OrderStatus;
use crate::reconciler::Wake;

/// A provider payment event, already verified and normalized by the
/// boundary layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub order_external_id: String,
    pub status: OrderStatus,
    /// Provider-side charge identifier, when the event named one.
    #[serde(default)]
    pub charge_ref: Option<String>,
    #[serde(default)]
    pub amount_cents: Option<i64>,
}

/// What ingesting an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Ledger moved; `newly_paid` means a reconciliation wake-up fired.
    Applied { newly_paid: bool },
    /// Redelivery or disallowed transition: nothing changed.
    NoChange,
    /// No such order. Acknowledged and dropped -- the provider retries
    /// webhooks aggressively and the poller converges later.
    UnknownOrder,
}

/// Handle for feeding normalized payment events into the reconciler.
#[derive(Clone)]
pub struct FastPath {
    ledger: Arc<Ledger>,
    wake: mpsc::Sender<Wake>,
}

impl FastPath {
    pub(crate) fn new(ledger: Arc<Ledger>, wake: mpsc::Sender<Wake>) -> Self {
        Self { ledger, wake }
    }

    /// Idempotently apply one event. A status the order already has, or
    /// a transition the status machine forbids, is a no-op.
    pub fn ingest(&self, event: &PaymentEvent) -> Result<IngestOutcome, CoreError> {
        let now = Utc::now();

        let Some(order) = self.ledger.order_by_code(&event.order_external_id) else {
            debug!(
                order = %event.order_external_id,
                "payment event for unknown order, dropping"
            );
            return Ok(IngestOutcome::UnknownOrder);
        };

        if let Some(ref charge_ref) = event.charge_ref {
            self.ledger.upsert_charge(
                charge_ref,
                Some(order.id),
                &event.status.to_string(),
                event.amount_cents,
                now,
            );
        }

        let change = self
            .ledger
            .apply_payment_status(&event.order_external_id, event.status, now)?;

        if change.newly_paid {
            info!(
                order = %change.order.id,
                router = %change.order.router_id,
                "order paid, waking reconciler"
            );
            // A full channel means a pass is already queued; the tick
            // covers the rest.
            let _ = self.wake.try_send(Wake::Router(change.order.router_id));
            return Ok(IngestOutcome::Applied { newly_paid: true });
        }

        Ok(if change.changed {
            IngestOutcome::Applied { newly_paid: false }
        } else {
            IngestOutcome::NoChange
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, Plan, RouterId};

    fn fast_path_with_order() -> (FastPath, mpsc::Receiver<Wake>, RouterId) {
        let ledger = Arc::new(Ledger::new());
        let router_id = RouterId::new();
        let order = Order::new(
            "ord-1",
            990,
            Plan::new("2h", 120),
            "10.0.0.5".parse().unwrap(),
            None,
            router_id,
            Utc::now(),
        );
        ledger.insert_order(order).unwrap();
        let (tx, rx) = mpsc::channel(8);
        (FastPath::new(ledger, tx), rx, router_id)
    }

    #[test]
    fn paid_event_wakes_the_affected_router() {
        let (fast_path, mut rx, router_id) = fast_path_with_order();

        let outcome = fast_path
            .ingest(&PaymentEvent {
                order_external_id: "ord-1".into(),
                status: OrderStatus::Paid,
                charge_ref: Some("ch-1".into()),
                amount_cents: Some(990),
            })
            .unwrap();

        assert_eq!(outcome, IngestOutcome::Applied { newly_paid: true });
        assert_eq!(rx.try_recv().unwrap(), Wake::Router(router_id));
        assert!(fast_path.ledger.charge_by_ref("ch-1").is_some());
    }

    #[test]
    fn redelivered_event_is_a_no_op() {
        let (fast_path, mut rx, _) = fast_path_with_order();
        let event = PaymentEvent {
            order_external_id: "ord-1".into(),
            status: OrderStatus::Paid,
            charge_ref: None,
            amount_cents: None,
        };

        fast_path.ingest(&event).unwrap();
        rx.try_recv().unwrap();

        let outcome = fast_path.ingest(&event).unwrap();
        assert_eq!(outcome, IngestOutcome::NoChange);
        assert!(rx.try_recv().is_err(), "no second wake-up");
    }

    #[test]
    fn unknown_order_is_acknowledged() {
        let (fast_path, mut rx, _) = fast_path_with_order();
        let outcome = fast_path
            .ingest(&PaymentEvent {
                order_external_id: "ord-unknown".into(),
                status: OrderStatus::Paid,
                charge_ref: None,
                amount_cents: None,
            })
            .unwrap();
        assert_eq!(outcome, IngestOutcome::UnknownOrder);
        assert!(rx.try_recv().is_err());
    }
}
