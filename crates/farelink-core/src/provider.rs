// ── Slow-path payment poller ──
//
// Webhooks get lost. Orders stuck awaiting payment past a threshold are
// re-checked against the provider's pull endpoint, and the answer flows
// through the exact same ingest path as a webhook event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fastpath::{FastPath, PaymentEvent};
use crate::ledger::Ledger;
use crate::model::OrderStatus;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("order unknown to provider")]
    NotFound,

    #[error("malformed provider response: {0}")]
    Decode(String),
}

/// Pull interface to the payment provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Fetch the provider's current status for one order.
    async fn get_order_status(&self, external_code: &str) -> Result<OrderStatus, ProviderError>;
}

/// Periodic sweep over orders whose webhook never arrived.
pub struct PaymentPoller {
    ledger: Arc<Ledger>,
    provider: Arc<dyn PaymentProvider>,
    fast_path: FastPath,
    poll_interval: Duration,
    /// Orders younger than this are left for the webhook.
    min_age: Duration,
}

impl PaymentPoller {
    pub fn new(
        ledger: Arc<Ledger>,
        provider: Arc<dyn PaymentProvider>,
        fast_path: FastPath,
        poll_interval: Duration,
        min_age: Duration,
    ) -> Self {
        Self {
            ledger,
            provider,
            fast_path,
            poll_interval,
            min_age,
        }
    }

    /// Run until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await; // the webhook gets first shot at fresh orders
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.poll_once().await,
            }
        }
        debug!("payment poller stopped");
    }

    /// One sweep over the stuck orders.
    pub async fn poll_once(&self) {
        let min_age = chrono::Duration::from_std(self.min_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let cutoff = Utc::now() - min_age;

        for order in self.ledger.orders_awaiting_payment(cutoff) {
            match self.provider.get_order_status(&order.external_code).await {
                Ok(status) if status != order.status => {
                    debug!(
                        order = %order.id,
                        from = %order.status,
                        to = %status,
                        "poll found missed status change"
                    );
                    let event = PaymentEvent {
                        order_external_id: order.external_code.clone(),
                        status,
                        charge_ref: None,
                        amount_cents: None,
                    };
                    if let Err(err) = self.fast_path.ingest(&event) {
                        warn!(order = %order.id, %err, "failed to apply polled status");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(order = %order.id, %err, "provider poll failed");
                }
            }
        }
    }
}
