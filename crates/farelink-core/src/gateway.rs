// ── Relay gateway port ──
//
// The reconciler talks to routers through this trait so the control
// loop can be exercised against an in-process fake. The HTTP adapter
// wraps `farelink-relay`'s client and reader.

use async_trait::async_trait;
use serde_json::Value;

use farelink_relay::{ObservedState, RelayClient, RelayError, RouterOp, RouterStateReader};

use crate::model::Router;

/// Everything the reconciler needs from the relay: one mutation at a
/// time, and a full observation pass.
#[async_trait]
pub trait RelayGateway: Send + Sync {
    async fn execute(&self, router: &Router, op: RouterOp) -> Result<Value, RelayError>;
    async fn observe(&self, router: &Router) -> Result<ObservedState, RelayError>;
}

/// Production gateway over the HTTP relay.
#[derive(Debug, Clone)]
pub struct HttpRelayGateway {
    client: RelayClient,
    reader: RouterStateReader,
}

impl HttpRelayGateway {
    pub fn new(client: RelayClient, paid_list: impl Into<String>, chain: impl Into<String>) -> Self {
        let reader = RouterStateReader::new(client.clone(), paid_list, chain);
        Self { client, reader }
    }
}

#[async_trait]
impl RelayGateway for HttpRelayGateway {
    async fn execute(&self, router: &Router, op: RouterOp) -> Result<Value, RelayError> {
        self.client.execute(&router.target(), &op).await
    }

    async fn observe(&self, router: &Router) -> Result<ObservedState, RelayError> {
        self.reader.observe(&router.target()).await
    }
}
