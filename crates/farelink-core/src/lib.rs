// farelink-core: ledgers, desired-state derivation, drift detection, and
// the reconciliation loop that keeps routers matching what riders paid for.

pub mod derive;
pub mod drift;
pub mod error;
pub mod fastpath;
pub mod gateway;
pub mod ledger;
pub mod model;
pub mod provider;
pub mod reconciler;
pub mod report;

// ── Primary re-exports ──────────────────────────────────────────────
pub use derive::{DesiredGrant, DesiredKind, desired_grants};
pub use drift::{Action, diff};
pub use error::CoreError;
pub use fastpath::{FastPath, IngestOutcome, PaymentEvent};
pub use gateway::{HttpRelayGateway, RelayGateway};
pub use ledger::{Ledger, StatusChange};
pub use provider::{PaymentPoller, PaymentProvider, ProviderError};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use report::{ActionRecord, CycleReport, OrderingAlert, Outcome, RouterSummary};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    Charge, ChargeId, GrantFault, Order, OrderId, OrderStatus, Plan, Router, RouterHealth,
    RouterId, Session, SessionId,
};
