// ── Core error types ──
//
// Ledger and reconciliation failures. Relay-layer errors are wrapped,
// not re-exposed raw; consumers see domain-level variants.

use thiserror::Error;

use crate::model::{RouterId, SessionId};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Ledger lookups ───────────────────────────────────────────────
    #[error("order not found: {identifier}")]
    OrderNotFound { identifier: String },

    #[error("session not found: {id}")]
    SessionNotFound { id: SessionId },

    #[error("router not found: {id}")]
    RouterNotFound { id: RouterId },

    // ── Ledger writes ────────────────────────────────────────────────
    #[error("order with external code '{code}' already exists")]
    DuplicateOrder { code: String },

    #[error("an active session already holds {ip} on router {router_id}")]
    ActiveSessionExists {
        router_id: RouterId,
        ip: std::net::IpAddr,
    },

    /// Optimistic-concurrency rejection. The losing writer retries on
    /// the next cycle with fresh state; this is never a hard failure.
    #[error("stale write on session {id}: expected version {expected}, ledger has {found}")]
    VersionConflict {
        id: SessionId,
        expected: u64,
        found: u64,
    },

    // ── Relay (wrapped) ──────────────────────────────────────────────
    #[error("relay error: {0}")]
    Relay(#[from] farelink_relay::RelayError),
}
