// ── Cycle reports ──
//
// What the operator endpoint serves instead of the pile of diagnostic
// scripts this engine replaced: per router, the last cycle's action
// outcomes, standing rule-ordering alerts, and sessions parked behind
// a permanent-error cool-down.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::drift::Action;
use crate::model::{RouterHealth, RouterId, SessionId};

/// What happened to one corrective action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    /// Applied on the router and recorded in the ledger.
    Applied,
    /// Not attempted (or not finished) this cycle; the next tick retries.
    Deferred { reason: String },
    /// The router permanently rejected it; retry is cooled down.
    Failed { message: String },
    /// Intentionally not attempted (cool-down, stale write, held IP).
    Skipped { reason: String },
    /// Surfaced as an alert; never auto-applied.
    AlertRaised,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub action: Action,
    pub outcome: Outcome,
}

/// Standing alert for high-blast-radius structural drift.
#[derive(Debug, Clone, Serialize)]
pub struct OrderingAlert {
    pub chain: String,
    pub position: usize,
    pub rule: String,
    pub detected_at: DateTime<Utc>,
}

/// One router's slice of one reconciliation cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub router_id: RouterId,
    pub router_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reachable: bool,
    pub actions: Vec<ActionRecord>,
    pub alerts: Vec<OrderingAlert>,
    /// Sessions excluded from automatic retry after a permanent error.
    pub cooled_down_sessions: Vec<SessionId>,
}

impl CycleReport {
    /// Report for a router that could not be observed this cycle.
    pub fn unreachable(router_id: RouterId, name: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            router_id,
            router_name: name.to_owned(),
            started_at,
            finished_at: Utc::now(),
            reachable: false,
            actions: Vec::new(),
            alerts: Vec::new(),
            cooled_down_sessions: Vec::new(),
        }
    }
}

/// Router registry entry for the operator surface.
#[derive(Debug, Clone, Serialize)]
pub struct RouterSummary {
    pub id: RouterId,
    pub name: String,
    pub address: String,
    pub health: RouterHealth,
}

impl From<&crate::model::Router> for RouterSummary {
    fn from(router: &crate::model::Router) -> Self {
        Self {
            id: router.id,
            name: router.name.clone(),
            address: router.address.clone(),
            health: router.health.clone(),
        }
    }
}
