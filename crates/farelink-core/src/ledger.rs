// ── Ledger store ──
//
// Single source of truth for desired state: Orders, Charges, Sessions,
// and the Router registry. Concurrent readers are safe; Session writers
// go through an optimistic version check so a fast-path-triggered cycle
// and the periodic tick cannot both win a re-key with stale data.
//
// Every operation is short-lived and scoped to a single entry -- a
// router timeout can never hold a ledger lock open.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::{
    Charge, ChargeId, Order, OrderId, OrderStatus, Router, RouterHealth, RouterId, Session,
    SessionId,
};

/// Result of applying a payment status to an order.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub order: Order,
    /// Whether the ledger row actually moved.
    pub changed: bool,
    /// Whether this application is the one that made the order PAID.
    pub newly_paid: bool,
}

/// In-memory ledger. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct Ledger {
    orders: DashMap<OrderId, Order>,
    order_codes: DashMap<String, OrderId>,
    charges: DashMap<ChargeId, Charge>,
    charge_refs: DashMap<String, ChargeId>,
    sessions: DashMap<SessionId, Session>,
    routers: DashMap<RouterId, Router>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Orders ───────────────────────────────────────────────────────

    /// Insert a new order. External codes are unique; a collision is a
    /// checkout bug, not drift, and is rejected.
    pub fn insert_order(&self, order: Order) -> Result<(), CoreError> {
        match self.order_codes.entry(order.external_code.clone()) {
            Entry::Occupied(_) => Err(CoreError::DuplicateOrder {
                code: order.external_code,
            }),
            Entry::Vacant(slot) => {
                slot.insert(order.id);
                self.orders.insert(order.id, order);
                Ok(())
            }
        }
    }

    pub fn order(&self, id: OrderId) -> Option<Order> {
        self.orders.get(&id).map(|o| o.clone())
    }

    pub fn order_by_code(&self, code: &str) -> Option<Order> {
        let id = *self.order_codes.get(code)?;
        self.order(id)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.iter().map(|o| o.clone()).collect()
    }

    /// Apply a (webhook- or poll-sourced) payment status. Idempotent:
    /// re-applying the current status is a no-op, and a transition the
    /// status machine forbids (e.g. PAID regressing) is ignored with a
    /// warning rather than failed -- providers redeliver events freely.
    pub fn apply_payment_status(
        &self,
        code: &str,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<StatusChange, CoreError> {
        let id = *self
            .order_codes
            .get(code)
            .ok_or_else(|| CoreError::OrderNotFound {
                identifier: code.to_owned(),
            })?;
        let mut entry = self.orders.get_mut(&id).ok_or(CoreError::OrderNotFound {
            identifier: code.to_owned(),
        })?;

        if entry.status == status {
            return Ok(StatusChange {
                order: entry.clone(),
                changed: false,
                newly_paid: false,
            });
        }
        if !entry.status.accepts(status) {
            warn!(
                order = %entry.id,
                from = %entry.status,
                to = %status,
                "ignoring disallowed payment status transition"
            );
            return Ok(StatusChange {
                order: entry.clone(),
                changed: false,
                newly_paid: false,
            });
        }

        entry.status = status;
        entry.updated_at = now;
        let newly_paid = status == OrderStatus::Paid;
        if newly_paid {
            entry.paid_at = Some(now);
        }
        Ok(StatusChange {
            order: entry.clone(),
            changed: true,
            newly_paid,
        })
    }

    /// Sweep orders stuck in PENDING since before `cutoff` to EXPIRED.
    pub fn expire_pending_before(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<OrderId> {
        let mut expired = Vec::new();
        for mut entry in self.orders.iter_mut() {
            if entry.status == OrderStatus::Pending && entry.created_at < cutoff {
                entry.status = OrderStatus::Expired;
                entry.updated_at = now;
                expired.push(entry.id);
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired stale pending orders");
        }
        expired
    }

    /// Orders still waiting on the provider, created before `cutoff` --
    /// the slow-path poller's work list.
    pub fn orders_awaiting_payment(&self, cutoff: DateTime<Utc>) -> Vec<Order> {
        self.orders
            .iter()
            .filter(|o| o.status.awaits_payment() && o.created_at < cutoff)
            .map(|o| o.clone())
            .collect()
    }

    // ── Charges ──────────────────────────────────────────────────────

    /// Upsert a charge by provider identifier. The identifier is looked
    /// up, never assumed unique at creation: a second event for the same
    /// ref updates the existing row.
    pub fn upsert_charge(
        &self,
        provider_ref: &str,
        order_id: Option<OrderId>,
        status: &str,
        amount_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> Charge {
        if let Some(existing_id) = self.charge_refs.get(provider_ref).map(|e| *e) {
            if let Some(mut charge) = self.charges.get_mut(&existing_id) {
                charge.status = status.to_owned();
                charge.updated_at = now;
                if charge.order_id.is_none() {
                    charge.order_id = order_id;
                }
                if let Some(amount) = amount_cents {
                    charge.amount_cents = Some(amount);
                }
                return charge.clone();
            }
        }
        let charge = Charge {
            id: ChargeId::new(),
            provider_ref: provider_ref.to_owned(),
            order_id,
            status: status.to_owned(),
            amount_cents,
            created_at: now,
            updated_at: now,
        };
        self.charge_refs.insert(provider_ref.to_owned(), charge.id);
        self.charges.insert(charge.id, charge.clone());
        charge
    }

    pub fn charge_by_ref(&self, provider_ref: &str) -> Option<Charge> {
        let id = *self.charge_refs.get(provider_ref)?;
        self.charges.get(&id).map(|c| c.clone())
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Insert a new session, enforcing at most one active session per
    /// (router, IP).
    pub fn insert_session(&self, session: Session) -> Result<Session, CoreError> {
        if session.active {
            if let Some(existing) = self.active_session_for_ip(session.router_id, session.ip) {
                if existing.id != session.id {
                    return Err(CoreError::ActiveSessionExists {
                        router_id: session.router_id,
                        ip: session.ip,
                    });
                }
            }
        }
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Optimistic write: succeeds only if the caller's copy carries the
    /// version currently in the ledger. The stored version is bumped, so
    /// a concurrent writer holding the same snapshot loses and retries
    /// next cycle with fresh state.
    pub fn update_session(&self, updated: Session) -> Result<Session, CoreError> {
        let mut entry = self
            .sessions
            .get_mut(&updated.id)
            .ok_or(CoreError::SessionNotFound { id: updated.id })?;
        if entry.version != updated.version {
            return Err(CoreError::VersionConflict {
                id: updated.id,
                expected: updated.version,
                found: entry.version,
            });
        }
        let mut stored = updated;
        stored.version += 1;
        *entry = stored.clone();
        Ok(stored)
    }

    pub fn active_session_for_order(&self, order_id: OrderId) -> Option<Session> {
        self.sessions
            .iter()
            .find(|s| s.active && s.order_id == order_id)
            .map(|s| s.clone())
    }

    pub fn active_session_for_ip(&self, router_id: RouterId, ip: std::net::IpAddr) -> Option<Session> {
        self.sessions
            .iter()
            .find(|s| s.active && s.router_id == router_id && s.ip == ip)
            .map(|s| s.clone())
    }

    pub fn sessions_for_router(&self, router_id: RouterId) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.router_id == router_id)
            .map(|s| s.clone())
            .collect()
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| s.active)
            .map(|s| s.clone())
            .collect()
    }

    // ── Routers ──────────────────────────────────────────────────────

    pub fn upsert_router(&self, router: Router) {
        self.routers.insert(router.id, router);
    }

    pub fn router(&self, id: RouterId) -> Option<Router> {
        self.routers.get(&id).map(|r| r.clone())
    }

    pub fn routers(&self) -> Vec<Router> {
        self.routers.iter().map(|r| r.clone()).collect()
    }

    pub fn set_router_health(&self, id: RouterId, health: RouterHealth) {
        if let Some(mut router) = self.routers.get_mut(&id) {
            router.health = health;
        }
    }
}
