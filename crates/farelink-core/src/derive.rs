// ── Desired-state deriver ──
//
// Pure function over the ledger: which grants *should* each router hold
// right now. Revocation is explicit -- router state is additive, so an
// order that stopped deserving access yields a Revoked entry, never
// mere absence.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};

use farelink_relay::MacAddress;

use crate::ledger::Ledger;
use crate::model::{OrderId, OrderStatus, RouterId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredKind {
    Active,
    Revoked,
}

/// One grant a router should (or should no longer) hold.
#[derive(Debug, Clone)]
pub struct DesiredGrant {
    pub order_id: OrderId,
    /// The live session backing this grant, when one exists.
    pub session_id: Option<SessionId>,
    pub ip: IpAddr,
    pub mac: Option<MacAddress>,
    pub expires_at: DateTime<Utc>,
    /// Expiry last confirmed on the router (session bookkeeping).
    pub applied_expires_at: Option<DateTime<Utc>>,
    pub kind: DesiredKind,
}

/// Compute the desired grants per router.
///
/// - PAID order with a live session: active, preserving the session's
///   expiry (renewals extend it elsewhere; derivation never shortens it).
/// - PAID order with no session yet: active from `paid_at + plan`.
/// - Orders FAILED/CANCELED/EXPIRED, or sessions past expiry: revoked.
///
/// When an IP carries both an active and a revoked desire (a fresh
/// order reusing an IP whose previous session just lapsed), active wins
/// -- revoking would tear down the entry the new grant needs.
pub fn desired_grants(ledger: &Ledger, now: DateTime<Utc>) -> HashMap<RouterId, Vec<DesiredGrant>> {
    let mut per_router: HashMap<RouterId, Vec<DesiredGrant>> = HashMap::new();
    let mut claimed_sessions: HashSet<SessionId> = HashSet::new();

    for order in ledger.orders() {
        let session = ledger.active_session_for_order(order.id);
        if let Some(ref s) = session {
            claimed_sessions.insert(s.id);
        }

        let grant = match order.status {
            OrderStatus::Paid => match session {
                Some(s) if !s.is_expired(now) => DesiredGrant {
                    order_id: order.id,
                    session_id: Some(s.id),
                    ip: s.ip,
                    mac: s.mac.clone().or_else(|| order.client_mac.clone()),
                    expires_at: s.expires_at,
                    applied_expires_at: s.applied_expires_at,
                    kind: DesiredKind::Active,
                },
                Some(s) => DesiredGrant {
                    order_id: order.id,
                    session_id: Some(s.id),
                    ip: s.ip,
                    mac: s.mac.clone(),
                    expires_at: s.expires_at,
                    applied_expires_at: s.applied_expires_at,
                    kind: DesiredKind::Revoked,
                },
                None => {
                    let paid_at = order.paid_at.unwrap_or(order.updated_at);
                    let expires_at = paid_at + order.plan.duration();
                    if expires_at <= now {
                        // Paid window elapsed before access was ever
                        // granted (router down the whole time). Nothing
                        // to grant, nothing on the router to revoke.
                        continue;
                    }
                    DesiredGrant {
                        order_id: order.id,
                        session_id: None,
                        ip: order.client_ip,
                        mac: order.client_mac.clone(),
                        expires_at,
                        applied_expires_at: None,
                        kind: DesiredKind::Active,
                    }
                }
            },
            OrderStatus::Failed | OrderStatus::Canceled | OrderStatus::Expired => match session {
                Some(s) => DesiredGrant {
                    order_id: order.id,
                    session_id: Some(s.id),
                    ip: s.ip,
                    mac: s.mac.clone(),
                    expires_at: s.expires_at,
                    applied_expires_at: s.applied_expires_at,
                    kind: DesiredKind::Revoked,
                },
                None => continue,
            },
            OrderStatus::Pending | OrderStatus::Authorized => continue,
        };

        per_router.entry(order.router_id).or_default().push(grant);
    }

    // Stray active sessions no Paid order claims (order rows are never
    // deleted, so this only catches ledger corruption) are revoked too.
    for s in ledger.active_sessions() {
        if !claimed_sessions.contains(&s.id) {
            per_router
                .entry(s.router_id)
                .or_default()
                .push(DesiredGrant {
                    order_id: s.order_id,
                    session_id: Some(s.id),
                    ip: s.ip,
                    mac: s.mac.clone(),
                    expires_at: s.expires_at,
                    applied_expires_at: s.applied_expires_at,
                    kind: DesiredKind::Revoked,
                });
        }
    }

    for grants in per_router.values_mut() {
        resolve_ip_conflicts(grants);
        grants.sort_by_key(|g| (g.ip, g.kind == DesiredKind::Revoked));
    }
    per_router
}

/// Active desires win over revoked ones for the same IP; among several
/// active desires for one IP, the latest expiry wins (the others will
/// claim the IP once it frees up).
fn resolve_ip_conflicts(grants: &mut Vec<DesiredGrant>) {
    let active_ips: HashMap<IpAddr, DateTime<Utc>> = grants
        .iter()
        .filter(|g| g.kind == DesiredKind::Active)
        .fold(HashMap::new(), |mut acc, g| {
            let best = acc.entry(g.ip).or_insert(g.expires_at);
            if g.expires_at > *best {
                *best = g.expires_at;
            }
            acc
        });

    grants.retain(|g| match g.kind {
        DesiredKind::Active => active_ips.get(&g.ip) == Some(&g.expires_at),
        DesiredKind::Revoked => !active_ips.contains_key(&g.ip),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, Plan, Session};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn paid_order(ledger: &Ledger, code: &str, router_id: RouterId, now: DateTime<Utc>) -> Order {
        let order = Order::new(
            code,
            990,
            Plan::new("2h", 120),
            "10.0.0.5".parse().unwrap(),
            None,
            router_id,
            now,
        );
        ledger.insert_order(order).unwrap();
        ledger
            .apply_payment_status(code, OrderStatus::Paid, now)
            .unwrap()
            .order
    }

    #[test]
    fn paid_order_without_session_derives_active_grant() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let router_id = RouterId::new();
        let order = paid_order(&ledger, "ord-1", router_id, now);

        let desired = desired_grants(&ledger, now);
        let grants = &desired[&router_id];
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].kind, DesiredKind::Active);
        assert_eq!(grants[0].ip, order.client_ip);
        assert_eq!(grants[0].session_id, None);
        assert_eq!(grants[0].expires_at, now + Duration::minutes(120));
    }

    #[test]
    fn live_session_expiry_is_preserved() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let router_id = RouterId::new();
        let order = paid_order(&ledger, "ord-1", router_id, now);

        let mut session = Session::for_order(&order, now);
        session.expires_at = now + Duration::minutes(45); // manually shortened
        ledger.insert_session(session.clone()).unwrap();

        let desired = desired_grants(&ledger, now);
        let grants = &desired[&router_id];
        assert_eq!(grants[0].session_id, Some(session.id));
        assert_eq!(grants[0].expires_at, now + Duration::minutes(45));
    }

    #[test]
    fn expired_session_derives_explicit_revoke() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let router_id = RouterId::new();
        let order = paid_order(&ledger, "ord-1", router_id, now - Duration::hours(3));

        let session = Session::for_order(&order, now - Duration::hours(3));
        ledger.insert_session(session.clone()).unwrap();

        let desired = desired_grants(&ledger, now);
        let grants = &desired[&router_id];
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].kind, DesiredKind::Revoked);
        assert_eq!(grants[0].session_id, Some(session.id));
    }

    #[test]
    fn canceled_order_with_session_derives_revoke() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let router_id = RouterId::new();
        let order = Order::new(
            "ord-1",
            990,
            Plan::new("2h", 120),
            "10.0.0.5".parse().unwrap(),
            None,
            router_id,
            now,
        );
        ledger.insert_order(order.clone()).unwrap();
        ledger.insert_session(Session::for_order(&order, now)).unwrap();
        ledger
            .apply_payment_status("ord-1", OrderStatus::Canceled, now)
            .unwrap();

        let desired = desired_grants(&ledger, now);
        assert_eq!(desired[&router_id][0].kind, DesiredKind::Revoked);
    }

    #[test]
    fn paid_window_elapsed_before_any_grant_yields_nothing() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let router_id = RouterId::new();
        paid_order(&ledger, "ord-1", router_id, now - Duration::hours(5));

        let desired = desired_grants(&ledger, now);
        assert!(desired.is_empty());
    }

    #[test]
    fn active_desire_wins_ip_conflict() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let router_id = RouterId::new();

        // Old order's session expired on 10.0.0.5 ...
        let old = paid_order(&ledger, "ord-old", router_id, now - Duration::hours(3));
        ledger
            .insert_session(Session::for_order(&old, now - Duration::hours(3)))
            .unwrap();
        // ... and a fresh paid order reuses the same IP.
        paid_order(&ledger, "ord-new", router_id, now);

        let desired = desired_grants(&ledger, now);
        let grants = &desired[&router_id];
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].kind, DesiredKind::Active);
        assert_eq!(grants[0].session_id, None);
    }

    #[test]
    fn pending_orders_derive_nothing() {
        let ledger = Ledger::new();
        let now = Utc::now();
        let order = Order::new(
            "ord-1",
            990,
            Plan::new("2h", 120),
            "10.0.0.5".parse().unwrap(),
            None,
            RouterId::new(),
            now,
        );
        ledger.insert_order(order).unwrap();
        assert!(desired_grants(&ledger, now).is_empty());
    }
}
