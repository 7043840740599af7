// End-to-end reconciliation tests against an in-process fake relay.
//
// The fake models each router's additive state (address-list, bindings,
// hotspot sessions) and can be made unreachable or made to permanently
// reject commands for chosen IPs.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use farelink_core::{
    Action, Ledger, Order, OrderStatus, Outcome, Plan, Reconciler, ReconcilerConfig, RelayGateway,
    Router, RouterHealth, Session,
};
use farelink_relay::{
    Binding, BindingKind, MacAddress, ObservedState, RelayError, RouterOp, StaleFacets,
};

const LIST: &str = "paid_clients";

// ── Fake relay ──────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRouterState {
    paid_list: HashSet<IpAddr>,
    bindings: HashMap<IpAddr, Option<MacAddress>>,
    active_sessions: HashSet<IpAddr>,
}

#[derive(Default)]
struct FakeRelay {
    routers: Mutex<HashMap<String, FakeRouterState>>,
    unreachable: Mutex<HashSet<String>>,
    reject_ips: Mutex<HashSet<IpAddr>>,
    stale: Mutex<StaleFacets>,
    op_log: Mutex<Vec<RouterOp>>,
}

impl FakeRelay {
    fn set_unreachable(&self, address: &str, down: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if down {
            unreachable.insert(address.to_owned());
        } else {
            unreachable.remove(address);
        }
    }

    fn reject_ip(&self, ip: IpAddr) {
        self.reject_ips.lock().unwrap().insert(ip);
    }

    fn seed(&self, address: &str, f: impl FnOnce(&mut FakeRouterState)) {
        let mut routers = self.routers.lock().unwrap();
        f(routers.entry(address.to_owned()).or_default());
    }

    fn state<T>(&self, address: &str, f: impl FnOnce(&FakeRouterState) -> T) -> T {
        let mut routers = self.routers.lock().unwrap();
        f(routers.entry(address.to_owned()).or_default())
    }

    fn mutation_ops(&self) -> Vec<RouterOp> {
        self.op_log.lock().unwrap().clone()
    }

    fn clear_log(&self) {
        self.op_log.lock().unwrap().clear();
    }
}

#[async_trait]
impl RelayGateway for FakeRelay {
    async fn execute(&self, router: &Router, op: RouterOp) -> Result<Value, RelayError> {
        if self.unreachable.lock().unwrap().contains(&router.address) {
            return Err(RelayError::RouterUnreachable {
                message: "fake outage".into(),
            });
        }
        self.op_log.lock().unwrap().push(op.clone());

        let mut routers = self.routers.lock().unwrap();
        let state = routers.entry(router.address.clone()).or_default();
        match op {
            RouterOp::EnsureAddressListMember { ip, .. } => {
                if self.reject_ips.lock().unwrap().contains(&ip) {
                    return Err(RelayError::Rejected {
                        op: "ensure-address-list-member".into(),
                        message: "invalid address".into(),
                    });
                }
                state.paid_list.insert(ip);
                Ok(json!(null))
            }
            RouterOp::RemoveAddressListMember { ip, .. } => {
                state.paid_list.remove(&ip);
                Ok(json!(null))
            }
            RouterOp::EnsureIpBinding { ip, mac, .. } => {
                if self.reject_ips.lock().unwrap().contains(&ip) {
                    return Err(RelayError::Rejected {
                        op: "ensure-ip-binding".into(),
                        message: "invalid address".into(),
                    });
                }
                state.bindings.insert(ip, mac);
                Ok(json!(null))
            }
            RouterOp::RemoveIpBinding { ip } => {
                state.bindings.remove(&ip);
                Ok(json!(null))
            }
            _ => Ok(json!([])),
        }
    }

    async fn observe(&self, router: &Router) -> Result<ObservedState, RelayError> {
        if self.unreachable.lock().unwrap().contains(&router.address) {
            return Err(RelayError::RouterUnreachable {
                message: "fake outage".into(),
            });
        }
        let mut routers = self.routers.lock().unwrap();
        let state = routers.entry(router.address.clone()).or_default();

        let mut observed = ObservedState::default();
        observed
            .address_lists
            .insert(LIST.to_owned(), state.paid_list.clone());
        observed.bindings = state
            .bindings
            .iter()
            .map(|(ip, mac)| {
                (
                    *ip,
                    Binding {
                        mac: mac.clone(),
                        kind: BindingKind::Bypassed,
                    },
                )
            })
            .collect();
        observed.active_sessions = state.active_sessions.clone();
        observed.stale = *self.stale.lock().unwrap();
        if observed.stale.address_list {
            observed.address_lists.clear();
        }
        if observed.stale.ip_bindings {
            observed.bindings.clear();
        }
        Ok(observed)
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Harness {
    reconciler: Reconciler,
    relay: Arc<FakeRelay>,
    ledger: Arc<Ledger>,
    router: Router,
}

fn harness() -> Harness {
    let ledger = Arc::new(Ledger::new());
    let relay = Arc::new(FakeRelay::default());
    let router = Router::new(
        "bus-17",
        "10.8.0.12:8728",
        "reconciler",
        secrecy::SecretString::from("hunter2".to_string()),
    );
    ledger.upsert_router(router.clone());

    let reconciler = Reconciler::new(
        Arc::clone(&ledger),
        Arc::clone(&relay) as Arc<dyn RelayGateway>,
        ReconcilerConfig::default(),
    );
    Harness {
        reconciler,
        relay,
        ledger,
        router,
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

impl Harness {
    fn paid_order(&self, code: &str, ip_s: &str, mac: Option<&str>) -> Order {
        let order = Order::new(
            code,
            990,
            Plan::new("2h", 120),
            ip(ip_s),
            mac.map(|m| m.parse().unwrap()),
            self.router.id,
            Utc::now(),
        );
        self.ledger.insert_order(order).unwrap();
        self.ledger
            .apply_payment_status(code, OrderStatus::Paid, Utc::now())
            .unwrap()
            .order
    }

    fn granted(&self, ip_s: &str) -> bool {
        self.relay.state(&self.router.address, |s| {
            s.paid_list.contains(&ip(ip_s)) && s.bindings.contains_key(&ip(ip_s))
        })
    }
}

// ── Scenario A: PAID order converges to a grant ─────────────────────

#[tokio::test]
async fn paid_order_converges_to_grant_with_plan_expiry() {
    let h = harness();
    let before = Utc::now();
    let order = h.paid_order("ord-1", "10.0.0.5", None);

    h.reconciler.reconcile_all().await;

    assert!(h.granted("10.0.0.5"));
    let session = h.ledger.active_session_for_order(order.id).expect("session created");
    let paid_at = h.ledger.order(order.id).unwrap().paid_at.unwrap();
    assert_eq!(session.expires_at, paid_at + Duration::minutes(120));
    assert!(session.started_at >= before);

    let report = h.reconciler.report(h.router.id).expect("report stored");
    assert!(report.reachable);
    assert!(matches!(
        report.actions.as_slice(),
        [r] if matches!(r.action, Action::Grant { .. }) && r.outcome == Outcome::Applied
    ));
}

// ── Idempotence ─────────────────────────────────────────────────────

#[tokio::test]
async fn second_pass_over_converged_state_is_quiet() {
    let h = harness();
    h.paid_order("ord-1", "10.0.0.5", None);

    h.reconciler.reconcile_all().await;
    h.relay.clear_log();
    h.reconciler.reconcile_all().await;

    assert!(h.relay.mutation_ops().is_empty(), "no drift, no commands");
    let report = h.reconciler.report(h.router.id).unwrap();
    assert!(report.actions.is_empty());
    assert!(h.granted("10.0.0.5"));
}

// ── Scenario B: expiry revokes ──────────────────────────────────────

#[tokio::test]
async fn expired_session_is_revoked_and_deactivated() {
    let h = harness();
    let order = h.paid_order("ord-1", "10.0.0.5", None);

    h.reconciler.reconcile_all().await;
    assert!(h.granted("10.0.0.5"));

    // Force the session past its expiry.
    let mut session = h.ledger.active_session_for_order(order.id).unwrap();
    session.expires_at = Utc::now() - Duration::seconds(1);
    let session = h.ledger.update_session(session).unwrap();

    h.reconciler.reconcile_all().await;

    assert!(!h.granted("10.0.0.5"));
    let session = h.ledger.session(session.id).unwrap();
    assert!(!session.active);

    let report = h.reconciler.report(h.router.id).unwrap();
    assert!(matches!(
        report.actions.as_slice(),
        [r] if matches!(r.action, Action::Revoke { .. }) && r.outcome == Outcome::Applied
    ));
}

#[tokio::test]
async fn bookkeeping_revoke_when_router_is_already_clean() {
    let h = harness();
    let order = h.paid_order("ord-1", "10.0.0.5", None);

    // Session exists and has lapsed, but nothing was ever granted on
    // the router (it was down for the whole window).
    let mut session = Session::for_order(&order, Utc::now() - Duration::hours(3));
    session.expires_at = Utc::now() - Duration::hours(1);
    let session = h.ledger.insert_session(session).unwrap();

    h.reconciler.reconcile_all().await;

    assert!(!h.ledger.session(session.id).unwrap().active);
}

// ── Scenario C: outage then recovery ────────────────────────────────

#[tokio::test]
async fn outage_defers_without_corrupting_sessions() {
    let h = harness();
    let order = h.paid_order("ord-1", "10.0.0.5", None);

    h.reconciler.reconcile_all().await;
    let session_before = h.ledger.active_session_for_order(order.id).unwrap();

    h.relay.set_unreachable(&h.router.address, true);
    for _ in 0..3 {
        h.reconciler.reconcile_all().await;
    }

    // The outage must not revoke or expire anything in the ledger.
    let session_during = h.ledger.session(session_before.id).unwrap();
    assert!(session_during.active);
    assert_eq!(session_during.expires_at, session_before.expires_at);

    let router = h.ledger.router(h.router.id).unwrap();
    match router.health {
        RouterHealth::Unreachable {
            consecutive_failures,
            ..
        } => assert_eq!(consecutive_failures, 3),
        other => panic!("expected unreachable health, got {other:?}"),
    }
    assert!(!h.reconciler.report(h.router.id).unwrap().reachable);

    // Recovery: the very next pass converges.
    h.relay.set_unreachable(&h.router.address, false);
    h.reconciler.reconcile_all().await;

    assert!(h.granted("10.0.0.5"));
    assert!(h.ledger.router(h.router.id).unwrap().health.is_reachable());
}

#[tokio::test]
async fn paid_during_outage_granted_on_recovery() {
    let h = harness();
    h.relay.set_unreachable(&h.router.address, true);
    h.paid_order("ord-1", "10.0.0.5", None);

    h.reconciler.reconcile_all().await;
    assert!(!h.granted("10.0.0.5"));

    h.relay.set_unreachable(&h.router.address, false);
    h.reconciler.reconcile_all().await;
    assert!(h.granted("10.0.0.5"));
}

// ── Scenario D: DHCP re-key ─────────────────────────────────────────

#[tokio::test]
async fn dhcp_churn_rekeys_same_session() {
    let h = harness();
    let order = h.paid_order("ord-1", "10.0.0.5", Some("AA:BB:CC:DD:EE:FF"));

    h.reconciler.reconcile_all().await;
    let session = h.ledger.active_session_for_order(order.id).unwrap();
    assert_eq!(session.ip, ip("10.0.0.5"));

    // DHCP hands the client 10.0.0.9; the router re-binds the MAC.
    h.relay.seed(&h.router.address, |s| {
        s.bindings.remove(&ip("10.0.0.5"));
        s.bindings
            .insert(ip("10.0.0.9"), Some("AA:BB:CC:DD:EE:FF".parse().unwrap()));
    });
    h.relay.clear_log();

    h.reconciler.reconcile_all().await;

    // Same session row, new IP, order linkage intact.
    let rekeyed = h.ledger.session(session.id).unwrap();
    assert_eq!(rekeyed.ip, ip("10.0.0.9"));
    assert_eq!(rekeyed.order_id, order.id);
    assert!(rekeyed.active);
    assert_eq!(
        h.ledger.active_session_for_order(order.id).unwrap().id,
        session.id,
        "no duplicate session for the order"
    );

    assert!(!h.granted("10.0.0.5"));
    assert!(h.granted("10.0.0.9"));

    // Revoke ops for the old IP must precede grant ops for the new one.
    let ops = h.relay.mutation_ops();
    let first_remove = ops
        .iter()
        .position(|op| matches!(op, RouterOp::RemoveAddressListMember { ip: i, .. } if *i == ip("10.0.0.5")))
        .expect("old ip removed");
    let first_ensure = ops
        .iter()
        .position(|op| matches!(op, RouterOp::EnsureAddressListMember { ip: i, .. } if *i == ip("10.0.0.9")))
        .expect("new ip ensured");
    assert!(first_remove < first_ensure, "revoke-before-grant ordering");
}

// ── No double grant ─────────────────────────────────────────────────

#[tokio::test]
async fn at_most_one_active_session_per_ip() {
    let h = harness();
    h.paid_order("ord-1", "10.0.0.5", None);
    h.paid_order("ord-2", "10.0.0.5", None);

    h.reconciler.reconcile_all().await;
    h.reconciler.reconcile_all().await;

    let active: Vec<Session> = h
        .ledger
        .sessions_for_router(h.router.id)
        .into_iter()
        .filter(|s| s.active)
        .collect();
    assert_eq!(active.len(), 1, "exactly one active session for the ip");
}

// ── Permanent errors park the session ───────────────────────────────

#[tokio::test]
async fn permanent_rejection_cools_down_instead_of_hot_looping() {
    let h = harness();
    let order = h.paid_order("ord-1", "10.0.0.5", None);
    h.relay.reject_ip(ip("10.0.0.5"));

    h.reconciler.reconcile_all().await;

    let report = h.reconciler.report(h.router.id).unwrap();
    assert!(matches!(
        report.actions.as_slice(),
        [r] if matches!(r.outcome, Outcome::Failed { .. })
    ));

    // A session row carries the fault and the cool-down.
    let session = h.ledger.active_session_for_order(order.id).unwrap();
    let fault = session.last_error.clone().expect("fault recorded");
    assert!(fault.retry_after > Utc::now());
    assert!(session.in_cooldown(Utc::now()));

    // The next pass does not re-issue the doomed command.
    h.relay.clear_log();
    h.reconciler.reconcile_all().await;
    assert!(h.relay.mutation_ops().is_empty());

    let report = h.reconciler.report(h.router.id).unwrap();
    assert!(matches!(
        report.actions.as_slice(),
        [r] if matches!(r.outcome, Outcome::Skipped { .. })
    ));
    assert_eq!(report.cooled_down_sessions, vec![session.id]);
}

// ── Stale facets suppress blind corrections ─────────────────────────

#[tokio::test]
async fn fully_stale_observation_takes_no_action() {
    let h = harness();
    h.paid_order("ord-1", "10.0.0.5", None);
    {
        let mut stale = h.relay.stale.lock().unwrap();
        stale.address_list = true;
        stale.ip_bindings = true;
    }

    h.reconciler.reconcile_all().await;

    assert!(h.relay.mutation_ops().is_empty());
    let report = h.reconciler.report(h.router.id).unwrap();
    assert!(report.reachable);
    assert!(report.actions.is_empty());
}

// ── Fast path wake-up end to end ────────────────────────────────────

#[tokio::test]
async fn fast_path_event_grants_without_waiting_for_tick() {
    let h = harness();
    let order = Order::new(
        "ord-1",
        990,
        Plan::new("2h", 120),
        ip("10.0.0.5"),
        None,
        h.router.id,
        Utc::now(),
    );
    h.ledger.insert_order(order).unwrap();

    let fast_path = h.reconciler.fast_path();
    let outcome = fast_path
        .ingest(&farelink_core::PaymentEvent {
            order_external_id: "ord-1".into(),
            status: OrderStatus::Paid,
            charge_ref: None,
            amount_cents: None,
        })
        .unwrap();
    assert_eq!(
        outcome,
        farelink_core::IngestOutcome::Applied { newly_paid: true }
    );

    // The wake-up targets exactly this router; drive the scoped pass.
    h.reconciler.reconcile_one(h.router.id).await;
    assert!(h.granted("10.0.0.5"));
}
