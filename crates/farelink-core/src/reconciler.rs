// ── Reconciliation scheduler ──
//
// One logical pipeline: Tick → Derive → Observe → Diff → Apply → Record.
// Routers reconcile fully in parallel; within one router, actions run
// sequentially so a Rekey's revoke lands before its grant. A per-router
// single-flight lock keeps a fast-path wake-up from overlapping the
// periodic tick on the same router.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use farelink_relay::RouterOp;

use crate::derive::{self, DesiredGrant};
use crate::drift::{self, Action};
use crate::error::CoreError;
use crate::fastpath::FastPath;
use crate::gateway::RelayGateway;
use crate::ledger::Ledger;
use crate::model::{GrantFault, OrderId, Router, RouterHealth, RouterId, Session, SessionId};
use crate::report::{ActionRecord, CycleReport, OrderingAlert, Outcome};

const WAKE_CHANNEL_SIZE: usize = 64;

/// A reconciliation trigger from outside the periodic tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    All,
    Router(RouterId),
}

/// Tuning for the control loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Fixed interval between full reconciliation passes.
    pub tick_interval: Duration,
    /// Outer deadline for one router's Observe+Diff+Apply slice. Work
    /// left when it passes is deferred to the next tick, never cut off
    /// mid-action.
    pub router_deadline: Duration,
    /// How long a session sits out of automatic retry after the router
    /// permanently rejected a command for it.
    pub error_cooldown: Duration,
    /// How long a PENDING order may wait before it expires.
    pub checkout_window: Duration,
    /// Address-list granting egress to paying clients.
    pub paid_list: String,
    /// Comment/tag stamped on entries this engine owns.
    pub bypass_tag: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            router_deadline: Duration::from_secs(45),
            error_cooldown: Duration::from_secs(900),
            checkout_window: Duration::from_secs(1800),
            paid_list: "paid_clients".into(),
            bypass_tag: "farelink".into(),
        }
    }
}

/// The reconciliation engine. Cheaply cloneable.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<ReconcilerInner>,
}

struct ReconcilerInner {
    ledger: Arc<Ledger>,
    gateway: Arc<dyn RelayGateway>,
    config: ReconcilerConfig,
    wake_tx: mpsc::Sender<Wake>,
    wake_rx: Mutex<Option<mpsc::Receiver<Wake>>>,
    locks: DashMap<RouterId, Arc<Mutex<()>>>,
    reports: DashMap<RouterId, Arc<CycleReport>>,
}

/// How one relay step failed.
enum StepFailure {
    /// Transport-level: the slice defers and the router is marked
    /// unreachable for this cycle.
    Transient(String),
    /// The router will never accept this command as issued.
    Permanent(String),
}

impl Reconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        gateway: Arc<dyn RelayGateway>,
        config: ReconcilerConfig,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_SIZE);
        Self {
            inner: Arc::new(ReconcilerInner {
                ledger,
                gateway,
                config,
                wake_tx,
                wake_rx: Mutex::new(Some(wake_rx)),
                locks: DashMap::new(),
                reports: DashMap::new(),
            }),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.inner.ledger
    }

    /// The webhook fast path feeding this reconciler.
    pub fn fast_path(&self) -> FastPath {
        FastPath::new(Arc::clone(&self.inner.ledger), self.inner.wake_tx.clone())
    }

    /// Last cycle report for one router.
    pub fn report(&self, router_id: RouterId) -> Option<Arc<CycleReport>> {
        self.inner.reports.get(&router_id).map(|r| Arc::clone(&r))
    }

    /// Last cycle reports for every router that has had one.
    pub fn reports(&self) -> Vec<Arc<CycleReport>> {
        self.inner
            .reports
            .iter()
            .map(|r| Arc::clone(&r))
            .collect()
    }

    // ── Control loop ─────────────────────────────────────────────────

    /// Run until cancelled: a full pass immediately, then every tick,
    /// plus targeted passes whenever the fast path wakes us.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut wake_rx) = self.inner.wake_rx.lock().await.take() else {
            warn!("reconciler loop already running");
            return;
        };
        let mut interval = tokio::time::interval(self.inner.config.tick_interval);

        info!(
            tick_secs = self.inner.config.tick_interval.as_secs(),
            "reconciler started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.reconcile_all().await;
                }
                wake = wake_rx.recv() => match wake {
                    Some(Wake::Router(id)) => self.reconcile_one(id).await,
                    Some(Wake::All) => self.reconcile_all().await,
                    None => break,
                },
            }
        }
        debug!("reconciler stopped");
    }

    /// One full pass over every registered router.
    pub async fn reconcile_all(&self) {
        let now = Utc::now();
        self.inner
            .ledger
            .expire_pending_before(now - self.checkout_window(), now);

        let mut desired = derive::desired_grants(&self.inner.ledger, now);
        let slices: Vec<_> = self
            .inner
            .ledger
            .routers()
            .into_iter()
            .map(|router| {
                let grants = desired.remove(&router.id).unwrap_or_default();
                self.reconcile_router(router, grants)
            })
            .collect();
        futures::future::join_all(slices).await;
    }

    /// One pass scoped to a single router (fast-path wake-up).
    pub async fn reconcile_one(&self, router_id: RouterId) {
        let Some(router) = self.inner.ledger.router(router_id) else {
            warn!(%router_id, "wake-up for unknown router");
            return;
        };
        let now = Utc::now();
        let grants = derive::desired_grants(&self.inner.ledger, now)
            .remove(&router_id)
            .unwrap_or_default();
        self.reconcile_router(router, grants).await;
    }

    // ── Per-router slice ─────────────────────────────────────────────

    async fn reconcile_router(&self, router: Router, desired: Vec<DesiredGrant>) {
        let inner = &self.inner;
        let lock = inner
            .locks
            .entry(router.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock() else {
            debug!(router = %router.name, "slice already in flight, skipping");
            return;
        };

        let started_at = Utc::now();
        let deadline = Instant::now() + inner.config.router_deadline;

        let observed = match inner.gateway.observe(&router).await {
            Ok(observed) => {
                inner
                    .ledger
                    .set_router_health(router.id, RouterHealth::reachable(Utc::now()));
                observed
            }
            Err(err) => {
                warn!(router = %router.name, %err, "router unreachable, deferring slice");
                self.record_router_failure(&router);
                inner.reports.insert(
                    router.id,
                    Arc::new(CycleReport::unreachable(router.id, &router.name, started_at)),
                );
                return;
            }
        };

        let actions = drift::diff(&desired, &observed, &inner.config.paid_list);
        if !actions.is_empty() {
            debug!(router = %router.name, actions = actions.len(), "drift detected");
        }

        let mut records = Vec::with_capacity(actions.len());
        let mut alerts = Vec::new();
        let mut aborted = false;

        for action in actions {
            if let Action::RepairOrdering {
                chain,
                position,
                rule,
            } = &action
            {
                warn!(
                    router = %router.name,
                    chain, position, rule,
                    "filter rule ordering starves paid clients; operator action required"
                );
                alerts.push(OrderingAlert {
                    chain: chain.clone(),
                    position: *position,
                    rule: rule.clone(),
                    detected_at: Utc::now(),
                });
                records.push(ActionRecord {
                    action,
                    outcome: Outcome::AlertRaised,
                });
                continue;
            }

            if aborted || Instant::now() >= deadline {
                let reason = if aborted {
                    "router marked unreachable mid-cycle"
                } else {
                    "router deadline exceeded"
                };
                records.push(ActionRecord {
                    action,
                    outcome: Outcome::Deferred {
                        reason: reason.into(),
                    },
                });
                continue;
            }

            let now = Utc::now();
            if let Some(session_id) = action.session_id() {
                if inner
                    .ledger
                    .session(session_id)
                    .is_some_and(|s| s.in_cooldown(now))
                {
                    records.push(ActionRecord {
                        action,
                        outcome: Outcome::Skipped {
                            reason: "cooling down after permanent error".into(),
                        },
                    });
                    continue;
                }
            }

            match self.apply_action(&router, &action, now).await {
                Ok(outcome) => {
                    debug!(router = %router.name, kind = action.kind_name(), ?outcome, "action finished");
                    records.push(ActionRecord { action, outcome });
                }
                Err(reason) => {
                    warn!(router = %router.name, kind = action.kind_name(), %reason, "transient failure, deferring rest of slice");
                    self.record_router_failure(&router);
                    records.push(ActionRecord {
                        action,
                        outcome: Outcome::Deferred { reason },
                    });
                    aborted = true;
                }
            }
        }

        let now = Utc::now();
        let cooled_down_sessions: Vec<SessionId> = inner
            .ledger
            .sessions_for_router(router.id)
            .into_iter()
            .filter(|s| s.in_cooldown(now))
            .map(|s| s.id)
            .collect();

        inner.reports.insert(
            router.id,
            Arc::new(CycleReport {
                router_id: router.id,
                router_name: router.name.clone(),
                started_at,
                finished_at: now,
                reachable: true,
                actions: records,
                alerts,
                cooled_down_sessions,
            }),
        );
    }

    // ── Applying one action ──────────────────────────────────────────

    /// Apply one corrective action: relay ops first, ledger recording
    /// second. `Err` carries a transient-failure reason that defers the
    /// rest of the slice; permanent failures are absorbed into the
    /// returned outcome with the session parked behind a cool-down.
    async fn apply_action(
        &self,
        router: &Router,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Result<Outcome, String> {
        let config = &self.inner.config;
        match action {
            Action::Grant {
                order_id,
                session_id,
                ip,
                mac,
                expires_at,
            } => {
                let ops = vec![
                    RouterOp::EnsureAddressListMember {
                        list: config.paid_list.clone(),
                        ip: *ip,
                        tag: config.bypass_tag.clone(),
                    },
                    RouterOp::EnsureIpBinding {
                        ip: *ip,
                        mac: mac.clone(),
                        tag: config.bypass_tag.clone(),
                    },
                ];
                match self.run_ops(router, ops).await {
                    Ok(()) => Ok(self.record_grant(*order_id, *session_id, *expires_at, now)),
                    Err(StepFailure::Transient(reason)) => Err(reason),
                    Err(StepFailure::Permanent(message)) => {
                        self.park_session(*order_id, *session_id, &message, now);
                        Ok(Outcome::Failed { message })
                    }
                }
            }

            Action::Renew {
                session_id,
                ip,
                mac,
                expires_at,
            } => {
                let ops = vec![
                    RouterOp::EnsureAddressListMember {
                        list: config.paid_list.clone(),
                        ip: *ip,
                        tag: config.bypass_tag.clone(),
                    },
                    RouterOp::EnsureIpBinding {
                        ip: *ip,
                        mac: mac.clone(),
                        tag: config.bypass_tag.clone(),
                    },
                ];
                match self.run_ops(router, ops).await {
                    Ok(()) => Ok(self.sync_applied_expiry(*session_id, *expires_at)),
                    Err(StepFailure::Transient(reason)) => Err(reason),
                    Err(StepFailure::Permanent(message)) => {
                        self.fault_session(*session_id, &message, now);
                        Ok(Outcome::Failed { message })
                    }
                }
            }

            Action::Revoke { session_id, ip } => {
                let ops = vec![
                    RouterOp::RemoveAddressListMember {
                        list: config.paid_list.clone(),
                        ip: *ip,
                    },
                    RouterOp::RemoveIpBinding { ip: *ip },
                ];
                match self.run_ops(router, ops).await {
                    Ok(()) => Ok(self.record_revoke(*session_id)),
                    Err(StepFailure::Transient(reason)) => Err(reason),
                    Err(StepFailure::Permanent(message)) => {
                        if let Some(session_id) = session_id {
                            self.fault_session(*session_id, &message, now);
                        }
                        Ok(Outcome::Failed { message })
                    }
                }
            }

            Action::Rekey {
                session_id,
                old_ip,
                new_ip,
                mac,
                expires_at,
                ..
            } => {
                if let Some(holder) = self
                    .inner
                    .ledger
                    .active_session_for_ip(router.id, *new_ip)
                {
                    if holder.id != *session_id {
                        return Ok(Outcome::Skipped {
                            reason: format!("target ip {new_ip} held by session {}", holder.id),
                        });
                    }
                }
                // Revoke must land before the grant: two live entries
                // for one MAC is the race this ordering exists to stop.
                let ops = vec![
                    RouterOp::RemoveAddressListMember {
                        list: config.paid_list.clone(),
                        ip: *old_ip,
                    },
                    RouterOp::RemoveIpBinding { ip: *old_ip },
                    RouterOp::EnsureAddressListMember {
                        list: config.paid_list.clone(),
                        ip: *new_ip,
                        tag: config.bypass_tag.clone(),
                    },
                    RouterOp::EnsureIpBinding {
                        ip: *new_ip,
                        mac: Some(mac.clone()),
                        tag: config.bypass_tag.clone(),
                    },
                ];
                match self.run_ops(router, ops).await {
                    Ok(()) => Ok(self.record_rekey(*session_id, *new_ip, *expires_at)),
                    Err(StepFailure::Transient(reason)) => Err(reason),
                    Err(StepFailure::Permanent(message)) => {
                        self.fault_session(*session_id, &message, now);
                        Ok(Outcome::Failed { message })
                    }
                }
            }

            Action::RepairOrdering { .. } => Ok(Outcome::AlertRaised),
        }
    }

    /// Run relay ops in order, stopping at the first failure.
    async fn run_ops(&self, router: &Router, ops: Vec<RouterOp>) -> Result<(), StepFailure> {
        for op in ops {
            match self.inner.gateway.execute(router, op).await {
                Ok(_) => {}
                Err(err) if err.is_idempotent_conflict() => {}
                Err(err) if err.is_transient() => {
                    return Err(StepFailure::Transient(err.to_string()));
                }
                Err(err) => return Err(StepFailure::Permanent(err.to_string())),
            }
        }
        Ok(())
    }

    // ── Recording ────────────────────────────────────────────────────

    fn record_grant(
        &self,
        order_id: OrderId,
        session_id: Option<SessionId>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let ledger = &self.inner.ledger;
        if let Some(session_id) = session_id {
            return self.sync_applied_expiry(session_id, expires_at);
        }

        let Some(order) = ledger.order(order_id) else {
            return Outcome::Skipped {
                reason: "order vanished from ledger".into(),
            };
        };
        let mut session = Session::for_order(&order, order.paid_at.unwrap_or(now));
        session.applied_expires_at = Some(session.expires_at);

        match ledger.insert_session(session) {
            Ok(_) => Outcome::Applied,
            Err(CoreError::ActiveSessionExists { router_id, ip }) => {
                // The IP is still claimed. An expired holdover gets
                // deactivated and the grant recorded; a live one keeps
                // the IP until its own revoke lands.
                let Some(holder) = ledger.active_session_for_ip(router_id, ip) else {
                    return Outcome::Skipped {
                        reason: format!("ip {ip} contested, retrying next tick"),
                    };
                };
                if holder.order_id == order_id {
                    return Outcome::Applied;
                }
                if !holder.is_expired(now) {
                    return Outcome::Skipped {
                        reason: format!("ip {ip} held by live session {}", holder.id),
                    };
                }
                let mut lapsed = holder;
                lapsed.active = false;
                lapsed.applied_expires_at = None;
                if let Err(err) = ledger.update_session(lapsed) {
                    return Outcome::Skipped {
                        reason: format!("could not release lapsed session: {err}"),
                    };
                }
                let mut retry = Session::for_order(&order, order.paid_at.unwrap_or(now));
                retry.applied_expires_at = Some(retry.expires_at);
                match ledger.insert_session(retry) {
                    Ok(_) => Outcome::Applied,
                    Err(err) => Outcome::Skipped {
                        reason: err.to_string(),
                    },
                }
            }
            Err(err) => Outcome::Skipped {
                reason: err.to_string(),
            },
        }
    }

    fn record_revoke(&self, session_id: Option<SessionId>) -> Outcome {
        let Some(session_id) = session_id else {
            return Outcome::Applied;
        };
        let Some(mut session) = self.inner.ledger.session(session_id) else {
            return Outcome::Applied;
        };
        session.active = false;
        session.applied_expires_at = None;
        match self.inner.ledger.update_session(session) {
            Ok(_) => Outcome::Applied,
            Err(err @ CoreError::VersionConflict { .. }) => Outcome::Skipped {
                reason: format!("{err}; retrying next tick"),
            },
            Err(err) => Outcome::Skipped {
                reason: err.to_string(),
            },
        }
    }

    fn record_rekey(
        &self,
        session_id: SessionId,
        new_ip: std::net::IpAddr,
        expires_at: DateTime<Utc>,
    ) -> Outcome {
        let Some(mut session) = self.inner.ledger.session(session_id) else {
            return Outcome::Skipped {
                reason: "session vanished from ledger".into(),
            };
        };
        session.ip = new_ip;
        session.applied_expires_at = Some(expires_at);
        session.last_error = None;
        match self.inner.ledger.update_session(session) {
            Ok(_) => Outcome::Applied,
            Err(err @ CoreError::VersionConflict { .. }) => Outcome::Skipped {
                reason: format!("{err}; retrying next tick"),
            },
            Err(err) => Outcome::Skipped {
                reason: err.to_string(),
            },
        }
    }

    fn sync_applied_expiry(&self, session_id: SessionId, expires_at: DateTime<Utc>) -> Outcome {
        let Some(mut session) = self.inner.ledger.session(session_id) else {
            return Outcome::Skipped {
                reason: "session vanished from ledger".into(),
            };
        };
        session.applied_expires_at = Some(expires_at);
        session.last_error = None;
        match self.inner.ledger.update_session(session) {
            Ok(_) => Outcome::Applied,
            Err(err @ CoreError::VersionConflict { .. }) => Outcome::Skipped {
                reason: format!("{err}; retrying next tick"),
            },
            Err(err) => Outcome::Skipped {
                reason: err.to_string(),
            },
        }
    }

    /// Park an existing session behind the cool-down after a permanent
    /// relay failure.
    fn fault_session(&self, session_id: SessionId, message: &str, now: DateTime<Utc>) {
        let Some(mut session) = self.inner.ledger.session(session_id) else {
            return;
        };
        session.last_error = Some(GrantFault {
            message: message.to_owned(),
            at: now,
            retry_after: now + self.cooldown(),
        });
        if let Err(err) = self.inner.ledger.update_session(session) {
            debug!(%err, "fault bookkeeping lost to a concurrent write");
        }
    }

    /// A permanently-failed grant with no session yet still needs a row
    /// to carry the fault, or the loop would re-issue the doomed command
    /// every tick.
    fn park_session(
        &self,
        order_id: OrderId,
        session_id: Option<SessionId>,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(session_id) = session_id {
            self.fault_session(session_id, message, now);
            return;
        }
        let Some(order) = self.inner.ledger.order(order_id) else {
            return;
        };
        let mut session = Session::for_order(&order, order.paid_at.unwrap_or(now));
        session.last_error = Some(GrantFault {
            message: message.to_owned(),
            at: now,
            retry_after: now + self.cooldown(),
        });
        if let Err(err) = self.inner.ledger.insert_session(session) {
            debug!(%err, "could not park failed grant");
        }
    }

    fn record_router_failure(&self, router: &Router) {
        let now = Utc::now();
        let health = self
            .inner
            .ledger
            .router(router.id)
            .map_or_else(
                || RouterHealth::Unknown.after_failure(now),
                |r| r.health.after_failure(now),
            );
        self.inner.ledger.set_router_health(router.id, health);
    }

    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.config.error_cooldown)
            .unwrap_or_else(|_| chrono::Duration::minutes(15))
    }

    fn checkout_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.config.checkout_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(30))
    }
}
