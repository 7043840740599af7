// ── Drift detector ──
//
// Diffs desired grants against one router's observed state and emits
// corrective actions. Ordering only matters inside Rekey (revoke before
// grant); everything else is independent. Corrections that depend on a
// facet whose read failed are skipped for the cycle rather than issued
// against incomplete information.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use farelink_relay::{MacAddress, ObservedState, RuleAction};

use crate::derive::{DesiredGrant, DesiredKind};
use crate::model::{OrderId, SessionId};

/// One corrective step for one router.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Desired active, not observed: open access.
    Grant {
        order_id: OrderId,
        session_id: Option<SessionId>,
        ip: IpAddr,
        mac: Option<MacAddress>,
        expires_at: DateTime<Utc>,
    },
    /// Desired active and observed, but the ledger's expiry moved since
    /// the last confirmed push. Re-issues the (idempotent) ensure ops
    /// and syncs bookkeeping.
    Renew {
        session_id: SessionId,
        ip: IpAddr,
        mac: Option<MacAddress>,
        expires_at: DateTime<Utc>,
    },
    /// Desired revoked: close access and deactivate the session.
    Revoke {
        session_id: Option<SessionId>,
        ip: IpAddr,
    },
    /// The client's MAC now sits on a different IP (DHCP churn). Revoke
    /// the old IP, grant the new one, move the session's IP in place.
    Rekey {
        session_id: SessionId,
        order_id: OrderId,
        old_ip: IpAddr,
        new_ip: IpAddr,
        mac: MacAddress,
        expires_at: DateTime<Utc>,
    },
    /// A drop/reject rule without a paid-clients exclusion precedes the
    /// paid-clients accept rule. Reported only, never auto-applied:
    /// firewall reordering has a blast radius no missed grant comes
    /// close to.
    RepairOrdering {
        chain: String,
        position: usize,
        rule: String,
    },
}

impl Action {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Grant { .. } => "grant",
            Self::Renew { .. } => "renew",
            Self::Revoke { .. } => "revoke",
            Self::Rekey { .. } => "rekey",
            Self::RepairOrdering { .. } => "repair-ordering",
        }
    }

    /// The session this action touches, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Grant { session_id, .. } | Self::Revoke { session_id, .. } => *session_id,
            Self::Renew { session_id, .. } | Self::Rekey { session_id, .. } => Some(*session_id),
            Self::RepairOrdering { .. } => None,
        }
    }
}

/// Diff one router's desired grants against its observed state.
pub fn diff(desired: &[DesiredGrant], observed: &ObservedState, paid_list: &str) -> Vec<Action> {
    let membership_fresh = !observed.stale.address_list;
    let bindings_fresh = !observed.stale.ip_bindings;

    let mut rekeys = Vec::new();
    let mut revokes = Vec::new();
    let mut grants = Vec::new();
    let mut renews = Vec::new();

    for d in desired {
        match d.kind {
            DesiredKind::Active => {
                // DHCP churn check first: the MAC is authoritative for
                // identity, the IP only keys router state.
                if let (Some(session_id), Some(mac)) = (d.session_id, d.mac.as_ref()) {
                    if bindings_fresh {
                        if let Some(bound_ip) = observed.bound_ip_for_mac(mac) {
                            if bound_ip != d.ip {
                                rekeys.push(Action::Rekey {
                                    session_id,
                                    order_id: d.order_id,
                                    old_ip: d.ip,
                                    new_ip: bound_ip,
                                    mac: mac.clone(),
                                    expires_at: d.expires_at,
                                });
                                continue;
                            }
                        }
                    }
                }

                if !membership_fresh && !bindings_fresh {
                    // Grant state unobservable this cycle.
                    continue;
                }
                let missing_membership = membership_fresh && !observed.is_member(paid_list, d.ip);
                let missing_binding = bindings_fresh && !observed.bindings.contains_key(&d.ip);

                if missing_membership || missing_binding {
                    grants.push(Action::Grant {
                        order_id: d.order_id,
                        session_id: d.session_id,
                        ip: d.ip,
                        mac: d.mac.clone(),
                        expires_at: d.expires_at,
                    });
                } else if let Some(session_id) = d.session_id {
                    if d.applied_expires_at != Some(d.expires_at) {
                        renews.push(Action::Renew {
                            session_id,
                            ip: d.ip,
                            mac: d.mac.clone(),
                            expires_at: d.expires_at,
                        });
                    }
                } else {
                    // Observed granted but no session recorded: issue a
                    // Grant to establish bookkeeping. The ensure ops are
                    // no-ops on the router.
                    grants.push(Action::Grant {
                        order_id: d.order_id,
                        session_id: None,
                        ip: d.ip,
                        mac: d.mac.clone(),
                        expires_at: d.expires_at,
                    });
                }
            }
            DesiredKind::Revoked => {
                if membership_fresh || bindings_fresh {
                    revokes.push(Action::Revoke {
                        session_id: d.session_id,
                        ip: d.ip,
                    });
                }
            }
        }
    }

    let mut actions = rekeys;
    actions.append(&mut revokes);
    actions.append(&mut grants);
    actions.append(&mut renews);
    actions.extend(detect_misordering(observed, paid_list));
    actions
}

/// Scan the filter chain for drop/reject rules that would starve paid
/// clients: any enabled drop/reject without a negated paid-list match
/// that evaluates before the paid-list accept rule.
fn detect_misordering(observed: &ObservedState, paid_list: &str) -> Vec<Action> {
    if observed.stale.filter_rules {
        return Vec::new();
    }

    let accept_position = observed.filter_rules.iter().position(|r| {
        !r.disabled
            && r.action == RuleAction::Accept
            && !r.src_list_negated
            && r.src_address_list.as_deref() == Some(paid_list)
    });
    // No accept rule at all means every drop ahead of (a hypothetical)
    // one starves paid clients; scan the whole chain.
    let horizon = accept_position.unwrap_or(observed.filter_rules.len());

    observed
        .filter_rules
        .iter()
        .take(horizon)
        .enumerate()
        .filter(|(_, r)| {
            !r.disabled && matches!(r.action, RuleAction::Drop | RuleAction::Reject)
        })
        .filter(|(_, r)| {
            !(r.src_list_negated && r.src_address_list.as_deref() == Some(paid_list))
        })
        .map(|(position, r)| Action::RepairOrdering {
            chain: r.chain.clone(),
            position,
            rule: describe_rule(r),
        })
        .collect()
}

fn describe_rule(rule: &farelink_relay::FilterRule) -> String {
    let action = match rule.action {
        RuleAction::Accept => "accept",
        RuleAction::Drop => "drop",
        RuleAction::Reject => "reject",
        RuleAction::Other => "other",
    };
    match (&rule.src_address_list, rule.src_list_negated) {
        (Some(list), true) => format!("{action} src-address-list=!{list}"),
        (Some(list), false) => format!("{action} src-address-list={list}"),
        (None, _) => format!("{action} (no src-address-list)"),
    }
}
