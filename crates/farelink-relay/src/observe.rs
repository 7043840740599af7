// ── Router state reader ──
//
// Fetches the four observable facets of one router in a single pass:
// address-list membership, hotspot IP bindings, active hotspot sessions,
// and firewall filter rule order. Reads are concurrent and independent;
// a facet whose read failed is returned empty and marked stale so the
// drift detector can skip corrections that depend on it.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::client::{RelayClient, RouterTarget};
use crate::error::RelayError;
use crate::mac::MacAddress;
use crate::op::RouterOp;

/// Hotspot IP binding kind, mirroring the router's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    /// Exempt from captive-portal redirection.
    Bypassed,
    /// Explicitly denied.
    Blocked,
    /// Subject to the portal.
    #[default]
    #[serde(other)]
    Regular,
}

/// One hotspot IP binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub mac: Option<MacAddress>,
    pub kind: BindingKind,
}

/// Firewall rule verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    #[serde(other)]
    Other,
}

/// One firewall filter rule, in chain evaluation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub chain: String,
    pub action: RuleAction,
    /// Source address-list the rule matches, with negation split out
    /// (the router renders negation as a `!` prefix).
    pub src_address_list: Option<String>,
    pub src_list_negated: bool,
    pub disabled: bool,
    pub comment: Option<String>,
}

/// Which facets of an [`ObservedState`] failed to read this pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleFacets {
    pub address_list: bool,
    pub ip_bindings: bool,
    pub active_sessions: bool,
    pub filter_rules: bool,
}

impl StaleFacets {
    pub fn any(&self) -> bool {
        self.address_list || self.ip_bindings || self.active_sessions || self.filter_rules
    }

    pub fn all(&self) -> bool {
        self.address_list && self.ip_bindings && self.active_sessions && self.filter_rules
    }
}

/// The router's actual state, fetched fresh each reconciliation pass.
///
/// Ground truth for "is access actually open right now", as opposed to
/// the ledger's "should access be open".
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    /// Address-list membership, keyed by list name.
    pub address_lists: HashMap<String, HashSet<IpAddr>>,
    /// Hotspot IP bindings keyed by IP.
    pub bindings: HashMap<IpAddr, Binding>,
    /// IPs with an active hotspot session.
    pub active_sessions: HashSet<IpAddr>,
    /// Filter rules of the watched chain, in evaluation order.
    pub filter_rules: Vec<FilterRule>,
    /// Facets whose read failed; their collections above are empty.
    pub stale: StaleFacets,
}

impl ObservedState {
    /// Whether `ip` is a member of the named address-list.
    pub fn is_member(&self, list: &str, ip: IpAddr) -> bool {
        self.address_lists
            .get(list)
            .is_some_and(|members| members.contains(&ip))
    }

    /// The IP currently bound to `mac`, if any binding carries that MAC.
    pub fn bound_ip_for_mac(&self, mac: &MacAddress) -> Option<IpAddr> {
        self.bindings
            .iter()
            .find(|(_, b)| b.mac.as_ref() == Some(mac))
            .map(|(ip, _)| *ip)
    }
}

// ── Wire entry shapes ───────────────────────────────────────────────
//
// The relay returns each list call's data as a JSON array of objects
// with the router's kebab-case field names.

#[derive(Deserialize)]
struct AddressListEntry {
    address: IpAddr,
}

#[derive(Deserialize)]
struct IpBindingEntry {
    address: IpAddr,
    #[serde(default, rename = "mac-address")]
    mac_address: Option<MacAddress>,
    #[serde(default, rename = "type")]
    kind: BindingKind,
}

#[derive(Deserialize)]
struct ActiveSessionEntry {
    address: IpAddr,
}

#[derive(Deserialize)]
struct FilterRuleEntry {
    chain: String,
    action: RuleAction,
    #[serde(default, rename = "src-address-list")]
    src_address_list: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    comment: Option<String>,
}

impl From<FilterRuleEntry> for FilterRule {
    fn from(entry: FilterRuleEntry) -> Self {
        let (list, negated) = match entry.src_address_list {
            Some(raw) => match raw.strip_prefix('!') {
                Some(stripped) => (Some(stripped.to_owned()), true),
                None => (Some(raw), false),
            },
            None => (None, false),
        };
        Self {
            chain: entry.chain,
            action: entry.action,
            src_address_list: list,
            src_list_negated: negated,
            disabled: entry.disabled,
            comment: entry.comment,
        }
    }
}

// ── Reader ──────────────────────────────────────────────────────────

/// Pure read over one router's observable collections.
#[derive(Debug, Clone)]
pub struct RouterStateReader {
    client: RelayClient,
    paid_list: String,
    filter_chain: String,
}

impl RouterStateReader {
    pub fn new(client: RelayClient, paid_list: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            client,
            paid_list: paid_list.into(),
            filter_chain: chain.into(),
        }
    }

    /// Fetch the four facets concurrently.
    ///
    /// Partial failure returns partial state with the failed facets
    /// marked stale. If every facet failed the router is unreachable and
    /// the first error is returned instead.
    pub async fn observe(&self, target: &RouterTarget) -> Result<ObservedState, RelayError> {
        let list_op = RouterOp::ListAddressList {
            list: self.paid_list.clone(),
        };
        let rules_op = RouterOp::ListFilterRules {
            chain: self.filter_chain.clone(),
        };

        let (list_res, bindings_res, active_res, rules_res) = tokio::join!(
            self.client.execute(target, &list_op),
            self.client.execute(target, &RouterOp::ListIpBindings),
            self.client.execute(target, &RouterOp::ListActiveSessions),
            self.client.execute(target, &rules_op),
        );

        let mut state = ObservedState::default();

        match list_res.and_then(|data| parse_entries::<AddressListEntry>(&list_op, data)) {
            Ok(entries) => {
                let members = entries.into_iter().map(|e| e.address).collect();
                state.address_lists.insert(self.paid_list.clone(), members);
            }
            Err(err) => {
                warn!(router = %target.address, %err, "address-list facet unreadable");
                state.stale.address_list = true;
            }
        }

        match bindings_res
            .and_then(|data| parse_entries::<IpBindingEntry>(&RouterOp::ListIpBindings, data))
        {
            Ok(entries) => {
                state.bindings = entries
                    .into_iter()
                    .map(|e| {
                        (
                            e.address,
                            Binding {
                                mac: e.mac_address,
                                kind: e.kind,
                            },
                        )
                    })
                    .collect();
            }
            Err(err) => {
                warn!(router = %target.address, %err, "ip-bindings facet unreadable");
                state.stale.ip_bindings = true;
            }
        }

        match active_res
            .and_then(|data| parse_entries::<ActiveSessionEntry>(&RouterOp::ListActiveSessions, data))
        {
            Ok(entries) => {
                state.active_sessions = entries.into_iter().map(|e| e.address).collect();
            }
            Err(err) => {
                warn!(router = %target.address, %err, "active-sessions facet unreadable");
                state.stale.active_sessions = true;
            }
        }

        match rules_res.and_then(|data| parse_entries::<FilterRuleEntry>(&rules_op, data)) {
            Ok(entries) => {
                state.filter_rules = entries.into_iter().map(FilterRule::from).collect();
            }
            Err(err) => {
                warn!(router = %target.address, %err, "filter-rules facet unreadable");
                state.stale.filter_rules = true;
            }
        }

        if state.stale.all() {
            return Err(RelayError::RouterUnreachable {
                message: format!("all facets unreadable for {}", target.address),
            });
        }

        Ok(state)
    }
}

fn parse_entries<T: serde::de::DeserializeOwned>(
    op: &RouterOp,
    data: Value,
) -> Result<Vec<T>, RelayError> {
    serde_json::from_value(data).map_err(|e| RelayError::Protocol {
        message: format!("{} returned malformed data: {e}", op.name()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_rule_negation_is_split() {
        let entry: FilterRuleEntry = serde_json::from_value(json!({
            "chain": "forward",
            "action": "drop",
            "src-address-list": "!paid_clients",
        }))
        .unwrap();
        let rule = FilterRule::from(entry);
        assert_eq!(rule.src_address_list.as_deref(), Some("paid_clients"));
        assert!(rule.src_list_negated);
    }

    #[test]
    fn bound_ip_lookup_matches_mac() {
        let mac: MacAddress = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let mut state = ObservedState::default();
        state.bindings.insert(
            "10.0.0.9".parse().unwrap(),
            Binding {
                mac: Some(mac.clone()),
                kind: BindingKind::Bypassed,
            },
        );
        assert_eq!(
            state.bound_ip_for_mac(&mac),
            Some("10.0.0.9".parse().unwrap())
        );
    }
}
