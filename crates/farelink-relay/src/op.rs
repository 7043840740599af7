// ── Router operation set ──
//
// Every router interaction flows through one closed `RouterOp` enum.
// The relay owns Mikrotik command syntax; this crate only names the
// intent and its operands. All ensure/remove operations are idempotent
// from the reconciler's point of view.

use std::net::IpAddr;

use serde::Serialize;

use crate::mac::MacAddress;

/// The closed set of operations a relay accepts for one router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "args", rename_all = "kebab-case")]
pub enum RouterOp {
    // ── Mutations ────────────────────────────────────────────────────
    /// Add `ip` to the named address-list (no-op if already a member).
    EnsureAddressListMember {
        list: String,
        ip: IpAddr,
        tag: String,
    },
    /// Remove `ip` from the named address-list (no-op if absent).
    RemoveAddressListMember { list: String, ip: IpAddr },
    /// Create a bypassed hotspot IP binding for `ip` (no-op if present).
    /// The MAC is optional -- checkout does not always capture it.
    EnsureIpBinding {
        ip: IpAddr,
        mac: Option<MacAddress>,
        tag: String,
    },
    /// Remove the hotspot IP binding for `ip` (no-op if absent).
    RemoveIpBinding { ip: IpAddr },

    // ── Reads ────────────────────────────────────────────────────────
    /// List the members of the named address-list.
    ListAddressList { list: String },
    /// List all hotspot IP bindings.
    ListIpBindings,
    /// List IPs with an active hotspot session.
    ListActiveSessions,
    /// List the firewall filter rules of one chain, in evaluation order.
    ListFilterRules { chain: String },
}

impl RouterOp {
    /// The wire name of this operation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnsureAddressListMember { .. } => "ensure-address-list-member",
            Self::RemoveAddressListMember { .. } => "remove-address-list-member",
            Self::EnsureIpBinding { .. } => "ensure-ip-binding",
            Self::RemoveIpBinding { .. } => "remove-ip-binding",
            Self::ListAddressList { .. } => "list-address-list",
            Self::ListIpBindings => "list-ip-bindings",
            Self::ListActiveSessions => "list-active-sessions",
            Self::ListFilterRules { .. } => "list-filter-rules",
        }
    }

    /// Whether this operation changes router state. Mutations fold the
    /// relay's "already exists" / "not found" faults into success.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::EnsureAddressListMember { .. }
                | Self::RemoveAddressListMember { .. }
                | Self::EnsureIpBinding { .. }
                | Self::RemoveIpBinding { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::RouterOp;

    #[test]
    fn serializes_as_tagged_op() {
        let op = RouterOp::ListAddressList {
            list: "paid_clients".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "list-address-list");
        assert_eq!(json["args"]["list"], "paid_clients");
    }

    #[test]
    fn unit_reads_carry_no_args() {
        let json = serde_json::to_value(RouterOp::ListIpBindings).unwrap();
        assert_eq!(json["op"], "list-ip-bindings");
    }
}
