// ── Domain model ──
//
// Orders and Charges mirror the payment provider's view of a purchase;
// Sessions are the desired access grants the reconciler drives routers
// toward. Observed router state lives in `farelink_relay::ObservedState`
// and is never persisted.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use farelink_relay::{MacAddress, RouterTarget};

// ── Entity ids ──────────────────────────────────────────────────────

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id!(
    /// One purchase attempt.
    OrderId
);
entity_id!(
    /// One provider-side payment attempt.
    ChargeId
);
entity_id!(
    /// One access grant window.
    SessionId
);
entity_id!(
    /// One physical gateway.
    RouterId
);

// ── Order ───────────────────────────────────────────────────────────

/// Payment status of an order.
///
/// Transitions are monotone forward; `Paid` is terminal with respect to
/// payment and never reverts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Authorized,
    Paid,
    Failed,
    Canceled,
    Expired,
}

impl OrderStatus {
    /// Whether this status grants network access.
    pub fn grants_access(self) -> bool {
        self == Self::Paid
    }

    /// Whether the order is still waiting on the provider.
    pub fn awaits_payment(self) -> bool {
        matches!(self, Self::Pending | Self::Authorized)
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn accepts(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Authorized => {
                matches!(next, Self::Paid | Self::Failed | Self::Canceled)
            }
            // Terminal states never move again.
            Self::Paid | Self::Failed | Self::Canceled | Self::Expired => false,
        }
    }

    /// Normalize a provider status string. The provider's vocabulary is
    /// wider than ours; unrecognized values map to `None` and are left
    /// for the next poll.
    pub fn from_provider(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pending" | "created" | "waiting" | "ativa" => Some(Self::Pending),
            "authorized" | "in_process" => Some(Self::Authorized),
            "paid" | "approved" | "confirmed" | "concluida" => Some(Self::Paid),
            "failed" | "refused" | "declined" | "rejected" => Some(Self::Failed),
            "canceled" | "cancelled" | "removida_pelo_usuario_recebedor" => Some(Self::Canceled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// Access plan sold at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub label: String,
    pub minutes: u32,
}

impl Plan {
    pub fn new(label: impl Into<String>, minutes: u32) -> Self {
        Self {
            label: label.into(),
            minutes,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.minutes))
    }
}

/// One purchase attempt. Created at checkout, mutated only by the
/// webhook fast path or the provider poller, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Provider-facing reference, unique across all orders.
    pub external_code: String,
    pub status: OrderStatus,
    pub amount_cents: i64,
    pub plan: Plan,
    /// Client IP at purchase time (may go stale under DHCP churn).
    pub client_ip: IpAddr,
    /// Client MAC when the captive portal captured it.
    pub client_mac: Option<MacAddress>,
    pub router_id: RouterId,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        external_code: impl Into<String>,
        amount_cents: i64,
        plan: Plan,
        client_ip: IpAddr,
        client_mac: Option<MacAddress>,
        router_id: RouterId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(),
            external_code: external_code.into(),
            status: OrderStatus::Pending,
            amount_cents,
            plan,
            client_ip,
            client_mac,
            router_id,
            created_at: now,
            paid_at: None,
            updated_at: now,
        }
    }
}

// ── Charge ──────────────────────────────────────────────────────────

/// Provider-side payment attempt linked 0..1 to an Order.
///
/// Informational only -- charges never drive access grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: ChargeId,
    /// Provider identifier; looked up, never assumed unique at creation.
    pub provider_ref: String,
    pub order_id: Option<OrderId>,
    pub status: String,
    pub amount_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Session ─────────────────────────────────────────────────────────

/// A permanent relay failure recorded on a session, with the cool-down
/// deadline before automatic retry resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantFault {
    pub message: String,
    pub at: DateTime<Utc>,
    pub retry_after: DateTime<Utc>,
}

/// One access grant window: what the router *should* have open.
///
/// At most one active session exists per (router, IP). A session re-keys
/// in place when its client's DHCP-assigned IP moves: the IP changes,
/// the id and Order linkage do not. Sessions are deactivated, never
/// hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub ip: IpAddr,
    pub mac: Option<MacAddress>,
    pub plan_label: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub order_id: OrderId,
    pub router_id: RouterId,
    /// Expiry last pushed to the router; drives Renew bookkeeping.
    pub applied_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<GrantFault>,
    /// Optimistic-concurrency version; bumped on every ledger write.
    pub version: u64,
}

impl Session {
    /// Build the session an order earns when it reaches PAID.
    pub fn for_order(order: &Order, paid_at: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            ip: order.client_ip,
            mac: order.client_mac.clone(),
            plan_label: order.plan.label.clone(),
            started_at: paid_at,
            expires_at: paid_at + order.plan.duration(),
            active: true,
            order_id: order.id,
            router_id: order.router_id,
            applied_expires_at: None,
            last_error: None,
            version: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether automatic retry is suppressed after a permanent failure.
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.last_error
            .as_ref()
            .is_some_and(|fault| fault.retry_after > now)
    }
}

// ── Router ──────────────────────────────────────────────────────────

/// Last-known reachability of a router, updated every observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RouterHealth {
    Unknown,
    Reachable {
        as_of: DateTime<Utc>,
    },
    Unreachable {
        since: DateTime<Utc>,
        consecutive_failures: u32,
    },
}

impl RouterHealth {
    pub fn reachable(now: DateTime<Utc>) -> Self {
        Self::Reachable { as_of: now }
    }

    /// The health after one more failed observation.
    pub fn after_failure(&self, now: DateTime<Utc>) -> Self {
        match self {
            Self::Unreachable {
                since,
                consecutive_failures,
            } => Self::Unreachable {
                since: *since,
                consecutive_failures: consecutive_failures.saturating_add(1),
            },
            Self::Unknown | Self::Reachable { .. } => Self::Unreachable {
                since: now,
                consecutive_failures: 1,
            },
        }
    }

    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Reachable { .. })
    }
}

/// One physical gateway. Static reference data except for `health`.
#[derive(Debug, Clone)]
pub struct Router {
    pub id: RouterId,
    pub name: String,
    /// Management address the relay dials.
    pub address: String,
    pub username: String,
    pub password: SecretString,
    pub health: RouterHealth,
}

impl Router {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        username: impl Into<String>,
        password: SecretString,
    ) -> Self {
        Self {
            id: RouterId::new(),
            name: name.into(),
            address: address.into(),
            username: username.into(),
            password,
            health: RouterHealth::Unknown,
        }
    }

    /// The relay-facing address + credentials for this router.
    pub fn target(&self) -> RouterTarget {
        RouterTarget {
            address: self.address.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_is_terminal() {
        assert!(OrderStatus::Pending.accepts(OrderStatus::Paid));
        assert!(OrderStatus::Authorized.accepts(OrderStatus::Paid));
        assert!(!OrderStatus::Paid.accepts(OrderStatus::Failed));
        assert!(!OrderStatus::Paid.accepts(OrderStatus::Canceled));
        assert!(!OrderStatus::Paid.accepts(OrderStatus::Expired));
    }

    #[test]
    fn pending_can_expire_but_authorized_cannot() {
        assert!(OrderStatus::Pending.accepts(OrderStatus::Expired));
        assert!(!OrderStatus::Authorized.accepts(OrderStatus::Expired));
    }

    #[test]
    fn provider_vocabulary_normalizes() {
        assert_eq!(OrderStatus::from_provider("CONCLUIDA"), Some(OrderStatus::Paid));
        assert_eq!(OrderStatus::from_provider("approved"), Some(OrderStatus::Paid));
        assert_eq!(OrderStatus::from_provider("ATIVA"), Some(OrderStatus::Pending));
        assert_eq!(OrderStatus::from_provider("weird"), None);
    }

    #[test]
    fn session_expiry_is_paid_at_plus_plan() {
        let now = Utc::now();
        let order = Order::new(
            "ord-1",
            500,
            Plan::new("2h", 120),
            "10.0.0.5".parse().unwrap(),
            None,
            RouterId::new(),
            now,
        );
        let session = Session::for_order(&order, now);
        assert_eq!(session.expires_at, now + Duration::minutes(120));
        assert!(session.active);
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + Duration::minutes(121)));
    }

    #[test]
    fn health_counts_consecutive_failures() {
        let now = Utc::now();
        let health = RouterHealth::Unknown.after_failure(now).after_failure(now);
        match health {
            RouterHealth::Unreachable {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 2),
            other => panic!("unexpected health {other:?}"),
        }
    }
}
