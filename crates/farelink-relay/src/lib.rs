// farelink-relay: Async client for the router command relay (Mikrotik gateways)

pub mod client;
pub mod error;
pub mod mac;
pub mod observe;
pub mod op;
pub mod transport;

pub use client::{RelayClient, RouterTarget};
pub use error::RelayError;
pub use mac::MacAddress;
pub use observe::{
    Binding, BindingKind, FilterRule, ObservedState, RouterStateReader, RuleAction, StaleFacets,
};
pub use op::RouterOp;
pub use transport::{TlsMode, TransportConfig};
