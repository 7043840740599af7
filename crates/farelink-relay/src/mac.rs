// Client hardware addresses as reported by the hotspot.
//
// Normalized to uppercase colon-separated form on construction so that
// ledger lookups and observed-state comparisons never miss on formatting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A validated, normalized MAC address (`AA:BB:CC:DD:EE:FF`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

#[derive(Debug, Error)]
#[error("invalid MAC address: {0}")]
pub struct InvalidMac(pub String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MacAddress {
    type Err = InvalidMac;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<&str> = s.split([':', '-']).collect();
        if octets.len() != 6 {
            return Err(InvalidMac(s.to_owned()));
        }
        let mut normalized = String::with_capacity(17);
        for (i, octet) in octets.iter().enumerate() {
            if octet.len() != 2 || !octet.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(InvalidMac(s.to_owned()));
            }
            if i > 0 {
                normalized.push(':');
            }
            normalized.push_str(&octet.to_ascii_uppercase());
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = InvalidMac;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
