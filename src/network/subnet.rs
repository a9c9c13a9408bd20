//! Normalized subnet identifiers used to group observed hosts.

use std::{
    cmp::Ordering,
    fmt::Display,
    net::IpAddr,
    str::FromStr,
};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

use crate::topology::error::ObservationError;

/// A network prefix with its host bits cleared.
///
/// `10.0.0.7/24`, `10.0.0.0/255.255.255.0` and `10.0.0.0/24` all normalize to the
/// same key. A bare address is accepted and becomes a host prefix (/32 or /128).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubnetKey(IpNetwork);

impl SubnetKey {
    pub fn new(network: IpNetwork) -> Self {
        let normalized = match network {
            IpNetwork::V4(net) => Ipv4Network::new(net.network(), net.prefix()).map(IpNetwork::V4),
            IpNetwork::V6(net) => Ipv6Network::new(net.network(), net.prefix()).map(IpNetwork::V6),
        };
        SubnetKey(normalized.unwrap_or(network))
    }

    pub fn network(&self) -> IpNetwork {
        self.0
    }

    pub fn prefix(&self) -> u8 {
        self.0.prefix()
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.0.contains(address)
    }

    /// True for addresses that never identify a host of this subnet: the
    /// unspecified address, the network address and (IPv4) the broadcast address.
    /// Point-to-point prefixes (/31, /127) and host prefixes have no reserved addresses.
    pub fn is_special_address(&self, address: IpAddr) -> bool {
        if address.is_unspecified() {
            return true;
        }
        match (self.0, address) {
            (IpNetwork::V4(net), IpAddr::V4(ip)) if net.prefix() < 31 => {
                ip == net.network() || ip == net.broadcast()
            }
            (IpNetwork::V6(net), IpAddr::V6(ip)) if net.prefix() < 127 => ip == net.network(),
            _ => false,
        }
    }
}

impl From<IpNetwork> for SubnetKey {
    fn from(network: IpNetwork) -> Self {
        SubnetKey::new(network)
    }
}

impl FromStr for SubnetKey {
    type Err = ObservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ObservationError::InvalidSubnetKey("empty subnet key".to_string()));
        }
        IpNetwork::from_str(trimmed)
            .map(SubnetKey::new)
            .map_err(|e| ObservationError::InvalidSubnetKey(format!("{trimmed}: {e}")))
    }
}

impl Display for SubnetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.0.network(), self.0.prefix())
    }
}

// Reports order subnets by family, then network address, then prefix length.
impl Ord for SubnetKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .network()
            .cmp(&other.0.network())
            .then_with(|| self.0.prefix().cmp(&other.0.prefix()))
    }
}

impl PartialOrd for SubnetKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Serialized as the canonical string so the key can be used as a map key in JSON.

impl Serialize for SubnetKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SubnetKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de> {
        let s = String::deserialize(deserializer)?;
        SubnetKey::from_str(&s).map_err(serde::de::Error::custom)
    }
}
