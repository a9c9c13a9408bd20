/*!
Observation events handed to the engine by the capture/decoding side.

This module defines:
- `ObservationEvent`: A validated, typed observation
- `ProxyEvidence`: Netproxy-related facts carried by an observation, if the decoder flagged it
- `RawObservation`: The string-typed wire form, as decoded from JSON
*/

use std::{net::IpAddr, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    network::{interface::InterfaceInfo, subnet::SubnetKey},
    topology::error::{ObservationError, ObservationResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyEvidence {
    pub internal: Option<InterfaceInfo>,
    pub external: Option<InterfaceInfo>,
    #[serde(default)]
    pub remote_peers: Vec<IpAddr>,
}

impl ProxyEvidence {
    pub fn interface_pair(internal: InterfaceInfo, external: InterfaceInfo) -> Self {
        Self {
            internal: Some(internal),
            external: Some(external),
            remote_peers: Vec::new(),
        }
    }

    pub fn with_remote_peer(mut self, address: IpAddr) -> Self {
        self.remote_peers.push(address);
        self
    }

    /// The candidate pair, if both sides are present. One side alone is malformed evidence.
    pub fn pair(&self) -> ObservationResult<Option<(&InterfaceInfo, &InterfaceInfo)>> {
        match (&self.internal, &self.external) {
            (Some(internal), Some(external)) => Ok(Some((internal, external))),
            (None, None) => Ok(None),
            (Some(only), None) | (None, Some(only)) => Err(ObservationError::InvalidInterface(format!(
                "proxy evidence names only interface {}",
                only.name
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationEvent {
    pub subnet: SubnetKey,
    pub source: IpAddr,
    pub destination: Option<IpAddr>,
    /// Name of the local interface the packet was captured on.
    pub interface: String,
    /// Milliseconds since the Unix epoch.
    pub observed_at: u64,
    pub proxy: Option<ProxyEvidence>,
}

impl ObservationEvent {
    pub fn new(subnet: SubnetKey, source: IpAddr, interface: &str, observed_at: u64) -> Self {
        Self {
            subnet,
            source,
            destination: None,
            interface: interface.to_string(),
            observed_at,
            proxy: None,
        }
    }

    pub fn with_destination(mut self, destination: IpAddr) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_proxy_evidence(mut self, evidence: ProxyEvidence) -> Self {
        self.proxy = Some(evidence);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInterface {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// String-typed observation, one per JSON line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawObservation {
    pub subnet: String,
    pub source: String,
    #[serde(default)]
    pub destination: Option<String>,
    pub interface: String,
    pub timestamp: u64,
    #[serde(default)]
    pub proxy_evidence: bool,
    #[serde(default)]
    pub internal_interface: Option<RawInterface>,
    #[serde(default)]
    pub external_interface: Option<RawInterface>,
    #[serde(default)]
    pub remote_peers: Vec<String>,
}

fn parse_address(s: &str) -> ObservationResult<IpAddr> {
    IpAddr::from_str(s.trim()).map_err(|_| ObservationError::InvalidAddress(format!("{s:?}")))
}

fn parse_interface(raw: &RawInterface) -> ObservationResult<InterfaceInfo> {
    InterfaceInfo::parse(&raw.name, &raw.address, raw.label.as_deref())
}

impl TryFrom<RawObservation> for ObservationEvent {
    type Error = ObservationError;

    fn try_from(raw: RawObservation) -> Result<Self, Self::Error> {
        let subnet = SubnetKey::from_str(&raw.subnet)?;
        let source = parse_address(&raw.source)?;
        let destination = raw.destination.as_deref().map(parse_address).transpose()?;

        let interface = raw.interface.trim();
        if interface.is_empty() {
            return Err(ObservationError::InvalidInterface(
                "observed interface name is empty".to_string(),
            ));
        }

        // Interface and peer fields are only meaningful when the decoder flagged the packet.
        let proxy = if raw.proxy_evidence {
            Some(ProxyEvidence {
                internal: raw.internal_interface.as_ref().map(parse_interface).transpose()?,
                external: raw.external_interface.as_ref().map(parse_interface).transpose()?,
                remote_peers: raw
                    .remote_peers
                    .iter()
                    .map(|peer| parse_address(peer))
                    .collect::<ObservationResult<Vec<_>>>()?,
            })
        } else {
            None
        };

        Ok(ObservationEvent {
            subnet,
            source,
            destination,
            interface: interface.to_string(),
            observed_at: raw.timestamp,
            proxy,
        })
    }
}
