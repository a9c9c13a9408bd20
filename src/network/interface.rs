use std::{fmt::Display, net::IpAddr};

use serde::{Deserialize, Serialize};

use crate::topology::error::ObservationError;

/// Descriptor of one local network interface, as reported by the capture side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub address: IpAddr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl InterfaceInfo {
    /// Builds a descriptor, rejecting blank names and the unspecified address.
    pub fn new(name: &str, address: IpAddr) -> Result<Self, ObservationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ObservationError::InvalidInterface("interface name is empty".to_string()));
        }
        if address.is_unspecified() {
            return Err(ObservationError::InvalidInterface(format!(
                "interface {name} has unspecified address {address}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            address,
            label: None,
        })
    }

    pub fn with_label(mut self, label: &str) -> Self {
        let label = label.trim();
        self.label = (!label.is_empty()).then(|| label.to_string());
        self
    }

    /// Parses a descriptor from its string parts, as they arrive on raw observations.
    pub fn parse(name: &str, address: &str, label: Option<&str>) -> Result<Self, ObservationError> {
        let address: IpAddr = address.trim().parse().map_err(|_| {
            ObservationError::InvalidInterface(format!(
                "interface {} has malformed address {address:?}",
                name.trim()
            ))
        })?;
        let info = Self::new(name, address)?;
        Ok(match label {
            Some(label) => info.with_label(label),
            None => info,
        })
    }

    /// Two descriptors denote the same physical interface when their names match.
    pub fn same_interface(&self, other: &InterfaceInfo) -> bool {
        self.name == other.name
    }

    /// Checks a descriptor that did not go through `new`, e.g. one deserialized directly.
    pub fn validate(&self) -> Result<(), ObservationError> {
        Self::new(&self.name, self.address).map(|_| ())
    }
}

impl Display for InterfaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.address)?;
        if let Some(label) = &self.label {
            write!(f, " [{}]", label)?;
        }
        Ok(())
    }
}
