use std::net::IpAddr;

use thiserror::Error;

use crate::network::subnet::SubnetKey;

/// Reasons an observation (or part of one) is rejected.
///
/// Every variant is local and non-fatal: the engine leaves its state untouched
/// and keeps serving subsequent calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObservationError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid interface: {0}")]
    InvalidInterface(String),
    #[error("invalid subnet key: {0}")]
    InvalidSubnetKey(String),
    #[error("address {address} does not belong to subnet {subnet}")]
    AddressOutsideSubnet { address: IpAddr, subnet: SubnetKey },
    #[error(
        "netproxy already tracked with interfaces {current_internal}/{current_external}, clear it before accepting {internal}/{external}"
    )]
    NetproxyIdentityConflict {
        current_internal: String,
        current_external: String,
        internal: String,
        external: String,
    },
}

pub type ObservationResult<T> = Result<T, ObservationError>;
