/*!
Tracking of the locally detected network proxy.

This module defines:
- `LocalNetproxyInfo`: The proxy's internal/external interfaces and its remote peers
- `InterfaceSwapPolicy`: What to do when evidence names a different interface pair
- `NetproxyTracker`: Owner of the (at most one) tracked proxy
*/

use std::{collections::HashSet, net::IpAddr};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    network::interface::InterfaceInfo,
    topology::error::{ObservationError, ObservationResult},
};

/// The local netproxy as currently understood from traffic evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalNetproxyInfo {
    pub internal_interface: InterfaceInfo,
    pub external_interface: InterfaceInfo,
    /// Peers in the order they were first seen.
    pub remote_netproxy_addresses: Vec<IpAddr>,
    pub detected_at: u64,
    pub interfaces_observed_at: u64,
    pub last_evidence_at: u64,
}

impl LocalNetproxyInfo {
    fn has_pair(&self, internal: &InterfaceInfo, external: &InterfaceInfo) -> bool {
        self.internal_interface.same_interface(internal) && self.external_interface.same_interface(external)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceSwapPolicy {
    /// A different pair replaces the current one when its evidence is newer.
    #[default]
    LastWriteWins,
    /// A different pair is refused until the tracked proxy is cleared.
    RequireClear,
}

#[derive(Debug)]
struct TrackedNetproxy {
    info: LocalNetproxyInfo,
    known_peers: HashSet<IpAddr>,
}

/// Holds at most one `LocalNetproxyInfo`.
#[derive(Debug, Default)]
pub struct NetproxyTracker {
    tracked: Option<TrackedNetproxy>,
    policy: InterfaceSwapPolicy,
}

impl NetproxyTracker {
    pub fn new(policy: InterfaceSwapPolicy) -> Self {
        Self { tracked: None, policy }
    }

    pub fn policy(&self) -> InterfaceSwapPolicy {
        self.policy
    }

    pub fn is_tracking(&self) -> bool {
        self.tracked.is_some()
    }

    /// Validates an interface pair without touching the tracker.
    pub fn check_pair(
        &self,
        internal: &InterfaceInfo,
        external: &InterfaceInfo,
    ) -> ObservationResult<()> {
        internal.validate()?;
        external.validate()?;
        if internal.same_interface(external) {
            return Err(ObservationError::InvalidInterface(format!(
                "internal and external interface are both {}",
                internal.name
            )));
        }
        if let (InterfaceSwapPolicy::RequireClear, Some(tracked)) = (self.policy, &self.tracked) {
            if !tracked.info.has_pair(internal, external) {
                return Err(ObservationError::NetproxyIdentityConflict {
                    current_internal: tracked.info.internal_interface.name.clone(),
                    current_external: tracked.info.external_interface.name.clone(),
                    internal: internal.name.clone(),
                    external: external.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Records evidence that `internal`/`external` are the proxy's interface pair.
    pub fn observe_candidate_interface_pair(
        &mut self,
        internal: InterfaceInfo,
        external: InterfaceInfo,
        observed_at: u64,
    ) -> ObservationResult<()> {
        self.check_pair(&internal, &external)?;

        let Some(tracked) = self.tracked.as_mut() else {
            info!(
                internal = %internal,
                external = %external,
                at = observed_at,
                "local netproxy detected"
            );
            self.tracked = Some(TrackedNetproxy {
                info: LocalNetproxyInfo {
                    internal_interface: internal,
                    external_interface: external,
                    remote_netproxy_addresses: Vec::new(),
                    detected_at: observed_at,
                    interfaces_observed_at: observed_at,
                    last_evidence_at: observed_at,
                },
                known_peers: HashSet::new(),
            });
            return Ok(());
        };

        let info = &mut tracked.info;
        info.last_evidence_at = info.last_evidence_at.max(observed_at);

        if info.has_pair(&internal, &external) {
            if observed_at >= info.interfaces_observed_at {
                // Same interfaces; addresses and labels follow the newest descriptor.
                info.internal_interface = internal;
                info.external_interface = external;
                info.interfaces_observed_at = observed_at;
            }
            return Ok(());
        }

        if observed_at > info.interfaces_observed_at {
            info!(
                from_internal = %info.internal_interface,
                from_external = %info.external_interface,
                to_internal = %internal,
                to_external = %external,
                at = observed_at,
                "netproxy interface pair replaced"
            );
            info.internal_interface = internal;
            info.external_interface = external;
            info.interfaces_observed_at = observed_at;
        } else {
            debug!(
                internal = %internal,
                external = %external,
                at = observed_at,
                current_since = info.interfaces_observed_at,
                "ignoring older netproxy interface evidence"
            );
        }
        Ok(())
    }

    /// Appends `address` to the peer list if it is not there yet.
    ///
    /// Returns `false` when the peer was already known or no proxy is tracked.
    pub fn record_remote_peer(&mut self, address: IpAddr) -> bool {
        let Some(tracked) = self.tracked.as_mut() else {
            warn!(%address, "remote netproxy peer seen while no local netproxy is tracked");
            return false;
        };
        if !tracked.known_peers.insert(address) {
            return false;
        }
        tracked.info.remote_netproxy_addresses.push(address);
        info!(%address, "remote netproxy peer recorded");
        true
    }

    /// Refreshes the evidence time used by the absence timeout.
    pub fn touch(&mut self, observed_at: u64) {
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.info.last_evidence_at = tracked.info.last_evidence_at.max(observed_at);
        }
    }

    pub fn clear(&mut self) {
        if self.tracked.take().is_some() {
            info!("local netproxy cleared");
        }
    }

    /// Clears the tracked proxy if no evidence arrived within `absence_timeout` of `now`.
    pub fn expire_if_absent(&mut self, now: u64, absence_timeout: u64) -> bool {
        let expired = self
            .tracked
            .as_ref()
            .is_some_and(|t| now.saturating_sub(t.info.last_evidence_at) > absence_timeout);
        if expired {
            info!(now, absence_timeout, "local netproxy absent beyond timeout");
            self.tracked = None;
        }
        expired
    }

    pub fn snapshot(&self) -> Option<LocalNetproxyInfo> {
        self.tracked.as_ref().map(|t| t.info.clone())
    }
}
