/*!
This module provides storage for the observed membership of every subnet.

This module defines:
- `TopologyEntry`: The set of hosts seen in one subnet plus the time its membership last changed
- `TopologyStore`: Collection of entries keyed by `SubnetKey`, with staleness-based eviction
- `StaleScan`: Result of a bounded scan for stale entries
*/

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
    ops::Bound,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    network::subnet::SubnetKey,
    topology::error::{ObservationError, ObservationResult},
};

/// Observed membership of one subnet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyEntry {
    pub ips: BTreeSet<IpAddr>,
    /// Milliseconds since the Unix epoch of the last insertion or removal.
    pub last_change_time: u64,
}

impl TopologyEntry {
    fn with_first_member(ip: IpAddr, observed_at: u64) -> Self {
        TopologyEntry {
            ips: BTreeSet::from([ip]),
            last_change_time: observed_at,
        }
    }

    pub fn cardinality(&self) -> usize {
        self.ips.len()
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip)
    }

    fn is_stale(&self, cutoff: u64) -> bool {
        self.last_change_time < cutoff
    }

    fn mark_changed(&mut self, at: u64) {
        // Out-of-order evidence never moves the timestamp backwards.
        self.last_change_time = self.last_change_time.max(at);
    }
}

/// Keys found stale by `TopologyStore::stale_candidates`, and where the next scan resumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleScan {
    pub stale: Vec<SubnetKey>,
    pub scanned: usize,
    /// `None` once the scan reached the last key; the next scan starts over.
    pub resume_after: Option<SubnetKey>,
}

impl StaleScan {
    pub fn is_complete(&self) -> bool {
        self.resume_after.is_none()
    }
}

/// Storage for every observed subnet.
#[derive(Debug, Clone, Serialize)]
pub struct TopologyStore {
    entries: BTreeMap<SubnetKey, TopologyEntry>,
    #[serde(skip)]
    strict_membership: bool,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new(true)
    }
}

fn stale_cutoff(now: u64, stale_threshold: u64) -> u64 {
    now.saturating_sub(stale_threshold)
}

impl TopologyStore {
    /// Creates an empty store. With `strict_membership`, an address must fall inside the
    /// subnet it is recorded under.
    pub fn new(strict_membership: bool) -> Self {
        Self {
            entries: BTreeMap::new(),
            strict_membership,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &SubnetKey) -> Option<&TopologyEntry> {
        self.entries.get(key)
    }

    pub fn entries_iter(&self) -> impl Iterator<Item = (&SubnetKey, &TopologyEntry)> {
        self.entries.iter()
    }

    /// Checks that `ip` may be recorded under `key` without touching the store.
    pub fn check_member(&self, key: &SubnetKey, ip: IpAddr) -> ObservationResult<()> {
        if ip.is_unspecified() {
            return Err(ObservationError::InvalidAddress(format!("{ip} is unspecified")));
        }
        if ip.is_ipv4() != key.network().is_ipv4() {
            return Err(ObservationError::InvalidAddress(format!(
                "{ip} is not of the same address family as {key}"
            )));
        }
        if key.is_special_address(ip) {
            return Err(ObservationError::InvalidAddress(format!(
                "{ip} is a reserved address of {key}"
            )));
        }
        if self.strict_membership && !key.contains(ip) {
            return Err(ObservationError::AddressOutsideSubnet {
                address: ip,
                subnet: *key,
            });
        }
        Ok(())
    }

    /// Adds `ip` to the entry for `key`, creating the entry if needed.
    ///
    /// Returns `true` when membership changed. Re-observing a known address is a no-op and
    /// leaves `last_change_time` alone. Rejected input leaves the store untouched.
    pub fn record_observation(
        &mut self,
        key: SubnetKey,
        ip: IpAddr,
        observed_at: u64,
    ) -> ObservationResult<bool> {
        self.check_member(&key, ip)?;

        match self.entries.get_mut(&key) {
            Some(entry) => {
                if entry.ips.insert(ip) {
                    entry.mark_changed(observed_at);
                    debug!(subnet = %key, %ip, at = observed_at, "host joined subnet");
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => {
                self.entries
                    .insert(key, TopologyEntry::with_first_member(ip, observed_at));
                debug!(subnet = %key, %ip, at = observed_at, "new subnet observed");
                Ok(true)
            }
        }
    }

    /// Removes `ip` from the entry for `key`. An entry left without members is dropped.
    pub fn forget_address(&mut self, key: &SubnetKey, ip: IpAddr, at: u64) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if !entry.ips.remove(&ip) {
            return false;
        }
        entry.mark_changed(at);
        if entry.ips.is_empty() {
            self.entries.remove(key);
            debug!(subnet = %key, %ip, "last host left subnet, entry dropped");
        } else {
            debug!(subnet = %key, %ip, at, "host left subnet");
        }
        true
    }

    /// Removes every entry whose membership last changed before `now - stale_threshold`.
    pub fn evict_stale(&mut self, now: u64, stale_threshold: u64) -> usize {
        let cutoff = stale_cutoff(now, stale_threshold);
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(cutoff));
        let removed = before - self.entries.len();
        if removed > 0 {
            info!(removed, cutoff, "evicted stale subnets");
        }
        removed
    }

    /// Scans at most `max_scan` entries following `resume_after` and reports the stale ones.
    ///
    /// Nothing is removed here, so the scan can run under a shared lock.
    pub fn stale_candidates(
        &self,
        resume_after: Option<&SubnetKey>,
        now: u64,
        stale_threshold: u64,
        max_scan: usize,
    ) -> StaleScan {
        let cutoff = stale_cutoff(now, stale_threshold);
        let lower = match resume_after {
            Some(key) => Bound::Excluded(*key),
            None => Bound::Unbounded,
        };

        let mut scan = StaleScan::default();
        let mut last_seen = None;
        let mut range = self.entries.range((lower, Bound::Unbounded));
        for (key, entry) in range.by_ref().take(max_scan) {
            scan.scanned += 1;
            last_seen = Some(*key);
            if entry.is_stale(cutoff) {
                scan.stale.push(*key);
            }
        }
        if range.next().is_some() {
            scan.resume_after = last_seen;
        }
        scan
    }

    /// Removes the given entries if they are still stale. Entries refreshed since the scan stay.
    pub fn evict_if_stale(&mut self, keys: &[SubnetKey], now: u64, stale_threshold: u64) -> usize {
        let cutoff = stale_cutoff(now, stale_threshold);
        let mut removed = 0;
        for key in keys {
            if self.entries.get(key).is_some_and(|entry| entry.is_stale(cutoff)) {
                self.entries.remove(key);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, cutoff, "evicted stale subnets");
        }
        removed
    }

    /// Point-in-time copy of every entry, ordered by subnet key.
    pub fn snapshot(&self) -> Vec<(SubnetKey, TopologyEntry)> {
        self.entries
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn key(s: &str) -> SubnetKey {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_membership_is_order_independent() {
        let subnet = key("10.0.0.0/24");
        let addrs = ["10.0.0.5", "10.0.0.6", "10.0.0.5", "10.0.0.9", "10.0.0.6"];

        let mut forward = TopologyStore::default();
        for (t, a) in addrs.iter().enumerate() {
            forward.record_observation(subnet, ip(a), t as u64).unwrap();
        }
        let mut backward = TopologyStore::default();
        for (t, a) in addrs.iter().rev().enumerate() {
            backward.record_observation(subnet, ip(a), t as u64).unwrap();
        }

        let expected: BTreeSet<IpAddr> = ["10.0.0.5", "10.0.0.6", "10.0.0.9"].iter().map(|a| ip(a)).collect();
        assert_eq!(forward.get(&subnet).unwrap().ips, expected);
        assert_eq!(backward.get(&subnet).unwrap().ips, expected);
    }

    #[test]
    fn test_last_change_time_tracks_new_members_only() {
        let subnet = key("10.0.0.0/24");
        let mut store = TopologyStore::default();

        assert!(store.record_observation(subnet, ip("10.0.0.5"), 1000).unwrap());
        assert_eq!(store.get(&subnet).unwrap().last_change_time, 1000);

        assert!(store.record_observation(subnet, ip("10.0.0.6"), 2000).unwrap());
        assert_eq!(store.get(&subnet).unwrap().last_change_time, 2000);

        assert!(!store.record_observation(subnet, ip("10.0.0.5"), 3000).unwrap());
        assert_eq!(store.get(&subnet).unwrap().last_change_time, 2000);
    }

    #[test]
    fn test_late_evidence_does_not_rewind_timestamp() {
        let subnet = key("10.0.0.0/24");
        let mut store = TopologyStore::default();
        store.record_observation(subnet, ip("10.0.0.5"), 5000).unwrap();
        store.record_observation(subnet, ip("10.0.0.6"), 4000).unwrap();

        let entry = store.get(&subnet).unwrap();
        assert_eq!(entry.cardinality(), 2);
        assert_eq!(entry.last_change_time, 5000);
    }

    #[test]
    fn test_rejected_addresses_leave_store_untouched() {
        let subnet = key("10.0.0.0/24");
        let mut store = TopologyStore::default();
        store.record_observation(subnet, ip("10.0.0.5"), 1000).unwrap();
        let before = store.snapshot();

        let cases = [
            ip("0.0.0.0"),
            ip("10.0.0.0"),
            ip("10.0.0.255"),
            ip("fe80::1"),
        ];
        for bad in cases {
            let err = store.record_observation(subnet, bad, 9000).unwrap_err();
            assert!(matches!(err, ObservationError::InvalidAddress(_)), "{bad}: {err}");
        }
        let err = store.record_observation(subnet, ip("192.168.1.1"), 9000).unwrap_err();
        assert!(matches!(err, ObservationError::AddressOutsideSubnet { .. }));

        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_lax_membership_accepts_foreign_addresses() {
        let subnet = key("10.0.0.0/24");
        let mut store = TopologyStore::new(false);
        assert!(store.record_observation(subnet, ip("192.168.1.1"), 10).unwrap());
        assert!(store.get(&subnet).unwrap().contains(&ip("192.168.1.1")));
    }

    #[test]
    fn test_evict_stale_is_exact_and_idempotent() {
        let mut store = TopologyStore::default();
        store.record_observation(key("10.0.0.0/24"), ip("10.0.0.5"), 1000).unwrap();
        store.record_observation(key("10.0.1.0/24"), ip("10.0.1.5"), 5000).unwrap();
        store.record_observation(key("10.0.2.0/24"), ip("10.0.2.5"), 6000).unwrap();

        // cutoff = 5000: strictly older entries go, the one at exactly 5000 stays
        let kept_before: Vec<_> = store
            .snapshot()
            .into_iter()
            .filter(|(_, e)| e.last_change_time >= 5000)
            .collect();
        assert_eq!(store.evict_stale(6000, 1000), 1);
        assert_eq!(store.snapshot(), kept_before);
        assert_eq!(store.evict_stale(6000, 1000), 0);
        assert_eq!(store.snapshot(), kept_before);
    }

    #[test]
    fn test_evict_stale_with_threshold_larger_than_now() {
        let mut store = TopologyStore::default();
        store.record_observation(key("10.0.0.0/24"), ip("10.0.0.5"), 0).unwrap();
        assert_eq!(store.evict_stale(10, u64::MAX), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_forget_address_bumps_time_and_drops_empty_entries() {
        let subnet = key("10.0.0.0/24");
        let mut store = TopologyStore::default();
        store.record_observation(subnet, ip("10.0.0.5"), 100).unwrap();
        store.record_observation(subnet, ip("10.0.0.6"), 200).unwrap();

        assert!(store.forget_address(&subnet, ip("10.0.0.5"), 300));
        assert_eq!(store.get(&subnet).unwrap().last_change_time, 300);
        assert!(!store.forget_address(&subnet, ip("10.0.0.5"), 400));
        assert_eq!(store.get(&subnet).unwrap().last_change_time, 300);

        assert!(store.forget_address(&subnet, ip("10.0.0.6"), 500));
        assert!(store.get(&subnet).is_none());
    }

    #[test]
    fn test_bounded_scan_resumes_and_wraps() {
        let mut store = TopologyStore::default();
        for third in 0..5u8 {
            let subnet = key(&format!("10.0.{third}.0/24"));
            let host = IpAddr::V4(Ipv4Addr::new(10, 0, third, 1));
            // even subnets are stale at now=1000/threshold=100
            let at = if third % 2 == 0 { 10 } else { 950 };
            store.record_observation(subnet, host, at).unwrap();
        }

        let first = store.stale_candidates(None, 1000, 100, 2);
        assert_eq!(first.scanned, 2);
        assert_eq!(first.stale, vec![key("10.0.0.0/24")]);
        assert_eq!(first.resume_after, Some(key("10.0.1.0/24")));

        let second = store.stale_candidates(first.resume_after.as_ref(), 1000, 100, 2);
        assert_eq!(second.stale, vec![key("10.0.2.0/24")]);
        assert!(!second.is_complete());

        let third = store.stale_candidates(second.resume_after.as_ref(), 1000, 100, 2);
        assert_eq!(third.scanned, 1);
        assert_eq!(third.stale, vec![key("10.0.4.0/24")]);
        assert!(third.is_complete());

        let again = store.stale_candidates(third.resume_after.as_ref(), 1000, 100, 2);
        assert_eq!(again.stale, first.stale);
    }

    #[test]
    fn test_evict_if_stale_rechecks_entries() {
        let subnet = key("10.0.0.0/24");
        let mut store = TopologyStore::default();
        store.record_observation(subnet, ip("10.0.0.5"), 10).unwrap();

        let scan = store.stale_candidates(None, 1000, 100, 16);
        assert_eq!(scan.stale, vec![subnet]);

        // refreshed between scan and eviction
        store.record_observation(subnet, ip("10.0.0.6"), 990).unwrap();
        assert_eq!(store.evict_if_stale(&scan.stale, 1000, 100), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_by_key() {
        let mut store = TopologyStore::default();
        store.record_observation(key("192.168.0.0/24"), ip("192.168.0.2"), 1).unwrap();
        store.record_observation(key("10.0.0.0/8"), ip("10.1.2.3"), 1).unwrap();
        store.record_observation(key("172.16.0.0/12"), ip("172.16.0.9"), 1).unwrap();

        let keys: Vec<_> = store.snapshot().into_iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/24"]);
    }
}
