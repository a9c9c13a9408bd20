/*!
The topology engine: single entry point for observations, maintenance and reports.

The store sits behind a `RwLock` and the netproxy tracker behind a `Mutex`. When both
are needed the store lock is always taken first. An event is fully validated while the
locks it needs are held, and only then applied, so a rejected event changes nothing.
*/

use std::{
    collections::BTreeSet,
    net::IpAddr,
    sync::{
        Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::EngineConfig,
    network::subnet::SubnetKey,
    topology::{
        error::{ObservationError, ObservationResult},
        event::{ObservationEvent, RawObservation},
        netproxy::{LocalNetproxyInfo, NetproxyTracker},
        store::{TopologyEntry, TopologyStore},
    },
};

/// Milliseconds since the Unix epoch, as used for every timestamp in the engine.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One subnet as seen by reporting code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetReport {
    pub subnet_key: SubnetKey,
    pub ips: BTreeSet<IpAddr>,
    pub last_change_time: u64,
}

impl From<(SubnetKey, TopologyEntry)> for SubnetReport {
    fn from((subnet_key, entry): (SubnetKey, TopologyEntry)) -> Self {
        SubnetReport {
            subnet_key,
            ips: entry.ips,
            last_change_time: entry.last_change_time,
        }
    }
}

/// The sole read surface for reporting collaborators. Subnets are ordered by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyReport {
    pub topology: Vec<SubnetReport>,
    pub netproxy: Option<LocalNetproxyInfo>,
}

impl TopologyReport {
    pub fn subnet(&self, key: &SubnetKey) -> Option<&SubnetReport> {
        self.topology
            .binary_search_by(|s| s.subnet_key.cmp(key))
            .ok()
            .map(|i| &self.topology[i])
    }

    pub fn host_count(&self) -> usize {
        self.topology.iter().map(|s| s.ips.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceOutcome {
    pub scanned: usize,
    pub evicted: usize,
    /// The bounded scan reached the last subnet; the next pass starts from the first.
    pub scan_complete: bool,
    pub netproxy_expired: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub accepted: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub netproxy_expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    netproxy_expirations: AtomicU64,
}

#[derive(Debug)]
pub struct TopologyEngine {
    config: EngineConfig,
    store: RwLock<TopologyStore>,
    netproxy: Mutex<NetproxyTracker>,
    eviction_cursor: Mutex<Option<SubnetKey>>,
    /// Newest `observed_at` among accepted events.
    latest_observed_at: AtomicU64,
    counters: Counters,
}

impl Default for TopologyEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl TopologyEngine {
    pub fn new(mut config: EngineConfig) -> Self {
        // a zero scan bound would never make progress
        config.max_eviction_scan = config.max_eviction_scan.max(1);
        Self {
            store: RwLock::new(TopologyStore::new(config.strict_subnet_membership)),
            netproxy: Mutex::new(NetproxyTracker::new(config.interface_swap_policy)),
            eviction_cursor: Mutex::new(None),
            latest_observed_at: AtomicU64::new(0),
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Applies one observation. Rejected events are reported back and leave all state as it was.
    pub fn observe(&self, event: ObservationEvent) -> ObservationResult<()> {
        let subnet = event.subnet;
        let source = event.source;
        let observed_at = event.observed_at;
        let result = self.apply(event);
        match &result {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.latest_observed_at.fetch_max(observed_at, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(%subnet, %source, error = %e, "observation rejected");
            }
        }
        result
    }

    /// Parses a string-typed observation and applies it.
    pub fn observe_raw(&self, raw: RawObservation) -> ObservationResult<()> {
        match ObservationEvent::try_from(raw) {
            Ok(event) => self.observe(event),
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "malformed observation rejected");
                Err(e)
            }
        }
    }

    fn apply(&self, event: ObservationEvent) -> ObservationResult<()> {
        let ObservationEvent {
            subnet,
            source,
            destination,
            interface,
            observed_at,
            proxy,
        } = event;

        if interface.trim().is_empty() {
            return Err(ObservationError::InvalidInterface(
                "observed interface name is empty".to_string(),
            ));
        }

        let mut store = write(&self.store);
        store.check_member(&subnet, source)?;
        // Destinations only count when they are hosts of the subnet the packet was seen in.
        let destination = destination.filter(|dst| {
            self.config.record_destinations
                && *dst != source
                && subnet.contains(*dst)
                && store.check_member(&subnet, *dst).is_ok()
        });

        let Some(evidence) = proxy else {
            store.record_observation(subnet, source, observed_at)?;
            if let Some(dst) = destination {
                store.record_observation(subnet, dst, observed_at)?;
            }
            return Ok(());
        };

        evidence.pair()?;
        if let Some(peer) = evidence.remote_peers.iter().find(|p| p.is_unspecified()) {
            return Err(ObservationError::InvalidAddress(format!(
                "remote netproxy peer {peer} is unspecified"
            )));
        }
        let mut tracker = lock(&self.netproxy);
        if let Some((internal, external)) = evidence.pair()? {
            tracker.check_pair(internal, external)?;
        }

        store.record_observation(subnet, source, observed_at)?;
        if let Some(dst) = destination {
            store.record_observation(subnet, dst, observed_at)?;
        }
        drop(store);

        if let Some((internal, external)) = evidence.internal.zip(evidence.external) {
            tracker.observe_candidate_interface_pair(internal, external, observed_at)?;
        }
        for peer in evidence.remote_peers {
            tracker.record_remote_peer(peer);
        }
        tracker.touch(observed_at);
        debug!(%subnet, %source, at = observed_at, "proxy evidence applied");
        Ok(())
    }

    /// The newest observation time accepted so far, or 0 before the first event.
    pub fn latest_observed_at(&self) -> u64 {
        self.latest_observed_at.load(Ordering::Relaxed)
    }

    /// Removes a host from a subnet, e.g. when the capture side learns it moved elsewhere.
    pub fn forget_address(&self, subnet: &SubnetKey, ip: IpAddr, at: u64) -> bool {
        write(&self.store).forget_address(subnet, ip, at)
    }

    /// Drops the tracked netproxy after its absence was confirmed externally.
    pub fn clear_netproxy(&self) {
        lock(&self.netproxy).clear();
    }

    /// Runs one bounded eviction step and the netproxy absence check.
    ///
    /// At most `max_eviction_scan` subnets are examined per call; consecutive calls continue
    /// where the previous one stopped. The scan runs under the shared lock and only the
    /// removal of stale keys takes the exclusive one.
    pub fn maintenance(&self, now: u64) -> MaintenanceOutcome {
        let threshold = self.config.stale_threshold_ms;
        let mut cursor = lock(&self.eviction_cursor);

        let scan = read(&self.store).stale_candidates(
            cursor.as_ref(),
            now,
            threshold,
            self.config.max_eviction_scan,
        );
        let evicted = if scan.stale.is_empty() {
            0
        } else {
            write(&self.store).evict_if_stale(&scan.stale, now, threshold)
        };
        *cursor = scan.resume_after;
        drop(cursor);

        let netproxy_expired =
            lock(&self.netproxy).expire_if_absent(now, self.config.netproxy_absence_timeout_ms);

        self.counters
            .evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if netproxy_expired {
            self.counters
                .netproxy_expirations
                .fetch_add(1, Ordering::Relaxed);
        }

        MaintenanceOutcome {
            scanned: scan.scanned,
            evicted,
            scan_complete: scan.resume_after.is_none(),
            netproxy_expired,
        }
    }

    pub fn topology_snapshot(&self) -> Vec<(SubnetKey, TopologyEntry)> {
        read(&self.store).snapshot()
    }

    pub fn netproxy_snapshot(&self) -> Option<LocalNetproxyInfo> {
        lock(&self.netproxy).snapshot()
    }

    /// Both halves are read while holding both locks, so the report is one point in time.
    pub fn report(&self) -> TopologyReport {
        let store = read(&self.store);
        let tracker = lock(&self.netproxy);
        TopologyReport {
            topology: store.snapshot().into_iter().map(SubnetReport::from).collect(),
            netproxy: tracker.snapshot(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            netproxy_expirations: self.counters.netproxy_expirations.load(Ordering::Relaxed),
        }
    }
}
