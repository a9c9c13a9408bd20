//! Asynchronous ingest loop.
//!
//! Capture threads hand observations to an `IngestHandle` without ever waiting on engine
//! locks; a single apply task drains the queue into the engine and runs periodic
//! maintenance. A full queue drops the observation and counts it.
//!
//! Maintenance runs on event time by default: `now` is the newest accepted `observed_at`,
//! so replayed or delayed captures are not aged by the host clock.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::{IngestConfig, MaintenanceClock},
    topology::{
        engine::{TopologyEngine, current_time_millis},
        event::{ObservationEvent, RawObservation},
        source::{ObservationSource, SourceError},
    },
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingest queue is full, observation dropped")]
    QueueFull,
    #[error("ingest loop has stopped")]
    Closed,
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug)]
enum Queued {
    Event(ObservationEvent),
    Raw(RawObservation),
}

/// Summary returned by the apply task when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub maintenance_runs: u64,
    pub evicted: u64,
}

/// Cloneable producer side of the ingest loop.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Queued>,
    shutdown: Arc<watch::Sender<bool>>,
    dropped: Arc<AtomicU64>,
}

impl IngestHandle {
    fn try_enqueue(&self, item: Queued) -> Result<(), IngestError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "ingest queue full, dropping observation");
                Err(IngestError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(IngestError::Closed),
        }
    }

    /// Queues an observation without blocking. Safe to call from capture threads.
    pub fn submit(&self, event: ObservationEvent) -> Result<(), IngestError> {
        self.try_enqueue(Queued::Event(event))
    }

    /// Queues a raw observation without blocking; parsing happens on the apply task.
    pub fn submit_raw(&self, raw: RawObservation) -> Result<(), IngestError> {
        self.try_enqueue(Queued::Raw(raw))
    }

    /// Queues a raw observation, waiting for room. For replay sources where loss is not acceptable.
    pub async fn submit_raw_wait(&self, raw: RawObservation) -> Result<(), IngestError> {
        self.tx
            .send(Queued::Raw(raw))
            .await
            .map_err(|_| IngestError::Closed)
    }

    /// Asks the apply task to stop once it has drained what is already queued.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Starts the apply task on the current tokio runtime.
pub fn spawn_ingest(
    engine: Arc<TopologyEngine>,
    config: &IngestConfig,
) -> (IngestHandle, JoinHandle<IngestStats>) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dropped = Arc::new(AtomicU64::new(0));

    let handle = IngestHandle {
        tx,
        shutdown: Arc::new(shutdown_tx),
        dropped: Arc::clone(&dropped),
    };
    let interval = config
        .maintenance_interval()
        .max(Duration::from_millis(1));
    let clock = config.maintenance_clock;
    let task = tokio::spawn(run_apply_loop(engine, rx, shutdown_rx, interval, clock, dropped));
    (handle, task)
}

fn apply(engine: &TopologyEngine, item: Queued, stats: &mut IngestStats) {
    let result = match item {
        Queued::Event(event) => engine.observe(event),
        Queued::Raw(raw) => engine.observe_raw(raw),
    };
    match result {
        Ok(()) => stats.applied += 1,
        Err(_) => stats.rejected += 1,
    }
}

fn maintenance_now(engine: &TopologyEngine, clock: MaintenanceClock) -> u64 {
    match clock {
        MaintenanceClock::Event => engine.latest_observed_at(),
        MaintenanceClock::Wall => current_time_millis(),
    }
}

// Individual rejections are only logged at debug level; this surfaces them once per pass.
fn warn_new_rejections(engine: &TopologyEngine, reported: &mut u64) -> u64 {
    let total = engine.stats().rejected;
    let new = total.saturating_sub(*reported);
    if new > 0 {
        warn!(new, total, "observations rejected since last maintenance pass");
        *reported = total;
    }
    new
}

async fn run_apply_loop(
    engine: Arc<TopologyEngine>,
    mut rx: mpsc::Receiver<Queued>,
    mut shutdown_rx: watch::Receiver<bool>,
    interval: Duration,
    clock: MaintenanceClock,
    dropped: Arc<AtomicU64>,
) -> IngestStats {
    let mut stats = IngestStats::default();
    let mut reported_rejections = engine.stats().rejected;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(?interval, ?clock, "ingest loop started");
    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            next = rx.recv() => match next {
                Some(item) => apply(&engine, item, &mut stats),
                None => break,
            },
            _ = ticker.tick() => {
                let outcome = engine.maintenance(maintenance_now(&engine, clock));
                warn_new_rejections(&engine, &mut reported_rejections);
                stats.maintenance_runs += 1;
                stats.evicted += outcome.evicted as u64;
                debug!(?outcome, "maintenance pass");
            }
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        apply(&engine, item, &mut stats);
    }
    warn_new_rejections(&engine, &mut reported_rejections);
    stats.dropped = dropped.load(Ordering::Relaxed);
    info!(
        applied = stats.applied,
        rejected = stats.rejected,
        dropped = stats.dropped,
        "ingest loop stopped"
    );
    stats
}

/// Forwards everything `source` yields into the ingest loop, waiting for queue room.
///
/// Malformed records are logged and skipped; a read error ends the pump.
pub async fn pump<S>(source: &mut S, handle: &IngestHandle) -> Result<u64, IngestError>
where
    S: ObservationSource + ?Sized,
{
    let mut forwarded = 0;
    while let Some(next) = source.next_observation().await {
        match next {
            Ok(raw) => {
                handle.submit_raw_wait(raw).await?;
                forwarded += 1;
            }
            Err(e @ SourceError::Parse { .. }) => {
                warn!(error = %e, "skipping malformed observation");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{config::EngineConfig, topology::source::JsonLinesSource};

    fn event(source: &str, at: u64) -> ObservationEvent {
        ObservationEvent::new(
            "10.0.0.0/24".parse().unwrap(),
            source.parse::<IpAddr>().unwrap(),
            "eth0",
            at,
        )
    }

    #[tokio::test]
    async fn test_applies_queued_events_before_stopping() {
        let engine = Arc::new(TopologyEngine::default());
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &IngestConfig::default());

        handle.submit(event("10.0.0.5", 1000)).unwrap();
        handle.submit(event("10.0.0.6", 2000)).unwrap();
        handle.submit(event("10.0.0.0", 3000)).unwrap();
        handle.shutdown();

        let stats = task.await.unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(engine.report().host_count(), 2);
        assert!(matches!(handle.submit(event("10.0.0.7", 4000)), Err(IngestError::Closed)));
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let engine = Arc::new(TopologyEngine::default());
        let config = IngestConfig {
            queue_capacity: 1,
            ..IngestConfig::default()
        };
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &config);

        // the apply task cannot run before this test yields
        handle.submit(event("10.0.0.5", 1)).unwrap();
        assert!(matches!(handle.submit(event("10.0.0.6", 2)), Err(IngestError::QueueFull)));
        assert_eq!(handle.dropped(), 1);

        handle.shutdown();
        let stats = task.await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_stops_when_all_handles_are_dropped() {
        let engine = Arc::new(TopologyEngine::default());
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &IngestConfig::default());
        handle.submit(event("10.0.0.5", 1)).unwrap();
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(stats.applied, 1);
    }

    #[tokio::test]
    async fn test_periodic_maintenance_evicts_on_wall_clock() {
        let engine = Arc::new(TopologyEngine::new(EngineConfig {
            stale_threshold_ms: 1,
            ..EngineConfig::default()
        }));
        let config = IngestConfig {
            maintenance_interval_ms: 10,
            maintenance_clock: MaintenanceClock::Wall,
            ..IngestConfig::default()
        };
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &config);

        // timestamp far in the past, so the first maintenance pass finds it stale
        handle.submit(event("10.0.0.5", 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();

        let stats = task.await.unwrap();
        assert!(stats.maintenance_runs >= 1);
        assert_eq!(stats.evicted, 1);
        assert!(engine.report().topology.is_empty());
    }

    #[tokio::test]
    async fn test_replayed_events_survive_maintenance_ticks() {
        let engine = Arc::new(TopologyEngine::default());
        let config = IngestConfig {
            maintenance_interval_ms: 10,
            ..IngestConfig::default()
        };
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &config);

        handle.submit(event("10.0.0.5", 1000)).unwrap();
        handle.submit(event("10.0.0.6", 2000)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        let stats = task.await.unwrap();
        assert!(stats.maintenance_runs >= 1);
        assert_eq!(stats.evicted, 0);
        let report = engine.report();
        assert_eq!(report.topology.len(), 1);
        assert_eq!(report.topology[0].ips.len(), 2);
        assert_eq!(report.topology[0].last_change_time, 2000);
    }

    #[tokio::test]
    async fn test_event_clock_evicts_subnets_left_behind() {
        let engine = Arc::new(TopologyEngine::new(EngineConfig {
            stale_threshold_ms: 100,
            ..EngineConfig::default()
        }));
        let config = IngestConfig {
            maintenance_interval_ms: 10,
            ..IngestConfig::default()
        };
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &config);

        handle.submit(event("10.0.0.5", 1000)).unwrap();
        handle
            .submit(ObservationEvent::new(
                "10.1.0.0/24".parse().unwrap(),
                "10.1.0.5".parse::<IpAddr>().unwrap(),
                "eth0",
                5000,
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        let stats = task.await.unwrap();
        assert_eq!(stats.evicted, 1);
        let keys: Vec<String> = engine
            .report()
            .topology
            .iter()
            .map(|s| s.subnet_key.to_string())
            .collect();
        assert_eq!(keys, ["10.1.0.0/24"]);
    }

    #[test]
    fn test_rejections_are_summarized_once() {
        let engine = TopologyEngine::default();
        let mut reported = 0;
        assert_eq!(warn_new_rejections(&engine, &mut reported), 0);

        engine.observe(event("10.0.0.0", 1)).unwrap_err();
        engine.observe(event("10.9.9.9", 2)).unwrap_err();
        assert_eq!(warn_new_rejections(&engine, &mut reported), 2);
        assert_eq!(warn_new_rejections(&engine, &mut reported), 0);
        assert_eq!(reported, 2);
    }

    #[tokio::test]
    async fn test_pump_skips_malformed_lines() {
        let engine = Arc::new(TopologyEngine::default());
        let (handle, task) = spawn_ingest(Arc::clone(&engine), &IngestConfig::default());

        let input = concat!(
            r#"{"subnet":"10.0.0.0/24","source":"10.0.0.5","interface":"eth0","timestamp":1000}"#,
            "\nnot json\n",
            r#"{"subnet":"10.0.0.0/24","source":"999.0.0.1","interface":"eth0","timestamp":1001}"#,
            "\n",
        );
        let mut source = JsonLinesSource::new(input.as_bytes());
        let forwarded = pump(&mut source, &handle).await.unwrap();
        assert_eq!(forwarded, 2);

        handle.shutdown();
        let stats = task.await.unwrap();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(engine.stats().rejected, 1);
    }
}
