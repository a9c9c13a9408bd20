//! Passive network topology and local netproxy detection.
//!
//! Observations decoded from captured traffic are folded into a per-subnet view of
//! active hosts and into the state of the local netproxy, if one is present.
//! `topology::TopologyEngine` is the entry point; `ingest` puts a non-blocking queue
//! in front of it for capture threads.

pub mod config;
pub mod ingest;
pub mod logging;
pub mod network;
pub mod topology;

pub use config::{EngineConfig, IngestConfig, Settings};
pub use network::{interface::InterfaceInfo, subnet::SubnetKey};
pub use topology::{
    ObservationError, ObservationEvent, ProxyEvidence, RawObservation, TopologyEngine,
    TopologyReport,
};
