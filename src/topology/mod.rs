/*!
Topology module

This module holds the live topology state and the engine that maintains it.

Structure:
- `store`: Per-subnet host membership with staleness-based eviction.
- `netproxy`: The (at most one) locally detected netproxy and its remote peers.
- `engine`: `TopologyEngine`, which validates observations, fans them out to the store
            and the tracker, runs maintenance and serves reports.
- `event`: Typed and raw observation events.
- `source`: A small async trait (`ObservationSource`) for capture-side collaborators.
- `error`: `ObservationError`, returned for every rejected input.

Re-exports:
- `TopologyEngine`, `TopologyReport` and `ObservationEvent` for easy consumption by callers.
*/

pub mod engine;
pub mod error;
pub mod event;
pub mod netproxy;
pub mod source;
pub mod store;

pub use engine::{TopologyEngine, TopologyReport};
pub use error::ObservationError;
pub use event::{ObservationEvent, ProxyEvidence, RawObservation};
