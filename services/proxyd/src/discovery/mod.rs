//! Pod-based API server discovery.
//!
//! ```text
//! watch frames -> WatchDecoder -> PodEvent -> DiscoveryWatcher -> BackendRegistry
//!                                                   |
//!                                                Cutover
//! ```

mod decode;
mod pod;
mod watcher;

pub use decode::{pod_events, DecodeError, WatchDecoder};
pub use pod::{ContainerReadiness, Pod, PodEvent};
pub use watcher::{DiscoveryWatcher, EventOutcome};
