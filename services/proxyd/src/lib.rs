pub mod bootstrap;
pub mod credentials;
pub mod cutover;
pub mod discovery;
pub mod error;
pub mod proxy;

pub use bootstrap::{bootstrap_backend_id, spawn_probers, BootstrapConfig};
pub use credentials::{Condition, FileExists, TrustBundle};
pub use cutover::{Cutover, Mode};
pub use discovery::{pod_events, DiscoveryWatcher, EventOutcome, Pod, PodEvent, WatchDecoder};
pub use error::ProxyError;
pub use proxy::{
    Backend, BackendOrigin, BackendRegistry, Listener, ListenerConfig, ListenerStats, ProxyStream,
};
