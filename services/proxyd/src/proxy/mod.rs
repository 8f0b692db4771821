//! L4 front-door proxy.
//!
//! This module provides:
//! - The backend registry with least-connections selection
//! - The TCP accept loop
//! - Full-duplex joining with half-close
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> BackendRegistry::select_backend -> dial -> join_streams
//!                              ^               ^
//!                     bootstrap probes   discovery watcher
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendRegistry, Listener, ListenerConfig};
//!
//! let registry = Arc::new(BackendRegistry::new());
//! let config = ListenerConfig::new("0.0.0.0:443".parse()?);
//! let listener = Arc::new(Listener::bind(config, registry).await?);
//! listener.run().await?;
//! ```

mod backend;
mod listener;
mod stream;

pub use backend::{join_host_port, Backend, BackendOrigin, BackendRegistry, ConnectionLease};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_BACKEND_PORT, DEFAULT_CONNECT_TIMEOUT,
};
pub use stream::{join_streams, JoinStats, ProxyStream};
