//! Bootstrap probing.
//!
//! Before the cluster can report its own API servers, the proxy probes a
//! fixed list of candidate hosts with plain TCP connects and registers the
//! reachable ones as synthetic `bootstrap-<n>` backends. Each candidate gets
//! its own task; every task stops for good once the cutover fires or the
//! process shuts down, removing its backend on the way out.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, info, Instrument};

use crate::cutover::{shutdown_requested, Cutover};
use crate::proxy::{join_host_port, BackendOrigin, BackendRegistry, DEFAULT_BACKEND_PORT};

/// Default interval between probes of one candidate.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on a single probe connect.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the bootstrap probers.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Candidate hosts, in configured order. The index names the backend.
    pub endpoints: Vec<String>,
    /// Port probed (and later dialled) on every candidate.
    pub backend_port: u16,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl BootstrapConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            backend_port: DEFAULT_BACKEND_PORT,
            interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Backend id for the candidate at `index`.
///
/// Discovered backends use pod UIDs, which never take this form.
pub fn bootstrap_backend_id(index: usize) -> String {
    format!("bootstrap-{index}")
}

/// Spawn one probe task per candidate endpoint.
pub fn spawn_probers(
    config: BootstrapConfig,
    registry: Arc<BackendRegistry>,
    cutover: Arc<Cutover>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    info!(
        endpoint_count = config.endpoints.len(),
        interval_ms = config.interval.as_millis() as u64,
        "Starting bootstrap probes"
    );

    config
        .endpoints
        .iter()
        .enumerate()
        .map(|(index, endpoint)| {
            let prober = Prober {
                id: bootstrap_backend_id(index),
                endpoint: endpoint.clone(),
                target: join_host_port(endpoint, config.backend_port),
                interval: config.interval,
                probe_timeout: config.probe_timeout,
                registry: Arc::clone(&registry),
                cutover: Arc::clone(&cutover),
            };
            let span = tracing::info_span!("bootstrap", backend_id = %prober.id);
            tokio::spawn(prober.run(shutdown.clone()).instrument(span))
        })
        .collect()
}

struct Prober {
    id: String,
    endpoint: String,
    target: String,
    interval: Duration,
    probe_timeout: Duration,
    registry: Arc<BackendRegistry>,
    cutover: Arc<Cutover>,
}

impl Prober {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cutover.fired() => {
                    debug!(endpoint = %self.endpoint, "Cutover observed");
                    break;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    debug!(endpoint = %self.endpoint, "Shutdown observed");
                    break;
                }
                _ = ticker.tick() => self.probe_once().await,
            }
        }

        if self.registry.delete_backend(&self.id) {
            info!(endpoint = %self.endpoint, "Deregistered bootstrap backend");
        }
    }

    async fn probe_once(&self) {
        match probe(&self.target, self.probe_timeout).await {
            Ok(()) => {
                // A probe that raced the cutover must not re-register.
                if self.cutover.is_fired() {
                    return;
                }
                if self
                    .registry
                    .add_backend(&self.id, &self.endpoint, BackendOrigin::Bootstrap)
                {
                    info!(endpoint = %self.endpoint, "Registered bootstrap backend");
                }
            }
            Err(e) => {
                if self.registry.delete_backend(&self.id) {
                    info!(
                        endpoint = %self.endpoint,
                        error = %e,
                        "Deregistered unreachable bootstrap backend"
                    );
                } else {
                    debug!(endpoint = %self.endpoint, error = %e, "Bootstrap probe failed");
                }
            }
        }
    }
}

/// Connect to `target` and close the socket straight away.
async fn probe(target: &str, probe_timeout: Duration) -> io::Result<()> {
    let stream = timeout(probe_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "probe timeout"))??;
    drop(stream);
    Ok(())
}
