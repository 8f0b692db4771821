//! proxyd
//!
//! Front-door TCP proxy for the cluster control plane.
//!
//! This service:
//! - Probes a fixed list of bootstrap hosts until the control plane is up
//! - Waits for admin credentials, then follows API server pods
//! - Cuts over from bootstrap probing to pod discovery exactly once
//! - Proxies every inbound connection to the least-loaded API server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use proxyd::{
    pod_events, spawn_probers, BackendRegistry, Cutover, DiscoveryWatcher, FileExists, Listener,
    ProxyError, TrustBundle,
};

mod config;

/// How long shutdown waits for bootstrap probes to deregister.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to PROXYD_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting proxyd");
    info!(
        listen_addr = %config.listen_addr,
        bootstrap_endpoints = ?config.bootstrap_endpoints,
        backend_port = config.backend_port,
        credentials_file = %config.credentials_file.display(),
        "Configuration loaded"
    );

    let trust_bundle = TrustBundle::load(&config.trust_bundle)
        .await
        .context("Failed to load trust bundle")?;
    info!(
        path = %trust_bundle.path().display(),
        bytes = trust_bundle.len(),
        "Trust bundle loaded"
    );

    let registry = Arc::new(BackendRegistry::new());
    let cutover = Arc::new(Cutover::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probers = spawn_probers(
        config.bootstrap(),
        Arc::clone(&registry),
        Arc::clone(&cutover),
        shutdown_rx.clone(),
    );

    let discovery = tokio::spawn({
        let watcher = DiscoveryWatcher::new(Arc::clone(&registry), Arc::clone(&cutover));
        let gate = FileExists::new(vec![config.credentials_file.clone()]);
        let source = config.watch_source.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move {
            let open = async move {
                let reader: Box<dyn AsyncBufRead + Unpin + Send> = match source {
                    Some(path) => {
                        info!(path = %path.display(), "Opening pod watch source");
                        let file = tokio::fs::File::open(&path)
                            .await
                            .map_err(ProxyError::WatchSource)?;
                        Box::new(BufReader::new(file))
                    }
                    None => {
                        info!("Reading pod watch frames from stdin");
                        Box::new(BufReader::new(tokio::io::stdin()))
                    }
                };
                Ok(pod_events(reader))
            };

            if let Err(e) = watcher.run(&gate, open, shutdown_rx).await {
                error!(reason = e.reason_code(), error = %e, "Discovery stopped");
            }
        }
    });

    let listener = Arc::new(Listener::bind(config.listener(), Arc::clone(&registry)).await?);

    let result = tokio::select! {
        result = Arc::clone(&listener).run() => {
            result.context("Listener failed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    // Signal shutdown to probes and discovery
    let _ = shutdown_tx.send(true);
    discovery.abort();

    info!("Waiting for bootstrap probes to stop...");
    for handle in probers {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Bootstrap probe did not stop in time");
        }
    }

    info!(
        mode = ?cutover.mode(),
        backends = registry.len(),
        "proxyd shutdown complete"
    );
    result
}
