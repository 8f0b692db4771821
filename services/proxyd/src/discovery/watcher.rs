//! API-server discovery from pod lifecycle events.
//!
//! Events are applied one at a time, in stream order:
//! - Added: register a pod that has an IP and only ready containers
//! - Updated: deregister as soon as a container is not ready; register when
//!   the pod first gets an IP with every container ready
//! - Deleted: deregister unconditionally
//!
//! Every registration fires the cutover. Only the first one has an effect.

use std::future::Future;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::pod::{Pod, PodEvent};
use crate::credentials::Condition;
use crate::cutover::{shutdown_requested, Cutover};
use crate::error::ProxyError;
use crate::proxy::{BackendOrigin, BackendRegistry};

/// What handling one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// The pod is (still) registered. `cutover_fired` is true only for the
    /// event that flipped the cutover.
    Registered { cutover_fired: bool },
    /// The pod's backend was removed.
    Deregistered,
    /// Nothing changed.
    Ignored(&'static str),
}

/// Applies pod events to the backend registry.
pub struct DiscoveryWatcher {
    registry: Arc<BackendRegistry>,
    cutover: Arc<Cutover>,
}

impl DiscoveryWatcher {
    pub fn new(registry: Arc<BackendRegistry>, cutover: Arc<Cutover>) -> Self {
        Self { registry, cutover }
    }

    /// Wait for `gate`, open the event stream, and apply events until the
    /// stream ends or shutdown is signalled.
    ///
    /// `open` is not polled until the gate holds.
    pub async fn run<C, F, S>(
        &self,
        gate: &C,
        open: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError>
    where
        C: Condition + ?Sized,
        F: Future<Output = Result<S, ProxyError>>,
        S: Stream<Item = PodEvent>,
    {
        info!(condition = %gate.describe(), "Discovery waiting for credentials");
        tokio::select! {
            _ = gate.wait() => {}
            _ = shutdown_requested(&mut shutdown) => return Ok(()),
        }

        let events = open.await?;
        tokio::pin!(events);
        info!("Discovery watching API server pods");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Discovery shutting down");
                    return Ok(());
                }
                event = events.next() => {
                    let Some(event) = event else {
                        warn!("Pod watch stream ended");
                        return Ok(());
                    };
                    self.handle_event(event);
                }
            }
        }
    }

    /// Apply a single event.
    pub fn handle_event(&self, event: PodEvent) -> EventOutcome {
        let kind = event.kind();
        let outcome = match event {
            PodEvent::Added(pod) => self.on_added(pod),
            PodEvent::Updated { old, new } => self.on_updated(old, new),
            PodEvent::Deleted(pod) => self.on_deleted(pod),
        };

        if let EventOutcome::Ignored(reason) = outcome {
            debug!(event = kind, reason, "Pod event ignored");
        }
        outcome
    }

    fn on_added(&self, pod: Pod) -> EventOutcome {
        if let Some(reason) = skip_reason(&pod) {
            return EventOutcome::Ignored(reason);
        }
        let Some(ip) = pod.ip() else {
            return EventOutcome::Ignored("no pod IP");
        };
        if !pod.all_ready() {
            return EventOutcome::Ignored("containers not ready");
        }
        self.register(&pod, ip)
    }

    fn on_updated(&self, old: Pod, new: Pod) -> EventOutcome {
        if let Some(reason) = skip_reason(&old) {
            return EventOutcome::Ignored(reason);
        }

        if !new.all_ready() {
            if self.registry.delete_backend(&new.uid) {
                info!(
                    pod = %new.name,
                    uid = %new.uid,
                    ip = new.ip().unwrap_or_default(),
                    "Deregistered unhealthy API server"
                );
                return EventOutcome::Deregistered;
            }
            return EventOutcome::Ignored("not registered");
        }

        match (old.ip(), new.ip()) {
            (None, Some(ip)) => self.register(&new, ip),
            _ => EventOutcome::Ignored("no IP transition"),
        }
    }

    fn on_deleted(&self, pod: Pod) -> EventOutcome {
        if let Some(reason) = skip_reason(&pod) {
            return EventOutcome::Ignored(reason);
        }
        if self.registry.delete_backend(&pod.uid) {
            info!(
                pod = %pod.name,
                uid = %pod.uid,
                ip = pod.ip().unwrap_or_default(),
                "Deregistered API server"
            );
            EventOutcome::Deregistered
        } else {
            EventOutcome::Ignored("not registered")
        }
    }

    fn register(&self, pod: &Pod, ip: &str) -> EventOutcome {
        if self
            .registry
            .add_backend(&pod.uid, ip, BackendOrigin::Discovered)
        {
            info!(pod = %pod.name, uid = %pod.uid, ip = %ip, "Registered API server");
        }
        EventOutcome::Registered {
            cutover_fired: self.cutover.fire(),
        }
    }
}

fn skip_reason(pod: &Pod) -> Option<&'static str> {
    if !pod.is_api_server() {
        return Some("not an API server");
    }
    if pod.uid.is_empty() {
        warn!(pod = %pod.name, "API server pod event without uid");
        return Some("missing uid");
    }
    None
}
