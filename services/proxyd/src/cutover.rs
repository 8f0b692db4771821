//! One-way handoff from bootstrap probing to pod discovery.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::info;

/// Which mechanism currently owns backend registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Fixed candidate list probed by direct connects.
    Bootstrapping,
    /// Pod watch events drive the registry.
    Discovering,
}

/// Idempotent switch from [`Mode::Bootstrapping`] to [`Mode::Discovering`].
///
/// `fire` is a compare-and-set: only the first caller flips the switch and
/// publishes the signal, no matter how many discovery events race to fire it.
/// There is no way back.
pub struct Cutover {
    fired: AtomicBool,
    signal: watch::Sender<bool>,
}

impl Cutover {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            signal,
        }
    }

    /// Fire the cutover. Returns true only for the call that actually fired.
    pub fn fire(&self) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.signal.send_replace(true);
        info!("Cutover to pod discovery; stopping bootstrap probes");
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> Mode {
        if self.is_fired() {
            Mode::Discovering
        } else {
            Mode::Bootstrapping
        }
    }

    /// Resolve once the cutover has fired. Resolves immediately if it already
    /// has.
    pub async fn fired(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|fired| *fired).await.is_ok();
    }

    /// Receiver that flips to `true` when the cutover fires.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

impl Default for Cutover {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once `shutdown` carries `true`.
///
/// A dropped sender never resolves; only an explicit signal stops a loop.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}
