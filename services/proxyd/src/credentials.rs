//! Credential material and startup gates.
//!
//! The proxy never parses credentials itself. It holds the cluster trust
//! bundle as opaque bytes and waits for the admin credentials file to exist
//! before discovery starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ProxyError;

/// Default poll interval for [`FileExists`].
pub const DEFAULT_FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A precondition that must hold before a component starts.
#[async_trait]
pub trait Condition: Send + Sync {
    /// Block until the condition holds.
    async fn wait(&self);

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Holds once every listed path exists.
#[derive(Debug, Clone)]
pub struct FileExists {
    paths: Vec<PathBuf>,
    poll_interval: Duration,
}

impl FileExists {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            poll_interval: DEFAULT_FILE_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn all_exist(&self) -> bool {
        for path in &self.paths {
            match tokio::fs::try_exists(path).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat awaited file");
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl Condition for FileExists {
    async fn wait(&self) {
        let mut logged = false;
        while !self.all_exist().await {
            if !logged {
                info!(condition = %self.describe(), "Waiting for files to exist");
                logged = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn describe(&self) -> String {
        let paths: Vec<String> = self
            .paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        format!("files exist: {}", paths.join(", "))
    }
}

/// Opaque cluster CA bundle.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    path: PathBuf,
    pem: Arc<[u8]>,
}

impl TrustBundle {
    /// Read the bundle from disk. A missing or unreadable file is a startup
    /// error.
    pub async fn load(path: &Path) -> Result<Self, ProxyError> {
        let pem = tokio::fs::read(path)
            .await
            .map_err(|source| ProxyError::TrustBundle {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            pem: pem.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pem
    }

    pub fn len(&self) -> usize {
        self.pem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pem.is_empty()
    }
}
