//! Error types for the front-door proxy.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Proxy errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Could not bind the inbound listener.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Non-transient accept failure. Fatal for the whole proxy.
    #[error("accept_failed: {0}")]
    Accept(#[source] io::Error),

    /// Backend refused or reset the dial.
    #[error("dial_failed: {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Backend did not answer within the connect timeout.
    #[error("dial_timeout: {target} after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    /// One side of a joined connection cannot shut down only its write half.
    #[error("half_close_unsupported")]
    HalfCloseUnsupported,

    /// Trust bundle could not be read at startup.
    #[error("trust_bundle_unreadable: {}: {source}", .path.display())]
    TrustBundle {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Pod watch source could not be opened.
    #[error("watch_source_failed: {0}")]
    WatchSource(#[source] io::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ProxyError::Bind { .. } => "bind_failed",
            ProxyError::Accept(_) => "accept_failed",
            ProxyError::Dial { .. } => "dial_failed",
            ProxyError::DialTimeout { .. } => "dial_timeout",
            ProxyError::HalfCloseUnsupported => "half_close_unsupported",
            ProxyError::TrustBundle { .. } => "trust_bundle_unreadable",
            ProxyError::WatchSource(_) => "watch_source_failed",
            ProxyError::Io(_) => "io_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_matches_display_prefix() {
        let err = ProxyError::DialTimeout {
            target: "10.0.0.5:6443".to_string(),
            timeout: Duration::from_millis(100),
        };
        assert_eq!(err.reason_code(), "dial_timeout");
        assert!(err.to_string().starts_with("dial_timeout: 10.0.0.5:6443"));

        let err = ProxyError::TrustBundle {
            path: PathBuf::from("/etc/kubernetes/pki/ca.crt"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err
            .to_string()
            .starts_with("trust_bundle_unreadable: /etc/kubernetes/pki/ca.crt"));
    }
}
