//! Full-duplex joining of two byte streams.
//!
//! Each direction copies until EOF or error, then shuts down only the write
//! side of its destination so the peer sees end-of-stream while its own
//! in-flight data can still drain the other way. Both directions are joined
//! before the streams are dropped.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ProxyError;

const COPY_BUFFER_SIZE: usize = 8192;

/// A connection the proxy can join.
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Whether `shutdown` closes only the write direction and leaves the read
    /// direction usable. Streams without it cannot be joined safely.
    fn supports_half_close(&self) -> bool {
        false
    }
}

impl ProxyStream for TcpStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

#[cfg(unix)]
impl ProxyStream for tokio::net::UnixStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

impl ProxyStream for tokio::io::DuplexStream {
    fn supports_half_close(&self) -> bool {
        true
    }
}

/// Bytes moved by a joined connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Proxy data between `client` and `backend` until both directions finish.
///
/// Fails up front with [`ProxyError::HalfCloseUnsupported`] if either side
/// cannot half-close; nothing is copied in that case.
pub async fn join_streams<A, B>(client: A, backend: B) -> Result<JoinStats, ProxyError>
where
    A: ProxyStream,
    B: ProxyStream,
{
    if !client.supports_half_close() || !backend.supports_half_close() {
        return Err(ProxyError::HalfCloseUnsupported);
    }

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let (client_to_backend, backend_to_client) = tokio::join!(
        copy_then_half_close(&mut client_read, &mut backend_write, "client_to_backend"),
        copy_then_half_close(&mut backend_read, &mut client_write, "backend_to_client"),
    );

    Ok(JoinStats {
        client_to_backend,
        backend_to_client,
    })
}

/// Copy until EOF or error and shut down `dst`'s write side.
///
/// Returns the bytes written, even when the copy ended in an error.
async fn copy_then_half_close<R, W>(src: &mut R, dst: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let result = async {
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            dst.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    .await;

    if let Err(e) = result {
        debug!(direction, error = %e, bytes = total, "Copy ended with error");
    }
    if let Err(e) = dst.shutdown().await {
        debug!(direction, error = %e, "Half-close failed");
    }
    total
}
