
use std::net::SocketAddr;
use std::time::Duration;

use harness::{eventually, tls_client_connect, ProxyHandle, TcpEchoBackend, TlsBackend};
use proxyd::BackendOrigin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn try_roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
    let result = timeout(Duration::from_millis(500), async {
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(_)) => Err("io error"),
        Err(_) => Err("timeout"),
    }
}

/// Whether the proxy closed the connection without sending anything.
async fn closed_by_proxy(addr: SocketAddr) -> bool {
    let Ok(mut stream) = TcpStream::connect(addr).await else {
        return true;
    };
    let mut buf = [0u8; 16];
    matches!(
        timeout(Duration::from_millis(500), stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

#[tokio::test]
async fn full_duplex_bytes_survive_intact() {
    let backend = TcpEchoBackend::spawn_v4().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.addr.port()).await.unwrap();
    proxy
        .registry
        .add_backend("uid-1", &backend.host(), BackendOrigin::Discovered);

    let stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let (mut read_half, mut write_half) = stream.into_split();

    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        for chunk in payload.chunks(3000) {
            write_half.write_all(chunk).await.unwrap();
        }
        // Half-close: the echo backend sees EOF, finishes, and closes.
        write_half.shutdown().await.unwrap();
    });

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), read_half.read_to_end(&mut received))
        .await
        .expect("echo should finish after client half-close")
        .unwrap();
    writer.await.unwrap();

    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "echoed bytes differ from sent bytes");

    assert!(
        eventually(Duration::from_secs(1), || {
            proxy.registry.get("uid-1").unwrap().connections == 0
        })
        .await,
        "connection count must be released after both directions finish"
    );
    assert_eq!(
        proxy.stat(|s| &s.bytes_to_backend),
        expected.len() as u64
    );
    assert_eq!(
        proxy.stat(|s| &s.bytes_from_backend),
        expected.len() as u64
    );
}

#[tokio::test]
async fn empty_registry_closes_without_dialling() {
    let backend = TcpEchoBackend::spawn_v4().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.addr.port()).await.unwrap();

    assert!(closed_by_proxy(proxy.listen_addr).await);
    assert!(
        eventually(Duration::from_secs(1), || {
            proxy.stat(|s| &s.rejected_no_backend) == 1
        })
        .await
    );
    assert_eq!(proxy.stat(|s| &s.dial_attempts), 0);
    assert_eq!(backend.connection_count(), 0);
}

#[tokio::test]
async fn deleted_backend_keeps_established_connection() {
    let backend = TcpEchoBackend::spawn_v4().await.unwrap();
    let proxy = ProxyHandle::spawn(backend.addr.port()).await.unwrap();
    proxy
        .registry
        .add_backend("uid-1", &backend.host(), BackendOrigin::Discovered);

    let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    assert_eq!(try_roundtrip(&mut stream, b"before").await.unwrap(), b"before");
    assert_eq!(proxy.registry.get("uid-1").unwrap().connections, 1);

    assert!(proxy.registry.delete_backend("uid-1"));

    // The in-flight connection keeps working.
    assert_eq!(try_roundtrip(&mut stream, b"after").await.unwrap(), b"after");

    // New connections no longer reach it.
    assert!(closed_by_proxy(proxy.listen_addr).await);
    assert_eq!(backend.connection_count(), 1);

    drop(stream);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(proxy.registry.is_empty());
}

#[tokio::test]
async fn held_connections_spread_by_least_connections() {
    let (first, second) = TcpEchoBackend::spawn_pair().await.unwrap();
    let proxy = ProxyHandle::spawn(first.addr.port()).await.unwrap();
    proxy
        .registry
        .add_backend("a-first", &first.host(), BackendOrigin::Discovered);
    proxy
        .registry
        .add_backend("b-second", &second.host(), BackendOrigin::Discovered);

    // Lowest id wins the tie.
    let mut conn1 = TcpStream::connect(proxy.listen_addr).await.unwrap();
    assert_eq!(try_roundtrip(&mut conn1, b"one").await.unwrap(), b"one");
    assert_eq!(first.connection_count(), 1);

    // "a-first" now carries one connection, so the next goes elsewhere.
    let mut conn2 = TcpStream::connect(proxy.listen_addr).await.unwrap();
    assert_eq!(try_roundtrip(&mut conn2, b"two").await.unwrap(), b"two");
    assert_eq!(second.connection_count(), 1);

    // Release the first and the tie goes back to "a-first".
    drop(conn1);
    assert!(
        eventually(Duration::from_secs(1), || {
            proxy.registry.get("a-first").unwrap().connections == 0
        })
        .await
    );

    let mut conn3 = TcpStream::connect(proxy.listen_addr).await.unwrap();
    assert_eq!(try_roundtrip(&mut conn3, b"three").await.unwrap(), b"three");
    assert_eq!(first.connection_count(), 2);
    assert_eq!(second.connection_count(), 1);

    drop(conn2);
    drop(conn3);
}

#[tokio::test]
async fn tls_passes_through_untouched() {
    let backend = TlsBackend::spawn_v4("kubernetes.default", "apiserver-ok")
        .await
        .unwrap();
    let proxy = ProxyHandle::spawn(backend.addr.port()).await.unwrap();
    proxy
        .registry
        .add_backend("bootstrap-0", "127.0.0.1", BackendOrigin::Bootstrap);

    let mut tls = timeout(
        Duration::from_secs(2),
        tls_client_connect(proxy.listen_addr, "kubernetes.default", &backend.cert_der),
    )
    .await
    .expect("handshake timeout")
    .expect("handshake through the proxy should succeed");

    tls.write_all(b"GET /healthz").await.unwrap();
    let mut response = Vec::new();
    let _ = timeout(Duration::from_secs(2), tls.read_to_end(&mut response)).await;
    assert_eq!(response, backend.marker.as_bytes());
    assert_eq!(
        backend.connections.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}
