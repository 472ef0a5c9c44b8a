//! Relay lifecycle tests: payload integrity, teardown, dial failures,
//! header read failures and the connection limit.


use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use tcpgate_ingress::ListenerConfig;

use harness::{dead_addr, eventually, service, CapturingBackend, IngressHandle, TcpEchoBackend};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let ingress = IngressHandle::spawn(vec![service(0, backend.addr, None)])
        .await
        .unwrap();

    // Many relay chunks in each direction.
    let data = payload(64 * 1024 + 17);

    let result = timeout(TEST_TIMEOUT, async {
        let stream = TcpStream::connect(ingress.listen_addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        let expected = data.clone();
        let sender = tokio::spawn(async move { writer.write_all(&expected).await.map(|_| writer) });

        let mut echoed = vec![0u8; data.len()];
        reader.read_exact(&mut echoed).await?;
        let _writer = sender.await.map_err(std::io::Error::other)??;
        Ok::<_, std::io::Error>(echoed)
    })
    .await;

    match result {
        Ok(Ok(echoed)) => assert!(echoed == data, "echoed payload differs"),
        Ok(Err(e)) => panic!("round trip through proxy failed: {}", e),
        Err(_) => panic!("test timed out"),
    }

    let expected = data.len() as u64;
    assert!(eventually(|| backend.bytes_received.load(Ordering::Relaxed) == expected).await);
    assert!(eventually(|| ingress.count(|s| &s.bytes_to_backend) == expected).await);
    assert!(eventually(|| ingress.count(|s| &s.bytes_from_backend) == expected).await);
}

#[tokio::test]
async fn test_header_is_forwarded_before_later_bytes() {
    let mut backend = CapturingBackend::spawn().await.unwrap();
    let ingress = IngressHandle::spawn(vec![service(0, backend.addr, None)])
        .await
        .unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(b"first-").await.unwrap();

    let mut upstream = backend.next().await;
    client.write_all(b"second").await.unwrap();

    let mut received = [0u8; 12];
    timeout(TEST_TIMEOUT, upstream.read_exact(&mut received))
        .await
        .expect("test timed out")
        .unwrap();
    assert_eq!(&received, b"first-second");

    upstream.write_all(b"reply").await.unwrap();
    let mut reply = [0u8; 5];
    timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
        .await
        .expect("test timed out")
        .unwrap();
    assert_eq!(&reply, b"reply");
}

#[tokio::test]
async fn test_backend_close_closes_client() {
    let mut backend = CapturingBackend::spawn().await.unwrap();
    let ingress = IngressHandle::spawn(vec![service(0, backend.addr, None)])
        .await
        .unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(b"hello").await.unwrap();

    let mut upstream = backend.next().await;
    let mut buf = [0u8; 5];
    upstream.read_exact(&mut buf).await.unwrap();
    upstream.write_all(b"bye").await.unwrap();
    drop(upstream);

    // Whatever the backend sent before closing still arrives, then EOF.
    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, client.read_to_end(&mut received))
        .await
        .expect("client was never closed")
        .unwrap();
    assert!(b"bye".starts_with(&received));

    assert!(eventually(|| ingress.count(|s| &s.connections_closed) == 1).await);
    assert_eq!(ingress.count(|s| &s.connections_active), 0);
}

#[tokio::test]
async fn test_client_half_close_closes_backend() {
    let mut backend = CapturingBackend::spawn().await.unwrap();
    let ingress = IngressHandle::spawn(vec![service(0, backend.addr, None)])
        .await
        .unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    client.write_all(b"request").await.unwrap();

    let mut upstream = backend.next().await;
    let mut buf = [0u8; 7];
    upstream.read_exact(&mut buf).await.unwrap();

    // Only the write side is closed; the session ends anyway.
    client.shutdown().await.unwrap();

    let mut rest = Vec::new();
    let closed = timeout(TEST_TIMEOUT, upstream.read_to_end(&mut rest)).await;
    match closed {
        Ok(Ok(_)) | Ok(Err(_)) => assert!(rest.is_empty()),
        Err(_) => panic!("backend was never closed"),
    }

    let mut tail = Vec::new();
    let closed = timeout(TEST_TIMEOUT, client.read_to_end(&mut tail)).await;
    assert!(closed.is_ok(), "client read side was never closed");
}

#[tokio::test]
async fn test_dial_failure_keeps_listener_serving() {
    let unreachable = dead_addr().await;
    let ingress = IngressHandle::spawn(vec![service(0, unreachable, None)])
        .await
        .unwrap();

    for attempt in 1..=3u64 {
        let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
        client.write_all(b"anyone there?").await.unwrap();

        let mut buf = [0u8; 16];
        let result = timeout(TEST_TIMEOUT, client.read(&mut buf))
            .await
            .expect("client was never closed");
        assert!(matches!(result, Ok(0) | Err(_)));

        assert!(eventually(|| ingress.count(|s| &s.dial_failed) == attempt).await);
    }

    assert_eq!(ingress.count(|s| &s.dial_attempts), 3);
    assert_eq!(ingress.count(|s| &s.connections_accepted), 3);
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let ingress = IngressHandle::spawn(vec![service(0, backend.addr, None)])
        .await
        .unwrap();
    let addr = ingress.listen_addr;

    let result = timeout(TEST_TIMEOUT, async move {
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..20u8 {
            tasks.spawn(async move {
                let mut stream = TcpStream::connect(addr).await?;
                let message = vec![i; 3000];
                stream.write_all(&message).await?;
                let mut echoed = vec![0u8; message.len()];
                stream.read_exact(&mut echoed).await?;
                Ok::<_, std::io::Error>(echoed == message)
            });
        }

        let mut matched = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.map_err(std::io::Error::other)?? {
                matched += 1;
            }
        }
        Ok::<_, std::io::Error>(matched)
    })
    .await;

    match result {
        Ok(Ok(matched)) => assert_eq!(matched, 20),
        Ok(Err(e)) => panic!("concurrent round trips failed: {}", e),
        Err(_) => panic!("test timed out"),
    }
    assert_eq!(backend.connection_count(), 20);
}

#[tokio::test]
async fn test_reset_during_header_read_drops_only_that_connection() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let ingress = IngressHandle::spawn(vec![service(0, backend.addr, None)])
        .await
        .unwrap();

    let mut client = TcpStream::connect(ingress.listen_addr).await.unwrap();
    // Half a TLS record header keeps the proxy waiting for more.
    client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();
    assert!(eventually(|| ingress.count(|s| &s.connections_accepted) == 1).await);

    // Zero linger turns the close into a reset.
    #[allow(deprecated)]
    client.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);

    assert!(eventually(|| ingress.count(|s| &s.header_read_failed) == 1).await);
    assert!(eventually(|| ingress.count(|s| &s.connections_closed) == 1).await);
    assert_eq!(ingress.count(|s| &s.dial_attempts), 0);
    assert_eq!(backend.connection_count(), 0);

    // The listener keeps serving.
    let result = timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(ingress.listen_addr).await?;
        stream.write_all(b"still here").await?;
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await;

    match result {
        Ok(Ok(echo)) => assert_eq!(&echo, b"still here"),
        Ok(Err(e)) => panic!("echo through proxy failed: {}", e),
        Err(_) => panic!("test timed out"),
    }
    assert_eq!(ingress.count(|s| &s.header_read_failed), 1);
}

#[tokio::test]
async fn test_connections_over_limit_are_rejected() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let config = ListenerConfig {
        max_connections: 1,
        ..ListenerConfig::default()
    };
    let ingress = IngressHandle::spawn_with_config(vec![service(0, backend.addr, None)], config)
        .await
        .unwrap();

    // Hold the only slot with a live session.
    let mut first = TcpStream::connect(ingress.listen_addr).await.unwrap();
    first.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, first.read_exact(&mut buf))
        .await
        .expect("test timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");

    let mut second = TcpStream::connect(ingress.listen_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let result = timeout(TEST_TIMEOUT, second.read(&mut buf))
        .await
        .expect("over-limit connection was never closed");
    assert!(matches!(result, Ok(0) | Err(_)));

    assert_eq!(ingress.count(|s| &s.connections_rejected), 1);
    assert_eq!(ingress.count(|s| &s.connections_accepted), 1);
    assert_eq!(backend.connection_count(), 1);

    // The first session is unaffected.
    first.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, first.read_exact(&mut buf))
        .await
        .expect("test timed out")
        .unwrap();
    assert_eq!(&buf, b"pong");
}
