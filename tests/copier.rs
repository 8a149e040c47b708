use redmux::io::{ByteStream, ByteStreamRef, CopyStats, ForceClose, TwoWayCopier, loopback_pair};
use redmux::msg::{MsgByteStream, MsgStream, msg_pair};
use std::net::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use test_log::test;
use tokio::time::Instant;

#[test(tokio::test(start_paused = true))]
async fn test_half_close_grace_period() {
    let (client, a) = loopback_pair(1024);
    let (b, server) = loopback_pair(1024);
    let started = Instant::now();
    let task = tokio::spawn(TwoWayCopier::new(Arc::new(a), Arc::new(b)).run());

    client.write(b"request").await.unwrap();
    client.shutdown(Shutdown::Write).await.unwrap();
    let mut buf = [0u8; 7];
    server.read_full(&mut buf).await.unwrap();
    assert_eq!(&buf, b"request");

    // The server never finishes its side.
    let stats = task.await.unwrap().unwrap();
    let elapsed = started.elapsed();
    assert_eq!(stats.forced, Some(ForceClose::HalfCloseTimeout));
    assert_eq!(stats.a_to_b, 7);
    assert!(
        elapsed >= Duration::from_secs(9) && elapsed <= Duration::from_secs(11),
        "closed after {:?}",
        elapsed
    );

    // Both outer ends observe the teardown.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
}

#[test(tokio::test(start_paused = true))]
async fn test_custom_grace_without_jitter() {
    let (client, a) = loopback_pair(64);
    let (b, _server) = loopback_pair(64);
    let started = Instant::now();
    let task = tokio::spawn(
        TwoWayCopier::new(Arc::new(a), Arc::new(b))
            .half_close_timeout(Duration::from_secs(3))
            .half_close_jitter(Duration::ZERO)
            .run(),
    );
    client.shutdown(Shutdown::Write).await.unwrap();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.forced, Some(ForceClose::HalfCloseTimeout));
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[cfg(unix)]
#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_copy_between_sockets() {
    use redmux::io::{SocketOptions, SocketStream};
    use tokio::net::TcpListener;

    async fn socket_pair(opts: &SocketOptions) -> (SocketStream, SocketStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(SocketStream::connect(addr, opts), listener.accept());
        let server = SocketStream::from_tokio(accepted.unwrap().0, opts).unwrap();
        (client.unwrap(), server)
    }

    let opts = SocketOptions::default();
    let (client, a) = socket_pair(&opts).await;
    let (b, server) = socket_pair(&opts).await;
    let task = tokio::spawn(TwoWayCopier::new(Arc::new(a), Arc::new(b)).label("test").run());

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let echo = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        server.read_full(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        server.write(b"done").await.unwrap();
        server.shutdown(Shutdown::Write).await.unwrap();
        let mut rest = [0u8; 1];
        assert_eq!(server.read(&mut rest).await.unwrap(), 0);
        server.close().await.unwrap();
    });

    client.write(&payload).await.unwrap();
    client.shutdown(Shutdown::Write).await.unwrap();
    let mut reply = [0u8; 4];
    client.read_full(&mut reply).await.unwrap();
    assert_eq!(&reply, b"done");
    echo.await.unwrap();

    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.a_to_b, 64 * 1024);
    assert_eq!(stats.b_to_a, 4);
    assert_eq!(stats.forced, None);
    client.close().await.unwrap();
}

/// Client half-closes, side b never answers; the copier must give up after
/// a short grace period and close b even though a read on it is parked.
async fn grace_expires(b: ByteStreamRef) -> CopyStats {
    let (client, a) = loopback_pair(64);
    let task = tokio::spawn(
        TwoWayCopier::new(Arc::new(a), b)
            .half_close_timeout(Duration::from_millis(200))
            .half_close_jitter(Duration::ZERO)
            .run(),
    );
    client.shutdown(Shutdown::Write).await.unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("copier did not return after the grace period")
        .unwrap()
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    stats
}

#[test(tokio::test)]
async fn test_grace_expiry_closes_loopback() {
    let (b, server) = loopback_pair(64);
    let stats = grace_expires(Arc::new(b)).await;
    assert_eq!(stats.forced, Some(ForceClose::HalfCloseTimeout));
    let mut buf = [0u8; 1];
    assert_eq!(server.read(&mut buf).await.unwrap(), 0);
}

#[test(tokio::test)]
async fn test_grace_expiry_closes_message_stream() {
    let (b, peer) = msg_pair(8);
    let stats = grace_expires(Arc::new(MsgByteStream::new(Arc::new(b)))).await;
    assert_eq!(stats.forced, Some(ForceClose::HalfCloseTimeout));
    assert_eq!(peer.recv().await.unwrap(), None);
    assert!(peer.send(bytes::Bytes::from_static(b"late")).await.is_err());
}

#[cfg(unix)]
#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_grace_expiry_closes_socket() {
    use redmux::io::{SocketOptions, SocketStream};
    use tokio::io::AsyncReadExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let opts = SocketOptions::default();
    let (b, accepted) = tokio::join!(SocketStream::connect(addr, &opts), listener.accept());
    let (mut server, _) = accepted.unwrap();

    let stats = grace_expires(Arc::new(b.unwrap())).await;
    assert_eq!(stats.forced, Some(ForceClose::HalfCloseTimeout));
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), server.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
}
