#![cfg(unix)]

use rand::Rng;
use redmux::Error;
use redmux::io::{ByteStream, ReadStrategy, SocketOptions, SocketStream};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use test_log::test;

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn strategies() -> Vec<ReadStrategy> {
    vec![
        ReadStrategy::Direct,
        ReadStrategy::Async,
        #[cfg(target_os = "linux")]
        ReadStrategy::Epoll,
    ]
}

fn stream_pair(opts: &SocketOptions) -> (SocketStream, SocketStream) {
    let (a, b) = tcp_pair();
    (
        SocketStream::new(a, opts).unwrap(),
        SocketStream::new(b, opts).unwrap(),
    )
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + i / 253) as u8).collect()
}

async fn read_to_end(stream: &SocketStream, max_chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; max_chunk];
    loop {
        let len = rand::rng().random_range(1..=max_chunk);
        let n = stream.read(&mut buf[..len]).await.unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_no_loss_or_duplication() {
    let data = Arc::new(pattern(200 * 1024 + 17));
    for strategy in strategies() {
        for read_ahead in [None, Some(1), Some(16), Some(256), Some(4096)] {
            let opts = SocketOptions::default()
                .read_strategy(strategy)
                .read_ahead(read_ahead.is_some(), read_ahead.unwrap_or(256));
            let (writer, reader) = stream_pair(&opts);
            let payload = data.clone();
            let write_task = tokio::spawn(async move {
                let mut pos = 0;
                while pos < payload.len() {
                    let len = rand::rng().random_range(1..=3000).min(payload.len() - pos);
                    writer.write(&payload[pos..pos + len]).await.unwrap();
                    pos += len;
                }
                writer.shutdown(Shutdown::Write).await.unwrap();
                writer
            });
            let received = read_to_end(&reader, 700).await;
            assert!(
                received == *data,
                "{:?} read-ahead {:?}: got {} bytes",
                strategy,
                read_ahead,
                received.len()
            );
            assert!(!reader.state().can_read());
            let writer = write_task.await.unwrap();
            writer.close().await.unwrap();
            reader.close().await.unwrap();
        }
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_close_is_idempotent() {
    for strategy in strategies() {
        let opts = SocketOptions::default().read_strategy(strategy);
        let (a, b) = stream_pair(&opts);
        a.close().await.unwrap();
        a.close().await.unwrap();
        assert!(a.state().is_closed());

        b.shutdown(Shutdown::Write).await.unwrap();
        b.shutdown(Shutdown::Write).await.unwrap();
        b.close().await.unwrap();
        b.close().await.unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(a.read(&mut buf).await, Err(Error::Closed)));
        assert!(matches!(a.write(b"x").await, Err(Error::Closed)));
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_second_read_fails_fast() {
    for strategy in strategies() {
        let opts = SocketOptions::default().read_strategy(strategy);
        let (a, _b) = stream_pair(&opts);
        let a = Arc::new(a);
        let pending = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                a.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).await.unwrap_err();
        assert!(err.is_protocol_violation(), "{:?}: {}", strategy, err);

        // Closing underneath the pending read fails it instead of hanging.
        a.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Closed)), "{:?}", strategy);
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_small_reads_fill_read_ahead() {
    let opts = SocketOptions::default()
        .read_strategy(ReadStrategy::Async)
        .read_ahead(true, 256);
    let (a, b) = stream_pair(&opts);
    a.write(&pattern(100)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut one = [0u8; 1];
    assert_eq!(b.read(&mut one).await.unwrap(), 1);
    assert_eq!(b.buffered(), Some(99));

    let mut rest = [0u8; 99];
    b.read_full(&mut rest).await.unwrap();
    assert_eq!(b.buffered(), Some(0));
    let mut all = one.to_vec();
    all.extend_from_slice(&rest);
    assert_eq!(all, pattern(100));
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_read_full_hits_eof() {
    let opts = SocketOptions::default();
    let (a, b) = stream_pair(&opts);
    a.write(b"short").await.unwrap();
    a.shutdown(Shutdown::Write).await.unwrap();
    let mut buf = [0u8; 16];
    assert!(matches!(
        b.read_full(&mut buf).await,
        Err(Error::UnexpectedEof(_))
    ));
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_connect_and_addresses() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let opts = SocketOptions::default();
    let (client, accepted) = tokio::join!(SocketStream::connect(addr, &opts), listener.accept());
    let client = client.unwrap();
    let (server, peer) = accepted.unwrap();
    let server = SocketStream::from_tokio(server, &opts).unwrap();
    assert_eq!(client.peer_addr(), Some(addr));
    assert_eq!(server.peer_addr(), Some(peer));
    assert_eq!(client.local_addr(), Some(peer));

    client.write(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_full(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[cfg(target_os = "linux")]
#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_epoll_megabyte_in_odd_chunks() {
    use redmux::io::Reactors;

    const TOTAL: usize = 1024 * 1024;
    let reactors = Reactors::start("scenario").unwrap();
    let opts = SocketOptions::default()
        .read_strategy(ReadStrategy::Epoll)
        .read_ahead(true, 256);
    let (a, b) = tcp_pair();
    let writer = SocketStream::with_reactors(a, &opts, &reactors).unwrap();
    let reader = SocketStream::with_reactors(b, &opts, &reactors).unwrap();

    let [read_side, _] = reactors.snapshot();
    assert_eq!(read_side.name, "scenario-read");
    assert_eq!(read_side.handlers.len(), 2);

    let data = Arc::new(pattern(TOTAL));
    let payload = data.clone();
    let write_task = tokio::spawn(async move {
        for chunk in payload.chunks(4096) {
            writer.write(chunk).await.unwrap();
        }
        writer.shutdown(Shutdown::Write).await.unwrap();
        writer
    });

    let mut received = Vec::with_capacity(TOTAL);
    let mut buf = [0u8; 13];
    loop {
        let n = reader.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received.len(), TOTAL);
    assert!(received == *data);

    let writer = write_task.await.unwrap();
    writer.close().await.unwrap();
    reader.close().await.unwrap();
    assert!(reactors.read.is_empty());
    assert!(reactors.write.is_empty());
    reactors.stop();
}
