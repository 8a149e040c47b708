#![cfg(unix)]

use redmux::{Config, RelayServer};
use std::net::SocketAddr;
use std::time::Duration;
use test_log::test;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = sock.split();
                if tokio::io::copy(&mut r, &mut w).await.is_ok() {
                    let _ = w.shutdown().await;
                }
            });
        }
    });
    addr
}

async fn start(yaml: String) -> SocketAddr {
    let config = Config::parse(&yaml).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Err(e) = RelayServer::new(config).serve(listener).await {
            tracing::error!("relay stopped: {:#}", e);
        }
    });
    addr
}

async fn round_trip(relay: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(relay).await.unwrap();
    let (mut r, mut w) = client.split();
    let writer = async {
        w.write_all(payload).await.unwrap();
        w.shutdown().await.unwrap();
    };
    let reader = async {
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        out
    };
    let ((), out) = timeout(WAIT, async { tokio::join!(writer, reader) })
        .await
        .unwrap();
    out
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_direct_relay() {
    let echo = echo_server().await;
    let relay = start(format!("mode: direct\nlisten: \"127.0.0.1:0\"\ntarget: \"{}\"\n", echo)).await;
    let data = payload(300 * 1024);
    assert!(round_trip(relay, &data).await == data);
    assert_eq!(round_trip(relay, b"again").await, b"again");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_tunnel_relay() {
    let echo = echo_server().await;
    // Both ends of a tunnel must agree on the mux settings.
    let mux = "mux:\n  window: 8\n  maxMessageSize: 4096\n";
    let server = start(format!("mode: tunnelServer\nlisten: \"127.0.0.1:0\"\n{}", mux)).await;
    let client = start(format!(
        "mode: tunnelClient\nlisten: \"127.0.0.1:0\"\ntarget: \"{}\"\nserver: \"{}\"\nlinks: 3\n{}",
        echo, server, mux
    ))
    .await;

    let data = payload(200 * 1024);
    assert!(round_trip(client, &data).await == data);

    // Concurrent connections share the one tunnel.
    let tasks: Vec<_> = (0..5)
        .map(|i| {
            tokio::spawn(async move {
                let data = payload(10_000 + i * 997);
                assert!(round_trip(client, &data).await == data);
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_tunnel_refused_target() {
    // Bound then dropped, so nothing listens there.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let server = start("mode: tunnelServer\nlisten: \"127.0.0.1:0\"\n".to_string()).await;
    let client = start(format!(
        "mode: tunnelClient\nlisten: \"127.0.0.1:0\"\ntarget: \"{}\"\nserver: \"{}\"\n",
        unused, server
    ))
    .await;

    let mut conn = TcpStream::connect(client).await.unwrap();
    let _ = conn.write_all(b"hello").await;
    let mut out = Vec::new();
    let result = timeout(WAIT, conn.read_to_end(&mut out)).await.unwrap();
    assert!(result.is_err() || out.is_empty());
}
