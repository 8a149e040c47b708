use bytes::Bytes;
use redmux::io::StreamState;
use redmux::msg::{AllToOne, InverseMux, MemMsgStream, MsgStream, MsgStreamRef, msg_pair};
use std::sync::Arc;
use test_log::test;

fn pairs(n: usize, capacity: usize) -> (Vec<MsgStreamRef>, Vec<Arc<MemMsgStream>>) {
    let mut local: Vec<MsgStreamRef> = Vec::new();
    let mut remote = Vec::new();
    for _ in 0..n {
        let (a, b) = msg_pair(capacity);
        local.push(Arc::new(a));
        remote.push(Arc::new(b));
    }
    (local, remote)
}

fn msg(i: usize) -> Bytes {
    Bytes::from(format!("message-{}", i))
}

#[test(tokio::test)]
async fn test_sends_spread_evenly() {
    let (local, remote) = pairs(3, 64);
    let mux = AllToOne::new(local).unwrap();
    for i in 0..12 {
        mux.send(msg(i)).await.unwrap();
    }
    for (k, peer) in remote.iter().enumerate() {
        peer.shutdown().await.unwrap();
        for round in 0..4 {
            assert_eq!(peer.recv().await.unwrap().unwrap(), msg(round * 3 + k));
        }
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_senders_spread_evenly() {
    let (local, remote) = pairs(3, 64);
    let mux = Arc::new(AllToOne::new(local).unwrap());
    let tasks: Vec<_> = (0..4)
        .map(|t| {
            let mux = mux.clone();
            tokio::spawn(async move {
                for i in 0..3 {
                    mux.send(msg(t * 3 + i)).await.unwrap();
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }
    mux.shutdown().await.unwrap();

    let mut all = Vec::new();
    for peer in &remote {
        let mut count = 0;
        while let Some(m) = peer.recv().await.unwrap() {
            all.push(m);
            count += 1;
        }
        assert_eq!(count, 4);
    }
    all.sort();
    let mut expected: Vec<Bytes> = (0..12).map(msg).collect();
    expected.sort();
    assert_eq!(all, expected);
}

#[test(tokio::test)]
async fn test_state_folds_members() {
    let (local, remote) = pairs(2, 4);
    let mux = InverseMux::new(vec![local[0].clone()], vec![local[1].clone()]).unwrap();
    assert_eq!(mux.state(), StreamState::OPEN);

    local[0].shutdown().await.unwrap();
    assert_eq!(mux.state(), StreamState::LOCAL_SHUTDOWN);

    remote[1].shutdown().await.unwrap();
    assert_eq!(local[1].recv().await.unwrap(), None);
    assert!(mux.state().is_closed());
}

async fn ordering_over_links(pre_read: bool) {
    let (left, right) = pairs(3, 16);
    let right: Vec<MsgStreamRef> = right.into_iter().map(|r| r as MsgStreamRef).collect();
    let a = Arc::new(AllToOne::new(left).unwrap().pre_read(pre_read));
    let b = AllToOne::new(right).unwrap().pre_read(pre_read);

    let sender = {
        let a = a.clone();
        tokio::spawn(async move {
            for i in 0..100 {
                a.send(msg(i)).await.unwrap();
            }
            a.shutdown().await.unwrap();
        })
    };
    for i in 0..100 {
        assert_eq!(b.recv().await.unwrap().unwrap(), msg(i), "pre_read={}", pre_read);
    }
    assert_eq!(b.recv().await.unwrap(), None);
    // The stream stays finished once a member ended.
    assert_eq!(b.recv().await.unwrap(), None);
    sender.await.unwrap();
    b.close().await.unwrap();
}

#[test(tokio::test)]
async fn test_order_preserved() {
    ordering_over_links(false).await;
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn test_order_preserved_with_pre_read() {
    ordering_over_links(true).await;
}

#[test(tokio::test)]
async fn test_close_reaches_every_member() {
    let (local, remote) = pairs(3, 4);
    let mux = AllToOne::new(local.clone()).unwrap().pre_read(true);
    mux.close().await.unwrap();
    mux.close().await.unwrap();
    for (member, peer) in local.iter().zip(&remote) {
        assert!(member.state().is_closed());
        assert_eq!(peer.recv().await.unwrap(), None);
    }
    assert!(mux.state().is_closed());
}

#[test(tokio::test)]
async fn test_member_error_surfaces() {
    let (local, remote) = pairs(2, 4);
    let mux = AllToOne::new(local.clone()).unwrap();
    remote[0].close().await.unwrap();
    assert!(mux.send(msg(0)).await.unwrap_err().is_fault());
    // The cursor still advances past the broken member.
    mux.send(msg(1)).await.unwrap();
    assert_eq!(remote[1].recv().await.unwrap().unwrap(), msg(1));
}
