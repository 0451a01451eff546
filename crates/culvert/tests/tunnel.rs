//! Tunnel-level scenarios over in-process stream pairs.
//!
//! The far side of every tunnel here is driven by hand with the raw codec,
//! so each property is observed on the wire rather than through a second
//! endpoint.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::time::timeout;

use culvert::tunnel::Tunnel;
use culvert::{Message, NO_CALL_ID, RpcError, read_message, write_message};

const WAIT: Duration = Duration::from_secs(5);

fn single_link_tunnel() -> (Arc<Tunnel>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(1 << 16);
    (Tunnel::new(vec![local]), remote)
}

/// Run the tunnel's routing side until it dies, like an endpoint's receive
/// loop would. Unsolicited messages are discarded.
fn drive(tunnel: Arc<Tunnel>) {
    tokio::spawn(async move {
        while tunnel.is_alive() {
            tunnel.listen().await;
        }
    });
}

#[tokio::test]
async fn concurrent_calls_get_distinct_ids_and_isolated_responses() {
    let (tunnel, mut remote) = single_link_tunnel();
    drive(tunnel.clone());

    const K: usize = 50;
    let mut calls = Vec::with_capacity(K);
    for i in 0..K {
        let call = tunnel.call(9, Bytes::from(vec![i as u8])).await.unwrap();
        calls.push(call);
    }

    // Echo every request back, remembering the ids we saw.
    let mut seen_ids = Vec::with_capacity(K);
    for _ in 0..K {
        let msg = timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap();
        let Message::Call { fn_id, call_id, args } = msg else {
            panic!("expected Call, got {}", msg.kind());
        };
        assert_eq!(fn_id, 9);
        assert_ne!(call_id, NO_CALL_ID, "sentinel must never be allocated");
        seen_ids.push(call_id);
        write_message(&mut remote, &Message::Result { fn_id, call_id, response: args })
            .await
            .unwrap();
    }

    let mut sorted = seen_ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), K, "every in-flight call holds a distinct id");

    for (i, call) in calls.into_iter().enumerate() {
        let response = timeout(WAIT, call).await.unwrap().unwrap();
        assert_eq!(response, Bytes::from(vec![i as u8]), "call {i} got someone else's answer");
    }
}

#[tokio::test]
async fn remote_error_text_reaches_exactly_its_caller() {
    let (tunnel, mut remote) = single_link_tunnel();
    drive(tunnel.clone());

    let ok_call = tunnel.call(3, Bytes::from_static(b"fine")).await.unwrap();
    let bad_call = tunnel.call(3, Bytes::from_static(b"bad")).await.unwrap();

    for _ in 0..2 {
        let msg = timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap();
        let Message::Call { fn_id, call_id, args } = msg else {
            panic!("expected Call, got {}", msg.kind());
        };
        let reply = if args == Bytes::from_static(b"bad") {
            Message::Error { fn_id, call_id, message: Bytes::from_static(b"boom") }
        } else {
            Message::Result { fn_id, call_id, response: args }
        };
        write_message(&mut remote, &reply).await.unwrap();
    }

    assert_eq!(timeout(WAIT, ok_call).await.unwrap().unwrap(), Bytes::from_static(b"fine"));
    match timeout(WAIT, bad_call).await.unwrap() {
        Err(RpcError::Remote { message }) => assert_eq!(message, "boom"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_result_resolves_at_most_once() {
    let (tunnel, mut remote) = single_link_tunnel();

    let call = tunnel.call(5, Bytes::new()).await.unwrap();
    let Message::Call { fn_id, call_id, .. } =
        timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap()
    else {
        panic!("expected Call");
    };

    let reply = Message::Result { fn_id, call_id, response: Bytes::from_static(b"once") };
    write_message(&mut remote, &reply).await.unwrap();
    write_message(&mut remote, &reply).await.unwrap();

    // Route until the duplicate comes back out as unsolicited; the first
    // copy resolved the pending call and was consumed.
    let unmatched = timeout(WAIT, async {
        loop {
            let msgs = tunnel.listen().await;
            if !msgs.is_empty() {
                return msgs;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(unmatched, vec![reply]);
    assert_eq!(timeout(WAIT, call).await.unwrap().unwrap(), Bytes::from_static(b"once"));
    assert_eq!(tunnel.pending_calls(), 0);
}

#[tokio::test]
async fn exhausted_id_space_blocks_until_a_completion() {
    let (tunnel, mut remote) = single_link_tunnel();
    drive(tunnel.clone());

    // Saturate fn_id 4: all 254 usable ids in flight.
    let mut calls = Vec::with_capacity(254);
    for _ in 0..254 {
        calls.push(tunnel.call(4, Bytes::new()).await.unwrap());
    }
    assert_eq!(tunnel.pending_calls(), 254);

    let mut first_id = None;
    for _ in 0..254 {
        let msg = timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap();
        let Message::Call { call_id, .. } = msg else { panic!("expected Call") };
        assert_ne!(call_id, NO_CALL_ID);
        first_id.get_or_insert(call_id);
    }
    let first_id = first_id.unwrap();

    // The 255th allocation must not proceed while the table is full.
    let overflow = tunnel.call(4, Bytes::from_static(b"overflow"));
    tokio::pin!(overflow);
    assert!(
        timeout(Duration::from_millis(200), &mut overflow).await.is_err(),
        "allocation proceeded with a full id table"
    );

    // Complete one call; its slot frees and the blocked allocation finishes.
    write_message(
        &mut remote,
        &Message::Result { fn_id: 4, call_id: first_id, response: Bytes::new() },
    )
    .await
    .unwrap();

    let unblocked = timeout(WAIT, overflow).await.unwrap().unwrap();
    let msg = timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap();
    let Message::Call { call_id, args, .. } = msg else { panic!("expected Call") };
    assert_eq!(call_id, first_id, "the freed id is the one reused");
    assert_eq!(args, Bytes::from_static(b"overflow"));

    // Answer it so the future resolves.
    write_message(
        &mut remote,
        &Message::Result { fn_id: 4, call_id, response: Bytes::from_static(b"through") },
    )
    .await
    .unwrap();
    assert_eq!(timeout(WAIT, unblocked).await.unwrap().unwrap(), Bytes::from_static(b"through"));
}

#[tokio::test]
async fn abandoning_a_call_frees_its_id() {
    let (tunnel, mut remote) = single_link_tunnel();

    let first = tunnel.call(8, Bytes::new()).await.unwrap();
    let abandoned_id = first.id();
    assert_eq!(tunnel.pending_calls(), 1);

    drop(first);
    assert_eq!(tunnel.pending_calls(), 0, "dropping an unresolved call removes its entry");

    let second = tunnel.call(8, Bytes::new()).await.unwrap();
    assert_eq!(second.id(), abandoned_id, "the abandoned id is reusable");

    // Both dispatches reached the wire regardless.
    for _ in 0..2 {
        let msg = timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap();
        assert_eq!(msg.kind(), "Call");
    }
}

#[tokio::test]
async fn dead_tunnel_fails_pending_and_future_calls() {
    let (tunnel, mut remote) = single_link_tunnel();
    drive(tunnel.clone());

    let call = tunnel.call(2, Bytes::new()).await.unwrap();
    let _ = timeout(WAIT, read_message(&mut remote)).await.unwrap().unwrap();

    // Peer goes away without answering.
    drop(remote);

    match timeout(WAIT, call).await.unwrap() {
        Err(RpcError::Disconnected) => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }

    let err = timeout(WAIT, async {
        loop {
            match tunnel.call(2, Bytes::new()).await {
                Err(e) => return e,
                Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .unwrap();
    match err {
        RpcError::Disconnected | RpcError::Transport(_) => {}
        other => panic!("expected a dead-tunnel error, got {other:?}"),
    }
    assert!(!tunnel.is_alive());
}

#[tokio::test]
async fn unsolicited_messages_are_returned_for_routing() {
    let (tunnel, mut remote) = single_link_tunnel();

    write_message(&mut remote, &Message::Ping).await.unwrap();
    write_message(
        &mut remote,
        &Message::Call { fn_id: 1, call_id: 7, args: Bytes::from_static(b"req") },
    )
    .await
    .unwrap();
    write_message(
        &mut remote,
        &Message::Result { fn_id: 6, call_id: 6, response: Bytes::new() },
    )
    .await
    .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        seen.extend(timeout(WAIT, tunnel.listen()).await.unwrap());
    }
    assert_eq!(seen[0], Message::Ping);
    assert_eq!(
        seen[1],
        Message::Call { fn_id: 1, call_id: 7, args: Bytes::from_static(b"req") }
    );
    // A result with no pending entry is handed back, not swallowed.
    assert_eq!(seen[2], Message::Result { fn_id: 6, call_id: 6, response: Bytes::new() });
}

#[tokio::test]
async fn multi_link_tunnel_receives_from_every_link_and_spreads_sends() {
    let (a_local, mut a_remote) = tokio::io::duplex(1 << 16);
    let (b_local, mut b_remote) = tokio::io::duplex(1 << 16);
    let (c_local, mut c_remote) = tokio::io::duplex(1 << 16);
    let tunnel = Tunnel::new(vec![a_local, b_local, c_local]);
    assert_eq!(tunnel.link_count(), 3);

    // Inbound: one message per link, all surface through one listen stream.
    for (i, remote) in [&mut a_remote, &mut b_remote, &mut c_remote].into_iter().enumerate() {
        write_message(
            remote,
            &Message::Call { fn_id: i as u8, call_id: 0, args: Bytes::new() },
        )
        .await
        .unwrap();
    }
    let mut inbound = Vec::new();
    while inbound.len() < 3 {
        inbound.extend(timeout(WAIT, tunnel.listen()).await.unwrap());
    }
    let mut fn_ids: Vec<u8> = inbound
        .iter()
        .map(|m| match m {
            Message::Call { fn_id, .. } => *fn_id,
            other => panic!("expected Call, got {}", other.kind()),
        })
        .collect();
    fn_ids.sort_unstable();
    assert_eq!(fn_ids, vec![0, 1, 2]);

    // Outbound: every send lands on exactly one link; nothing is lost or
    // duplicated across the set.
    const SENDS: usize = 30;
    for _ in 0..SENDS {
        tunnel.send(&Message::Ping).await.unwrap();
    }
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for mut remote in [a_remote, b_remote, c_remote] {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(msg) = read_message(&mut remote).await {
                let _ = tx.send(msg);
            }
        });
    }
    drop(tx);
    let mut received = 0;
    while received < SENDS {
        let msg = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(msg, Message::Ping);
        received += 1;
    }
}
