//! End-to-end session scenarios against scripted peers.
//!
//! The message loop is generic over its stream, so these tests drive it
//! over in-memory duplex pipes (and over loopback TCP for the full
//! lifecycle), with a `MemoryStore` standing in for the database.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

use chainwatch_observer::{
    frame_stream, observe_peer, perform_handshake, run_message_loop, PeerEndpoint, PeerPool,
    SeenCaches, SessionHandles,
};
use chainwatch_protocol::{
    encode_inv_payload, parse_inv_payload, BlockHeader, Hash256, InvVector, RawMessage,
    Transaction, VersionMessage,
};
use chainwatch_storage::{MemoryStore, ObserverStore};

fn endpoint(host: &str, port: u16) -> Arc<PeerEndpoint> {
    Arc::new(PeerEndpoint {
        host: host.to_string(),
        port,
        city: "Berlin".to_string(),
        country_code: "DE".to_string(),
        latitude: 52.52,
        longitude: 13.405,
        asn: "AS64500 Example".to_string(),
        org_name: "Example Networks".to_string(),
        ..PeerEndpoint::default()
    })
}

fn test_handles(store: &Arc<MemoryStore>) -> SessionHandles {
    SessionHandles {
        pool: Arc::new(PeerPool::default()),
        seen: Arc::new(SeenCaches::new()),
        store: Arc::clone(store) as Arc<dyn ObserverStore>,
        token: CancellationToken::new(),
    }
}

fn remote_version(agent: &str) -> VersionMessage {
    let mut version = VersionMessage::for_peer("127.0.0.1".parse().unwrap(), 8333, 1_700_000_000);
    version.user_agent = agent.to_string();
    version
}

/// Wire bytes of a minimal transaction spending `outpoints`.
fn tx_bytes(outpoints: &[(Hash256, u32)], value: i64, salt: u8) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&2i32.to_le_bytes());
    out.push(outpoints.len() as u8);
    for (hash, index) in outpoints {
        out.extend_from_slice(hash.as_bytes());
        out.extend_from_slice(&index.to_le_bytes());
        out.push(1); // script length
        out.push(salt);
        out.extend_from_slice(&0xffff_ffffu32.to_le_bytes());
    }
    out.push(1); // one output
    out.extend_from_slice(&value.to_le_bytes());
    out.push(0); // empty script
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}

/// Wire bytes of a block holding the given raw transactions.
fn block_bytes(timestamp: u32, txs: &[Vec<u8>]) -> Vec<u8> {
    let header = BlockHeader {
        version: 4,
        prev_block_hash: Hash256::from_bytes([0x01; 32]),
        merkle_root: Hash256::from_bytes([0x02; 32]),
        timestamp,
        bits: 0x1d00ffff,
        nonce: 7,
    };
    let mut out = header.to_bytes().to_vec();
    out.push(txs.len() as u8);
    for tx in txs {
        out.extend_from_slice(tx);
    }
    out
}

#[tokio::test]
async fn handshake_records_peer_version() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn ObserverStore> = Arc::clone(&store) as Arc<dyn ObserverStore>;
    let peer_endpoint = endpoint("127.0.0.1", 8333);

    let scripted_peer = tokio::spawn(async move {
        let mut framed = frame_stream(remote);

        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "version");
        let observer_version = VersionMessage::parse(&msg.payload).unwrap();
        assert_eq!(observer_version.start_height, 0);
        assert_eq!(observer_version.services, 0);
        assert!(observer_version.relay);

        framed
            .send(RawMessage::new("version", remote_version("/x:1/").encode()))
            .await
            .unwrap();

        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "verack");
        framed
            .send(RawMessage::new("verack", Vec::new()))
            .await
            .unwrap();
        framed
    });

    let mut framed = frame_stream(local);
    let version = perform_handshake(&mut framed, &peer_endpoint, &dyn_store)
        .await
        .unwrap();
    assert_eq!(version.user_agent, "/x:1/");

    let row = store.peer("127.0.0.1:8333").unwrap();
    assert_eq!(row.user_agent, "/x:1/");
    assert_eq!(row.protocol_version, 70015);
    assert_eq!(row.connection_count, 1);

    // The connection is still usable after the handshake.
    let mut peer_framed = scripted_peer.await.unwrap();
    framed
        .send(RawMessage::new("ping", vec![0u8; 8]))
        .await
        .unwrap();
    let msg = peer_framed.next().await.unwrap().unwrap();
    assert_eq!(msg.command(), "ping");
}

#[tokio::test]
async fn inventory_dedup_requests_each_hash_once() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let store = Arc::new(MemoryStore::new());
    let handles = test_handles(&store);

    let h1 = Hash256::from_bytes([0x11; 32]);
    let h2 = Hash256::from_bytes([0x22; 32]);

    let scripted_peer = tokio::spawn(async move {
        let mut framed = frame_stream(remote);
        let announcement = vec![
            InvVector::tx(h1),
            InvVector::tx(h2),
            InvVector::tx(h1), // repeat
        ];
        framed
            .send(RawMessage::new("inv", encode_inv_payload(&announcement)))
            .await
            .unwrap();

        // Exactly one getdata, listing the two distinct hashes in order.
        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "getdata");
        let requested = parse_inv_payload(&msg.payload);
        assert_eq!(
            requested.tx.iter().map(|v| v.hash).collect::<Vec<_>>(),
            vec![h1, h2]
        );
        assert!(requested.blocks.is_empty());
        // Closing ends the observer's loop.
    });

    run_message_loop(frame_stream(local), "peer:8333", "DE", &handles).await;
    scripted_peer.await.unwrap();

    // Observation rows exist for the two distinct hashes only; the
    // repeated announcement counts as another sighting of h1.
    let first = store.observation(&h1).unwrap();
    assert_eq!(first.peer_count, 2);
    let second = store.observation(&h2).unwrap();
    assert_eq!(second.peer_count, 1);

    // Propagation events: one per announcement, first delay is zero.
    let events = store.propagation_events(&h1);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].delay_from_first_ms, 0);
}

#[tokio::test]
async fn conflicting_spends_flagged_then_block_confirms_winner() {
    let (local, remote) = tokio::io::duplex(256 * 1024);
    let store = Arc::new(MemoryStore::new());
    let handles = test_handles(&store);

    let contested = (Hash256::from_bytes([0xaa; 32]), 0u32);
    let ta_bytes = tx_bytes(&[contested], 1_000, 0x01);
    let tb_bytes = tx_bytes(&[contested], 2_000, 0x02);
    let ta_id = Transaction::parse(&ta_bytes).unwrap().txid;
    let tb_id = Transaction::parse(&tb_bytes).unwrap().txid;
    let block = block_bytes(1_700_000_000, &[ta_bytes.clone()]);

    let scripted_peer = tokio::spawn(async move {
        let mut framed = frame_stream(remote);

        // Announce both so observation rows exist.
        framed
            .send(RawMessage::new(
                "inv",
                encode_inv_payload(&[InvVector::tx(ta_id), InvVector::tx(tb_id)]),
            ))
            .await
            .unwrap();
        let getdata = framed.next().await.unwrap().unwrap();
        assert_eq!(getdata.command(), "getdata");

        framed.send(RawMessage::new("tx", ta_bytes)).await.unwrap();
        framed.send(RawMessage::new("tx", tb_bytes)).await.unwrap();
        framed.send(RawMessage::new("block", block)).await.unwrap();
    });

    run_message_loop(frame_stream(local), "peer:8333", "DE", &handles).await;
    scripted_peer.await.unwrap();

    // TB arrived after TA and spends the same outpoint: TA superseded,
    // both flagged.
    let obs_a = store.observation(&ta_id).unwrap();
    assert_eq!(obs_a.replaced_by, Some(tb_id));
    assert!(obs_a.double_spend);

    let obs_b = store.observation(&tb_id).unwrap();
    assert!(obs_b.double_spend);
    assert_eq!(obs_b.replaced_by, None);

    // The block contained TA only: TA confirmed at the header time, TB
    // untouched and still flagged.
    let in_block = obs_a.in_block.expect("ta confirmed");
    assert_eq!(
        obs_a.confirmed_at.unwrap(),
        chrono::DateTime::from_timestamp(1_700_000_000, 0)
            .unwrap()
            .naive_utc()
    );
    let row_a = store.transaction_row(&ta_id).unwrap();
    assert_eq!(row_a.block_hash, Some(in_block));

    assert!(obs_b.in_block.is_none());
    assert!(obs_b.double_spend);

    // The block row itself landed.
    assert!(store.block_row(&in_block).is_some());
}

#[tokio::test]
async fn ping_is_echoed_as_pong() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let store = Arc::new(MemoryStore::new());
    let handles = test_handles(&store);

    let scripted_peer = tokio::spawn(async move {
        let mut framed = frame_stream(remote);
        let nonce = vec![9u8, 8, 7, 6, 5, 4, 3, 2];
        framed
            .send(RawMessage::new("ping", nonce.clone()))
            .await
            .unwrap();
        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "pong");
        assert_eq!(msg.payload, nonce);
    });

    run_message_loop(frame_stream(local), "peer:8333", "DE", &handles).await;
    scripted_peer.await.unwrap();
}

#[tokio::test]
async fn unknown_commands_are_ignored() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let store = Arc::new(MemoryStore::new());
    let handles = test_handles(&store);

    let scripted_peer = tokio::spawn(async move {
        let mut framed = frame_stream(remote);
        framed
            .send(RawMessage::new("feefilter", vec![0u8; 8]))
            .await
            .unwrap();
        // A malformed tx payload is skipped, not fatal.
        framed
            .send(RawMessage::new("tx", vec![0x01, 0x02]))
            .await
            .unwrap();
        framed
            .send(RawMessage::new("ping", vec![1u8; 8]))
            .await
            .unwrap();
        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "pong");
    });

    run_message_loop(frame_stream(local), "peer:8333", "DE", &handles).await;
    scripted_peer.await.unwrap();
}

#[tokio::test]
async fn cancellation_unblocks_a_pending_read() {
    let (local, _remote_held_open) = tokio::io::duplex(64 * 1024);
    let store = Arc::new(MemoryStore::new());
    let handles = test_handles(&store);
    let token = handles.token.clone();

    let session = tokio::spawn({
        let handles = handles.clone();
        async move { run_message_loop(frame_stream(local), "peer:8333", "DE", &handles).await }
    });

    // Give the loop a moment to park on the read.
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    tokio::time::timeout(Duration::from_secs(1), session)
        .await
        .expect("session did not stop after cancellation")
        .unwrap();
}

#[tokio::test]
async fn full_lifecycle_over_loopback_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let scripted_peer = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = frame_stream(socket);

        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "version");
        framed
            .send(RawMessage::new("version", remote_version("/y:2/").encode()))
            .await
            .unwrap();
        let msg = framed.next().await.unwrap().unwrap();
        assert_eq!(msg.command(), "verack");
        framed
            .send(RawMessage::new("verack", Vec::new()))
            .await
            .unwrap();
        // Hang up right away: a short-lived session.
    });

    let store = Arc::new(MemoryStore::new());
    let handles = test_handles(&store);
    let peer_endpoint = endpoint("127.0.0.1", port);
    let addr = peer_endpoint.addr();

    observe_peer(handles.clone(), "DE".to_string(), Arc::clone(&peer_endpoint)).await;
    scripted_peer.await.unwrap();

    // Handshake recorded the version row and the candidate's geo info.
    let row = store.peer(&addr).unwrap();
    assert_eq!(row.user_agent, "/y:2/");
    let geo = row.geo.expect("geo info written after handshake");
    assert_eq!(geo.city, "Berlin");
    assert_eq!(geo.country_code, "DE");
    assert_eq!(geo.region, "DE");

    // The session wound down and freed its slot.
    assert_eq!(handles.pool.total_active(), 0);

    // A sub-minute session counts as a suspicious disconnect: the
    // endpoint is inside the failure backoff and not selectable.
    handles.pool.set_candidates("DE", vec![peer_endpoint]);
    assert!(handles.pool.next_for_region("DE").is_none());
}
