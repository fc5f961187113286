use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ringdht::config::NodeConfig;
use ringdht::dht::node::RingNode;
use ringdht::dht::service::DhtNodeService;
use ringdht::dht::store::{MemoryStore, CHUNK_SIZE};
use ringdht::dht::transport::{GrpcTransport, Transport};
use ringdht::error::Error;
use ringdht::rpc::dht::dht_node_server::DhtNodeServer;
use ringdht::testing::{timers, LocalNetwork};
use ringdht::RingMember;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

const BITS: u32 = 8;
const TICK: Duration = Duration::from_millis(50);

fn manual() -> NodeConfig {
    timers(NodeConfig::new(BITS).unwrap(), Duration::ZERO)
}

async fn ring(ids: &[u64]) -> (Arc<LocalNetwork>, Vec<Arc<RingNode>>) {
    ring_with_timers(ids, Duration::ZERO).await
}

async fn ring_with_timers(
    ids: &[u64],
    period: Duration,
) -> (Arc<LocalNetwork>, Vec<Arc<RingNode>>) {
    let network = LocalNetwork::new();
    let mut nodes = Vec::new();
    for &id in ids {
        let config = timers(NodeConfig::new(BITS).unwrap(), period);
        nodes.push(network.spawn_node(config, id).await);
    }

    let bootstrap = nodes[0].member().clone();
    for node in &nodes {
        node.start(&bootstrap).await.unwrap();
    }
    for node in &nodes {
        node.check_successor().await.unwrap();
    }
    (network, nodes)
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn address(id: u64) -> String {
    format!("node-{}", id)
}

#[tokio::test]
async fn single_node_owns_everything() {
    let (_network, nodes) = ring(&[42]).await;
    let node = &nodes[0];

    assert!(node.predecessor().await.is_none());
    assert!(node.successor().await.is_none());
    for key in [0, 41, 42, 255] {
        assert!(node.owns(key).await);
        assert_eq!(node.owner(key, 0).await.unwrap().id, 42);
    }
}

#[tokio::test]
async fn start_twice_is_rejected() {
    let (_network, nodes) = ring(&[42]).await;
    let me = nodes[0].member().clone();
    assert!(matches!(nodes[0].start(&me).await, Err(Error::Internal(_))));
}

#[tokio::test]
async fn join_links_both_members() {
    let (_network, nodes) = ring(&[10, 100]).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    assert_eq!(b.predecessor().await.map(|m| m.id), Some(10));
    assert_eq!(b.successor().await.map(|m| m.id), Some(10));
    assert_eq!(a.predecessor().await.map(|m| m.id), Some(100));
    assert_eq!(a.successor().await.map(|m| m.id), Some(100));

    // ids just below the newcomer are its own: [predecessor, self)
    for node in [a, b] {
        assert_eq!(node.owner(99, 0).await.unwrap().id, 100);
        assert_eq!(node.owner(10, 0).await.unwrap().id, 100);
        assert_eq!(node.owner(100, 0).await.unwrap().id, 10);
    }
}

#[tokio::test]
async fn ownership_partitions_the_ring() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;

    for key in 0..256u64 {
        let mut owners = Vec::new();
        for node in &nodes {
            if node.owns(key).await {
                owners.push(node.id());
            }
        }
        assert_eq!(owners.len(), 1, "key {} owned by {:?}", key, owners);

        for node in &nodes {
            assert_eq!(node.owner(key, 0).await.unwrap().id, owners[0], "key {}", key);
        }
    }
}

#[tokio::test]
async fn successors_close_the_ring() {
    let (_network, nodes) = ring(&[10, 100, 200, 30]).await;

    for start in &nodes {
        let mut current = start.member().clone();
        let mut hops = 0;
        loop {
            let node = nodes.iter().find(|n| n.member() == &current).unwrap();
            current = node.successor().await.unwrap();
            hops += 1;
            if &current == start.member() {
                break;
            }
            assert!(hops <= nodes.len(), "ring does not close from {}", start.id());
        }
        assert_eq!(hops, nodes.len());
    }
}

#[tokio::test]
async fn next_successor_skips_one_member() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;
    let expected = [(10, 200), (100, 10), (200, 100)];
    for (node, (id, next)) in nodes.iter().zip(expected) {
        assert_eq!(node.id(), id);
        assert_eq!(node.next_successor().await.map(|m| m.id), Some(next));
    }
}

#[tokio::test]
async fn successor_failure_promotes_next_successor() {
    let (network, nodes) = ring(&[10, 100, 200]).await;
    let (a, c) = (&nodes[0], &nodes[2]);

    network.disconnect(&address(100)).await;
    a.check_successor().await.unwrap();

    assert_eq!(a.successor().await.map(|m| m.id), Some(200));
    assert_eq!(c.predecessor().await.map(|m| m.id), Some(10));

    for key in 0..256u64 {
        for node in [a, c] {
            let owner = node.owner(key, 0).await.unwrap();
            assert_ne!(owner.id, 100, "key {} still routed to the dead node", key);
        }
    }
}

#[tokio::test]
async fn stabilize_points_fingers_at_owners() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;
    let b = &nodes[1];

    b.stabilize().await;

    let table = b.finger_table().await;
    assert_eq!(table.len(), BITS as usize);
    assert_eq!(table[0].as_ref().map(|m| m.id), Some(200));
    // 101, 102, ..., 164 all fall in [100, 200), owned by 200
    for finger in &table[1..] {
        assert_eq!(finger.as_ref().map(|m| m.id), Some(200));
    }
}

#[tokio::test]
async fn save_query_delete_from_any_node() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;

    nodes[2].save(50, b"hello".to_vec()).await.unwrap();
    for node in &nodes {
        let result = node.query(50, 0).await.unwrap();
        assert_eq!(result.data.as_deref(), Some(&b"hello"[..]));
        assert_eq!(result.responsible.id, 100);
    }

    nodes[0].delete(50).await.unwrap();
    let result = nodes[1].query(50, 0).await.unwrap();
    assert!(result.data.is_none());
    assert_eq!(result.responsible.id, 100);
}

#[tokio::test]
async fn replicas_land_on_the_matching_neighbor() {
    let (network, nodes) = ring(&[10, 100, 200]).await;
    let b = &nodes[1];

    // b owns [10, 100); the split is at 55
    b.save(80, b"upper".to_vec()).await.unwrap();
    b.save(20, b"lower".to_vec()).await.unwrap();

    let c = nodes[2].clone();
    assert!(
        eventually(|| {
            let c = c.clone();
            async move { c.read_replica(80).await.unwrap().is_some() }
        })
        .await
    );
    let a = nodes[0].clone();
    assert!(
        eventually(|| {
            let a = a.clone();
            async move { a.read_replica(20).await.unwrap().is_some() }
        })
        .await
    );

    b.delete(80).await.unwrap();
    assert!(
        eventually(|| {
            let c = c.clone();
            async move { c.read_replica(80).await.unwrap().is_none() }
        })
        .await
    );

    // the failed owner's range moves to its successor
    network.disconnect(&address(100)).await;
    nodes[0].check_successor().await.unwrap();
    let a = nodes[0].clone();
    assert!(
        eventually(|| {
            let a = a.clone();
            async move {
                let result = a.query(20, 0).await.unwrap();
                result.responsible.id == 200 && result.data.as_deref() == Some(&b"lower"[..])
            }
        })
        .await
    );
}

#[tokio::test]
async fn failover_hands_only_the_lower_half_over() {
    let (network, nodes) = ring(&[10, 100, 200]).await;
    let (a, c) = (&nodes[0], &nodes[2]);
    // a holds replicas for [10, 55) of 100 and owns 5 itself
    a.rep_save(30, b"replica".to_vec()).await.unwrap();
    a.save(5, b"own".to_vec()).await.unwrap();
    let a2 = a.clone();
    assert!(
        eventually(|| {
            let a = a2.clone();
            async move { a.read_replica(30).await.unwrap().is_some() }
        })
        .await
    );

    let failed = nodes[1].member().clone();
    network.disconnect(&failed.address).await;
    assert_eq!(a.hand_over(&failed, c.member()).await, 1);

    let c2 = c.clone();
    assert!(
        eventually(|| {
            let c = c2.clone();
            async move { c.read_replica(30).await.unwrap().is_some() }
        })
        .await
    );
    assert!(c.read_replica(5).await.unwrap().is_none());
    // the predecessor keeps its copy as the new owner's replica
    assert!(a.read_replica(30).await.unwrap().is_some());
}

#[tokio::test]
async fn joining_node_pulls_its_range() {
    let (network, nodes) = ring(&[10, 200]).await;
    nodes[0].save(90, b"moving".to_vec()).await.unwrap();
    assert_eq!(nodes[0].owner(90, 0).await.unwrap().id, 200);

    let newcomer = network.spawn_node(manual(), 100).await;
    newcomer.start(nodes[0].member()).await.unwrap();

    assert_eq!(newcomer.owner(90, 0).await.unwrap().id, 100);
    let result = nodes[0].query(90, 0).await.unwrap();
    assert_eq!(result.data.as_deref(), Some(&b"moving"[..]));
}

#[tokio::test]
async fn resync_is_idempotent() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;
    for key in [15, 60, 99, 150, 250] {
        nodes[0].save(key, vec![key as u8; 3]).await.unwrap();
    }

    let placed = [(0, 15), (2, 60), (2, 99), (0, 150), (1, 250)];
    for (holder, key) in placed {
        let node = nodes[holder].clone();
        assert!(
            eventually(|| {
                let node = node.clone();
                async move { node.read_replica(key).await.unwrap().is_some() }
            })
            .await,
            "replica of {} never reached node {}",
            key,
            node.id()
        );
    }

    let b = &nodes[1];
    b.sync_keys().await;
    let mut first = Vec::new();
    for key in 0..256u64 {
        first.push(b.read_replica(key).await.unwrap());
    }

    b.sync_keys().await;
    for key in 0..256u64 {
        assert_eq!(b.read_replica(key).await.unwrap(), first[key as usize]);
    }
    assert_eq!(first[60].as_deref(), Some(&[60u8; 3][..]));
}

#[tokio::test]
async fn notifications_keep_the_closer_live_neighbor() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;
    let b = &nodes[1];

    let farther = RingMember::new(10, address(10));
    assert!(!b.handle_new_successor(farther, None).await.unwrap());
    assert_eq!(b.successor().await.map(|m| m.id), Some(200));

    let farther = RingMember::new(200, address(200));
    assert!(!b.handle_new_predecessor(farther).await.unwrap());
    assert_eq!(b.predecessor().await.map(|m| m.id), Some(10));

    assert!(!b.handle_new_predecessor(b.member().clone()).await.unwrap());
}

#[tokio::test]
async fn streamed_read_redirects_to_owner() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;
    let value: Vec<u8> = (0..CHUNK_SIZE * 2 + 7).map(|i| i as u8).collect();
    nodes[1].save(50, value.clone()).await.unwrap();

    let mut redirect = nodes[0].query_stream(50).await.unwrap();
    let first = redirect.recv().await.unwrap().unwrap();
    assert!(first.is_redirect_from(&address(10)));
    assert_eq!(first.responsible.id, 100);
    assert!(redirect.recv().await.is_none());

    let mut chunks = nodes[1].query_stream(50).await.unwrap();
    let mut received = Vec::new();
    let mut count = 0;
    while let Some(chunk) = chunks.recv().await {
        received.extend(chunk.unwrap().data.unwrap());
        count += 1;
    }
    assert_eq!(count, 3);
    assert_eq!(received, value);

    let mut missing = nodes[1].query_stream(51).await.unwrap();
    let only = missing.recv().await.unwrap().unwrap();
    assert!(only.data.is_none());
    assert!(!only.is_redirect_from(&address(100)));
}

#[tokio::test]
async fn forwarding_stops_at_the_hop_limit() {
    let (_network, nodes) = ring(&[10, 100, 200]).await;
    let max_hops = nodes[0].config().max_hops;

    match nodes[0].owner(50, max_hops).await {
        Err(Error::HopLimit { key, hops }) => assert_eq!((key, hops), (50, max_hops)),
        other => panic!("expected hop limit, got {:?}", other),
    }
    // owned keys are answered locally whatever the count
    assert_eq!(nodes[1].owner(50, max_hops).await.unwrap().id, 100);
}

#[tokio::test]
async fn isolated_node_reports_a_dead_end() {
    let (network, nodes) = ring(&[10, 100, 200]).await;
    network.disconnect(&address(100)).await;
    network.disconnect(&address(200)).await;

    assert!(matches!(
        nodes[0].owner(50, 0).await,
        Err(Error::RoutingDeadEnd(50))
    ));
}

#[tokio::test]
async fn timer_fails_over_a_crashed_successor() {
    let (network, nodes) = ring_with_timers(&[10, 100, 200], TICK).await;
    network.disconnect(&address(100)).await;

    let a = nodes[0].clone();
    assert!(
        eventually(|| {
            let a = a.clone();
            async move { a.successor().await.map(|m| m.id) == Some(200) }
        })
        .await
    );
    assert_eq!(nodes[2].predecessor().await.map(|m| m.id), Some(10));
}

#[tokio::test]
async fn timer_survives_failing_checks() {
    let (network, nodes) = ring_with_timers(&[10, 100, 200], TICK).await;
    network.disconnect(&address(100)).await;
    network.disconnect(&address(200)).await;

    // several ticks fail while both candidates are gone
    tokio::time::sleep(TICK * 6).await;
    assert_eq!(nodes[0].successor().await.map(|m| m.id), Some(100));

    network.register(&nodes[2]).await;
    let a = nodes[0].clone();
    assert!(
        eventually(|| {
            let a = a.clone();
            async move { a.successor().await.map(|m| m.id) == Some(200) }
        })
        .await
    );
}

#[tokio::test]
async fn shutdown_stops_the_timers() {
    let (network, nodes) = ring_with_timers(&[10, 100, 200], TICK).await;
    nodes[0].shutdown();
    network.disconnect(&address(100)).await;

    tokio::time::sleep(TICK * 6).await;
    assert_eq!(nodes[0].successor().await.map(|m| m.id), Some(100));
}

/// Serves a fresh node with timers off on an ephemeral port.
async fn serve(id: u64) -> (Arc<RingNode>, Arc<GrpcTransport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local: SocketAddr = listener.local_addr().unwrap();
    let me = RingMember::new(id, local.to_string());

    let transport = Arc::new(GrpcTransport::new());
    let node = RingNode::new(
        manual(),
        me,
        Arc::new(MemoryStore::new()),
        transport.clone(),
    );
    tokio::spawn(
        Server::builder()
            .add_service(DhtNodeServer::new(DhtNodeService::new(node.clone())))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );
    (node, transport)
}

#[tokio::test]
async fn grpc_stream_follows_redirect_to_owner() {
    let (a, transport) = serve(10).await;
    let (b, _) = serve(100).await;
    a.start(a.member()).await.unwrap();
    b.start(a.member()).await.unwrap();
    assert_eq!(a.predecessor().await.map(|m| m.id), Some(100));

    // b owns [10, 100)
    let value: Vec<u8> = (0..CHUNK_SIZE * 2 + 1).map(|i| i as u8).collect();
    transport.save(&b.member().address, 50, value.clone()).await.unwrap();

    let mut results = transport.query_stream(&a.member().address, 50);
    let mut received = Vec::new();
    while let Some(result) = results.recv().await {
        let result = result.unwrap();
        assert_eq!(result.responsible.id, 100);
        received.extend(result.data.unwrap());
    }
    assert_eq!(received, value);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn grpc_stream_stops_when_the_reader_leaves() {
    let (a, transport) = serve(10).await;
    let (b, _) = serve(100).await;
    a.start(a.member()).await.unwrap();
    b.start(a.member()).await.unwrap();

    let value = vec![3u8; CHUNK_SIZE * 5];
    transport.save(&b.member().address, 50, value).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    let follower = transport.clone();
    let start = a.member().address.clone();
    let handle = tokio::spawn(async move { follower.follow_query_stream(&start, 50, &tx).await });

    let first = rx.recv().await.unwrap().unwrap();
    assert_eq!(first.data.map(|d| d.len()), Some(CHUNK_SIZE));
    drop(rx);

    let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn grpc_node_serves_streams_end_to_end() {
    let (node, transport) = serve(7).await;
    let me = node.member().clone();
    node.start(&me).await.unwrap();

    let address = me.address.clone();
    transport.ping(&address).await.unwrap();
    assert_eq!(transport.owner(&address, 200, 0).await.unwrap(), me);

    let value = vec![9u8; CHUNK_SIZE + 1];
    let chunks = value.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
    transport.save_stream(&address, 200, chunks).await.unwrap();

    let mut results = transport.query_stream(&address, 200);
    let mut received = Vec::new();
    while let Some(result) = results.recv().await {
        received.extend(result.unwrap().data.unwrap());
    }
    assert_eq!(received, value);

    let missing = transport.query(&address, 201, 0).await.unwrap();
    assert!(missing.data.is_none());
    assert_eq!(missing.responsible, me);

    transport.delete(&address, 200).await.unwrap();
    assert!(transport.fetch_replica(&address, 200).await.unwrap().is_none());
    node.shutdown();
}
