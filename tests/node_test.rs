//! Multi-node integration tests.
//!
//! Nodes run in-process on loopback with OS-assigned ports, so tests are
//! isolated from each other and from the host network. Neighbor tables are
//! seeded through the announce path instead of relying on actual broadcast
//! reachability; everything after that (forwarding, ping/pong, task
//! execution, result re-injection) flows over real UDP.

use ryx::net::comm::DiscoverySink;
use ryx::net::envelope::AnnouncePayload;
use ryx::node::{Node, NodeConfig};
use ryx::types::ComputationResult;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

async fn spawn_node(cluster: &str) -> Node {
    let config = NodeConfig {
        port: 0,
        cluster_id: cluster.to_string(),
        ..Default::default()
    };
    let node = Node::new(config).await.expect("node boot failed");
    node.start();
    node
}

/// Feed `a` an announcement for `b`, as if b's broadcast had arrived.
async fn announce_to(a: &Node, b: &Node, cluster: &str) {
    let payload = AnnouncePayload {
        node_id: b.node_id().to_string(),
        cluster_id: cluster.to_string(),
        port: b.listen_port(),
        http_port: 8001,
        spatial: None,
    };
    let src: SocketAddr = format!("127.0.0.1:{}", b.listen_port()).parse().unwrap();
    a.discovery().handle_announce(payload, src).await;
}

/// Mutual introduction.
async fn link(a: &Node, b: &Node, cluster: &str) {
    announce_to(a, b, cluster).await;
    announce_to(b, a, cluster).await;
}

/// Poll until `predicate` holds or the deadline passes.
async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

/// Scenario: double injection of identical content stores one message with
/// the content-derived id.
#[tokio::test]
async fn test_content_addressed_dedup() {
    let node = spawn_node("dedup").await;

    node.diffusion()
        .inject("data", "hello", 0.0, Duration::from_secs(60));
    node.diffusion()
        .inject("data", "hello", 0.0, Duration::from_secs(60));

    assert_eq!(node.diffusion().total_messages(), 1);
    assert!(node.diffusion().get("2cf24dba5fb0a30e").is_some());

    node.shutdown();
}

/// Scenario: three fully-connected nodes all hold a flooded message, with
/// the injector as source and consistent hop counts.
#[tokio::test]
async fn test_three_node_flood() {
    let n1 = spawn_node("flood").await;
    let n2 = spawn_node("flood").await;
    let n3 = spawn_node("flood").await;
    link(&n1, &n2, "flood").await;
    link(&n1, &n3, "flood").await;
    link(&n2, &n3, "flood").await;

    let msg = n1.diffusion().inject("event", "X", 5.0, Duration::from_secs(60));
    let id = msg.id.clone();

    let all_have = wait_until(Duration::from_secs(2), || {
        [&n1, &n2, &n3]
            .iter()
            .all(|n| n.diffusion().get(&id).is_some())
    })
    .await;
    assert!(all_have, "message did not reach all nodes");

    for node in [&n2, &n3] {
        let copy = node.diffusion().get(&id).unwrap();
        assert_eq!(copy.source, n1.node_id());
        assert_eq!(copy.path[0], n1.node_id());
        assert!(copy.path.len() == 2 || copy.path.len() == 3);
        assert_eq!(copy.hops as usize, copy.path.len() - 1);
        // every node stores exactly one copy of this content
        assert_eq!(node.diffusion().total_messages(), 1);
    }

    for node in [n1, n2, n3] {
        node.shutdown();
    }
}

/// Scenario: on a ring, each node stores at most one copy and no stored
/// path visits any node twice.
#[tokio::test]
async fn test_ring_loop_prevention() {
    let nodes = [
        spawn_node("ring").await,
        spawn_node("ring").await,
        spawn_node("ring").await,
        spawn_node("ring").await,
    ];
    for i in 0..nodes.len() {
        let next = (i + 1) % nodes.len();
        link(&nodes[i], &nodes[next], "ring").await;
    }

    let msg = nodes[0]
        .diffusion()
        .inject("event", "Y", 10.0, Duration::from_secs(60));
    let id = msg.id.clone();

    let all_have = wait_until(Duration::from_secs(3), || {
        nodes.iter().all(|n| n.diffusion().get(&id).is_some())
    })
    .await;
    assert!(all_have, "message did not traverse the ring");

    // settle, then audit paths
    tokio::time::sleep(Duration::from_millis(200)).await;
    for node in &nodes {
        assert_eq!(node.diffusion().total_messages(), 1);
        let copy = node.diffusion().get(&id).unwrap();
        let mut seen = copy.path.clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), copy.path.len(), "path revisits a node: {:?}", copy.path);
    }

    for node in nodes {
        node.shutdown();
    }
}

/// Scenario: on a five-node chain with unit decay, energy 2 reaches the
/// source plus two hops and no further.
#[tokio::test]
async fn test_energy_exhaustion_on_chain() {
    let nodes = [
        spawn_node("chain").await,
        spawn_node("chain").await,
        spawn_node("chain").await,
        spawn_node("chain").await,
        spawn_node("chain").await,
    ];
    for pair in nodes.windows(2) {
        link(&pair[0], &pair[1], "chain").await;
    }

    let msg = nodes[0]
        .diffusion()
        .inject("event", "Z", 2.0, Duration::from_secs(60));
    let id = msg.id.clone();

    let reached = wait_until(Duration::from_secs(2), || {
        nodes[..3].iter().all(|n| n.diffusion().get(&id).is_some())
    })
    .await;
    assert!(reached, "message did not travel two hops");

    // give any leak past the energy horizon time to show up
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(nodes[3].diffusion().get(&id).is_none());
    assert!(nodes[4].diffusion().get(&id).is_none());

    // the copy at two hops arrived drained
    let drained = nodes[2].diffusion().get(&id).unwrap();
    assert_eq!(drained.energy, 0.0);
    assert_eq!(drained.hops, 2);

    for node in nodes {
        node.shutdown();
    }
}

/// Scenario: a wordcount task floods to a peer and at least one node emits
/// a result message with the expected counts.
#[tokio::test]
async fn test_wordcount_task_round_trip() {
    let n1 = spawn_node("wc").await;
    let n2 = spawn_node("wc").await;
    link(&n1, &n2, "wc").await;

    let parameters = HashMap::from([("case_sensitive".to_string(), serde_json::json!(false))]);
    n1.submit_task(
        "wordcount",
        "the quick brown fox the",
        parameters,
        3.0,
        Duration::from_secs(60),
    )
    .unwrap();

    let find_result = |node: &Node| -> Option<ComputationResult> {
        node.diffusion()
            .messages()
            .into_iter()
            .find(|m| m.kind == "result")
            .and_then(|m| serde_json::from_str(&m.content).ok())
    };

    let got_result = wait_until(Duration::from_secs(3), || {
        find_result(&n1).is_some() || find_result(&n2).is_some()
    })
    .await;
    assert!(got_result, "no node emitted a result");

    let result = find_result(&n1).or_else(|| find_result(&n2)).unwrap();
    assert_eq!(result.task_type, "wordcount");
    assert_eq!(result.result["total_words"], 5);
    assert_eq!(result.result["unique_words"], 4);
    assert_eq!(result.result["word_counts"]["the"], 2);

    n1.shutdown();
    n2.shutdown();
}

/// Scenario: a killed neighbor degrades and is removed once it stops
/// responding to liveness pings.
#[tokio::test]
async fn test_neighbor_loss() {
    let n1 = spawn_node("loss").await;
    let n2 = spawn_node("loss").await;
    link(&n1, &n2, "loss").await;
    assert_eq!(n1.discovery().neighbor_count(), 1);

    // tighten the liveness deadline, then hard-stop n2 so it cannot pong
    assert!(n1
        .params()
        .set("neighbor_timeout_ms", serde_json::json!(1_000)));
    n2.shutdown();

    let removed = wait_until(Duration::from_secs(10), || {
        n1.discovery().neighbor_count() == 0
    })
    .await;
    assert!(removed, "dead neighbor was never removed");

    n1.shutdown();
}

/// Forwarding while the neighbor set churns must not deadlock.
#[tokio::test]
async fn test_forwarding_during_discovery_churn() {
    let node = spawn_node("churn").await;

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        for i in 0..100u32 {
            // unreachable fake neighbors: sends fail and become telemetry
            let payload = AnnouncePayload {
                node_id: format!("node_fake_{i}"),
                cluster_id: "churn".to_string(),
                port: 9,
                http_port: 8001,
                spatial: None,
            };
            let src: SocketAddr = "127.0.0.1:9".parse().unwrap();
            node.discovery().handle_announce(payload, src).await;
            node.diffusion().inject(
                "event",
                &format!("churn payload {i}"),
                3.0,
                Duration::from_secs(60),
            );
        }
    })
    .await;
    assert!(outcome.is_ok(), "forwarding deadlocked against discovery");
    assert_eq!(node.diffusion().total_messages(), 100);

    node.shutdown();
}

/// Parameter updates through the node surface are validated and atomic.
#[tokio::test]
async fn test_parameter_update_batch() {
    let node = spawn_node("params").await;

    let updates = HashMap::from([
        ("default_energy".to_string(), serde_json::json!(7)),
        ("cleanup_interval_seconds".to_string(), serde_json::json!(5)),
    ]);
    let report = node.params().update_batch(&updates);
    assert!(report.values().all(|&ok| ok));
    assert_eq!(node.params().get_i64("default_energy", 0), 7);

    // a bad entry voids the whole batch
    let updates = HashMap::from([
        ("default_energy".to_string(), serde_json::json!(9)),
        ("neighbor_timeout_ms".to_string(), serde_json::json!("soon")),
    ]);
    let report = node.params().update_batch(&updates);
    assert!(!report["neighbor_timeout_ms"]);
    assert_eq!(node.params().get_i64("default_energy", 0), 7);

    node.shutdown();
}

/// The status read model reflects the live components.
#[tokio::test]
async fn test_node_status_snapshot() {
    let n1 = spawn_node("status").await;
    let n2 = spawn_node("status").await;
    link(&n1, &n2, "status").await;
    n1.diffusion()
        .inject("data", "status payload", 0.0, Duration::from_secs(60));

    let status = n1.status();
    assert_eq!(status.cluster_id, "status");
    assert_eq!(status.neighbors.len(), 1);
    assert_eq!(status.neighbors[0].node_id, n2.node_id());
    assert_eq!(status.diffusion.total_messages, 1);
    assert_eq!(status.computation.executors, vec!["wordcount"]);

    n1.shutdown();
    n2.shutdown();
}
