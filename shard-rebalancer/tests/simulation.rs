//! Multi-node simulation tests for shard-rebalancer.
//!
//! These tests run several coordinators against one in-process coordination
//! hub and exercise joins, leaves and churn the way a real fleet sees them.

use shard_rebalancer::coordination::{CoordinationClient, Membership, MemoryCoordinator};
use shard_rebalancer::{allocate, ClusterConfig, LifecycleEvents, RebalanceCoordinator};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const PARTY_PATH: &str = "/elastic-cluster/party";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("shard_rebalancer=debug")
        .with_test_writer()
        .try_init();
}

fn config(host: &str, port: u16) -> ClusterConfig {
    ClusterConfig::new(host, port)
        .with_rebalance_delay(Duration::from_millis(50))
        .with_rebalance_timeout(Duration::from_secs(1))
}

fn start_node(hub: &MemoryCoordinator, host: &str, port: u16) -> RebalanceCoordinator {
    RebalanceCoordinator::new(config(host, port), hub.client(), LifecycleEvents::none())
}

/// Node whose "finished" handler counts commits.
fn counting_node(
    hub: &MemoryCoordinator,
    host: &str,
    port: u16,
) -> (RebalanceCoordinator, Arc<AtomicU32>) {
    let commits = Arc::new(AtomicU32::new(0));
    let counter = commits.clone();
    let events = LifecycleEvents::builder()
        .on_end(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { anyhow::Ok(()) }
        })
        .build();
    let coordinator = RebalanceCoordinator::new(config(host, port), hub.client(), events);
    (coordinator, commits)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cluster did not converge within 10s");
}

fn all_assigned(nodes: &[&RebalanceCoordinator], size: usize) -> bool {
    nodes
        .iter()
        .all(|n| n.local_shard().is_some() && n.assignment().len() == size)
}

#[tokio::test]
async fn test_three_nodes_agree_on_sorted_assignment() {
    init_tracing();
    let hub = MemoryCoordinator::new();

    // Started in non-sorted order on purpose
    let c = start_node(&hub, "10.0.0.3", 8080);
    let a = start_node(&hub, "10.0.0.1", 8080);
    let b = start_node(&hub, "10.0.0.2", 8080);
    for node in [&c, &a, &b] {
        node.start().await.unwrap();
    }

    wait_until(|| all_assigned(&[&a, &b, &c], 3)).await;

    assert_eq!(a.local_shard(), Some(0));
    assert_eq!(b.local_shard(), Some(1));
    assert_eq!(c.local_shard(), Some(2));
    assert!(a.is_leader());

    let expected = allocate(&["10.0.0.1:8080", "10.0.0.2:8080", "10.0.0.3:8080"]);
    for node in [&a, &b, &c] {
        assert_eq!(node.assignment(), expected, "Every node must compute the same table");
        assert!(node.ready().await.is_ok());
    }

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }

    let stats = hub.barrier_stats();
    assert_eq!(stats.entered, stats.released);
    assert!(hub.open_gates().is_empty());
}

#[tokio::test]
async fn test_burst_of_joins_commits_once() {
    init_tracing();
    let hub = MemoryCoordinator::new();

    let (a, a_commits) = counting_node(&hub, "h", 1);
    a.start().await.unwrap();
    a.wait_for_assignment().await;
    assert_eq!(a_commits.load(Ordering::SeqCst), 1);

    // Two joins well inside one debounce window
    let b = start_node(&hub, "h", 2);
    let c = start_node(&hub, "h", 3);
    b.start().await.unwrap();
    c.start().await.unwrap();

    wait_until(|| all_assigned(&[&a, &b, &c], 3)).await;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(
        a_commits.load(Ordering::SeqCst),
        2,
        "Burst should produce exactly one more commit"
    );
    assert_eq!(a.assignment(), allocate(&["h:1", "h:2", "h:3"]));

    for node in [a, b, c] {
        node.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_member_leaving_mid_rebalance() {
    init_tracing();
    let hub = MemoryCoordinator::new();

    // A member that never enters the gate
    let ghost_client = hub.client();
    ghost_client.connect().await.unwrap();
    let ghost = ghost_client.membership(PARTY_PATH, "h:0");
    ghost.join().await.unwrap();

    let (a, a_commits) = counting_node(&hub, "h", 1);
    let (b, b_commits) = counting_node(&hub, "h", 2);
    a.start().await.unwrap();
    b.start().await.unwrap();

    // Both real nodes are stuck at the gate waiting for the ghost
    wait_until(|| hub.barrier_stats().held() == 2).await;
    assert_eq!(a.local_shard(), None);
    assert_eq!(b.local_shard(), None);

    ghost.leave().await.unwrap();

    wait_until(|| all_assigned(&[&a, &b], 2)).await;
    assert_eq!(a.local_shard(), Some(0));
    assert_eq!(b.local_shard(), Some(1));
    assert_eq!(a_commits.load(Ordering::SeqCst), 1, "Cancelled attempt must not commit");
    assert_eq!(b_commits.load(Ordering::SeqCst), 1, "Cancelled attempt must not commit");

    let stats = hub.barrier_stats();
    assert_eq!(stats.entered, stats.released, "Every slot taken must be released");
    assert!(hub.open_gates().is_empty());

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_scale_down_reassigns_remaining_nodes() {
    init_tracing();
    let hub = MemoryCoordinator::new();

    let a = start_node(&hub, "h", 1);
    let b = start_node(&hub, "h", 2);
    let c = start_node(&hub, "h", 3);
    for node in [&a, &b, &c] {
        node.start().await.unwrap();
    }
    wait_until(|| all_assigned(&[&a, &b, &c], 3)).await;

    // Leader leaves gracefully
    a.stop().await.unwrap();

    wait_until(|| all_assigned(&[&b, &c], 2)).await;
    assert_eq!(b.local_shard(), Some(0));
    assert_eq!(c.local_shard(), Some(1));
    assert!(b.is_leader());
    assert_eq!(hub.members(PARTY_PATH).len(), 2);

    b.stop().await.unwrap();
    c.stop().await.unwrap();
}

#[tokio::test]
async fn test_scale_up_from_1_to_5_nodes() {
    init_tracing();
    let hub = MemoryCoordinator::new();

    let mut nodes = vec![start_node(&hub, "svc", 9000)];
    nodes[0].start().await.unwrap();
    assert_eq!(nodes[0].wait_for_assignment().await, 0);

    for port in 9001..9005 {
        let node = start_node(&hub, "svc", port);
        node.start().await.unwrap();
        nodes.push(node);
        sleep(Duration::from_millis(20)).await;
    }

    wait_until(|| nodes.iter().all(|n| n.assignment().len() == 5)).await;

    // Every shard owned exactly once
    let mut shards: Vec<u32> = nodes.iter().filter_map(|n| n.local_shard()).collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![0, 1, 2, 3, 4]);

    for node in nodes {
        node.stop().await.unwrap();
    }
    assert_eq!(hub.barrier_stats().held(), 0);
}
