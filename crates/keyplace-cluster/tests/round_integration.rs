//! Multi-node placement round tests.
//!
//! Every scenario runs in-process over the loopback network: real
//! envelopes, concurrent message handling, in-memory stats and executor.

use std::sync::{Arc, Once};
use std::time::Duration;

use keyplace_cluster::sim::{
    LoopbackNetwork, MemoryStore, RecordingExecutor, StaticResolver, StaticStats, run_inbox,
};
use keyplace_cluster::{Collaborators, PlacementManager, RehashEvent, TickOutcome};
use keyplace_core::{
    AnnouncePhase, DemandReportMessage, Envelope, IndexAnnounceMessage, KeyCounts, Message, NodeId,
    PlacementConfig, StatKind,
};

static TRACING_INIT: Once = Once::new();

/// Protocol logs for a failing run, controlled by `RUST_LOG`.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

struct TestNode {
    id: NodeId,
    manager: Arc<PlacementManager>,
    stats: Arc<StaticStats>,
    executor: Arc<RecordingExecutor>,
    store: Arc<MemoryStore>,
}

struct TestCluster {
    net: Arc<LoopbackNetwork>,
    resolver: Arc<StaticResolver>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    fn new(ids: &[&str], config: PlacementConfig) -> Self {
        init_tracing();
        let net = Arc::new(LoopbackNetwork::new());
        for id in ids {
            net.add_member(NodeId::from(*id));
        }
        let resolver = Arc::new(StaticResolver::new(net.clone()));

        let nodes = ids
            .iter()
            .map(|id| {
                let id = NodeId::from(*id);
                let stats = Arc::new(StaticStats::new(2));
                let executor = Arc::new(RecordingExecutor::new());
                let store = Arc::new(MemoryStore::new());
                let (transport, inbox) = net.join(id.clone());
                let peers = Collaborators {
                    stats: stats.clone(),
                    resolver: resolver.clone(),
                    transport,
                    executor: executor.clone(),
                    store: Some(store.clone()),
                };
                let manager = Arc::new(PlacementManager::new(config.clone(), peers).unwrap());
                run_inbox(manager.clone(), net.clone(), inbox);
                TestNode {
                    id,
                    manager,
                    stats,
                    executor,
                    store,
                }
            })
            .collect();

        Self {
            net,
            resolver,
            nodes,
        }
    }

    fn node(&self, id: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.id.as_str() == id)
            .expect("node exists")
    }

    fn sample(&self, id: &str, kind: StatKind, pairs: &[(&str, u64)]) {
        self.node(id).stats.set(kind, counts(pairs));
    }

    fn own(&self, owner: &str, keys: &[&str]) {
        for key in keys {
            self.resolver.assign(key, owner.into());
        }
    }

    async fn tick_all(&self) -> Vec<TickOutcome> {
        let mut outcomes = Vec::new();
        for node in &self.nodes {
            outcomes.push(node.manager.tick().await.expect("tick"));
        }
        outcomes
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(30), self.net.quiesce())
            .await
            .expect("cluster went idle");
    }
}

fn counts(pairs: &[(&str, u64)]) -> KeyCounts {
    pairs.iter().map(|(k, c)| (k.to_string(), *c)).collect()
}

/// A on B's keys, B on C's, C on A's. Every node clears the sample threshold.
fn three_nodes(config: PlacementConfig) -> TestCluster {
    let c = TestCluster::new(&["a", "b", "c"], config);
    c.own("b", &["k1", "k2"]);
    c.own("c", &["x1", "x2"]);
    c.own("a", &["y1", "y2"]);
    c.sample("a", StatKind::RemoteGet, &[("k1", 50), ("k2", 40)]);
    c.sample("b", StatKind::RemoteGet, &[("x1", 3), ("x2", 3)]);
    c.sample("c", StatKind::RemoteGet, &[("y1", 1), ("y2", 1)]);
    c
}

#[tokio::test]
async fn hot_keys_relocate_to_their_heaviest_reader() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.sample("b", StatKind::LocalGet, &[("k1", 10)]);

    let outcomes = cluster.tick_all().await;
    assert!(outcomes.iter().all(|o| matches!(o, TickOutcome::Sent { round: 0, reports: 2, .. })));
    cluster.settle().await;

    let b = cluster.node("b");
    // k2 has no local reads at B, so it is released as well.
    assert_eq!(
        b.manager.sent_objects().await,
        vec![("k1".to_string(), 0), ("k2".to_string(), 0)]
    );

    for node in &cluster.nodes {
        let rounds = node.manager.rounds().await;
        assert_eq!((rounds.request_round, rounds.reply_round), (1, 1), "node {}", node.id);
        assert_eq!(node.manager.in_flight().await, None);
        assert_eq!(node.executor.installed_owners(), vec![NodeId::from("a"), "b".into(), "c".into()]);
        assert_eq!(node.executor.locate("k1"), Some("a".into()));
        assert_eq!(node.executor.locate("x1"), Some("b".into()));
        assert_eq!(node.executor.locate("y2"), Some("c".into()));
    }

    assert_eq!(cluster.node("a").executor.migrations(), 1);
    assert_eq!(cluster.node("b").executor.migrations(), 0);
    assert_eq!(cluster.node("c").executor.migrations(), 0);
}

#[tokio::test]
async fn local_use_at_least_as_high_keeps_the_key() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.sample("b", StatKind::LocalGet, &[("k1", 10), ("k2", 40)]);

    cluster.tick_all().await;
    cluster.settle().await;

    let b = cluster.node("b");
    assert_eq!(b.manager.sent_objects().await, vec![("k1".to_string(), 0)]);
    assert_eq!(b.executor.locate("k2"), None);
}

#[tokio::test]
async fn each_node_acks_exactly_once_per_round() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.tick_all().await;
    cluster.settle().await;

    // 6 demand reports, 6 index broadcasts, 2 acks.
    assert_eq!(cluster.net.delivered(), 14);

    // A repeated announcement replaces the slot but triggers nothing.
    let (filter, classifier) = cluster
        .node("c")
        .executor
        .installed(&"b".into())
        .expect("b's index installed at c")
        .encode();
    let repeat = Envelope::new(
        "b".into(),
        Message::IndexAnnounce(IndexAnnounceMessage::setting(0, filter, classifier)),
    );
    cluster.node("c").manager.handle(repeat).await;
    cluster.settle().await;

    assert_eq!(cluster.net.delivered(), 14);
    assert_eq!(cluster.node("a").executor.migrations(), 1);
}

#[tokio::test]
async fn migration_waits_for_every_ack() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.net.lose_where(|from, _, message| {
        from.as_str() == "c"
            && matches!(message, Message::IndexAnnounce(m) if m.phase == AnnouncePhase::Ack)
    });

    cluster.tick_all().await;
    cluster.settle().await;

    let a = cluster.node("a");
    assert_eq!(a.manager.ack_count(0).await, 1);
    assert_eq!(a.executor.migrations(), 0);

    // The lost ack finally arrives.
    let ack = Envelope::new("c".into(), Message::IndexAnnounce(IndexAnnounceMessage::ack(0)));
    a.manager.handle(ack.clone()).await;
    assert_eq!(a.executor.migrations(), 1);

    a.manager.handle(ack).await;
    assert_eq!(a.executor.migrations(), 1);
}

#[tokio::test]
async fn consecutive_rounds_each_migrate_once() {
    let cluster = three_nodes(PlacementConfig::default());
    for round in 0..3u64 {
        let outcomes = cluster.tick_all().await;
        assert!(
            outcomes.iter().all(|o| matches!(o, TickOutcome::Sent { round: r, .. } if *r == round)),
            "round {round}: {outcomes:?}"
        );
        cluster.settle().await;
    }
    assert_eq!(cluster.node("a").executor.migrations(), 3);
    for node in &cluster.nodes {
        let rounds = node.manager.rounds().await;
        assert_eq!((rounds.request_round, rounds.reply_round), (3, 3));
    }
}

#[tokio::test]
async fn stale_and_repeated_reports_change_nothing() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.tick_all().await;
    cluster.settle().await;

    let b = cluster.node("b");
    let before = b.manager.sent_objects().await;
    let stale = Envelope::new(
        "a".into(),
        Message::DemandReport(DemandReportMessage::new(0, counts(&[("k9", 1_000)]))),
    );
    b.manager.handle(stale).await;
    cluster.settle().await;

    assert_eq!(b.manager.rounds().await.reply_round, 1);
    assert_eq!(b.manager.sent_objects().await, before);
}

#[tokio::test]
async fn tick_is_skipped_while_a_round_is_in_flight() {
    let cluster = three_nodes(PlacementConfig::default());
    // C's report to B vanishes, so B never aggregates round 0.
    cluster.net.lose_where(|from, to, message| {
        from.as_str() == "c" && to.as_str() == "b" && matches!(message, Message::DemandReport(_))
    });
    cluster.tick_all().await;
    cluster.settle().await;

    let outcomes = cluster.tick_all().await;
    assert!(outcomes.iter().all(|o| *o == TickOutcome::InFlight { round: 0 }), "{outcomes:?}");
    assert_eq!(cluster.node("b").manager.rounds().await.reply_round, 0);
    assert_eq!(cluster.node("a").executor.migrations(), 0);
}

#[tokio::test(start_paused = true)]
async fn expired_round_is_abandoned_and_the_next_one_completes() {
    let config = PlacementConfig {
        round_timeout_secs: 10,
        ..PlacementConfig::default()
    };
    let cluster = three_nodes(config);
    cluster.net.lose_where(|from, to, message| {
        from.as_str() == "c" && to.as_str() == "b" && matches!(message, Message::DemandReport(_))
    });
    cluster.tick_all().await;
    cluster.settle().await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    cluster.net.heal();

    let outcomes = cluster.tick_all().await;
    assert!(outcomes.iter().all(|o| matches!(o, TickOutcome::Sent { round: 1, .. })), "{outcomes:?}");
    cluster.settle().await;

    for node in &cluster.nodes {
        let rounds = node.manager.rounds().await;
        assert_eq!((rounds.request_round, rounds.reply_round), (2, 2), "node {}", node.id);
        assert_eq!(node.manager.in_flight().await, None);
    }
    // Round 0 never finished; round 1 did.
    assert_eq!(cluster.node("a").executor.migrations(), 1);
}

#[tokio::test]
async fn departure_mid_round_aborts_it() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.net.lose_where(|from, to, message| {
        from.as_str() == "c" && to.as_str() == "b" && matches!(message, Message::DemandReport(_))
    });
    cluster.tick_all().await;
    cluster.settle().await;

    let b = cluster.node("b");
    assert!(b.executor.installed(&"c".into()).is_some());

    cluster.net.heal();
    cluster.net.leave(&"c".into());

    // The view refresh aborts round 0, which clears the in-flight guard.
    let outcome = b.manager.tick().await.expect("tick");
    assert!(matches!(outcome, TickOutcome::Sent { round: 1, .. }), "{outcome:?}");
    let rounds = b.manager.rounds().await;
    assert_eq!((rounds.request_round, rounds.reply_round), (2, 1));
    assert_eq!(b.manager.view().await.len(), 2);
    assert_eq!(b.executor.views().last().map(|v| v.len()), Some(2));
    // Indices announced under the three-member view no longer resolve.
    assert!(b.executor.installed(&"c".into()).is_none());
}

#[tokio::test]
async fn consistency_check_tracks_released_keys() {
    let cluster = three_nodes(PlacementConfig::default());
    let b = cluster.node("b");
    b.store.insert("k1");
    b.store.insert("k2");
    cluster.tick_all().await;
    cluster.settle().await;

    let members: Vec<NodeId> = cluster.net.members();
    let event = |pre| RehashEvent {
        pre,
        view_id: 2,
        members_at_start: members.clone(),
        members_at_end: members.clone(),
    };
    assert!(b.manager.on_rehash(&event(true)).await.is_empty());

    // k2 moved, k1 did not.
    b.store.remove("k2");
    assert_eq!(b.manager.on_rehash(&event(false)).await, vec!["k1".to_string()]);
}

#[tokio::test]
async fn consistency_check_can_be_disabled() {
    let config = PlacementConfig {
        consistency_check: false,
        ..PlacementConfig::default()
    };
    let cluster = three_nodes(config);
    cluster.tick_all().await;
    cluster.settle().await;

    let members = cluster.net.members();
    let event = RehashEvent {
        pre: true,
        view_id: 2,
        members_at_start: members.clone(),
        members_at_end: members,
    };
    // Nothing is stored locally, yet no violation is reported.
    assert!(cluster.node("b").manager.on_rehash(&event).await.is_empty());
}

#[tokio::test]
async fn failed_migration_is_reported_not_retried() {
    let cluster = three_nodes(PlacementConfig::default());
    cluster.node("a").executor.fail_migrations("disk full");
    cluster.tick_all().await;
    cluster.settle().await;

    assert_eq!(cluster.node("a").executor.migrations(), 0);
    // The barrier still closed; a late ack does not retry.
    let ack = Envelope::new("b".into(), Message::IndexAnnounce(IndexAnnounceMessage::ack(0)));
    cluster.node("a").manager.handle(ack).await;
    assert_eq!(cluster.node("a").executor.migrations(), 0);
}
