//! In-process cluster simulation.
//!
//! Every key has a "home" reader that reads it far more than anyone else.
//! Keys start out owned by a digest-mod-members resolver, so most hot keys
//! live away from their home reader. Each simulated round runs the real
//! protocol over the loopback network; once migration fires, ownership of
//! every released key is handed to its new owner and the next round
//! samples the updated layout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, ensure};
use keyplace_cluster::sim::{
    LoopbackNetwork, RecordingExecutor, StaticResolver, StaticStats, run_inbox,
};
use keyplace_cluster::{Collaborators, OwnershipResolver, PlacementManager, TickOutcome};
use keyplace_core::{KeyCounts, NodeId, PlacementConfig, StatKind};
use keyplace_index::KeyDigest;
use tracing::{info, warn};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SimulateArgs {
    pub nodes: usize,
    pub keys: usize,
    pub rounds: u64,
    pub capacity: usize,
    pub config: PlacementConfig,
}

struct SimNode {
    id: NodeId,
    manager: Arc<PlacementManager>,
    stats: Arc<StaticStats>,
    executor: Arc<RecordingExecutor>,
}

/// Deterministic per-node read counts.
struct Workload {
    keys: Vec<String>,
    members: Vec<NodeId>,
}

impl Workload {
    fn new(members: &[NodeId], keys: usize) -> Self {
        Self {
            keys: (0..keys).map(|i| format!("key:{i:06}")).collect(),
            members: members.to_vec(),
        }
    }

    /// Drawn from a digest word the resolver does not use, so the home
    /// reader is independent of initial ownership.
    fn home(&self, key: &str) -> usize {
        (KeyDigest::of(key).word(3) % self.members.len() as u64) as usize
    }

    fn reads(&self, reader: usize, key: &str) -> u64 {
        let digest = KeyDigest::of(key);
        if self.home(key) == reader {
            100 + digest.word(1) % 100
        } else {
            digest.word(2).wrapping_add(reader as u64) % 20
        }
    }

    fn owners(&self, resolver: &StaticResolver) -> anyhow::Result<HashMap<String, NodeId>> {
        let located = resolver
            .locate_owners(&self.keys, 1)
            .map_err(|e| anyhow!("resolver failed: {e}"))?;
        Ok(located
            .into_iter()
            .filter_map(|(key, owners)| owners.into_iter().next().map(|o| (key, o)))
            .collect())
    }

    /// Feed every node's stats from the current ownership layout.
    fn apply(&self, nodes: &[SimNode], owners: &HashMap<String, NodeId>) {
        for (i, node) in nodes.iter().enumerate() {
            let mut remote = KeyCounts::new();
            let mut local = KeyCounts::new();
            for key in &self.keys {
                let reads = self.reads(i, key);
                if reads == 0 {
                    continue;
                }
                if owners.get(key) == Some(&node.id) {
                    local.insert(key.clone(), reads);
                } else {
                    remote.insert(key.clone(), reads);
                }
            }
            node.stats.set(StatKind::RemoteGet, remote);
            node.stats.set(StatKind::LocalGet, local);
        }
    }

    /// Keys not owned by their home reader.
    fn misplaced(&self, owners: &HashMap<String, NodeId>) -> usize {
        self.keys
            .iter()
            .filter(|key| owners.get(*key) != Some(&self.members[self.home(key)]))
            .count()
    }
}

struct NodeRow {
    node: NodeId,
    released: usize,
    index_bytes: usize,
    depth: usize,
}

/// What a simulation achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationReport {
    pub misplaced_before: usize,
    pub misplaced_after: usize,
    pub migrations: usize,
}

pub async fn run(args: SimulateArgs) -> anyhow::Result<SimulationReport> {
    ensure!(args.nodes >= 2, "a simulation needs at least two nodes");
    ensure!(args.keys > 0, "a simulation needs at least one key");

    let net = Arc::new(LoopbackNetwork::new());
    let ids: Vec<NodeId> = (0..args.nodes).map(|i| NodeId::new(format!("node-{i}"))).collect();
    for id in &ids {
        net.add_member(id.clone());
    }
    let resolver = Arc::new(StaticResolver::new(net.clone()));

    let mut nodes = Vec::with_capacity(ids.len());
    for id in &ids {
        let stats = Arc::new(StaticStats::new(args.capacity));
        let executor = Arc::new(RecordingExecutor::new());
        let (transport, inbox) = net.join(id.clone());
        let peers = Collaborators {
            stats: stats.clone(),
            resolver: resolver.clone(),
            transport,
            executor: executor.clone(),
            store: None,
        };
        let manager = Arc::new(PlacementManager::new(args.config.clone(), peers)?);
        run_inbox(manager.clone(), net.clone(), inbox);
        nodes.push(SimNode {
            id: id.clone(),
            manager,
            stats,
            executor,
        });
    }

    let workload = Workload::new(&ids, args.keys);
    let coordinator = net.coordinator().context("empty cluster has no coordinator")?;
    let coordinator = nodes
        .iter()
        .find(|n| n.id == coordinator)
        .context("coordinator is not a simulated node")?;

    let initial = workload.misplaced(&workload.owners(&resolver)?);
    info!(nodes = args.nodes, keys = args.keys, misplaced = initial, "simulation starting");
    println!("{} nodes, {} keys, {} misplaced at start", args.nodes, args.keys, initial);

    for round in 0..args.rounds {
        let owners = workload.owners(&resolver)?;
        workload.apply(&nodes, &owners);

        let migrations_before = coordinator.executor.migrations();
        let mut sent = 0;
        for node in &nodes {
            match node.manager.tick().await? {
                TickOutcome::Sent { .. } => sent += 1,
                other => warn!(node = %node.id, round, ?other, "node sent no demand"),
            }
        }
        tokio::time::timeout(SETTLE_TIMEOUT, net.quiesce())
            .await
            .map_err(|_| anyhow!("round {round} did not settle within {SETTLE_TIMEOUT:?}"))?;

        let migrated = coordinator.executor.migrations() > migrations_before;
        let mut rows = Vec::with_capacity(nodes.len());
        let mut moved = 0;
        for node in &nodes {
            let released = node.manager.sent_objects().await;
            let stats = node.executor.installed(&node.id).map(|index| index.stats());
            if migrated {
                for (key, _) in &released {
                    if let Some(owner) = node.executor.locate_from(&node.id, key) {
                        resolver.assign(key, owner);
                        moved += 1;
                    }
                }
            }
            rows.push(NodeRow {
                node: node.id.clone(),
                released: released.len(),
                index_bytes: stats.map_or(0, |s| s.encoded_len),
                depth: stats.map_or(0, |s| s.depth),
            });
        }

        let misplaced = workload.misplaced(&workload.owners(&resolver)?);
        info!(round, sent, migrated, moved, misplaced, "simulated round finished");
        print_round(round, migrated, moved, misplaced, &rows);
    }

    let report = SimulationReport {
        misplaced_before: initial,
        misplaced_after: workload.misplaced(&workload.owners(&resolver)?),
        migrations: coordinator.executor.migrations(),
    };
    println!();
    println!(
        "{} migrations, misplaced keys {} -> {}",
        report.migrations, report.misplaced_before, report.misplaced_after
    );
    Ok(report)
}

fn print_round(round: u64, migrated: bool, moved: usize, misplaced: usize, rows: &[NodeRow]) {
    println!();
    println!(
        "round {round}: migration {}, {moved} keys moved, {misplaced} misplaced",
        if migrated { "started" } else { "not started" }
    );
    println!("  {:<10} {:>9} {:>12} {:>6}", "node", "released", "index bytes", "depth");
    for row in rows {
        println!(
            "  {:<10} {:>9} {:>12} {:>6}",
            row.node.as_str(),
            row.released,
            row.index_bytes,
            row.depth
        );
    }
}
