//! In-process collaborators for simulation and tests.
//!
//! `LoopbackNetwork` is a hub of unbounded channels. Every message goes
//! through the real envelope codec, and the hub counts messages that are
//! queued or being handled so callers can wait for the cluster to go idle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keyplace_core::{Envelope, KeyCounts, MemberView, Message, NodeId, StatKind};
use keyplace_index::{CompactRelocationIndex, KeyDigest};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::collaborators::{LocalStore, MigrationExecutor, OwnershipResolver, StatsEngine, Transport};
use crate::manager::PlacementManager;
use crate::table::RelocationTable;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub type Inbox = mpsc::UnboundedReceiver<Vec<u8>>;

/// Decides whether a message is silently lost: `(from, to, message)`.
pub type LossRule = Arc<dyn Fn(&NodeId, &NodeId, &Message) -> bool + Send + Sync>;

#[derive(Default)]
struct Hub {
    members: Vec<NodeId>,
    inboxes: HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    severed: HashSet<(NodeId, NodeId)>,
    loss: Option<LossRule>,
}

#[derive(Default)]
pub struct LoopbackNetwork {
    hub: Mutex<Hub>,
    pending: AtomicUsize,
    delivered: AtomicUsize,
    idle: Notify,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `node` to the member list without giving it an inbox.
    pub fn add_member(&self, node: NodeId) {
        let mut hub = locked(&self.hub);
        if !hub.members.contains(&node) {
            hub.members.push(node);
        }
    }

    /// Join as a member and get a transport plus the inbox to drain.
    pub fn join(self: &Arc<Self>, node: NodeId) -> (Arc<LoopbackTransport>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.add_member(node.clone());
        locked(&self.hub).inboxes.insert(node.clone(), tx);
        let transport = Arc::new(LoopbackTransport {
            local: node,
            net: self.clone(),
        });
        (transport, rx)
    }

    /// Remove `node` from the member list and close its inbox.
    pub fn leave(&self, node: &NodeId) {
        let mut hub = locked(&self.hub);
        hub.members.retain(|m| m != node);
        hub.inboxes.remove(node);
    }

    /// Replace the member order. Nodes not listed keep their inboxes.
    pub fn reorder(&self, members: Vec<NodeId>) {
        locked(&self.hub).members = members;
    }

    /// Make sends from `from` to `to` fail.
    pub fn sever(&self, from: &NodeId, to: &NodeId) {
        locked(&self.hub).severed.insert((from.clone(), to.clone()));
    }

    /// Silently drop messages matching `rule`. Sends still report success.
    pub fn lose_where(&self, rule: impl Fn(&NodeId, &NodeId, &Message) -> bool + Send + Sync + 'static) {
        locked(&self.hub).loss = Some(Arc::new(rule));
    }

    /// Restore every severed link and stop losing messages.
    pub fn heal(&self) {
        let mut hub = locked(&self.hub);
        hub.severed.clear();
        hub.loss = None;
    }

    pub fn members(&self) -> Vec<NodeId> {
        locked(&self.hub).members.clone()
    }

    /// The first member coordinates.
    pub fn coordinator(&self) -> Option<NodeId> {
        locked(&self.hub).members.first().cloned()
    }

    /// Total messages handed to an inbox so far.
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    fn deliver(&self, from: &NodeId, to: &NodeId, message: Message) -> Result<(), String> {
        let hub = locked(&self.hub);
        if hub.severed.contains(&(from.clone(), to.clone())) {
            return Err(format!("link {from} -> {to} is down"));
        }
        if hub.loss.as_ref().is_some_and(|lose| lose(from, to, &message)) {
            debug!(%from, %to, round = message.round(), "loopback message lost");
            return Ok(());
        }
        let bytes = Envelope::new(from.clone(), message)
            .encode()
            .map_err(|e| e.to_string())?;
        let inbox = hub.inboxes.get(to).ok_or_else(|| format!("{to} is unreachable"))?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if inbox.send(bytes).is_err() {
            self.mark_handled();
            return Err(format!("{to} has stopped"));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Called once per delivered message after it has been handled.
    pub fn mark_handled(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no message is queued or being handled.
    pub async fn quiesce(&self) {
        loop {
            let idle = self.idle.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

pub struct LoopbackTransport {
    local: NodeId,
    net: Arc<LoopbackNetwork>,
}

impl Transport for LoopbackTransport {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn members(&self) -> Vec<NodeId> {
        self.net.members()
    }

    fn coordinator(&self) -> Option<NodeId> {
        self.net.coordinator()
    }

    fn send(&self, target: &NodeId, message: Message) -> Result<(), String> {
        self.net.deliver(&self.local, target, message)
    }

    fn broadcast(&self, message: Message) -> Result<(), String> {
        let failures: Vec<String> = self
            .net
            .members()
            .iter()
            .filter(|m| **m != self.local)
            .filter_map(|m| self.net.deliver(&self.local, m, message.clone()).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}

/// Drain `inbox` into `manager`, one task per message.
///
/// Messages are handled concurrently, as a real transport would dispatch
/// them. The loop ends when the inbox closes.
pub fn run_inbox(
    manager: Arc<PlacementManager>,
    net: Arc<LoopbackNetwork>,
    mut inbox: Inbox,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = inbox.recv().await {
            let manager = manager.clone();
            let net = net.clone();
            tokio::spawn(async move {
                match Envelope::decode(&bytes) {
                    Ok(envelope) => manager.handle(envelope).await,
                    Err(e) => warn!(node = %manager.local_node(), error = %e, "undecodable message dropped"),
                }
                net.mark_handled();
            });
        }
        debug!("loopback inbox closed");
    })
}

/// Fixed top-K answers per stat kind.
pub struct StaticStats {
    capacity: usize,
    counts: Mutex<HashMap<StatKind, KeyCounts>>,
}

impl StaticStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, kind: StatKind, counts: KeyCounts) {
        locked(&self.counts).insert(kind, counts);
    }
}

impl StatsEngine for StaticStats {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn top_k(&self, kind: StatKind, k: usize) -> KeyCounts {
        let counts = locked(&self.counts);
        let Some(all) = counts.get(&kind) else {
            return KeyCounts::new();
        };
        let mut ranked: Vec<(&String, &u64)> = all.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(k)
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }
}

/// Explicit ownership, falling back to digest-mod-members.
pub struct StaticResolver {
    net: Arc<LoopbackNetwork>,
    assigned: Mutex<HashMap<String, NodeId>>,
}

impl StaticResolver {
    pub fn new(net: Arc<LoopbackNetwork>) -> Self {
        Self {
            net,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn assign(&self, key: &str, owner: NodeId) {
        locked(&self.assigned).insert(key.to_string(), owner);
    }
}

impl OwnershipResolver for StaticResolver {
    fn locate_owners(
        &self,
        keys: &[String],
        replicas: usize,
    ) -> Result<HashMap<String, Vec<NodeId>>, String> {
        let members = self.net.members();
        if members.is_empty() {
            return Err("no members to own keys".to_string());
        }
        let assigned = locked(&self.assigned);
        let owners = keys
            .iter()
            .map(|key| {
                let start = match assigned.get(key).and_then(|o| members.iter().position(|m| m == o)) {
                    Some(i) => i,
                    None => (KeyDigest::of(key).word(0) % members.len() as u64) as usize,
                };
                let owners = (0..replicas.min(members.len()))
                    .map(|r| members[(start + r) % members.len()].clone())
                    .collect();
                (key.clone(), owners)
            })
            .collect();
        Ok(owners)
    }
}

/// Records everything the protocol asks of the executor.
#[derive(Default)]
pub struct RecordingExecutor {
    table: Mutex<RelocationTable>,
    views: Mutex<Vec<MemberView>>,
    migrations: Mutex<Vec<String>>,
    fail_migration: Mutex<Option<String>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn migrations(&self) -> usize {
        locked(&self.migrations).len()
    }

    pub fn cache_names(&self) -> Vec<String> {
        locked(&self.migrations).clone()
    }

    pub fn views(&self) -> Vec<MemberView> {
        locked(&self.views).clone()
    }

    /// New owner of `key` per the installed indices.
    pub fn locate(&self, key: &str) -> Option<NodeId> {
        locked(&self.table).locate(key)
    }

    /// New owner of `key` per the index `owner` announced.
    pub fn locate_from(&self, owner: &NodeId, key: &str) -> Option<NodeId> {
        locked(&self.table).locate_from(owner, key)
    }

    pub fn installed_owners(&self) -> Vec<NodeId> {
        locked(&self.table).owners()
    }

    pub fn installed(&self, owner: &NodeId) -> Option<Arc<CompactRelocationIndex>> {
        locked(&self.table).get(owner).cloned()
    }

    /// Make the next `begin_migration` calls fail with `reason`.
    pub fn fail_migrations(&self, reason: &str) {
        *locked(&self.fail_migration) = Some(reason.to_string());
    }
}

impl MigrationExecutor for RecordingExecutor {
    fn set_member_view(&self, view: &MemberView) {
        locked(&self.table).set_view(view);
        locked(&self.views).push(view.clone());
    }

    fn install_index(&self, owner: &NodeId, index: Arc<CompactRelocationIndex>) {
        locked(&self.table).install(owner, index);
    }

    fn begin_migration(&self, cache_name: &str) -> Result<(), String> {
        if let Some(reason) = locked(&self.fail_migration).clone() {
            return Err(reason);
        }
        locked(&self.migrations).push(cache_name.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str) {
        locked(&self.keys).insert(key.to_string());
    }

    pub fn remove(&self, key: &str) -> bool {
        locked(&self.keys).remove(key)
    }
}

impl LocalStore for MemoryStore {
    fn contains_key(&self, key: &str) -> bool {
        locked(&self.keys).contains(key)
    }

    fn len(&self) -> usize {
        locked(&self.keys).len()
    }
}
