//! Placement manager — one node's side of the placement protocol.
//!
//! A round runs in four phases:
//!
//! 1. `tick` samples hot remote keys and sends one demand report to every
//!    peer, tagged with `request_round`.
//! 2. Each node buffers the reports for its `reply_round`. Once every peer
//!    has reported, it merges the demand, resolves it against local reads,
//!    trains a relocation index and broadcasts it.
//! 3. Each node installs every member's index (its own included). When all
//!    are installed it acks the coordinator.
//! 4. The coordinator starts migration after hearing from every other
//!    member.
//!
//! Aggregation state lives behind one lock. The install and ack barriers
//! each have their own. A barrier lock is never held while waiting on the
//! state lock.

use std::sync::Arc;

use keyplace_core::{
    AnnouncePhase, DemandReportMessage, Envelope, IndexAnnounceMessage, MemberView, Message, NodeId,
    PlacementConfig, RoundState, StatKind,
};
use keyplace_index::{CompactRelocationIndex, IndexStats};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregator::{
    Admission, ConflictStats, MergeStats, RelocationDecision, RequestAggregator, compact_requests,
    resolve_conflicts,
};
use crate::barrier::{BarrierProgress, RoundBarrier};
use crate::collaborators::{Collaborators, RehashEvent};
use crate::collector::plan_demand;
use crate::consistency::check_relocated;
use crate::error::{PlacementError, PlacementResult};

/// Summary of one completed aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub round: u64,
    pub reports: usize,
    pub merge: MergeStats,
    pub conflicts: ConflictStats,
    /// Keys this node released.
    pub released: usize,
    pub index: IndexStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub admission: Admission,
    /// Aggregations this report completed. More than one when parked
    /// reports complete the next round as well.
    pub completed: Vec<RoundOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sent {
        round: u64,
        reports: usize,
        non_empty: usize,
        failed: usize,
    },
    /// The previous round has not finished installing.
    InFlight { round: u64 },
    InsufficientSample { size: usize, capacity: usize },
    /// Nobody to send to.
    NoPeers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Progress(BarrierProgress),
    MigrationStarted { round: u64 },
    /// This node is not the coordinator.
    NotCoordinator,
}

type Aggregated = (RoundOutcome, Arc<CompactRelocationIndex>);

#[derive(Debug, Clone, Copy)]
struct InFlight {
    round: u64,
    since: Instant,
}

struct ProtocolState {
    view: MemberView,
    rounds: RoundState,
    aggregator: RequestAggregator,
    sent_objects: RelocationDecision,
    in_flight: Option<InFlight>,
}

pub struct PlacementManager {
    config: PlacementConfig,
    local: NodeId,
    peers: Collaborators,
    state: Mutex<ProtocolState>,
    installs: Mutex<RoundBarrier>,
    acks: Mutex<RoundBarrier>,
}

impl PlacementManager {
    pub fn new(config: PlacementConfig, peers: Collaborators) -> PlacementResult<Self> {
        config.validate()?;
        let local = peers.transport.local_node();
        let view = MemberView::new(0, peers.transport.members());
        peers.executor.set_member_view(&view);
        info!(node = %local, members = view.len(), "placement manager started");

        Ok(Self {
            state: Mutex::new(ProtocolState {
                view,
                rounds: RoundState::default(),
                aggregator: RequestAggregator::new(config.max_future_rounds),
                sent_objects: RelocationDecision::new(),
                in_flight: None,
            }),
            installs: Mutex::new(RoundBarrier::new()),
            acks: Mutex::new(RoundBarrier::new()),
            config,
            local,
            peers,
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    pub async fn rounds(&self) -> RoundState {
        self.state.lock().await.rounds
    }

    pub async fn view(&self) -> MemberView {
        self.state.lock().await.view.clone()
    }

    /// The last relocation decision, kept for the consistency check.
    pub async fn sent_objects(&self) -> RelocationDecision {
        self.state.lock().await.sent_objects.clone()
    }

    /// Round this node is waiting to finish installing, if any.
    pub async fn in_flight(&self) -> Option<u64> {
        self.state.lock().await.in_flight.map(|f| f.round)
    }

    pub async fn install_count(&self, round: u64) -> usize {
        self.installs.lock().await.count(round)
    }

    pub async fn ack_count(&self, round: u64) -> usize {
        self.acks.lock().await.count(round)
    }

    /// Scheduler entry point: expire a stuck round if needed, then collect.
    pub async fn tick(&self) -> PlacementResult<TickOutcome> {
        let (expired, done) = {
            let mut state = self.state.lock().await;
            self.refresh_view(&mut state);
            let Some(flight) = state.in_flight else {
                drop(state);
                return self.collect_and_send().await;
            };
            let age = flight.since.elapsed();
            if age < self.config.round_timeout() {
                info!(node = %self.local, round = flight.round, ?age, "previous round still in flight; skipping tick");
                return Ok(TickOutcome::InFlight { round: flight.round });
            }

            warn!(node = %self.local, round = flight.round, ?age, "round expired; abandoning it");
            state.in_flight = None;
            let before = state.rounds.reply_round;
            state.rounds.expire();
            let mut done = Vec::new();
            if state.rounds.reply_round != before {
                // Reports already parked for the new reply round are kept.
                let next = state.rounds.reply_round;
                let ProtocolState {
                    view, aggregator, ..
                } = &mut *state;
                aggregator.advance(next, view);
                done = self.aggregate_complete(&mut state).0;
            }
            (flight.round, done)
        };

        self.installs.lock().await.close_through(expired);
        self.publish(done).await;
        self.collect_and_send().await
    }

    /// Sample hot remote keys and report them to their owners.
    pub async fn collect_and_send(&self) -> PlacementResult<TickOutcome> {
        let mut state = self.state.lock().await;
        self.refresh_view(&mut state);

        let capacity = self.peers.stats.capacity();
        let sample = self.peers.stats.top_k(StatKind::RemoteGet, capacity);
        let size = sample.len();
        if capacity == 0 || !self.config.sample_is_sufficient(size, capacity) {
            info!(node = %self.local, size, capacity, "remote-get sample too small; not sending");
            return Ok(TickOutcome::InsufficientSample { size, capacity });
        }
        if state.view.peer_count() == 0 {
            warn!(node = %self.local, "no peers in member view; skipping round");
            return Ok(TickOutcome::NoPeers);
        }

        let keys: Vec<String> = sample.keys().cloned().collect();
        let owners = self
            .peers
            .resolver
            .locate_owners(&keys, self.config.replica_count)
            .map_err(PlacementError::Resolver)?;
        let plan = plan_demand(&self.local, state.view.members(), sample, &owners);

        let round = state.rounds.request_round;
        let reports = plan.reports.len();
        let non_empty = plan.non_empty();
        let mut failed = 0;
        for (target, key_counts) in plan.reports {
            let keys = key_counts.len();
            let message = Message::DemandReport(DemandReportMessage::new(round, key_counts));
            match self.peers.transport.send(&target, message) {
                Ok(()) => debug!(node = %self.local, %target, round, keys, "demand report sent"),
                Err(e) => {
                    failed += 1;
                    warn!(node = %self.local, %target, round, error = %e, "demand report send failed");
                }
            }
        }

        state.rounds.request_round += 1;
        state.in_flight = Some(InFlight {
            round,
            since: Instant::now(),
        });
        info!(node = %self.local, round, reports, non_empty, failed, "demand reports sent");
        Ok(TickOutcome::Sent {
            round,
            reports,
            non_empty,
            failed,
        })
    }

    pub async fn on_demand_report(
        &self,
        sender: &NodeId,
        report: DemandReportMessage,
    ) -> PlacementResult<ReportOutcome> {
        if *sender == self.local {
            return Err(PlacementError::SelfAddressed);
        }

        let completed;
        let admission = {
            let mut state = self.state.lock().await;
            if let Some(round) = self.refresh_view(&mut state) {
                return Err(PlacementError::TopologyChanged { round });
            }
            let sender_index = state
                .view
                .index_of(sender)
                .ok_or_else(|| PlacementError::UnknownSender(sender.clone()))?;

            let reply_round = state.rounds.reply_round;
            let round = report.round;
            let ProtocolState {
                view, aggregator, ..
            } = &mut *state;
            let admission =
                aggregator.admit(view, reply_round, sender, sender_index, round, report.key_counts);
            match admission {
                Admission::Buffered => debug!(
                    node = %self.local,
                    %sender,
                    round,
                    have = aggregator.buffered_count(),
                    need = view.peer_count(),
                    "demand report buffered"
                ),
                Admission::Parked => {
                    debug!(node = %self.local, %sender, round, reply_round, "demand report parked for a later round")
                }
                Admission::Duplicate => {
                    warn!(node = %self.local, %sender, round, "duplicate demand report dropped")
                }
                Admission::Stale => {
                    warn!(node = %self.local, %sender, round, reply_round, "stale demand report dropped")
                }
                Admission::TooFarAhead => {
                    warn!(node = %self.local, %sender, round, reply_round, "demand report too far ahead; dropped")
                }
            }

            completed = self.aggregate_complete(&mut state);
            admission
        };

        let (done, failure) = completed;
        let outcomes = self.publish(done).await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(ReportOutcome {
            admission,
            completed: outcomes,
        })
    }

    /// Aggregate every round the buffer holds in full. Stops at the first
    /// failure, leaving that round buffered.
    fn aggregate_complete(&self, state: &mut ProtocolState) -> (Vec<Aggregated>, Option<PlacementError>) {
        let mut done = Vec::new();
        while state.aggregator.is_complete(state.view.peer_count()) {
            match self.aggregate(state) {
                Ok(aggregated) => done.push(aggregated),
                Err(e) => {
                    error!(
                        node = %self.local,
                        round = state.rounds.reply_round,
                        error = %e,
                        "aggregation failed; round left buffered"
                    );
                    return (done, Some(e));
                }
            }
        }
        (done, None)
    }

    async fn publish(&self, done: Vec<Aggregated>) -> Vec<RoundOutcome> {
        let mut outcomes = Vec::with_capacity(done.len());
        for (outcome, index) in done {
            self.broadcast_index(outcome.round, index).await;
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Merge the buffered round, decide, train, and advance `reply_round`.
    ///
    /// On error nothing is advanced and the buffer is left as it was.
    fn aggregate(&self, state: &mut ProtocolState) -> PlacementResult<Aggregated> {
        let round = state.rounds.reply_round;
        let reports = state.aggregator.buffered_count();
        let (demand, merge) = compact_requests(state.aggregator.buffered());
        info!(
            node = %self.local,
            round,
            keys = demand.len(),
            merged = merge.merged,
            conflicts_won = merge.conflicts_won,
            conflicts_lost = merge.conflicts_lost,
            "demand reports merged"
        );

        let capacity = self.peers.stats.capacity();
        let local = self.peers.stats.top_k(StatKind::LocalGet, capacity);
        let (decision, conflicts) = resolve_conflicts(&demand, &local);
        info!(
            node = %self.local,
            round,
            final_list = decision.len(),
            uncontested = conflicts.uncontested,
            won = conflicts.won,
            lost = conflicts.lost,
            "conflicts resolved against local usage"
        );

        let index = CompactRelocationIndex::train(&decision, self.config.false_positive_rate)?;
        let stats = index.stats();
        debug!(node = %self.local, round, rules = %index.describe(), "relocation index rules");

        let outcome = RoundOutcome {
            round,
            reports,
            merge,
            conflicts,
            released: decision.len(),
            index: stats,
        };
        state.sent_objects = decision;
        state.rounds.reply_round += 1;
        let next = state.rounds.reply_round;
        let ProtocolState {
            view, aggregator, ..
        } = state;
        aggregator.advance(next, view);

        Ok((outcome, Arc::new(index)))
    }

    /// Install our own index, then send it to everyone else.
    pub async fn broadcast_index(&self, round: u64, index: Arc<CompactRelocationIndex>) {
        let (filter, classifier) = index.encode();
        if let Err(e) = self.on_index_received(&self.local, round, index).await {
            error!(node = %self.local, round, error = %e, "local index install failed");
        }

        let bytes = filter.len() + classifier.len();
        let message = Message::IndexAnnounce(IndexAnnounceMessage::setting(round, filter, classifier));
        match self.peers.transport.broadcast(message) {
            Ok(()) => info!(node = %self.local, round, bytes, "relocation index broadcast"),
            Err(e) => warn!(node = %self.local, round, error = %e, "relocation index broadcast failed"),
        }
    }

    /// Install `source`'s index for `round` and ack once every member's is in.
    pub async fn on_index_received(
        &self,
        source: &NodeId,
        round: u64,
        index: Arc<CompactRelocationIndex>,
    ) -> PlacementResult<BarrierProgress> {
        let need = {
            let mut state = self.state.lock().await;
            self.refresh_view(&mut state);
            if !state.view.contains(source) {
                return Err(PlacementError::UnknownSender(source.clone()));
            }
            self.check_window(&state, round)?;
            state.view.len()
        };

        let progress = {
            let mut installs = self.installs.lock().await;
            if installs.is_closed(round) {
                BarrierProgress::Stale
            } else {
                self.peers.executor.install_index(source, index);
                installs.record(round, source, need)
            }
        };

        match progress {
            BarrierProgress::Counted { have, need } => {
                debug!(node = %self.local, %source, round, have, need, "relocation index installed")
            }
            BarrierProgress::Duplicate => {
                warn!(node = %self.local, %source, round, "repeated index announcement; slot replaced, not recounted")
            }
            BarrierProgress::Stale => {
                warn!(node = %self.local, %source, round, "index for a finished round dropped")
            }
            BarrierProgress::Complete => {
                info!(node = %self.local, round, installed = need, "all relocation indices installed");
                {
                    let mut state = self.state.lock().await;
                    if state.in_flight.is_some_and(|f| f.round <= round) {
                        state.in_flight = None;
                    }
                }
                self.send_ack(round);
            }
        }
        Ok(progress)
    }

    fn send_ack(&self, round: u64) {
        match self.peers.transport.coordinator() {
            None => warn!(node = %self.local, round, "no coordinator known; ack not sent"),
            Some(coordinator) if coordinator == self.local => {
                info!(node = %self.local, round, "coordinator has every index installed")
            }
            Some(coordinator) => {
                let message = Message::IndexAnnounce(IndexAnnounceMessage::ack(round));
                match self.peers.transport.send(&coordinator, message) {
                    Ok(()) => info!(node = %self.local, %coordinator, round, "install ack sent"),
                    Err(e) => warn!(node = %self.local, %coordinator, round, error = %e, "install ack send failed"),
                }
            }
        }
    }

    /// Coordinator side of the ack barrier.
    pub async fn on_ack(&self, from: &NodeId, round: u64) -> PlacementResult<AckOutcome> {
        if self.peers.transport.coordinator().as_ref() != Some(&self.local) {
            warn!(node = %self.local, %from, round, "ack received by a non-coordinator; dropped");
            return Ok(AckOutcome::NotCoordinator);
        }
        if *from == self.local {
            return Err(PlacementError::SelfAddressed);
        }

        let need = {
            let mut state = self.state.lock().await;
            self.refresh_view(&mut state);
            if !state.view.contains(from) {
                return Err(PlacementError::UnknownSender(from.clone()));
            }
            self.check_window(&state, round)?;
            state.view.peer_count()
        };

        let progress = self.acks.lock().await.record(round, from, need);
        match progress {
            BarrierProgress::Counted { have, need } => {
                debug!(node = %self.local, %from, round, have, need, "install ack counted");
                Ok(AckOutcome::Progress(progress))
            }
            BarrierProgress::Duplicate => {
                warn!(node = %self.local, %from, round, "duplicate install ack dropped");
                Ok(AckOutcome::Progress(progress))
            }
            BarrierProgress::Stale => {
                warn!(node = %self.local, %from, round, "ack for a finished round dropped");
                Ok(AckOutcome::Progress(progress))
            }
            BarrierProgress::Complete => {
                info!(node = %self.local, round, cache = %self.config.cache_name, "start moving keys");
                self.peers
                    .executor
                    .begin_migration(&self.config.cache_name)
                    .map_err(PlacementError::Executor)?;
                Ok(AckOutcome::MigrationStarted { round })
            }
        }
    }

    /// Dispatch one inbound message. Errors are logged, never returned.
    pub async fn handle(&self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        let round = message.round();
        let result = match message {
            Message::DemandReport(report) => self.on_demand_report(&from, report).await.map(|_| ()),
            Message::IndexAnnounce(announce) => match announce.phase {
                AnnouncePhase::Setting => {
                    match CompactRelocationIndex::decode(&announce.filter, &announce.classifier) {
                        Ok(index) => self
                            .on_index_received(&from, announce.round, Arc::new(index))
                            .await
                            .map(|_| ()),
                        Err(e) => Err(e.into()),
                    }
                }
                AnnouncePhase::Ack => self.on_ack(&from, announce.round).await.map(|_| ()),
            },
        };
        if let Err(e) = result {
            error!(node = %self.local, %from, round, error = %e, "placement message failed");
        }
    }

    /// Verify the last released keys around a rehash. Returns violations.
    pub async fn on_rehash(&self, event: &RehashEvent) -> Vec<String> {
        if !self.config.consistency_check {
            return Vec::new();
        }
        let Some(store) = &self.peers.store else {
            return Vec::new();
        };
        if !event.is_topology_stable() {
            debug!(
                node = %self.local,
                start = event.members_at_start.len(),
                end = event.members_at_end.len(),
                "membership size changed across rehash; skipping consistency check"
            );
            return Vec::new();
        }
        let state = self.state.lock().await;
        check_relocated(&self.local, store.as_ref(), &state.sent_objects, event)
    }

    /// Barrier rounds come from peers. A round further ahead than any this
    /// node could be working on would close every real round, so it is
    /// refused before it reaches a barrier.
    fn check_window(&self, state: &ProtocolState, round: u64) -> PlacementResult<()> {
        let limit = state
            .rounds
            .request_round
            .max(state.rounds.reply_round)
            .saturating_add(self.config.max_future_rounds);
        if round > limit {
            warn!(node = %self.local, round, limit, "barrier round too far ahead; dropped");
            return Err(PlacementError::RoundOutOfWindow { round, limit });
        }
        Ok(())
    }

    /// Rebuild the view if the live member set changed.
    ///
    /// Returns the aborted round if reports were already buffered under
    /// the old view.
    fn refresh_view(&self, state: &mut ProtocolState) -> Option<u64> {
        let live = self.peers.transport.members();
        if !state.view.is_stale(&live) {
            return None;
        }
        let view = state.view.refreshed(live);
        info!(node = %self.local, epoch = view.epoch(), members = view.len(), "member view refreshed");
        self.peers.executor.set_member_view(&view);

        let aborted = match state.aggregator.opened_epoch() {
            Some(epoch) if epoch != view.epoch() => Some(state.rounds.reply_round),
            _ => None,
        };
        state.view = view;

        let round = aborted?;
        error!(
            node = %self.local,
            round,
            buffered = state.aggregator.buffered_count(),
            "membership changed mid-round; aborting round"
        );
        state.aggregator.abort();
        state.rounds.reply_round += 1;
        state.rounds.request_round = state.rounds.request_round.max(state.rounds.reply_round);
        if state.in_flight.is_some_and(|f| f.round <= round) {
            state.in_flight = None;
        }
        Some(round)
    }
}
