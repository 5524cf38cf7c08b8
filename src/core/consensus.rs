//! The consensus monitor.
//!
//! All protocol state lives in [`CoreState`] behind a single mutex; one
//! [`event_listener::Event`] serves as the "something changed" broadcast.
//! Three kinds of tasks drive the protocol: an election timer, a step-down
//! timer auditing the leader lease, and one driver task per remote peer that
//! performs vote or append RPCs. Every task prepares its work under the
//! lock, releases it across the RPC, then reacquires and re-validates term
//! and role before acting on the result.

use std::sync::Arc;
use std::time::Duration;

use event_listener::{Event, EventListener};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::storage::{LogMetadata, LogStore, StorageError};
use crate::transport::Transport;

use super::config::RaftOptions;
use super::membership::{Membership, MembershipState};
use super::message::{
    AppendEntryRequest, AppendEntryResponse, ClientError, ConfigurationDescriptor, Entry,
    EntryType, RequestVoteRequest, RequestVoteResponse, ServerAddress, SetConfigurationError,
};

/// This server's current role in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive; becomes a candidate when the election timer fires.
    Follower,
    /// Soliciting votes to become leader.
    Candidate,
    /// Replicating its log to followers.
    Leader,
}

/// Point-in-time view of a server, for operators and tests.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub id: u64,
    pub role: Role,
    pub term: u64,
    pub leader_hint: Option<u64>,
    pub committed_id: u64,
    pub last_log_id: u64,
    pub configuration_id: u64,
}

/// Seed a fresh log with a single-server stable configuration so the server
/// can elect itself. A no-op if the log already has entries.
pub fn bootstrap(log: &mut dyn LogStore, server: ServerAddress) -> Result<(), StorageError> {
    if log.last_id() != 0 {
        return Ok(());
    }
    log.append(Entry::configuration(
        1,
        ConfigurationDescriptor::stable(vec![server]),
    ))?;
    Ok(())
}

/// Everything the monitor lock protects.
struct CoreState {
    log: Box<dyn LogStore>,
    membership: Membership,

    role: Role,
    current_term: u64,
    voted_for: u64,
    committed_id: u64,
    /// Leader of the current term, if known; used as a client redirection
    /// hint. 0 = unknown.
    leader_id: u64,
    /// Logical clock for the leader lease; peers echo it back through
    /// `last_ack_epoch`.
    current_epoch: u64,
    /// When the election timer should next consider starting an election.
    start_election_at: Instant,
    /// Elections started since this server last heard from a leader.
    election_attempt: u64,
    exiting: bool,
    /// Live peer driver tasks; `exit` waits for this to reach zero.
    num_peer_tasks: u32,

    rng: StdRng,
    options: RaftOptions,
    event: Arc<Event>,
}

impl CoreState {
    fn notify(&self) {
        self.event.notify(usize::MAX);
    }

    fn local_id(&self) -> u64 {
        self.membership.local_id()
    }

    /// Persist term and vote. Must happen before any externally visible
    /// effect depends on them; a storage failure here is fatal.
    fn update_metadata(&mut self) {
        self.log
            .update_metadata(LogMetadata {
                current_term: self.current_term,
                voted_for: self.voted_for,
            })
            .expect("failed to persist metadata");
    }

    /// Arm the follower timer with fresh jitter.
    fn set_follower_timer(&mut self) {
        let timeout = self.options.election_timeout(&mut self.rng, 1);
        self.start_election_at = Instant::now() + timeout;
        // Decreases of the deadline must wake the timer task.
        self.notify();
    }

    /// Append to the log, installing configuration entries immediately
    /// (not at commit). Returns the assigned id.
    fn append_to_log(&mut self, entry: Entry) -> u64 {
        let id = self.log.append(entry).expect("failed to persist log entry");
        let appended = self.log.entry(id);
        if appended.kind == EntryType::Configuration {
            let descriptor = appended.configuration.clone().expect("configuration entry without descriptor");
            info!(id, state = ?self.membership.state, "installing configuration");
            self.membership.install(id, &descriptor);
        }
        self.notify();
        id
    }

    /// Reinstall the latest configuration present in the log. Called at boot
    /// and after truncation may have removed the installed one.
    fn scan_for_configuration(&mut self) {
        let mut id = self.log.last_id();
        while id >= 1 {
            let entry = self.log.entry(id);
            if entry.kind == EntryType::Configuration {
                let descriptor = entry.configuration.clone().expect("configuration entry without descriptor");
                self.membership.install(id, &descriptor);
                return;
            }
            id -= 1;
        }
        self.membership.revert_to_blank();
    }

    /// True once this leader has committed an entry of its own term;
    /// client-visible operations wait for this.
    fn leader_ready(&self) -> bool {
        self.log.begin_last_term_id() <= self.committed_id
    }

    /// Return to follower state, adopting `new_term` if it is newer.
    fn step_down(&mut self, new_term: u64) {
        debug_assert!(new_term >= self.current_term);
        if new_term > self.current_term {
            info!(
                old_term = self.current_term,
                new_term, "stepping down to newer term"
            );
            self.current_term = new_term;
            self.voted_for = 0;
            self.update_metadata();
            for peer in self.membership.peers_mut() {
                peer.reset_vote_state();
            }
        } else if self.role != Role::Follower {
            info!(term = self.current_term, "stepping down");
        }
        self.role = Role::Follower;
        self.leader_id = 0;
        self.election_attempt = 0;
        if self.membership.state == MembershipState::Staging {
            // An abandoned membership change must not leave listeners behind.
            self.membership.reset_staging_servers();
        }
        self.set_follower_timer();
    }

    /// Become a candidate and solicit votes. No-op on a blank configuration.
    fn start_new_election(&mut self) {
        if self.membership.is_blank() {
            // Nothing to elect from; wait to be adopted by a cluster.
            self.set_follower_timer();
            return;
        }
        self.current_term += 1;
        self.voted_for = self.local_id();
        self.update_metadata();
        self.role = Role::Candidate;
        self.leader_id = 0;
        self.election_attempt += 1;
        for peer in self.membership.peers_mut() {
            peer.reset_vote_state();
        }
        info!(
            term = self.current_term,
            attempt = self.election_attempt,
            "starting election"
        );
        let timeout = self
            .options
            .election_timeout(&mut self.rng, self.election_attempt);
        self.start_election_at = Instant::now() + timeout;
        self.notify();
        // A single-server configuration elects itself on the spot.
        if self.vote_quorum_reached() {
            self.become_leader();
        }
    }

    fn vote_quorum_reached(&self) -> bool {
        let local = self.local_id();
        self.membership.quorum_all(|id| {
            if id == local {
                self.voted_for == local
            } else {
                self.membership.peer(id).is_some_and(|p| p.have_vote)
            }
        })
    }

    /// Transition to leader after collecting a vote quorum.
    fn become_leader(&mut self) {
        info!(term = self.current_term, "became leader");
        self.role = Role::Leader;
        self.leader_id = self.local_id();
        self.election_attempt = 0;
        // Leaders do not run election timers.
        self.start_election_at = Instant::now() + Duration::from_secs(3600);
        let now = Instant::now();
        for peer in self.membership.peers_mut() {
            // Agreement is re-established via AppendEntry consistency checks.
            peer.reset_replication_state(now);
        }
        // Re-append the current configuration so this term has an entry to
        // commit; clients are served only after it does.
        let descriptor = self.membership.descriptor.clone();
        let entry = Entry::configuration(self.current_term, descriptor);
        self.append_to_log(entry);
        self.advance_committed_id();
    }

    /// Move `committed_id` forward if a quorum has stored more of the log,
    /// then act on any configuration entries that just committed. Leader
    /// only.
    fn advance_committed_id(&mut self) {
        loop {
            let local = self.local_id();
            let last = self.log.last_id();
            let quorum_id = self.membership.quorum_min(|id| {
                if id == local {
                    last
                } else {
                    self.membership.peer(id).map_or(0, |p| p.last_agree_id)
                }
            });
            if quorum_id <= self.committed_id || self.log.term(quorum_id) != self.current_term {
                return;
            }
            debug!(committed_id = quorum_id, "advancing commit");
            self.committed_id = quorum_id;
            self.notify();

            if self.membership.id > self.committed_id {
                continue;
            }
            match self.membership.state {
                MembershipState::Transitional => {
                    // The joint configuration is committed; move to the new
                    // servers alone.
                    let stable = ConfigurationDescriptor::stable(
                        self.membership.descriptor.new_servers.clone(),
                    );
                    let entry = Entry::configuration(self.current_term, stable);
                    self.append_to_log(entry);
                    // Loop again: a small cluster may commit it immediately.
                }
                MembershipState::Stable if !self.membership.has_vote(local) => {
                    info!("committed configuration excludes this server, stepping down");
                    self.step_down(self.current_term);
                    return;
                }
                _ => {}
            }
        }
    }

    fn handle_request_vote(&mut self, request: &RequestVoteRequest) -> RequestVoteResponse {
        if request.term > self.current_term {
            self.step_down(request.term);
        }
        let last_log_id = self.log.last_id();
        if request.term < self.current_term {
            debug!(
                candidate = request.candidate_id,
                term = request.term,
                "rejecting stale vote request"
            );
            return RequestVoteResponse {
                term: self.current_term,
                granted: false,
                last_log_id,
            };
        }

        let local_last_term = self.log.term(last_log_id);
        let log_ok = request.last_log_term > local_last_term
            || (request.last_log_term == local_last_term && request.last_log_id >= last_log_id);
        let can_vote = self.voted_for == 0 || self.voted_for == request.candidate_id;

        let granted = log_ok && can_vote;
        if granted {
            self.voted_for = request.candidate_id;
            self.update_metadata();
            self.set_follower_timer();
            debug!(candidate = request.candidate_id, term = self.current_term, "granted vote");
        }
        RequestVoteResponse {
            term: self.current_term,
            granted,
            last_log_id,
        }
    }

    fn handle_append_entry(&mut self, request: &AppendEntryRequest) -> AppendEntryResponse {
        if request.term < self.current_term {
            return AppendEntryResponse {
                term: self.current_term,
                success: false,
                last_log_id: self.log.last_id(),
            };
        }
        if request.term > self.current_term || self.role == Role::Candidate {
            // A candidate that discovers the current leader defers to it.
            self.step_down(request.term);
        }
        assert!(
            self.role != Role::Leader,
            "two leaders in term {}",
            self.current_term
        );
        self.leader_id = request.leader_id;
        self.set_follower_timer();

        if request.prev_log_id > self.log.last_id()
            || (request.prev_log_id > 0
                && self.log.term(request.prev_log_id) != request.prev_log_term)
        {
            // Missing or mismatched predecessor; the hint lets the leader
            // skip back past our whole tail at once.
            return AppendEntryResponse {
                term: self.current_term,
                success: false,
                last_log_id: self.log.last_id(),
            };
        }

        let mut configuration_truncated = false;
        for entry in &request.entries {
            if entry.id <= self.log.last_id() {
                if self.log.term(entry.id) == entry.term {
                    // Already stored; retransmissions are idempotent.
                    continue;
                }
                assert!(
                    entry.id > self.committed_id,
                    "refusing to truncate committed entry {}",
                    entry.id
                );
                if self.membership.id >= entry.id {
                    configuration_truncated = true;
                }
                self.log
                    .truncate(entry.id - 1)
                    .expect("failed to truncate log");
            }
            let assigned = self.append_to_log(entry.clone());
            debug_assert_eq!(assigned, entry.id);
        }
        if configuration_truncated {
            // The installed configuration went with the truncated tail; fall
            // back to the latest one still in the log.
            self.scan_for_configuration();
        }

        let new_commit = std::cmp::min(request.leader_commit_id, self.log.last_id());
        if new_commit > self.committed_id {
            self.committed_id = new_commit;
            self.notify();
        }
        AppendEntryResponse {
            term: self.current_term,
            success: true,
            last_log_id: self.log.last_id(),
        }
    }

    /// Mark catch-up progress for a staging listener after a successful
    /// append. A listener is caught up once one whole iteration (from the
    /// start id to the goal fixed at iteration start) finishes within the
    /// configured bound.
    fn update_catch_up(&mut self, peer_id: u64, now: Instant) {
        if self.membership.state != MembershipState::Staging
            || !self.membership.staging_ids().contains(&peer_id)
        {
            return;
        }
        let last_log_id = self.log.last_id();
        let catch_up_timeout = self.options.catch_up_timeout;
        let Some(peer) = self.membership.peer_mut(peer_id) else {
            return;
        };
        if peer.is_caught_up || peer.last_agree_id < peer.catch_up_iteration_goal_id {
            return;
        }
        let elapsed = now.saturating_duration_since(peer.catch_up_iteration_start);
        peer.last_catch_up_iteration = elapsed;
        peer.catch_up_rounds += 1;
        if elapsed <= catch_up_timeout {
            peer.is_caught_up = true;
            info!(
                peer = peer.id,
                rounds = peer.catch_up_rounds,
                took = ?peer.last_catch_up_iteration,
                "staging server caught up"
            );
        } else {
            peer.catch_up_iteration_start = now;
            peer.catch_up_iteration_goal_id = last_log_id;
        }
        self.notify();
    }

    fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            id: self.local_id(),
            role: self.role,
            term: self.current_term,
            leader_hint: if self.leader_id == 0 {
                None
            } else {
                Some(self.leader_id)
            },
            committed_id: self.committed_id,
            last_log_id: self.log.last_id(),
            configuration_id: self.membership.id,
        }
    }

    fn leader_hint(&self) -> Option<u64> {
        if self.leader_id == 0 || self.leader_id == self.local_id() {
            None
        } else {
            Some(self.leader_id)
        }
    }
}

struct Inner {
    state: Mutex<CoreState>,
    event: Arc<Event>,
    transport: Box<dyn Transport>,
    options: RaftOptions,
}

/// Handle to a running consensus server.
///
/// Created with [`ReplicatedLog::spawn`]; cloneable via `Arc`. All
/// operations are async and may block on cluster progress, bounded as
/// documented per method.
pub struct ReplicatedLog {
    inner: Arc<Inner>,
}

impl ReplicatedLog {
    /// Construct a server from recovered storage and start its tasks.
    /// `address` is how peers reach this server; it must match the address
    /// used for it in cluster configurations.
    pub fn spawn(
        id: u64,
        address: &str,
        log: Box<dyn LogStore>,
        transport: Box<dyn Transport>,
        options: RaftOptions,
    ) -> Arc<Self> {
        let event = Arc::new(Event::new());
        let meta = *log.metadata();
        let seed = options
            .seed
            .map(|s| s.wrapping_add(id))
            .unwrap_or_else(|| rand::rng().random());
        let mut state = CoreState {
            log,
            membership: Membership::new(id, address.to_string()),
            role: Role::Follower,
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            committed_id: 0,
            leader_id: 0,
            current_epoch: 0,
            start_election_at: Instant::now(),
            election_attempt: 0,
            exiting: false,
            num_peer_tasks: 0,
            rng: StdRng::seed_from_u64(seed),
            options: options.clone(),
            event: Arc::clone(&event),
        };
        state.scan_for_configuration();
        state.set_follower_timer();
        info!(
            id,
            term = state.current_term,
            last_log_id = state.log.last_id(),
            configuration_id = state.membership.id,
            "server starting"
        );

        let this = Arc::new(ReplicatedLog {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                event,
                transport,
                options,
            }),
        });
        {
            // Peer drivers for servers already in the recovered
            // configuration. Nothing else can hold the lock yet.
            let mut st = this
                .inner
                .state
                .try_lock()
                .expect("state is unshared before tasks start");
            sync_peer_drivers(&this.inner, &mut st);
        }
        tokio::spawn(election_timer(Arc::clone(&this.inner)));
        tokio::spawn(step_down_timer(Arc::clone(&this.inner)));
        this
    }

    /// Stop all tasks. Outstanding client calls return
    /// [`ClientError::Fail`] or [`ClientError::Retry`].
    pub async fn exit(&self) {
        {
            let mut st = self.inner.state.lock().await;
            st.exiting = true;
            st.notify();
        }
        loop {
            let listener = {
                let st = self.inner.state.lock().await;
                if st.num_peer_tasks == 0 {
                    return;
                }
                self.inner.event.listen()
            };
            listener.await;
        }
    }

    /// Peer-facing RequestVote entry point.
    pub async fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut st = self.inner.state.lock().await;
        st.handle_request_vote(&request)
    }

    /// Peer-facing AppendEntry entry point.
    pub async fn handle_append_entry(&self, request: AppendEntryRequest) -> AppendEntryResponse {
        let mut st = self.inner.state.lock().await;
        let response = st.handle_append_entry(&request);
        // The request may have installed a configuration with new servers.
        sync_peer_drivers(&self.inner, &mut st);
        response
    }

    /// Append an opaque payload to the replicated log and wait until it
    /// commits. Returns the assigned entry id.
    pub async fn replicate(&self, payload: Vec<u8>) -> Result<u64, ClientError> {
        // Phase one: get the entry into the leader's log. Appends are held
        // back until an entry of the leader's own term has committed.
        let mut payload = Some(payload);
        let (id, term) = loop {
            let listener = {
                let mut st = self.inner.state.lock().await;
                if st.exiting {
                    return Err(ClientError::Fail);
                }
                if st.role != Role::Leader {
                    return Err(ClientError::NotLeader {
                        leader_hint: st.leader_hint(),
                    });
                }
                if st.leader_ready() {
                    let entry = Entry::data(st.current_term, payload.take().expect("payload consumed once"));
                    let id = st.append_to_log(entry);
                    st.advance_committed_id();
                    break (id, st.current_term);
                }
                self.inner.event.listen()
            };
            listener.await;
        };
        // Phase two: wait for commitment (or for the entry's fate to become
        // unknowable because leadership moved on).
        loop {
            let listener = {
                let st = self.inner.state.lock().await;
                if st.committed_id >= id {
                    return if st.log.term(id) == term {
                        Ok(id)
                    } else {
                        Err(ClientError::Retry)
                    };
                }
                if st.exiting {
                    return Err(ClientError::Fail);
                }
                if st.role != Role::Leader || st.current_term != term {
                    return Err(ClientError::Retry);
                }
                self.inner.event.listen()
            };
            listener.await;
        }
    }

    /// Highest committed entry id, confirmed against a quorum so the answer
    /// is not stale. Bounded by the follower timeout.
    pub async fn get_last_committed_id(&self) -> Result<u64, ClientError> {
        self.confirm_leadership().await?;
        let st = self.inner.state.lock().await;
        Ok(st.committed_id)
    }

    /// Next committed entry after `last_seen`, blocking until one exists.
    pub async fn get_next_entry(&self, last_seen: u64) -> Result<Entry, ClientError> {
        loop {
            let listener = {
                let st = self.inner.state.lock().await;
                if st.committed_id > last_seen {
                    return Ok(st.log.entry(last_seen + 1).clone());
                }
                if st.exiting {
                    return Err(ClientError::Fail);
                }
                self.inner.event.listen()
            };
            listener.await;
        }
    }

    /// The committed, stable cluster configuration: its log id and server
    /// list. `Retry` while a membership change is in flight.
    pub async fn get_configuration(&self) -> Result<(u64, Vec<ServerAddress>), ClientError> {
        let st = self.inner.state.lock().await;
        if st.exiting {
            return Err(ClientError::Fail);
        }
        if st.role != Role::Leader {
            return Err(ClientError::NotLeader {
                leader_hint: st.leader_hint(),
            });
        }
        if !st.leader_ready()
            || st.membership.state != MembershipState::Stable
            || st.committed_id < st.membership.id
        {
            return Err(ClientError::Retry);
        }
        Ok((st.membership.id, st.membership.descriptor.old_servers.clone()))
    }

    /// Replace the cluster membership with `new_servers`.
    ///
    /// `old_id` must be the configuration id previously returned by
    /// [`get_configuration`](Self::get_configuration). New servers first
    /// mirror the log as non-voting listeners; once all are caught up the
    /// change goes through joint consensus and completes when the new stable
    /// configuration commits. A leader that is not part of `new_servers`
    /// steps down at the end.
    pub async fn set_configuration(
        &self,
        old_id: u64,
        new_servers: Vec<ServerAddress>,
    ) -> Result<(), SetConfigurationError> {
        // Stage the new servers.
        let (term, catch_up_deadline) = loop {
            let listener = {
                let mut st = self.inner.state.lock().await;
                if st.exiting {
                    return Err(SetConfigurationError::Fail);
                }
                if st.role != Role::Leader {
                    return Err(SetConfigurationError::NotLeader {
                        leader_hint: st.leader_hint(),
                    });
                }
                if !st.leader_ready() {
                    self.inner.event.listen()
                } else {
                    if st.membership.state != MembershipState::Stable
                        || st.membership.id != old_id
                    {
                        return Err(SetConfigurationError::Changed {
                            current: st.membership.id,
                        });
                    }
                    info!(?new_servers, "staging membership change");
                    st.membership.set_staging_servers(&new_servers);
                    let now = Instant::now();
                    let goal = st.log.last_id();
                    let staging: Vec<u64> = st.membership.staging_ids().to_vec();
                    for id in staging {
                        if let Some(peer) = st.membership.peer_mut(id) {
                            peer.begin_catch_up(now, goal);
                        }
                    }
                    let rounds = st.options.max_catch_up_rounds;
                    let deadline = now + st.options.catch_up_timeout * rounds as u32;
                    let term = st.current_term;
                    st.notify();
                    sync_peer_drivers(&self.inner, &mut st);
                    break (term, deadline);
                }
            };
            listener.await;
        };

        // Wait for every listener to catch up.
        loop {
            let listener = {
                let mut st = self.inner.state.lock().await;
                if st.exiting {
                    return Err(SetConfigurationError::Fail);
                }
                if st.role != Role::Leader || st.current_term != term {
                    // step_down already dropped the staging servers.
                    return Err(SetConfigurationError::Retry);
                }
                // The local server, when part of the new list, is caught up
                // by definition.
                let local = st.local_id();
                if st.membership.staging_all(|id| {
                    id == local || st.membership.peer(id).is_some_and(|p| p.is_caught_up)
                }) {
                    break;
                }
                let max_rounds = st.options.max_catch_up_rounds;
                let exhausted = Instant::now() >= catch_up_deadline
                    || st.membership.staging_ids().iter().any(|&id| {
                        st.membership.peer(id).is_some_and(|p| {
                            !p.is_caught_up && p.catch_up_rounds >= max_rounds
                        })
                    });
                if exhausted {
                    let stragglers: Vec<u64> = st
                        .membership
                        .staging_ids()
                        .iter()
                        .copied()
                        .filter(|&id| {
                            id != local
                                && !st.membership.peer(id).is_some_and(|p| p.is_caught_up)
                        })
                        .collect();
                    warn!(?stragglers, "membership change abandoned, servers not caught up");
                    st.membership.reset_staging_servers();
                    st.notify();
                    return Err(SetConfigurationError::Bad { servers: stragglers });
                }
                self.inner.event.listen()
            };
            tokio::select! {
                _ = listener => {}
                _ = tokio::time::sleep_until(catch_up_deadline) => {}
            }
        }

        // Everyone is caught up: enter joint consensus. The transitional
        // entry takes effect as soon as it is appended.
        {
            let mut st = self.inner.state.lock().await;
            if st.exiting {
                return Err(SetConfigurationError::Fail);
            }
            if st.role != Role::Leader || st.current_term != term {
                return Err(SetConfigurationError::Retry);
            }
            let descriptor = ConfigurationDescriptor::transitional(
                st.membership.descriptor.old_servers.clone(),
                new_servers.clone(),
            );
            let entry = Entry::configuration(term, descriptor);
            st.append_to_log(entry);
            st.advance_committed_id();
            sync_peer_drivers(&self.inner, &mut st);
        }

        // Once the transitional entry commits under joint quorum, commit
        // advancement appends the final stable configuration; wait for that
        // to commit in turn.
        loop {
            let listener = {
                let st = self.inner.state.lock().await;
                if st.membership.state == MembershipState::Stable
                    && st.committed_id >= st.membership.id
                    && st.membership.descriptor.old_servers == new_servers
                {
                    return Ok(());
                }
                if st.exiting {
                    return Err(SetConfigurationError::Fail);
                }
                if st.current_term != term {
                    return Err(SetConfigurationError::Retry);
                }
                self.inner.event.listen()
            };
            listener.await;
        }
    }

    /// Operator/test snapshot of this server's state.
    pub async fn status(&self) -> StatusSnapshot {
        let st = self.inner.state.lock().await;
        st.status()
    }

    /// Confirm leadership with a fresh quorum round-trip (the leader
    /// lease). Bounded by the follower timeout.
    async fn confirm_leadership(&self) -> Result<(), ClientError> {
        let epoch = {
            let mut st = self.inner.state.lock().await;
            if st.exiting {
                return Err(ClientError::Fail);
            }
            if st.role != Role::Leader {
                return Err(ClientError::NotLeader {
                    leader_hint: st.leader_hint(),
                });
            }
            st.current_epoch += 1;
            let now = Instant::now();
            for peer in st.membership.peers_mut() {
                // Heartbeat immediately instead of waiting out the period.
                peer.next_heartbeat_time = now;
            }
            st.notify();
            st.current_epoch
        };
        let deadline = Instant::now() + self.inner.options.follower_timeout;
        loop {
            let listener = {
                let st = self.inner.state.lock().await;
                if st.exiting {
                    return Err(ClientError::Fail);
                }
                if st.role != Role::Leader {
                    return Err(ClientError::NotLeader {
                        leader_hint: st.leader_hint(),
                    });
                }
                let local = st.local_id();
                let confirmed = st.membership.quorum_all(|id| {
                    id == local
                        || st
                            .membership
                            .peer(id)
                            .is_some_and(|p| p.last_ack_epoch >= epoch)
                });
                if confirmed {
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    return Err(ClientError::Retry);
                }
                self.inner.event.listen()
            };
            tokio::select! {
                _ = listener => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }
}

/// Start a driver task for every peer record that lacks one. Call with the
/// lock held after anything that may have added servers.
fn sync_peer_drivers(inner: &Arc<Inner>, st: &mut CoreState) {
    if st.exiting {
        return;
    }
    for id in st.membership.peer_ids() {
        let peer = st.membership.peer_mut(id).expect("peer id just listed");
        if !peer.driver_running {
            peer.driver_running = true;
            let token = peer.driver_token;
            st.num_peer_tasks += 1;
            tokio::spawn(peer_driver(Arc::clone(inner), id, token));
        }
    }
}

/// Sleeps until `start_election_at`, then starts an election if still
/// appropriate. Wakes early whenever the deadline moves.
async fn election_timer(inner: Arc<Inner>) {
    loop {
        let (listener, deadline) = {
            let mut st = inner.state.lock().await;
            if st.exiting {
                return;
            }
            if Instant::now() >= st.start_election_at {
                if st.role == Role::Leader {
                    st.start_election_at = Instant::now() + Duration::from_secs(3600);
                } else {
                    st.start_new_election();
                }
            }
            (inner.event.listen(), st.start_election_at)
        };
        wait_until(listener, deadline).await;
    }
}

/// While leader, verifies that a quorum keeps acknowledging fresh epochs;
/// steps down after a silent follower timeout even without seeing a higher
/// term, so clients stop waiting on a dead leadership.
async fn step_down_timer(inner: Arc<Inner>) {
    loop {
        // Wait until this server is leader.
        let (epoch, term) = loop {
            let listener = {
                let mut st = inner.state.lock().await;
                if st.exiting {
                    return;
                }
                if st.role == Role::Leader {
                    st.current_epoch += 1;
                    break (st.current_epoch, st.current_term);
                }
                inner.event.listen()
            };
            listener.await;
        };

        // One audit round: the quorum must reach `epoch` before the deadline.
        let deadline = Instant::now() + inner.options.follower_timeout;
        loop {
            let listener = {
                let mut st = inner.state.lock().await;
                if st.exiting {
                    return;
                }
                if st.role != Role::Leader || st.current_term != term {
                    break;
                }
                let local = st.local_id();
                let confirmed = st.membership.quorum_all(|id| {
                    id == local
                        || st
                            .membership
                            .peer(id)
                            .is_some_and(|p| p.last_ack_epoch >= epoch)
                });
                if confirmed {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(
                        term,
                        "no quorum acknowledged within the follower timeout, stepping down"
                    );
                    st.step_down(term);
                    break;
                }
                inner.event.listen()
            };
            wait_until(listener, deadline).await;
        }
    }
}

/// One RPC job prepared under the lock for a peer driver.
enum Job {
    Exit,
    Wait(Option<Instant>),
    Vote {
        address: String,
        request: RequestVoteRequest,
        term: u64,
    },
    Append {
        address: String,
        request: AppendEntryRequest,
        term: u64,
        epoch: u64,
        sent_last_id: u64,
    },
}

/// Per-peer driver: performs vote requests while this server is a candidate
/// and append/heartbeat RPCs while it is leader, honoring heartbeat and
/// backoff deadlines. Exits when its record disappears or the server shuts
/// down.
async fn peer_driver(inner: Arc<Inner>, peer_id: u64, token: u64) {
    loop {
        let mut listener = None;
        let job = {
            let mut st = inner.state.lock().await;
            let job = next_job(&mut st, peer_id, token);
            if matches!(job, Job::Wait(_)) {
                listener = Some(inner.event.listen());
            }
            job
        };
        match job {
            Job::Exit => break,
            Job::Wait(deadline) => {
                let listener = listener.expect("listener registered for wait");
                match deadline {
                    Some(deadline) => wait_until(listener, deadline).await,
                    None => listener.await,
                }
            }
            Job::Vote { address, request, term } => {
                let result = inner.transport.request_vote(&address, request).await;
                let mut st = inner.state.lock().await;
                if !driver_valid(&st, peer_id, token) {
                    continue;
                }
                match result {
                    Ok(response) => {
                        if response.term > st.current_term {
                            st.step_down(response.term);
                            continue;
                        }
                        if st.role != Role::Candidate || st.current_term != term {
                            continue;
                        }
                        if let Some(peer) = st.membership.peer_mut(peer_id) {
                            peer.request_vote_done = true;
                            peer.have_vote = response.granted;
                        }
                        st.notify();
                        if response.granted {
                            debug!(peer = peer_id, term, "vote granted");
                            if st.vote_quorum_reached() {
                                st.become_leader();
                            }
                        } else {
                            debug!(peer = peer_id, term, "vote denied");
                        }
                    }
                    Err(error) => {
                        debug!(peer = peer_id, %error, "vote request failed");
                        apply_backoff(&mut st, peer_id);
                    }
                }
            }
            Job::Append { address, request, term, epoch, sent_last_id } => {
                let result = inner.transport.append_entry(&address, request).await;
                let mut st = inner.state.lock().await;
                if !driver_valid(&st, peer_id, token) {
                    continue;
                }
                match result {
                    Ok(response) => {
                        if response.term > st.current_term {
                            st.step_down(response.term);
                            continue;
                        }
                        if st.role != Role::Leader || st.current_term != term {
                            continue;
                        }
                        let now = Instant::now();
                        let heartbeat_period = st.options.heartbeat_period;
                        if let Some(peer) = st.membership.peer_mut(peer_id) {
                            if response.success {
                                peer.last_agree_id = peer.last_agree_id.max(sent_last_id);
                                peer.last_ack_epoch = peer.last_ack_epoch.max(epoch);
                                peer.next_heartbeat_time = now + heartbeat_period;
                            } else {
                                // Consistency failure: back up at least one
                                // entry, or jump to the follower's tail.
                                let fallback = peer.last_agree_id.saturating_sub(1);
                                peer.last_agree_id = fallback.min(response.last_log_id);
                            }
                        }
                        if response.success {
                            st.notify();
                            st.advance_committed_id();
                            st.update_catch_up(peer_id, now);
                        }
                    }
                    Err(error) => {
                        debug!(peer = peer_id, %error, "append failed");
                        apply_backoff(&mut st, peer_id);
                    }
                }
            }
        }
    }

    // Deregister before the task ends so exit() can drain.
    let mut st = inner.state.lock().await;
    if let Some(peer) = st.membership.peer_mut(peer_id) {
        if peer.driver_token == token {
            peer.driver_running = false;
        }
    }
    st.num_peer_tasks -= 1;
    st.notify();
}

fn driver_valid(st: &CoreState, peer_id: u64, token: u64) -> bool {
    !st.exiting
        && st
            .membership
            .peer(peer_id)
            .is_some_and(|p| p.driver_token == token)
}

fn apply_backoff(st: &mut CoreState, peer_id: u64) {
    let backoff = st.options.rpc_failure_backoff;
    if let Some(peer) = st.membership.peer_mut(peer_id) {
        peer.backoff_until = Instant::now() + backoff;
    }
}

/// Decide the next action for a peer driver. Lock held.
fn next_job(st: &mut CoreState, peer_id: u64, token: u64) -> Job {
    if !driver_valid(st, peer_id, token) {
        return Job::Exit;
    }
    let now = Instant::now();
    let last_log_id = st.log.last_id();
    let soft_limit = st.options.soft_rpc_size_limit;
    let peer = st.membership.peer(peer_id).expect("driver_valid checked");

    if now < peer.backoff_until {
        return Job::Wait(Some(peer.backoff_until));
    }
    match st.role {
        Role::Candidate if !peer.request_vote_done => Job::Vote {
            address: peer.address.clone(),
            request: RequestVoteRequest {
                term: st.current_term,
                candidate_id: st.local_id(),
                last_log_id,
                last_log_term: st.log.term(last_log_id),
            },
            term: st.current_term,
        },
        Role::Leader => {
            let need_entries = peer.last_agree_id < last_log_id;
            if !need_entries && now < peer.next_heartbeat_time {
                return Job::Wait(Some(peer.next_heartbeat_time));
            }
            let prev_log_id = peer.last_agree_id;
            let mut entries = Vec::new();
            let mut bytes = 0usize;
            let mut next = prev_log_id + 1;
            while next <= last_log_id {
                let entry = st.log.entry(next);
                bytes += entry.payload.len() + 32;
                if !entries.is_empty() && bytes > soft_limit {
                    break;
                }
                entries.push(entry.clone());
                next += 1;
            }
            let sent_last_id = prev_log_id + entries.len() as u64;
            Job::Append {
                address: peer.address.clone(),
                request: AppendEntryRequest {
                    term: st.current_term,
                    leader_id: st.local_id(),
                    prev_log_id,
                    prev_log_term: st.log.term(prev_log_id),
                    entries,
                    leader_commit_id: st.committed_id,
                },
                term: st.current_term,
                epoch: st.current_epoch,
                sent_last_id,
            }
        }
        _ => Job::Wait(None),
    }
}

/// Await the listener, bounded by `deadline`.
async fn wait_until(listener: EventListener, deadline: Instant) {
    tokio::select! {
        _ = listener => {}
        _ = tokio::time::sleep_until(deadline) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLog;
    use crate::transport::inmemory::{InMemoryNetwork, Request};

    fn addr(id: u64) -> ServerAddress {
        ServerAddress { id, address: format!("server-{id}") }
    }

    fn blank_state(id: u64) -> CoreState {
        CoreState {
            log: Box::new(MemoryLog::new()),
            membership: Membership::new(id, format!("server-{id}")),
            role: Role::Follower,
            current_term: 0,
            voted_for: 0,
            committed_id: 0,
            leader_id: 0,
            current_epoch: 0,
            start_election_at: Instant::now(),
            election_attempt: 0,
            exiting: false,
            num_peer_tasks: 0,
            rng: StdRng::seed_from_u64(0),
            options: RaftOptions::default(),
            event: Arc::new(Event::new()),
        }
    }

    /// State with a stable configuration over `ids` installed from entry 1.
    fn cluster_state(id: u64, ids: &[u64]) -> CoreState {
        let mut st = blank_state(id);
        let servers = ids.iter().map(|&i| addr(i)).collect();
        st.append_to_log(Entry::configuration(
            1,
            ConfigurationDescriptor::stable(servers),
        ));
        st
    }

    fn entry_at(id: u64, term: u64, payload: &str) -> Entry {
        Entry {
            id,
            term,
            kind: EntryType::Data,
            payload: payload.as_bytes().to_vec(),
            configuration: None,
        }
    }

    fn heartbeat(term: u64, leader_id: u64, commit: u64) -> AppendEntryRequest {
        AppendEntryRequest {
            term,
            leader_id,
            prev_log_id: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit_id: commit,
        }
    }

    // === Elections ===

    #[test]
    fn blank_configuration_never_elects() {
        let mut st = blank_state(1);
        st.start_new_election();
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.current_term, 0);
    }

    #[test]
    fn election_makes_candidate_and_votes_for_self() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.start_new_election();
        assert_eq!(st.role, Role::Candidate);
        assert_eq!(st.current_term, 1);
        assert_eq!(st.voted_for, 1);
        assert_eq!(st.log.metadata().current_term, 1);
        assert_eq!(st.log.metadata().voted_for, 1);
    }

    #[test]
    fn single_server_elects_itself_and_commits() {
        let mut st = cluster_state(1, &[1]);
        st.start_new_election();
        assert_eq!(st.role, Role::Leader);
        assert_eq!(st.leader_id, 1);
        // The freshly appended configuration entry of the new term commits
        // by the leader's own acknowledgement.
        assert_eq!(st.committed_id, st.log.last_id());
        assert!(st.leader_ready());
    }

    #[test]
    fn become_leader_resets_peer_agreement() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.current_term = 3;
        st.role = Role::Candidate;
        st.membership.peer_mut(2).unwrap().last_agree_id = 7;
        st.become_leader();
        assert_eq!(st.role, Role::Leader);
        assert_eq!(st.membership.peer(2).unwrap().last_agree_id, 0);
        // An entry of the leader's own term exists for commitment.
        let last = st.log.last_id();
        assert_eq!(st.log.term(last), 3);
        assert_eq!(st.log.entry(last).kind, EntryType::Configuration);
    }

    // === Vote granting ===

    fn vote_request(term: u64, candidate: u64, last_id: u64, last_term: u64) -> RequestVoteRequest {
        RequestVoteRequest {
            term,
            candidate_id: candidate,
            last_log_id: last_id,
            last_log_term: last_term,
        }
    }

    #[test]
    fn grants_vote_to_up_to_date_candidate() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        let response = st.handle_request_vote(&vote_request(2, 2, 1, 1));
        assert!(response.granted);
        assert_eq!(response.term, 2);
        assert_eq!(st.voted_for, 2);
        assert_eq!(st.log.metadata().voted_for, 2);
    }

    #[test]
    fn denies_stale_term() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.current_term = 5;
        let response = st.handle_request_vote(&vote_request(3, 2, 10, 3));
        assert!(!response.granted);
        assert_eq!(response.term, 5);
        assert_eq!(st.voted_for, 0);
    }

    #[test]
    fn denies_second_candidate_in_same_term() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        assert!(st.handle_request_vote(&vote_request(2, 2, 5, 1)).granted);
        assert!(!st.handle_request_vote(&vote_request(2, 3, 5, 1)).granted);
        // A retransmission from the voted-for candidate is re-granted.
        assert!(st.handle_request_vote(&vote_request(2, 2, 5, 1)).granted);
    }

    #[test]
    fn denies_candidate_with_stale_log() {
        // Local last entry is (term 3, id 2); the candidate offers
        // (term 2, id 3). Higher term wins over longer log.
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.append_to_log(Entry::data(3, b"x".to_vec()));
        let response = st.handle_request_vote(&vote_request(4, 2, 3, 2));
        assert!(!response.granted);
        assert_eq!(st.current_term, 4);
        assert_eq!(st.voted_for, 0);
    }

    #[test]
    fn denies_candidate_with_shorter_log_of_equal_term() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.append_to_log(Entry::data(1, b"x".to_vec()));
        // Same last term, but candidate's log ends earlier.
        let response = st.handle_request_vote(&vote_request(2, 2, 1, 1));
        assert!(!response.granted);
    }

    #[test]
    fn higher_term_vote_request_steps_leader_down() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.current_term = 2;
        st.role = Role::Leader;
        st.leader_id = 1;
        let response = st.handle_request_vote(&vote_request(5, 2, 10, 4));
        assert!(response.granted);
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.current_term, 5);
    }

    // === AppendEntry handling ===

    #[test]
    fn heartbeat_records_leader_and_term() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        let response = st.handle_append_entry(&heartbeat(3, 1, 0));
        assert!(response.success);
        assert_eq!(st.current_term, 3);
        assert_eq!(st.leader_id, 1);
        assert_eq!(st.role, Role::Follower);
    }

    #[test]
    fn stale_term_append_is_rejected() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        st.current_term = 4;
        let before = st.start_election_at;
        let response = st.handle_append_entry(&heartbeat(2, 1, 0));
        assert!(!response.success);
        assert_eq!(response.term, 4);
        // The follower timer is untouched by a stale leader.
        assert_eq!(st.start_election_at, before);
    }

    #[test]
    fn candidate_defers_to_leader_of_same_term() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        st.start_new_election();
        assert_eq!(st.role, Role::Candidate);
        let term = st.current_term;
        let response = st.handle_append_entry(&heartbeat(term, 1, 0));
        assert!(response.success);
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.leader_id, 1);
    }

    #[test]
    fn append_rejects_missing_predecessor_with_hint() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        let request = AppendEntryRequest {
            term: 1,
            leader_id: 1,
            prev_log_id: 5,
            prev_log_term: 1,
            entries: vec![entry_at(6, 1, "late")],
            leader_commit_id: 0,
        };
        let response = st.handle_append_entry(&request);
        assert!(!response.success);
        assert_eq!(response.last_log_id, 1);
        assert_eq!(st.log.last_id(), 1);
    }

    #[test]
    fn append_rejects_mismatched_predecessor_term() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        st.append_to_log(Entry::data(1, b"a".to_vec()));
        let request = AppendEntryRequest {
            term: 2,
            leader_id: 1,
            prev_log_id: 2,
            prev_log_term: 2, // actually term 1 locally
            entries: vec![entry_at(3, 2, "b")],
            leader_commit_id: 0,
        };
        let response = st.handle_append_entry(&request);
        assert!(!response.success);
        assert_eq!(st.log.last_id(), 2);
    }

    #[test]
    fn conflicting_tail_is_replaced() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        st.append_to_log(Entry::data(1, b"keep".to_vec())); // id 2
        st.append_to_log(Entry::data(1, b"stale".to_vec())); // id 3
        let request = AppendEntryRequest {
            term: 2,
            leader_id: 1,
            prev_log_id: 2,
            prev_log_term: 1,
            entries: vec![entry_at(3, 2, "new")],
            leader_commit_id: 0,
        };
        let response = st.handle_append_entry(&request);
        assert!(response.success);
        assert_eq!(st.log.last_id(), 3);
        assert_eq!(st.log.term(3), 2);
        assert_eq!(st.log.entry(3).payload, b"new");
        assert_eq!(st.log.entry(2).payload, b"keep");
    }

    #[test]
    fn retransmission_is_idempotent() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        let request = AppendEntryRequest {
            term: 1,
            leader_id: 1,
            prev_log_id: 1,
            prev_log_term: 1,
            entries: vec![entry_at(2, 1, "once")],
            leader_commit_id: 0,
        };
        assert!(st.handle_append_entry(&request).success);
        assert!(st.handle_append_entry(&request).success);
        assert_eq!(st.log.last_id(), 2);
    }

    #[test]
    fn commit_is_bounded_by_local_log() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        let response = st.handle_append_entry(&heartbeat(1, 1, 99));
        assert!(response.success);
        assert_eq!(st.committed_id, 1);
    }

    #[test]
    #[should_panic(expected = "refusing to truncate committed entry")]
    fn committed_entries_are_never_truncated() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        st.append_to_log(Entry::data(1, b"committed".to_vec())); // id 2
        st.committed_id = 2;
        let request = AppendEntryRequest {
            term: 3,
            leader_id: 1,
            prev_log_id: 1,
            prev_log_term: 1,
            entries: vec![entry_at(2, 3, "conflict")],
            leader_commit_id: 0,
        };
        st.handle_append_entry(&request);
    }

    #[test]
    fn follower_installs_configuration_on_append() {
        let mut st = cluster_state(2, &[1, 2, 3]);
        let descriptor = ConfigurationDescriptor::stable(vec![addr(1), addr(2), addr(3), addr(4)]);
        let mut entry = Entry::configuration(1, descriptor);
        entry.id = 2;
        let request = AppendEntryRequest {
            term: 1,
            leader_id: 1,
            prev_log_id: 1,
            prev_log_term: 1,
            entries: vec![entry],
            leader_commit_id: 0,
        };
        assert!(st.handle_append_entry(&request).success);
        // Installed immediately, before commit.
        assert_eq!(st.membership.id, 2);
        assert!(st.membership.has_vote(4));
    }

    // === Commit advancement ===

    #[test]
    fn commit_requires_quorum() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.current_term = 1;
        st.role = Role::Leader;
        st.append_to_log(Entry::data(1, b"a".to_vec())); // id 2
        st.advance_committed_id();
        assert_eq!(st.committed_id, 0); // only the leader has it
        st.membership.peer_mut(2).unwrap().last_agree_id = 2;
        st.advance_committed_id();
        assert_eq!(st.committed_id, 2);
    }

    #[test]
    fn prior_term_entries_commit_only_indirectly() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.append_to_log(Entry::data(1, b"old".to_vec())); // id 2, term 1
        st.current_term = 2;
        st.role = Role::Leader;
        st.membership.peer_mut(2).unwrap().last_agree_id = 2;
        st.advance_committed_id();
        // A quorum stores id 2, but its term is not the leader's.
        assert_eq!(st.committed_id, 0);

        st.append_to_log(Entry::data(2, b"own".to_vec())); // id 3, term 2
        st.membership.peer_mut(2).unwrap().last_agree_id = 3;
        st.advance_committed_id();
        // The own-term entry carries the older one with it.
        assert_eq!(st.committed_id, 3);
    }

    #[test]
    fn joint_consensus_requires_both_majorities() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.current_term = 1;
        st.role = Role::Leader;
        st.append_to_log(Entry::configuration(
            1,
            ConfigurationDescriptor::transitional(
                vec![addr(1), addr(2), addr(3)],
                vec![addr(4), addr(5)],
            ),
        )); // id 2
        assert_eq!(st.membership.state, MembershipState::Transitional);

        // Old majority alone (leader + server 2) must not commit.
        st.membership.peer_mut(2).unwrap().last_agree_id = 2;
        st.advance_committed_id();
        assert_eq!(st.committed_id, 0);

        // Half of the new list is still not a majority of it.
        st.membership.peer_mut(4).unwrap().last_agree_id = 2;
        st.advance_committed_id();
        assert_eq!(st.committed_id, 0);

        // Both majorities: the transitional entry commits and the leader
        // appends the final stable configuration.
        st.membership.peer_mut(5).unwrap().last_agree_id = 2;
        st.advance_committed_id();
        assert_eq!(st.committed_id, 2);
        assert_eq!(st.membership.state, MembershipState::Stable);
        assert_eq!(st.membership.id, 3);
        assert_eq!(st.log.entry(3).kind, EntryType::Configuration);
    }

    #[test]
    fn leader_excluded_by_committed_configuration_steps_down() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.current_term = 1;
        st.role = Role::Leader;
        st.append_to_log(Entry::configuration(
            1,
            ConfigurationDescriptor::transitional(
                vec![addr(1), addr(2), addr(3)],
                vec![addr(2), addr(3)],
            ),
        )); // id 2
        for id in [2, 3] {
            st.membership.peer_mut(id).unwrap().last_agree_id = 2;
        }
        st.advance_committed_id();
        // Transitional committed; stable appended at id 3.
        assert_eq!(st.membership.id, 3);
        assert_eq!(st.role, Role::Leader);

        for id in [2, 3] {
            st.membership.peer_mut(id).unwrap().last_agree_id = 3;
        }
        st.advance_committed_id();
        assert_eq!(st.committed_id, 3);
        assert_eq!(st.role, Role::Follower);
    }

    // === Step down ===

    #[test]
    fn step_down_to_newer_term_clears_vote() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.start_new_election();
        assert_eq!(st.voted_for, 1);
        st.step_down(7);
        assert_eq!(st.role, Role::Follower);
        assert_eq!(st.current_term, 7);
        assert_eq!(st.voted_for, 0);
        assert_eq!(st.log.metadata().current_term, 7);
    }

    #[test]
    fn step_down_drops_staging_servers() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.role = Role::Leader;
        st.membership.set_staging_servers(&[addr(4)]);
        st.step_down(2);
        assert_eq!(st.membership.state, MembershipState::Stable);
        assert!(st.membership.peer(4).is_none());
    }

    // === Catch-up heuristic ===

    #[tokio::test(start_paused = true)]
    async fn staging_server_catches_up_within_bound() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.role = Role::Leader;
        st.append_to_log(Entry::data(1, b"a".to_vec())); // id 2
        st.membership.set_staging_servers(&[addr(4)]);
        let goal = st.log.last_id();
        let now = Instant::now();
        st.membership.peer_mut(4).unwrap().begin_catch_up(now, goal);

        tokio::time::advance(Duration::from_millis(100)).await;
        st.membership.peer_mut(4).unwrap().last_agree_id = goal;
        st.update_catch_up(4, Instant::now());
        assert!(st.membership.peer(4).unwrap().is_caught_up);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_staging_server_gets_another_iteration() {
        let mut st = cluster_state(1, &[1, 2, 3]);
        st.role = Role::Leader;
        st.append_to_log(Entry::data(1, b"a".to_vec())); // id 2
        st.membership.set_staging_servers(&[addr(4)]);
        let goal = st.log.last_id();
        st.membership.peer_mut(4).unwrap().begin_catch_up(Instant::now(), goal);

        // First iteration takes longer than the follower timeout.
        tokio::time::advance(Duration::from_millis(700)).await;
        st.append_to_log(Entry::data(1, b"b".to_vec())); // id 3 arrives meanwhile
        st.membership.peer_mut(4).unwrap().last_agree_id = goal;
        st.update_catch_up(4, Instant::now());
        let peer = st.membership.peer(4).unwrap();
        assert!(!peer.is_caught_up);
        assert_eq!(peer.catch_up_rounds, 1);
        // The next iteration chases the new tail.
        assert_eq!(peer.catch_up_iteration_goal_id, 3);

        // Second iteration completes quickly.
        tokio::time::advance(Duration::from_millis(50)).await;
        st.membership.peer_mut(4).unwrap().last_agree_id = 3;
        st.update_catch_up(4, Instant::now());
        assert!(st.membership.peer(4).unwrap().is_caught_up);
    }

    // === Async surface, single server ===

    async fn spawn_single(network: &InMemoryNetwork) -> Arc<ReplicatedLog> {
        let mut log = MemoryLog::new();
        bootstrap(&mut log, addr(1)).unwrap();
        let transport = network.transport("server-1", Duration::from_millis(200));
        ReplicatedLog::spawn(
            1,
            "server-1",
            Box::new(log),
            Box::new(transport),
            RaftOptions::default()
                .with_follower_timeout(Duration::from_millis(100))
                .with_heartbeat_period(Duration::from_millis(10))
                .with_seed(1),
        )
    }

    async fn wait_for_leader(log: &ReplicatedLog) {
        for _ in 0..200 {
            if log.status().await.role == Role::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test]
    async fn single_server_replicates_immediately() {
        let network = InMemoryNetwork::new();
        let log = spawn_single(&network).await;
        wait_for_leader(&log).await;

        let id = log.replicate(b"hello".to_vec()).await.unwrap();
        let entry = log.get_next_entry(id - 1).await.unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.kind, EntryType::Data);
        assert_eq!(entry.payload, b"hello");

        let committed = log.get_last_committed_id().await.unwrap();
        assert!(committed >= id);
        log.exit().await;
    }

    #[tokio::test]
    async fn committed_stream_walks_every_entry() {
        let network = InMemoryNetwork::new();
        let log = spawn_single(&network).await;
        wait_for_leader(&log).await;

        let first = log.replicate(b"one".to_vec()).await.unwrap();
        let second = log.replicate(b"two".to_vec()).await.unwrap();
        assert_eq!(second, first + 1);

        // Walking from the start yields the bootstrap and election
        // configuration entries before the data.
        let mut seen = Vec::new();
        let mut at = 0;
        while at < second {
            let entry = log.get_next_entry(at).await.unwrap();
            at = entry.id;
            seen.push(entry);
        }
        assert_eq!(seen[0].kind, EntryType::Configuration);
        assert_eq!(seen[seen.len() - 2].payload, b"one");
        assert_eq!(seen[seen.len() - 1].payload, b"two");
        log.exit().await;
    }

    #[tokio::test]
    async fn replicate_on_follower_reports_not_leader() {
        let network = InMemoryNetwork::new();
        let _inbox = network.register("server-2");
        // Server 1 recovers a configuration it is not part of, so it can
        // never win an election and stays a follower.
        let mut fresh = MemoryLog::new();
        fresh
            .append(Entry::configuration(
                1,
                ConfigurationDescriptor::stable(vec![addr(2), addr(3)]),
            ))
            .unwrap();
        let transport = network.transport("server-1", Duration::from_millis(50));
        let server = ReplicatedLog::spawn(
            1,
            "server-1",
            Box::new(fresh),
            Box::new(transport),
            RaftOptions::default().with_seed(3),
        );
        let result = server.replicate(b"nope".to_vec()).await;
        assert!(matches!(result, Err(ClientError::NotLeader { .. })));
        server.exit().await;
    }

    #[tokio::test]
    async fn get_configuration_round_trips() {
        let network = InMemoryNetwork::new();
        let log = spawn_single(&network).await;
        wait_for_leader(&log).await;
        // Wait for leadership to be serviceable.
        let mut result = log.get_configuration().await;
        for _ in 0..100 {
            if result.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            result = log.get_configuration().await;
        }
        let (id, servers) = result.unwrap();
        assert!(id >= 1);
        assert_eq!(servers, vec![addr(1)]);
        log.exit().await;
    }

    #[tokio::test]
    async fn exit_fails_pending_consumers() {
        let network = InMemoryNetwork::new();
        let log = spawn_single(&network).await;
        wait_for_leader(&log).await;
        let waiter = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.get_next_entry(9999).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.exit().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Fail)));
    }

    #[tokio::test]
    async fn dead_peer_response_is_ignored() {
        // An inbox that answers with a stale term must not disturb a newer
        // term; exercised indirectly through handle_* validation.
        let mut st = cluster_state(1, &[1, 2]);
        st.current_term = 5;
        let response = st.handle_append_entry(&heartbeat(4, 2, 0));
        assert!(!response.success);
        assert_eq!(st.current_term, 5);
        let _ = Request::AppendEntry {
            request: heartbeat(4, 2, 0),
            reply: tokio::sync::oneshot::channel().0,
        };
    }
}
