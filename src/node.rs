use std::time::Instant;

use tracing::info;

use crate::command::Command;
use crate::config::TimerConfig;
use crate::lease::OldLeaderLease;
use crate::state::{Candidate, Follower, Leader};
use crate::storage::PersistedRecord;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// Persistent state on all servers.
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

/// Volatile state on all servers. `commit_length` is also persisted, so it never
/// moves backwards across restarts.
pub struct VolatileState {
    pub commit_length: LogIndex,
    pub last_applied: LogIndex,
}

/// Server role with associated state. Each role owns the deadlines that are valid
/// in it, so replacing the role cancels the old role's timers.
pub enum Role {
    Follower(Follower),
    Candidate(Candidate),
    Leader(Leader),
}

/// Timers a node can have armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timer {
    Election,
    VoteRound,
    Heartbeat,
    LeaseExpiry,
}

/// A Raft node.
pub struct Node {
    pub id: NodeId,
    pub peers: Vec<NodeId>,
    pub persistent: PersistentState,
    pub volatile: VolatileState,
    pub role: Role,
    pub(crate) config: TimerConfig,
    pub(crate) old_leader_lease: OldLeaderLease,
    needs_persist: bool,
}

impl Node {
    /// Create a new node. Starts as follower with no known leader.
    pub fn new(id: NodeId, peers: Vec<NodeId>, config: TimerConfig, now: Instant) -> Self {
        Self::restore(id, peers, config, PersistedRecord::default(), now)
    }

    /// Rebuild a node from its persisted record. Nothing is applied yet; the
    /// runtime replays committed entries into the state machine.
    pub fn restore(
        id: NodeId,
        peers: Vec<NodeId>,
        config: TimerConfig,
        record: PersistedRecord,
        now: Instant,
    ) -> Self {
        let commit_length = record
            .commit_length
            .min(LogIndex::from_length(record.log.len()));
        let election_deadline = now + config.random_election_timeout();
        Self {
            id,
            peers,
            persistent: PersistentState {
                current_term: record.current_term,
                voted_for: record.voted_for,
                log: record.log,
            },
            volatile: VolatileState {
                commit_length,
                last_applied: LogIndex::default(),
            },
            role: Role::Follower(Follower::new(None, election_deadline)),
            config,
            old_leader_lease: OldLeaderLease::default(),
            needs_persist: false,
        }
    }

    /// Image of the state that must survive a crash.
    pub fn record(&self) -> PersistedRecord {
        PersistedRecord {
            commit_length: self.volatile.commit_length,
            current_term: self.persistent.current_term,
            voted_for: self.persistent.voted_for,
            log: self.persistent.log.clone(),
        }
    }

    /// True once per batch of mutations that has not been saved yet.
    pub fn take_needs_persist(&mut self) -> bool {
        std::mem::take(&mut self.needs_persist)
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.needs_persist = true;
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn role_name(&self) -> &'static str {
        match self.role {
            Role::Follower(_) => "follower",
            Role::Candidate(_) => "candidate",
            Role::Leader(_) => "leader",
        }
    }

    /// Who this node believes leads the current term.
    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Follower(follower) => follower.leader_id,
            Role::Candidate(_) => None,
            Role::Leader(_) => Some(self.id),
        }
    }

    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::from_length(self.persistent.log.len())
    }

    pub fn last_log_term(&self) -> Term {
        self.persistent
            .log
            .last()
            .map_or(Term::default(), |entry| entry.term)
    }

    /// Term of the entry at `index`, or 0 for index 0 and anything past the end.
    pub fn term_at(&self, index: LogIndex) -> Term {
        index
            .to_array_index()
            .and_then(|idx| self.persistent.log.get(idx))
            .map_or(Term::default(), |entry| entry.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        index
            .to_array_index()
            .and_then(|idx| self.persistent.log.get(idx))
    }

    /// When the earliest armed timer fires.
    pub fn next_deadline(&self) -> Instant {
        match &self.role {
            Role::Follower(follower) => follower.election_deadline,
            Role::Candidate(candidate) => candidate.deadline(),
            Role::Leader(leader) => leader.heartbeat_deadline.min(leader.lease.expires_at()),
        }
    }

    /// The timer that is due at `now`, if any. Lease expiry wins over the heartbeat.
    pub fn due_timer(&self, now: Instant) -> Option<Timer> {
        match &self.role {
            Role::Follower(follower) => {
                (now >= follower.election_deadline).then_some(Timer::Election)
            }
            Role::Candidate(candidate) if now >= candidate.deadline() => {
                if candidate.is_tallying() {
                    Some(Timer::VoteRound)
                } else {
                    Some(Timer::Election)
                }
            }
            Role::Candidate(_) => None,
            Role::Leader(leader) => {
                if leader.lease.is_expired(now) {
                    Some(Timer::LeaseExpiry)
                } else if now >= leader.heartbeat_deadline {
                    Some(Timer::Heartbeat)
                } else {
                    None
                }
            }
        }
    }

    /// §5.1: a message carrying a newer term moves this node to that term, as a
    /// follower with no vote cast, before anything else in the message is acted on.
    pub(crate) fn adopt_term(&mut self, term: Term, now: Instant, commands: &mut Vec<Command>) {
        if term > self.persistent.current_term {
            info!(
                node = %self.id,
                from = %self.persistent.current_term,
                to = %term,
                "observed newer term"
            );
            self.persistent.current_term = term;
            self.persistent.voted_for = None;
            self.mark_dirty();
            self.become_follower(None, now, commands);
        }
    }

    /// The single transition into the follower role. A follower stays put and only
    /// learns the leader; a candidate or leader drops its role state, and with it
    /// every timer of that role, and arms a fresh election timer.
    pub(crate) fn become_follower(
        &mut self,
        leader_id: Option<NodeId>,
        now: Instant,
        commands: &mut Vec<Command>,
    ) {
        if let Role::Follower(follower) = &mut self.role {
            follower.leader_id = leader_id;
            return;
        }
        if let Role::Leader(leader) = &self.role {
            // Report our own lease to the next candidate that asks for a vote.
            self.old_leader_lease.extend_until(leader.lease.expires_at());
            commands.push(Command::LeadershipLost { leader_id });
        }
        info!(
            node = %self.id,
            term = %self.persistent.current_term,
            previous = self.role_name(),
            "became follower"
        );
        let election_deadline = now + self.config.random_election_timeout();
        self.role = Role::Follower(Follower::new(leader_id, election_deadline));
    }

    /// Append to the local log, returning the new entry's index.
    pub(crate) fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.persistent.log.push(entry);
        self.mark_dirty();
        self.last_log_index()
    }

    /// Figure 2, Rules for Servers (All Servers): if commitIndex > lastApplied, apply the
    /// next entry to the state machine. §5.3: state machines process entries in log order.
    pub fn take_entry_to_apply(&mut self) -> Option<(LogIndex, LogEntry)> {
        if self.volatile.last_applied >= self.volatile.commit_length {
            return None;
        }
        let next = self.volatile.last_applied.next();
        let entry = self.entry(next)?.clone();
        self.volatile.last_applied = next;
        Some((next, entry))
    }
}
