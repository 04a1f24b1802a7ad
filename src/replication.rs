//! Replication Engine: leader start-up, heartbeat rounds, follower progress,
//! the commit rule, and the AppendEntries handler.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::command::Command;
use crate::lease::LeaderLease;
use crate::node::{Node, Role};
use crate::state::Leader;
use crate::types::{
    AppendEntries, AppendEntriesResponse, LogEntry, LogIndex, Message, NodeId, Operation,
};

impl Node {
    /// §5.2, §8: a new leader starts every follower at its own log length, appends a
    /// no-op in its term so earlier entries can be committed by the commit rule, and
    /// sends a heartbeat round straight away.
    pub(crate) fn become_leader(
        &mut self,
        now: Instant,
        old_leader_lease: Duration,
        commands: &mut Vec<Command>,
    ) {
        let lease = LeaderLease::new(now, self.config.lease_duration, old_leader_lease);
        info!(
            node = %self.id,
            term = %self.persistent.current_term,
            read_wait = ?old_leader_lease,
            "became leader"
        );
        self.role = Role::Leader(Leader::new(
            &self.peers,
            self.last_log_index(),
            now + self.config.heartbeat_interval,
            lease,
        ));
        self.append(LogEntry::noop(self.persistent.current_term));
        self.broadcast_heartbeat(now, commands);
    }

    /// Called when the heartbeat timer fires.
    pub fn heartbeat_timeout(&mut self, now: Instant) -> Vec<Command> {
        let mut commands = Vec::new();
        self.broadcast_heartbeat(now, &mut commands);
        commands
    }

    fn broadcast_heartbeat(&mut self, now: Instant, commands: &mut Vec<Command>) {
        let quorum = self.quorum();
        let Role::Leader(leader) = &mut self.role else {
            return;
        };
        leader.heartbeat_deadline = now + self.config.heartbeat_interval;
        let round = leader.lease.begin_round(now, quorum);

        for &peer in &self.peers {
            if let Some(request) = self.append_entries_for(peer, round) {
                commands.push(Command::Send {
                    to: peer,
                    message: Message::AppendEntries(request),
                });
            }
        }
        self.advance_commit_length();
    }

    /// Everything from the follower's believed log length onwards, plus the prefix check.
    fn append_entries_for(&self, peer: NodeId, round: u64) -> Option<AppendEntries> {
        let Role::Leader(leader) = &self.role else {
            return None;
        };
        let prev_log_index = leader.sent_length_for(peer)?.min(self.last_log_index());
        let entries = self
            .persistent
            .log
            .get(prev_log_index.as_length()..)
            .unwrap_or_default()
            .to_vec();
        Some(AppendEntries {
            term: self.persistent.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.term_at(prev_log_index),
            entries,
            leader_commit: self.volatile.commit_length,
            lease_duration: self.config.lease_duration,
            round,
        })
    }

    /// Append a client operation. Returns the entry and its index if this node leads.
    pub fn submit(&mut self, operation: Operation) -> Option<(LogIndex, LogEntry)> {
        if !self.is_leader() {
            return None;
        }
        let entry = LogEntry {
            term: self.persistent.current_term,
            operation,
        };
        let index = self.append(entry.clone());
        // Only matters for a single-node cluster; otherwise the next heartbeat ships it.
        self.advance_commit_length();
        Some((index, entry))
    }

    /// §5.3: accept entries only when our log holds the leader's prefix.
    pub fn handle_append_entries(
        &mut self,
        from: NodeId,
        request: AppendEntries,
        now: Instant,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        self.adopt_term(request.term, now, &mut commands);
        let current_term = self.persistent.current_term;

        if request.term == current_term {
            self.become_follower(Some(request.leader_id), now, &mut commands);
            let election_deadline = now + self.config.random_election_timeout();
            if let Role::Follower(follower) = &mut self.role {
                follower.election_deadline = election_deadline;
            }
            self.old_leader_lease.observe(now, request.lease_duration);
        }

        let prefix_matches = self.last_log_index() >= request.prev_log_index
            && (request.prev_log_index == LogIndex::ZERO
                || self.term_at(request.prev_log_index) == request.prev_log_term);

        let (success, ack_index) = if request.term == current_term && prefix_matches {
            let ack_index = self.reconcile_log(request.prev_log_index, request.entries);
            self.advance_commit_to(request.leader_commit.min(ack_index));
            (true, ack_index)
        } else {
            debug!(
                node = %self.id,
                leader = %request.leader_id,
                prev = %request.prev_log_index,
                "rejected AppendEntries"
            );
            (false, LogIndex::default())
        };

        commands.push(Command::Send {
            to: from,
            message: Message::AppendEntriesResponse(AppendEntriesResponse {
                term: current_term,
                success,
                ack_index,
                round: request.round,
            }),
        });
        commands
    }

    /// Merge the leader's suffix after `prev_log_index`. A conflicting entry (same index,
    /// different term) and everything after it is dropped; matching entries are kept.
    /// Returns the length of the prefix now shared with the leader.
    fn reconcile_log(&mut self, prev_log_index: LogIndex, entries: Vec<LogEntry>) -> LogIndex {
        let ack_index = prev_log_index.advance(entries.len());
        let mut insert_index = prev_log_index.next();

        for entry in entries {
            match insert_index.to_array_index() {
                Some(idx) if idx < self.persistent.log.len() => {
                    if self.persistent.log[idx].term != entry.term {
                        self.persistent.log.truncate(idx);
                        self.persistent.log.push(entry);
                        self.mark_dirty();
                    }
                    // Same term at this index: already present, skip.
                }
                _ => {
                    self.persistent.log.push(entry);
                    self.mark_dirty();
                }
            }
            insert_index = insert_index.next();
        }
        ack_index
    }

    fn advance_commit_to(&mut self, target: LogIndex) {
        if target > self.volatile.commit_length {
            self.volatile.commit_length = target;
            self.mark_dirty();
        }
    }

    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: AppendEntriesResponse,
        now: Instant,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        self.adopt_term(response.term, now, &mut commands);
        if response.term != self.persistent.current_term {
            return commands;
        }

        let quorum = self.quorum();
        let Role::Leader(leader) = &mut self.role else {
            return commands;
        };
        if response.success {
            leader.record_success(from, response.ack_index);
            leader.lease.record_ack(from, response.round, quorum);
            self.advance_commit_length();
        } else {
            leader.record_failure(from);
            debug!(node = %self.id, peer = %from, "log mismatch, backing off one entry");
        }
        commands
    }

    /// §5.3, §5.4.2: commit the longest prefix held by a majority, but only once its
    /// last entry belongs to the current term.
    fn advance_commit_length(&mut self) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let mut candidate = leader.replicated_on_quorum(self.last_log_index(), self.quorum());
        let current_term = self.persistent.current_term;

        while candidate > self.volatile.commit_length {
            if self.term_at(candidate) == current_term {
                info!(node = %self.id, term = %current_term, commit = %candidate, "advanced commit");
                self.advance_commit_to(candidate);
                return;
            }
            candidate = candidate.prev().unwrap_or_default();
        }
    }
}
