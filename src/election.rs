//! Election Manager: candidacy, vote solicitation and tallying, and the
//! RequestVote handler.

use std::time::Instant;

use tracing::{debug, info};

use crate::command::Command;
use crate::node::{Node, Role};
use crate::state::Candidate;
use crate::types::{LogIndex, Message, NodeId, RequestVote, RequestVoteResponse, Term};

impl Node {
    /// Called when the election timer fires. Follower/Candidate starts a new election.
    pub fn election_timeout(&mut self, now: Instant) -> Vec<Command> {
        match &self.role {
            Role::Leader(_) => Vec::new(),
            Role::Candidate(candidate) if candidate.is_tallying() => Vec::new(),
            Role::Follower(_) | Role::Candidate(_) => self.start_election(now),
        }
    }

    fn start_election(&mut self, now: Instant) -> Vec<Command> {
        self.persistent.current_term = self.persistent.current_term.increment();
        self.persistent.voted_for = Some(self.id);
        self.mark_dirty();

        let own_estimate = self.old_leader_lease.remaining(now);
        self.role = Role::Candidate(Candidate::new(
            self.id,
            now + self.config.rpc_timeout,
            own_estimate,
        ));
        info!(node = %self.id, term = %self.persistent.current_term, "starting election");

        let request = RequestVote {
            term: self.persistent.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        let mut commands: Vec<Command> = self
            .peers
            .iter()
            .map(|&peer| Command::Send {
                to: peer,
                message: Message::RequestVote(request.clone()),
            })
            .collect();
        // A single-node cluster wins on its own vote.
        self.tally_votes(now, &mut commands);
        commands
    }

    /// §5.2, §5.4: grant at most one vote per term, and only to a candidate whose
    /// log is at least as up-to-date as ours. Granting does not touch our own
    /// election timer.
    pub fn handle_request_vote(
        &mut self,
        from: NodeId,
        request: RequestVote,
        now: Instant,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        self.adopt_term(request.term, now, &mut commands);

        let current_term = self.persistent.current_term;
        let vote_available = match self.persistent.voted_for {
            None => true,
            Some(voted) => voted == request.candidate_id,
        };
        let vote_granted = request.term == current_term
            && vote_available
            && self.log_is_up_to_date(request.last_log_index, request.last_log_term);

        if vote_granted {
            if self.persistent.voted_for != Some(request.candidate_id) {
                self.persistent.voted_for = Some(request.candidate_id);
                self.mark_dirty();
            }
            debug!(node = %self.id, candidate = %request.candidate_id, term = %current_term, "vote granted");
        } else {
            debug!(node = %self.id, candidate = %request.candidate_id, term = %request.term, "vote denied");
        }

        commands.push(Command::Send {
            to: from,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: current_term,
                vote_granted,
                old_leader_lease_remaining: self.old_leader_lease.remaining(now),
            }),
        });
        commands
    }

    /// Fold a vote reply into the tally. Replies that arrive after the tally closed,
    /// or that belong to another term, are ignored.
    pub fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        response: RequestVoteResponse,
        now: Instant,
    ) -> Vec<Command> {
        let mut commands = Vec::new();
        self.adopt_term(response.term, now, &mut commands);
        if response.term != self.persistent.current_term {
            return commands;
        }

        let Role::Candidate(candidate) = &mut self.role else {
            return commands;
        };
        if !candidate.is_tallying() {
            return commands;
        }
        candidate.record_response(
            from,
            response.vote_granted,
            response.old_leader_lease_remaining,
        );
        self.tally_votes(now, &mut commands);
        commands
    }

    /// The vote round deadline passed before the tally resolved.
    pub fn vote_round_timeout(&mut self, now: Instant) -> Vec<Command> {
        if let Role::Candidate(candidate) = &self.role {
            if candidate.is_tallying() && now >= candidate.deadline() {
                self.lose_election(now);
            }
        }
        Vec::new()
    }

    /// Resolve the tally as soon as the outcome is known: a majority wins at once,
    /// and a round in which every peer answered without a majority is lost.
    fn tally_votes(&mut self, now: Instant, commands: &mut Vec<Command>) {
        let cluster_size = self.cluster_size();
        let peer_count = self.peers.len();
        let Role::Candidate(candidate) = &self.role else {
            return;
        };
        if candidate.has_majority(cluster_size) {
            let old_leader_lease = candidate.old_leader_lease();
            self.become_leader(now, old_leader_lease, commands);
        } else if candidate.all_responded(peer_count) {
            self.lose_election(now);
        }
    }

    fn lose_election(&mut self, now: Instant) {
        let election_deadline = now + self.config.random_election_timeout();
        if let Role::Candidate(candidate) = &mut self.role {
            info!(
                node = %self.id,
                term = %self.persistent.current_term,
                votes = candidate.votes(),
                "election lost, waiting for next timeout"
            );
            candidate.conclude(election_deadline);
        }
    }

    /// §5.4.1: the candidate's last entry has a later term, or the same term and
    /// at least as many entries.
    pub(crate) fn log_is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let my_last_term = self.last_log_term();
        last_log_term > my_last_term
            || (last_log_term == my_last_term && last_log_index >= self.last_log_index())
    }
}
