use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::lease::LeaderLease;
use crate::types::{LogIndex, NodeId};

/// §5.1: followers are passive: they issue no requests, only respond to RPCs from
/// leaders and candidates. If a follower receives no communication, it starts an election.
pub struct Follower {
    pub leader_id: Option<NodeId>,
    pub election_deadline: Instant,
}

impl Follower {
    pub fn new(leader_id: Option<NodeId>, election_deadline: Instant) -> Self {
        Self {
            leader_id,
            election_deadline,
        }
    }
}

/// §5.2: a candidate requests votes from peers to win an election. It votes for itself
/// and wins if it receives votes from a majority of servers in the full cluster.
///
/// The tally stays open until a majority is reached, every peer has answered, or the
/// round deadline passes. Once closed, replies for this term are ignored and the
/// deadline becomes the election timer for the next attempt.
pub struct Candidate {
    votes_received: HashSet<NodeId>,
    responded: HashSet<NodeId>,
    old_leader_lease: Duration,
    tallying: bool,
    deadline: Instant,
}

impl Candidate {
    pub fn new(self_id: NodeId, round_deadline: Instant, own_old_leader_lease: Duration) -> Self {
        Self {
            votes_received: HashSet::from([self_id]),
            responded: HashSet::new(),
            old_leader_lease: own_old_leader_lease,
            tallying: true,
            deadline: round_deadline,
        }
    }

    pub fn record_response(&mut self, from: NodeId, granted: bool, old_leader_lease: Duration) {
        self.responded.insert(from);
        if granted {
            self.votes_received.insert(from);
            self.old_leader_lease = self.old_leader_lease.max(old_leader_lease);
        }
    }

    // §5.2: a candidate wins the election if it receives votes from a majority
    // of the servers in the full cluster (⌊N/2⌋ + 1 out of N servers).
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() >= cluster_size / 2 + 1
    }

    pub fn all_responded(&self, peer_count: usize) -> bool {
        self.responded.len() >= peer_count
    }

    pub fn is_tallying(&self) -> bool {
        self.tallying
    }

    /// Close the tally without a win and arm the election timer.
    pub fn conclude(&mut self, election_deadline: Instant) {
        self.tallying = false;
        self.deadline = election_deadline;
    }

    /// Longest lease any granting voter reported for a previous leader.
    pub fn old_leader_lease(&self) -> Duration {
        self.old_leader_lease
    }

    pub fn votes(&self) -> usize {
        self.votes_received.len()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Volatile state on leaders, created on election win and dropped on step-down.
/// `sent_length` is how much of the log the leader believes each follower holds;
/// `acked_length` is how much each follower has confirmed.
pub struct Leader {
    sent_length: HashMap<NodeId, LogIndex>,
    acked_length: HashMap<NodeId, LogIndex>,
    pub heartbeat_deadline: Instant,
    pub lease: LeaderLease,
}

impl Leader {
    // sent_length starts at the leader's log length (optimistic).
    // acked_length starts at 0 (conservative, increases monotonically).
    pub fn new(
        peers: &[NodeId],
        log_length: LogIndex,
        heartbeat_deadline: Instant,
        lease: LeaderLease,
    ) -> Self {
        Self {
            sent_length: peers.iter().map(|&p| (p, log_length)).collect(),
            acked_length: peers.iter().map(|&p| (p, LogIndex::default())).collect(),
            heartbeat_deadline,
            lease,
        }
    }

    pub fn sent_length_for(&self, peer: NodeId) -> Option<LogIndex> {
        self.sent_length.get(&peer).copied()
    }

    pub fn acked_lengths(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.acked_length.values().copied()
    }

    /// Update follower progress after successful replication.
    pub fn record_success(&mut self, from: NodeId, ack_index: LogIndex) {
        if let Some(acked) = self.acked_length.get_mut(&from) {
            *acked = (*acked).max(ack_index);
            self.sent_length.insert(from, ack_index);
        }
    }

    /// Step back one entry after a rejected prefix; retried on the next heartbeat.
    pub fn record_failure(&mut self, from: NodeId) {
        if let Some(sent) = self.sent_length.get_mut(&from) {
            if let Some(prev) = sent.prev() {
                *sent = prev;
            }
        }
    }

    /// Largest length held by at least `quorum` servers, counting the leader's own log.
    pub fn replicated_on_quorum(&self, own_length: LogIndex, quorum: usize) -> LogIndex {
        let mut lengths: Vec<LogIndex> = self.acked_lengths().collect();
        lengths.push(own_length);
        lengths.sort_unstable_by(|a, b| b.cmp(a));
        quorum
            .checked_sub(1)
            .and_then(|position| lengths.get(position).copied())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leader(peers: &[u64], log_length: u64) -> Leader {
        let now = Instant::now();
        let peers: Vec<NodeId> = peers.iter().map(|&p| NodeId::from(p)).collect();
        Leader::new(
            &peers,
            LogIndex::from(log_length),
            now,
            LeaderLease::new(now, Duration::from_secs(2), Duration::ZERO),
        )
    }

    #[test]
    fn leader_new_initializes_correctly() {
        let leader = leader(&[1, 2, 3], 5);

        // sent_length should be the leader's log length for all peers
        assert_eq!(leader.sent_length_for(NodeId::from(1)), Some(LogIndex::from(5)));
        assert_eq!(leader.sent_length_for(NodeId::from(2)), Some(LogIndex::from(5)));
        assert_eq!(leader.sent_length_for(NodeId::from(3)), Some(LogIndex::from(5)));

        // acked_length should be 0 for all peers
        let acked: Vec<_> = leader.acked_lengths().collect();
        assert_eq!(acked.len(), 3);
        assert!(acked.iter().all(|&idx| idx == LogIndex::default()));
    }

    #[test]
    fn sent_length_for_returns_none_for_unknown_peer() {
        let leader = leader(&[1], 0);
        assert_eq!(leader.sent_length_for(NodeId::from(99)), None);
    }

    #[test]
    fn record_success_updates_both_lengths() {
        let mut leader = leader(&[1, 2], 0);

        leader.record_success(NodeId::from(1), LogIndex::from(5));

        assert!(leader.acked_lengths().any(|idx| idx == LogIndex::from(5)));
        assert_eq!(leader.sent_length_for(NodeId::from(1)), Some(LogIndex::from(5)));
        // peer 2 should remain unchanged
        assert_eq!(leader.sent_length_for(NodeId::from(2)), Some(LogIndex::from(0)));
    }

    #[test]
    fn stale_success_does_not_lower_acked_length() {
        let mut leader = leader(&[1], 0);

        leader.record_success(NodeId::from(1), LogIndex::from(5));
        leader.record_success(NodeId::from(1), LogIndex::from(3));

        assert_eq!(leader.acked_lengths().collect::<Vec<_>>(), vec![LogIndex::from(5)]);
    }

    #[test]
    fn record_failure_decrements_sent_length() {
        let mut leader = leader(&[1], 10);

        leader.record_failure(NodeId::from(1));
        assert_eq!(leader.sent_length_for(NodeId::from(1)), Some(LogIndex::from(9)));

        leader.record_failure(NodeId::from(1));
        assert_eq!(leader.sent_length_for(NodeId::from(1)), Some(LogIndex::from(8)));
    }

    #[test]
    fn record_failure_does_not_decrement_below_zero() {
        let mut leader = leader(&[1], 1);

        leader.record_failure(NodeId::from(1));
        assert_eq!(leader.sent_length_for(NodeId::from(1)), Some(LogIndex::from(0)));

        leader.record_failure(NodeId::from(1));
        assert_eq!(leader.sent_length_for(NodeId::from(1)), Some(LogIndex::from(0)));
    }

    #[test]
    fn progress_for_unknown_peer_is_ignored() {
        let mut leader = leader(&[1], 5);

        leader.record_failure(NodeId::from(99));
        leader.record_success(NodeId::from(99), LogIndex::from(10));

        assert_eq!(leader.sent_length_for(NodeId::from(99)), None);
        assert_eq!(leader.acked_lengths().count(), 1);
    }

    #[test]
    fn replicated_on_quorum_counts_leader() {
        let mut leader = leader(&[2, 3, 4, 5], 0);
        leader.record_success(NodeId::from(2), LogIndex::from(3));
        leader.record_success(NodeId::from(3), LogIndex::from(5));
        leader.record_success(NodeId::from(4), LogIndex::from(4));

        // lengths: leader 6, then 5, 4, 3, 0, so the third largest is 4.
        assert_eq!(leader.replicated_on_quorum(LogIndex::from(6), 3), LogIndex::from(4));
    }

    #[test]
    fn candidate_tallies_distinct_votes() {
        let now = Instant::now();
        let mut candidate = Candidate::new(NodeId::from(1), now, Duration::ZERO);
        assert!(!candidate.has_majority(3));

        candidate.record_response(NodeId::from(2), false, Duration::from_secs(9));
        assert!(!candidate.has_majority(3));
        assert_eq!(candidate.old_leader_lease(), Duration::ZERO);

        candidate.record_response(NodeId::from(3), true, Duration::from_secs(1));
        candidate.record_response(NodeId::from(3), true, Duration::from_secs(1));
        assert_eq!(candidate.votes(), 2);
        assert!(candidate.has_majority(3));
        assert!(candidate.all_responded(2));
        assert_eq!(candidate.old_leader_lease(), Duration::from_secs(1));
    }

    #[test]
    fn candidate_conclude_closes_tally() {
        let now = Instant::now();
        let mut candidate = Candidate::new(NodeId::from(1), now, Duration::ZERO);
        let next = now + Duration::from_secs(7);

        candidate.conclude(next);

        assert!(!candidate.is_tallying());
        assert_eq!(candidate.deadline(), next);
    }
}
