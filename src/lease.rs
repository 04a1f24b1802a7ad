//! Leader leases.
//!
//! A leader answers reads from its local state machine only while it holds a
//! lease: a window that starts at a heartbeat round acknowledged by a majority
//! and lasts `lease_duration`. Followers remember the duration the leader
//! advertised, and report what is left of it when voting, so the next leader
//! waits it out before serving any client request.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::command::Command;
use crate::node::{Node, Role};
use crate::types::NodeId;

/// Lease bookkeeping that exists only while this node is leader.
pub struct LeaderLease {
    duration: Duration,
    /// No client request may be served before this instant (old leader lease wait-out).
    read_barrier: Instant,
    expires_at: Instant,
    /// Set once a heartbeat round in this term reached a majority.
    confirmed: bool,
    round: u64,
    round_started_at: Instant,
    round_acks: HashSet<NodeId>,
}

impl LeaderLease {
    pub fn new(now: Instant, duration: Duration, old_leader_remaining: Duration) -> Self {
        let read_barrier = now + old_leader_remaining;
        Self {
            duration,
            read_barrier,
            expires_at: read_barrier + duration,
            confirmed: false,
            round: 0,
            round_started_at: now,
            round_acks: HashSet::new(),
        }
    }

    /// Start a heartbeat round and return its number. `quorum` counts this node,
    /// so a single-node cluster renews immediately.
    pub fn begin_round(&mut self, now: Instant, quorum: usize) -> u64 {
        self.round += 1;
        self.round_started_at = now;
        self.round_acks.clear();
        self.check_quorum(quorum);
        self.round
    }

    /// Record a successful heartbeat reply to `round`. Returns true if this renewed
    /// the lease. Replies to an earlier round are ignored: the follower started its
    /// count when that round arrived, before the current round started.
    pub fn record_ack(&mut self, peer: NodeId, round: u64, quorum: usize) -> bool {
        round == self.round && self.round_acks.insert(peer) && self.check_quorum(quorum)
    }

    fn check_quorum(&mut self, quorum: usize) -> bool {
        if self.round_acks.len() + 1 < quorum {
            return false;
        }
        // Anchored at the round start: followers start counting on receipt,
        // which is never earlier.
        let renewed = self.round_started_at + self.duration;
        if renewed > self.expires_at {
            self.expires_at = renewed;
        }
        self.confirmed = true;
        true
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn read_barrier(&self) -> Instant {
        self.read_barrier
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// The previous leader's lease has run out.
    pub fn past_barrier(&self, now: Instant) -> bool {
        now >= self.read_barrier
    }

    pub fn can_serve_reads(&self, now: Instant) -> bool {
        self.confirmed && self.past_barrier(now) && now < self.expires_at
    }
}

/// This node's estimate of when a previous leader's lease runs out.
#[derive(Default)]
pub struct OldLeaderLease {
    until: Option<Instant>,
}

impl OldLeaderLease {
    /// A leader advertised `lease_duration` at `now`.
    pub fn observe(&mut self, now: Instant, lease_duration: Duration) {
        self.extend_until(now + lease_duration);
    }

    pub fn extend_until(&mut self, deadline: Instant) {
        match self.until {
            Some(current) if current >= deadline => {}
            _ => self.until = Some(deadline),
        }
    }

    /// Remaining time, decayed by the wall clock since it was observed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.until
            .map_or(Duration::ZERO, |until| until.saturating_duration_since(now))
    }
}

impl Node {
    /// The lease ran out without a majority-acknowledged heartbeat round.
    /// The leader can no longer prove it may serve reads, so it steps down.
    pub fn lease_timeout(&mut self, now: Instant) -> Vec<Command> {
        let mut commands = Vec::new();
        let expired = match &self.role {
            Role::Leader(leader) => leader.lease.is_expired(now),
            _ => false,
        };
        if expired {
            warn!(
                node = %self.id,
                term = %self.persistent.current_term,
                "lease expired without majority renewal, stepping down"
            );
            self.become_follower(None, now, &mut commands);
        }
        commands
    }

    pub fn can_serve_reads(&self, now: Instant) -> bool {
        match &self.role {
            Role::Leader(leader) => leader.lease.can_serve_reads(now),
            _ => false,
        }
    }

    /// Writes wait out the previous leader's lease as well. Once a write is
    /// acknowledged, no deposed leader may still answer reads from older state.
    pub fn can_accept_writes(&self, now: Instant) -> bool {
        match &self.role {
            Role::Leader(leader) => leader.lease.past_barrier(now),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_millis(2500);

    #[test]
    fn fresh_lease_waits_for_majority_round() {
        let now = Instant::now();
        let mut lease = LeaderLease::new(now, LEASE, Duration::ZERO);
        assert!(!lease.can_serve_reads(now));

        let round = lease.begin_round(now, 2);
        assert!(!lease.can_serve_reads(now));

        assert!(lease.record_ack(NodeId::from(2), round, 2));
        assert!(lease.can_serve_reads(now));
        assert!(!lease.can_serve_reads(now + LEASE));
    }

    #[test]
    fn reads_wait_out_old_leader_lease() {
        let now = Instant::now();
        let mut lease = LeaderLease::new(now, LEASE, Duration::from_secs(2));
        lease.begin_round(now, 1);

        assert!(!lease.can_serve_reads(now + Duration::from_secs(1)));
        assert!(lease.can_serve_reads(now + Duration::from_secs(2)));
        assert_eq!(lease.expires_at(), now + Duration::from_secs(2) + LEASE);
    }

    #[test]
    fn duplicate_acks_do_not_count_twice() {
        let now = Instant::now();
        let mut lease = LeaderLease::new(now, LEASE, Duration::ZERO);
        let round = lease.begin_round(now, 3);

        assert!(!lease.record_ack(NodeId::from(2), round, 3));
        assert!(!lease.record_ack(NodeId::from(2), round, 3));
        assert!(lease.record_ack(NodeId::from(3), round, 3));
    }

    #[test]
    fn renewal_extends_from_round_start() {
        let start = Instant::now();
        let mut lease = LeaderLease::new(start, LEASE, Duration::ZERO);
        let later = start + Duration::from_secs(2);
        let round = lease.begin_round(later, 2);
        lease.record_ack(NodeId::from(2), round, 2);

        assert_eq!(lease.expires_at(), later + LEASE);
        assert!(!lease.is_expired(start + Duration::from_secs(4)));
    }

    #[test]
    fn ack_of_earlier_round_does_not_renew() {
        let start = Instant::now();
        let mut lease = LeaderLease::new(start, LEASE, Duration::ZERO);
        let first = lease.begin_round(start, 2);
        let later = start + Duration::from_secs(1);
        let second = lease.begin_round(later, 2);
        assert_ne!(first, second);

        // The reply to the first round shows up during the second.
        assert!(!lease.record_ack(NodeId::from(2), first, 2));
        assert!(!lease.can_serve_reads(later));
        assert_eq!(lease.expires_at(), start + LEASE);

        assert!(lease.record_ack(NodeId::from(2), second, 2));
        assert_eq!(lease.expires_at(), later + LEASE);
    }

    #[test]
    fn writes_wait_for_old_leader_lease_but_not_for_confirmation() {
        let now = Instant::now();
        let lease = LeaderLease::new(now, LEASE, Duration::from_secs(2));

        assert!(!lease.past_barrier(now + Duration::from_secs(1)));
        assert!(lease.past_barrier(now + Duration::from_secs(2)));
        assert!(!lease.can_serve_reads(now + Duration::from_secs(2)));
    }

    #[test]
    fn unrenewed_lease_expires() {
        let now = Instant::now();
        let lease = LeaderLease::new(now, LEASE, Duration::ZERO);
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + LEASE));
    }

    #[test]
    fn old_leader_lease_decays_and_keeps_maximum() {
        let now = Instant::now();
        let mut old = OldLeaderLease::default();
        assert_eq!(old.remaining(now), Duration::ZERO);

        old.observe(now, LEASE);
        old.observe(now, Duration::from_secs(1));
        assert_eq!(old.remaining(now), LEASE);
        assert_eq!(
            old.remaining(now + Duration::from_secs(1)),
            Duration::from_millis(1500)
        );
        assert_eq!(old.remaining(now + Duration::from_secs(10)), Duration::ZERO);
    }
}
