//! Deterministic in-memory cluster for tests.
//!
//! Messages sit in a queue until `deliver_all`; the clock only moves when a test
//! calls `advance` or `step`. Nodes can be isolated (their traffic is dropped),
//! crashed (only their `MemoryStorage` survives) and restarted from it.

use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::config::TimerConfig;
use crate::kv::{ClientReply, ClientRequest, ParseRequestError};
use crate::node::{Node, Role};
use crate::runtime::{Admission, Event, PendingWrites, Runtime};
use crate::storage::MemoryStorage;
use crate::types::{Message, NodeId};

/// Handle for a client request issued through `Cluster::serve`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(usize);

/// A message in flight between nodes.
struct InFlight {
    from: NodeId,
    to: NodeId,
    message: Message,
}

enum Slot {
    Up(Box<Runtime<MemoryStorage>>),
    Down(MemoryStorage),
}

/// Client requests a node is holding on to.
#[derive(Default)]
struct Waiting {
    writes: PendingWrites<RequestId>,
    deferred: Vec<(RequestId, ClientRequest)>,
}

/// Simulated cluster for testing.
pub struct Cluster {
    slots: Vec<Slot>,
    waiting: Vec<Waiting>,
    messages: VecDeque<InFlight>,
    isolated: HashSet<NodeId>,
    replies: Vec<Option<ClientReply>>,
    config: TimerConfig,
    now: Instant,
}

fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

impl Cluster {
    /// Create a cluster with ids `0..size`, all followers in term 0.
    pub fn new(size: usize) -> Self {
        Self::with_config(size, TimerConfig::default())
    }

    pub fn with_config(size: usize, config: TimerConfig) -> Self {
        let now = Instant::now();
        let mut cluster = Self {
            slots: Vec::with_capacity(size),
            waiting: (0..size).map(|_| Waiting::default()).collect(),
            messages: VecDeque::new(),
            isolated: HashSet::new(),
            replies: Vec::new(),
            config,
            now,
        };
        for index in 0..size {
            let runtime = cluster.boot(index, MemoryStorage::new());
            cluster.slots.push(Slot::Up(runtime));
        }
        cluster
    }

    fn boot(&self, index: usize, storage: MemoryStorage) -> Box<Runtime<MemoryStorage>> {
        let id = NodeId::from(index as u64);
        let peers = (0..self.size())
            .map(|p| NodeId::from(p as u64))
            .filter(|&p| p != id)
            .collect();
        Box::new(infallible(Runtime::from_storage_at(
            id,
            peers,
            storage,
            self.config.clone(),
            self.now,
        )))
    }

    fn size(&self) -> usize {
        self.waiting.len()
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Move the clock without firing anything.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Move the clock, fire every due timer, and deliver until quiet.
    pub fn step(&mut self, by: Duration) {
        self.advance(by);
        for index in 0..self.size() {
            while let Some(event) = self.runtime(index).and_then(|rt| rt.poll_timers_at(self.now)) {
                self.handle(index, event);
            }
            self.settle(index);
        }
        self.deliver_all();
    }

    /// Step in `tick` increments until `done` holds or `limit` has elapsed.
    pub fn run_until(
        &mut self,
        limit: Duration,
        tick: Duration,
        mut done: impl FnMut(&Cluster) -> bool,
    ) -> bool {
        let deadline = self.now + limit;
        while !done(self) {
            if self.now >= deadline {
                return false;
            }
            self.step(tick);
        }
        true
    }

    pub fn runtime(&self, index: usize) -> Option<&Runtime<MemoryStorage>> {
        match self.slots.get(index)? {
            Slot::Up(runtime) => Some(&**runtime),
            Slot::Down(_) => None,
        }
    }

    fn runtime_mut(&mut self, index: usize) -> Option<&mut Runtime<MemoryStorage>> {
        match self.slots.get_mut(index)? {
            Slot::Up(runtime) => Some(&mut **runtime),
            Slot::Down(_) => None,
        }
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.runtime(index).map(Runtime::node)
    }

    pub fn election_timeout(&mut self, index: usize) {
        self.handle(index, Event::ElectionTimeout);
    }

    pub fn heartbeat_timeout(&mut self, index: usize) {
        self.handle(index, Event::HeartbeatTimeout);
    }

    pub fn lease_timeout(&mut self, index: usize) {
        self.handle(index, Event::LeaseTimeout);
    }

    /// Run an election on `index` and deliver its traffic.
    pub fn elect(&mut self, index: usize) -> bool {
        self.election_timeout(index);
        self.deliver_all();
        self.node(index).is_some_and(Node::is_leader)
    }

    /// Deliver all pending messages, including the replies they trigger.
    pub fn deliver_all(&mut self) {
        while let Some(inflight) = self.messages.pop_front() {
            self.deliver(inflight);
        }
    }

    fn deliver(&mut self, inflight: InFlight) {
        if self.isolated.contains(&inflight.from) || self.isolated.contains(&inflight.to) {
            return;
        }
        self.handle(
            inflight.to.get() as usize,
            Event::Message {
                from: inflight.from,
                message: inflight.message,
            },
        );
    }

    fn handle(&mut self, index: usize, event: Event) {
        let now = self.now;
        let Some(runtime) = self.runtime_mut(index) else {
            return;
        };
        let commands = infallible(runtime.handle_at(event, now));
        let from = runtime.node().id;
        for command in commands {
            match command {
                Command::Send { to, message } => {
                    self.messages.push_back(InFlight { from, to, message })
                }
                Command::LeadershipLost { leader_id } => {
                    for (request, _) in std::mem::take(&mut self.waiting[index].deferred) {
                        self.replies[request.0] = Some(ClientReply::redirect(leader_id));
                    }
                }
            }
        }
        self.settle(index);
    }

    /// Answer whatever a node can answer now: deferred requests the lease allows,
    /// and applied writes.
    fn settle(&mut self, index: usize) {
        let now = self.now;
        for (request, client_request) in std::mem::take(&mut self.waiting[index].deferred) {
            let Some(runtime) = self.runtime_mut(index) else {
                return;
            };
            let admission = infallible(runtime.serve_at(client_request, now));
            self.admit(index, request, admission);
        }

        let Some(Slot::Up(runtime)) = self.slots.get_mut(index) else {
            return;
        };
        let applied = runtime.take_applied();
        for (request, committed) in self.waiting[index].writes.resolve(&applied) {
            self.replies[request.0] = Some(runtime.write_reply(committed));
        }
    }

    fn admit(&mut self, index: usize, request: RequestId, admission: Admission) {
        match admission {
            Admission::Reply(reply) => self.replies[request.0] = Some(reply),
            Admission::Deferred(client_request) => {
                self.waiting[index].deferred.push((request, client_request))
            }
            Admission::Write { index: log_index, entry } => {
                if let Some(displaced) = self.waiting[index].writes.insert(log_index, entry, request) {
                    self.replies[displaced.0] = Some(ClientReply::fail("", None));
                }
            }
        }
    }

    /// Issue a client command against a node. A crashed node never answers.
    pub fn serve(&mut self, index: usize, text: &str) -> RequestId {
        let request = RequestId(self.replies.len());
        self.replies.push(None);

        let parsed: Result<ClientRequest, ParseRequestError> = text.parse();
        let now = self.now;
        let Some(runtime) = self.runtime_mut(index) else {
            return request;
        };
        let admission = match parsed {
            Ok(parsed) => infallible(runtime.serve_at(parsed, now)),
            Err(err) => Admission::Reply(ClientReply::fail(err.to_string(), runtime.node().leader_id())),
        };
        self.admit(index, request, admission);
        self.settle(index);
        request
    }

    pub fn reply(&self, request: RequestId) -> Option<&ClientReply> {
        self.replies.get(request.0)?.as_ref()
    }

    /// Drop all traffic to and from a node.
    pub fn isolate(&mut self, index: usize) {
        self.isolated.insert(NodeId::from(index as u64));
    }

    pub fn heal(&mut self, index: usize) {
        self.isolated.remove(&NodeId::from(index as u64));
    }

    /// Kill a node. Only what it persisted survives; its clients never hear back.
    pub fn crash(&mut self, index: usize) {
        let slot = std::mem::replace(&mut self.slots[index], Slot::Down(MemoryStorage::new()));
        self.slots[index] = match slot {
            Slot::Up(runtime) => Slot::Down(runtime.into_storage()),
            down => down,
        };
        self.waiting[index] = Waiting::default();
    }

    pub fn restart(&mut self, index: usize) {
        let slot = std::mem::replace(&mut self.slots[index], Slot::Down(MemoryStorage::new()));
        self.slots[index] = match slot {
            Slot::Down(storage) => Slot::Up(self.boot(index, storage)),
            up => up,
        };
    }

    /// The leader with the highest term, if any node is leading.
    pub fn leader(&self) -> Option<usize> {
        (0..self.size())
            .filter_map(|index| self.node(index).map(|node| (index, node)))
            .filter(|(_, node)| node.is_leader())
            .max_by_key(|(_, node)| node.persistent.current_term)
            .map(|(index, _)| index)
    }

    /// Count live nodes in each role: (followers, candidates, leaders).
    pub fn role_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for node in (0..self.size()).filter_map(|index| self.node(index)) {
            match node.role {
                Role::Follower(_) => counts.0 += 1,
                Role::Candidate(_) => counts.1 += 1,
                Role::Leader(_) => counts.2 += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LogEntry, LogIndex, Term};

    const TICK: Duration = Duration::from_millis(50);

    fn ok(data: &str, leader: u64) -> ClientReply {
        ClientReply::ok(data, Some(NodeId::from(leader)))
    }

    /// No two nodes lead the same term.
    fn assert_election_safety(cluster: &Cluster) {
        let mut terms = HashSet::new();
        for node in (0..cluster.size()).filter_map(|index| cluster.node(index)) {
            if node.is_leader() {
                assert!(terms.insert(node.persistent.current_term), "two leaders in one term");
            }
        }
    }

    #[test]
    fn single_node_becomes_leader() {
        let mut cluster = Cluster::new(1);

        assert!(cluster.elect(0));
        assert_eq!(cluster.leader(), Some(0));
    }

    #[test]
    fn three_node_leader_election() {
        let mut cluster = Cluster::new(3);

        cluster.election_timeout(0);
        assert_eq!(cluster.role_counts(), (2, 1, 0));

        cluster.deliver_all();

        assert_eq!(cluster.leader(), Some(0));
        assert_eq!(cluster.role_counts(), (2, 0, 1));
    }

    #[test]
    fn timers_alone_elect_exactly_one_leader() {
        let mut cluster = Cluster::new(3);

        let elected = cluster.run_until(Duration::from_secs(60), TICK, |c| c.leader().is_some());

        assert!(elected);
        assert_eq!(cluster.role_counts().2, 1);
        assert_election_safety(&cluster);

        // Heartbeats keep the leader in place.
        let leader = cluster.leader();
        let term = leader.and_then(|l| cluster.node(l)).map(|n| n.persistent.current_term);
        cluster.run_until(Duration::from_secs(20), TICK, |_| false);
        assert_eq!(cluster.leader(), leader);
        assert_eq!(
            leader.and_then(|l| cluster.node(l)).map(|n| n.persistent.current_term),
            term
        );
    }

    #[test]
    fn set_then_get() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));

        let write = cluster.serve(0, "SET x 5");
        assert_eq!(cluster.reply(write), None);

        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.reply(write), Some(&ok("", 0)));

        let read = cluster.serve(0, "GET x");
        assert_eq!(cluster.reply(read), Some(&ok("5", 0)));

        // Followers learn the commit on the next heartbeat and redirect clients.
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        for follower in 1..3 {
            let runtime = cluster.runtime(follower).unwrap();
            assert_eq!(runtime.state_machine().get("x"), "5");
            let read = cluster.serve(follower, "GET x");
            assert_eq!(
                cluster.reply(read),
                Some(&ClientReply::redirect(Some(NodeId::from(0))))
            );
        }
    }

    #[test]
    fn leader_probe_points_at_leader() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(1));

        let probe = cluster.serve(2, "GET __leader__");

        let reply = cluster.reply(probe).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.leader_id, Some(NodeId::from(1)));
    }

    #[test]
    fn malformed_command_reports_error() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));

        let request = cluster.serve(0, "DEL x");

        let reply = cluster.reply(request).unwrap();
        assert!(!reply.success);
        assert!(reply.data.contains("DEL"));
    }

    #[test]
    fn new_leader_after_crash_keeps_committed_value() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        let write = cluster.serve(0, "SET x 5");
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.reply(write), Some(&ok("", 0)));

        cluster.crash(0);
        let elected = cluster.run_until(Duration::from_secs(30), TICK, |c| c.leader().is_some());
        assert!(elected);
        let leader = cluster.leader().unwrap();
        assert_ne!(leader, 0);

        let read = cluster.serve(leader, "GET x");
        cluster.run_until(Duration::from_secs(5), TICK, |c| c.reply(read).is_some());
        assert_eq!(cluster.reply(read), Some(&ok("5", leader as u64)));
    }

    #[test]
    fn partitioned_leader_steps_down_after_lease() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        cluster.isolate(0);

        cluster.run_until(Duration::from_millis(2400), TICK, |_| false);
        assert!(cluster.node(0).unwrap().is_leader());

        cluster.run_until(Duration::from_millis(200), TICK, |_| false);
        let node = cluster.node(0).unwrap();
        assert!(!node.is_leader());
        assert_eq!(node.persistent.current_term, Term::from(1));
    }

    #[test]
    fn concurrent_writes_serialize_through_log() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));

        let first = cluster.serve(0, "SET x 1");
        let second = cluster.serve(0, "SET x 2");
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        assert_eq!(cluster.reply(first), Some(&ok("", 0)));
        assert_eq!(cluster.reply(second), Some(&ok("", 0)));
        assert_eq!(cluster.runtime(0).unwrap().state_machine().get("x"), "2");
    }

    #[test]
    fn overwritten_write_reports_failure() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        cluster.isolate(0);

        // Appended on the old leader only.
        let stale = cluster.serve(0, "SET x stale");
        assert!(cluster.elect(1));
        cluster.heal(0);

        cluster.heartbeat_timeout(1);
        cluster.deliver_all();

        let reply = cluster.reply(stale).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.leader_id, Some(NodeId::from(1)));
        let node = cluster.node(0).unwrap();
        assert_eq!(node.entry(LogIndex::from(2)), Some(&LogEntry::noop(Term::from(2))));
        assert_eq!(cluster.runtime(0).unwrap().state_machine().get("x"), "");
    }

    #[test]
    fn new_leader_waits_out_old_lease_before_reading() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));

        // Node 1 takes over right away while node 0's lease is still fresh.
        assert!(cluster.elect(1));
        let read = cluster.serve(1, "GET x");
        assert_eq!(cluster.reply(read), None);

        cluster.run_until(Duration::from_millis(2400), TICK, |_| false);
        assert_eq!(cluster.reply(read), None);

        cluster.run_until(Duration::from_millis(200), TICK, |_| false);
        assert_eq!(cluster.reply(read), Some(&ok("", 1)));
    }

    #[test]
    fn new_leader_answers_nothing_while_isolated_leader_holds_lease() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        let first = cluster.serve(0, "SET x 5");
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        assert_eq!(cluster.reply(first), Some(&ok("", 0)));

        // Node 0 is cut off but its lease is still running.
        cluster.isolate(0);
        assert!(cluster.elect(1));
        let write = cluster.serve(1, "SET x 6");
        let read = cluster.serve(1, "GET x");
        cluster.heartbeat_timeout(1);
        cluster.deliver_all();
        assert_eq!(cluster.reply(write), None);
        assert_eq!(cluster.reply(read), None);

        let old = cluster.serve(0, "GET x");
        assert_eq!(cluster.reply(old), Some(&ok("5", 0)));

        let answered = cluster.run_until(Duration::from_secs(5), TICK, |c| {
            if c.node(0).is_some_and(Node::is_leader) {
                assert_eq!(c.reply(write), None, "write acknowledged during old lease");
                assert_eq!(c.reply(read), None, "read served during old lease");
            }
            c.reply(write).is_some() && c.reply(read).is_some()
        });
        assert!(answered);
        assert_eq!(cluster.reply(write), Some(&ok("", 1)));
        assert_eq!(cluster.reply(read), Some(&ok("5", 1)));

        let old = cluster.serve(0, "GET x");
        assert!(!cluster.reply(old).unwrap().success);
        let read = cluster.serve(1, "GET x");
        assert_eq!(cluster.reply(read), Some(&ok("6", 1)));
    }

    #[test]
    fn deferred_read_is_redirected_when_leadership_is_lost() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        assert!(cluster.elect(1));
        let read = cluster.serve(1, "GET x");

        assert!(cluster.elect(2));

        assert_eq!(
            cluster.reply(read),
            Some(&ClientReply::redirect(None))
        );
    }

    #[test]
    fn restart_restores_log_and_state_machine() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        cluster.serve(0, "SET x 5");
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        let before = cluster.node(1).unwrap().record();
        cluster.crash(1);
        cluster.restart(1);

        let runtime = cluster.runtime(1).unwrap();
        assert_eq!(runtime.node().record(), before);
        assert_eq!(runtime.state_machine().get("x"), "5");
        assert_eq!(runtime.node().volatile.commit_length, LogIndex::from(2));
    }

    #[test]
    fn logs_match_after_recovery() {
        let mut cluster = Cluster::new(3);
        assert!(cluster.elect(0));
        cluster.isolate(2);
        for value in ["1", "2", "3"] {
            cluster.serve(0, &format!("SET k {value}"));
        }
        cluster.heartbeat_timeout(0);
        cluster.deliver_all();

        cluster.heal(2);
        for _ in 0..6 {
            cluster.heartbeat_timeout(0);
            cluster.deliver_all();
        }

        let logs: Vec<_> = (0..3)
            .map(|i| cluster.node(i).unwrap().persistent.log.clone())
            .collect();
        assert_eq!(logs[0], logs[1]);
        assert_eq!(logs[0], logs[2]);
        for i in 0..3 {
            assert_eq!(cluster.runtime(i).unwrap().state_machine().get("k"), "3");
        }
    }
}
