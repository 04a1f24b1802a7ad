use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::command::Command;
use crate::config::TimerConfig;
use crate::kv::{ClientReply, ClientRequest, KvStore};
use crate::node::{Node, Timer};
use crate::storage::Storage;
use crate::types::{LogEntry, LogIndex, Message, NodeId, Operation};

/// Events that drive the runtime.
#[derive(Debug)]
pub enum Event {
    ElectionTimeout,
    VoteRoundTimeout,
    HeartbeatTimeout,
    LeaseTimeout,
    Message { from: NodeId, message: Message },
}

impl From<Timer> for Event {
    fn from(timer: Timer) -> Self {
        match timer {
            Timer::Election => Event::ElectionTimeout,
            Timer::VoteRound => Event::VoteRoundTimeout,
            Timer::Heartbeat => Event::HeartbeatTimeout,
            Timer::LeaseExpiry => Event::LeaseTimeout,
        }
    }
}

/// What became of a client request handed to the runtime.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Answered on the spot.
    Reply(ClientReply),
    /// The leader cannot serve this yet. Hand it back to `serve` later: reads wait
    /// for a confirmed lease, and both reads and writes wait out the previous
    /// leader's lease.
    Deferred(ClientRequest),
    /// Appended at `index`; answer once that index is applied.
    Write { index: LogIndex, entry: LogEntry },
}

/// Runtime that wraps a Raft node with its state machine and stable storage.
///
/// Every event goes through `handle`, which persists the node's record before
/// returning the messages to send, then applies newly committed entries in order.
pub struct Runtime<St> {
    node: Node,
    state_machine: KvStore,
    storage: St,
    applied: Vec<(LogIndex, LogEntry)>,
}

impl<St: Storage> Runtime<St> {
    /// Load the node from storage and replay its committed prefix.
    pub fn from_storage(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: St,
        config: TimerConfig,
    ) -> Result<Self, St::Error> {
        Self::from_storage_at(id, peers, storage, config, Instant::now())
    }

    pub fn from_storage_at(
        id: NodeId,
        peers: Vec<NodeId>,
        storage: St,
        config: TimerConfig,
        now: Instant,
    ) -> Result<Self, St::Error> {
        let record = storage.load()?;
        let node = Node::restore(id, peers, config, record, now);
        let mut runtime = Self {
            node,
            state_machine: KvStore::new(),
            storage,
            applied: Vec::new(),
        };
        runtime.apply_committed();
        // Replayed entries were answered before the crash, if at all.
        runtime.applied.clear();
        Ok(runtime)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn state_machine(&self) -> &KvStore {
        &self.state_machine
    }

    pub fn into_storage(self) -> St {
        self.storage
    }

    /// Process an event and return commands to execute.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Command>, St::Error> {
        self.handle_at(event, Instant::now())
    }

    pub fn handle_at(&mut self, event: Event, now: Instant) -> Result<Vec<Command>, St::Error> {
        let commands = match event {
            Event::ElectionTimeout => self.node.election_timeout(now),
            Event::VoteRoundTimeout => self.node.vote_round_timeout(now),
            Event::HeartbeatTimeout => self.node.heartbeat_timeout(now),
            Event::LeaseTimeout => self.node.lease_timeout(now),
            Event::Message { from, message } => self.handle_message(from, message, now),
        };

        // Nothing leaves this node before the state it depends on is durable.
        self.persist()?;
        self.apply_committed();
        Ok(commands)
    }

    fn handle_message(&mut self, from: NodeId, message: Message, now: Instant) -> Vec<Command> {
        match message {
            Message::RequestVote(req) => self.node.handle_request_vote(from, req, now),
            Message::RequestVoteResponse(resp) => {
                self.node.handle_request_vote_response(from, resp, now)
            }
            Message::AppendEntries(req) => self.node.handle_append_entries(from, req, now),
            Message::AppendEntriesResponse(resp) => {
                self.node.handle_append_entries_response(from, resp, now)
            }
        }
    }

    /// The timer event due now, if any.
    pub fn poll_timers(&self) -> Option<Event> {
        self.poll_timers_at(Instant::now())
    }

    pub fn poll_timers_at(&self, now: Instant) -> Option<Event> {
        self.node.due_timer(now).map(Event::from)
    }

    /// When the next timer fires.
    pub fn next_deadline(&self) -> Instant {
        self.node.next_deadline()
    }

    /// Admit a client request. Only the leader serves; everyone else redirects.
    pub fn serve(&mut self, request: ClientRequest) -> Result<Admission, St::Error> {
        self.serve_at(request, Instant::now())
    }

    pub fn serve_at(
        &mut self,
        request: ClientRequest,
        now: Instant,
    ) -> Result<Admission, St::Error> {
        if !self.node.is_leader() {
            return Ok(Admission::Reply(self.redirect()));
        }
        let ready = match &request {
            ClientRequest::Get { .. } => self.node.can_serve_reads(now),
            ClientRequest::Set { .. } => self.node.can_accept_writes(now),
        };
        if !ready {
            return Ok(Admission::Deferred(request));
        }
        match request {
            ClientRequest::Get { key } => Ok(Admission::Reply(self.read(&key))),
            ClientRequest::Set { key, value } => {
                let Some((index, entry)) = self.node.submit(Operation::Set { key, value }) else {
                    return Ok(Admission::Reply(self.redirect()));
                };
                debug!(node = %self.node.id, index = %index, "accepted write");
                self.persist()?;
                self.apply_committed();
                Ok(Admission::Write { index, entry })
            }
        }
    }

    /// Answer a read from the local state machine.
    pub fn read(&self, key: &str) -> ClientReply {
        ClientReply::ok(self.state_machine.get(key), self.node.leader_id())
    }

    pub fn redirect(&self) -> ClientReply {
        ClientReply::redirect(self.node.leader_id())
    }

    /// Answer a write once its index has been applied.
    pub fn write_reply(&self, committed: bool) -> ClientReply {
        if committed {
            ClientReply::ok("", self.node.leader_id())
        } else {
            ClientReply::fail("", self.node.leader_id())
        }
    }

    /// Entries applied since the last call, in log order.
    pub fn take_applied(&mut self) -> Vec<(LogIndex, LogEntry)> {
        std::mem::take(&mut self.applied)
    }

    fn persist(&mut self) -> Result<(), St::Error> {
        if self.node.take_needs_persist() {
            self.storage.save(&self.node.record())?;
        }
        Ok(())
    }

    // Figure 2, Rules for Servers (All Servers): if commitIndex > lastApplied, apply the
    // next entry to the state machine. §5.3: state machines process entries in log order.
    fn apply_committed(&mut self) {
        while let Some((index, entry)) = self.node.take_entry_to_apply() {
            self.state_machine.apply(&entry.operation);
            self.applied.push((index, entry));
        }
    }
}

/// Writes waiting for their log index to be applied.
///
/// A write succeeds only if the entry applied at its index is the one that was
/// appended; a different entry means another leader overwrote it first.
pub struct PendingWrites<W> {
    waiting: HashMap<LogIndex, (LogEntry, W)>,
}

impl<W> Default for PendingWrites<W> {
    fn default() -> Self {
        Self {
            waiting: HashMap::new(),
        }
    }
}

impl<W> PendingWrites<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter. Returns the waiter previously parked at the same index,
    /// whose entry can no longer be the one committed there.
    pub fn insert(&mut self, index: LogIndex, entry: LogEntry, waiter: W) -> Option<W> {
        self.waiting
            .insert(index, (entry, waiter))
            .map(|(_, displaced)| displaced)
    }

    /// Match applied entries against the waiters. Yields each resolved waiter
    /// with whether its own entry is the one that was applied.
    pub fn resolve(&mut self, applied: &[(LogIndex, LogEntry)]) -> Vec<(W, bool)> {
        applied
            .iter()
            .filter_map(|(index, committed)| {
                self.waiting
                    .remove(index)
                    .map(|(expected, waiter)| (waiter, expected == *committed))
            })
            .collect()
    }

    /// Drop waiters nobody is listening to anymore.
    pub fn retain(&mut self, mut keep: impl FnMut(&W) -> bool) {
        self.waiting.retain(|_, (_, waiter)| keep(waiter));
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}
