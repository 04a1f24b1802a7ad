use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::log::LogEntry;
use super::primitives::{LogIndex, NodeId, Term};

/// RequestVote RPC arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVote {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    /// How long, as far as the voter knows, a previous leader may still serve reads.
    pub old_leader_lease_remaining: Duration,
}

/// AppendEntries RPC arguments. An empty `entries` is a pure heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    pub lease_duration: Duration,
    /// Heartbeat round within the leader's term, echoed back in the response.
    pub round: u64,
}

/// AppendEntries RPC response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Length of the prefix the follower now shares with the leader; 0 on rejection.
    pub ack_index: LogIndex,
    /// The `round` of the request this answers.
    pub round: u64,
}

/// All possible Raft messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    RequestVote(RequestVote),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}
