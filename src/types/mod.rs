mod log;
mod message;
mod primitives;

pub use log::{LogEntry, Operation, ParseEntryError};
pub use message::{
    AppendEntries, AppendEntriesResponse, Message, RequestVote, RequestVoteResponse,
};
pub use primitives::{LogIndex, NodeId, Term};
