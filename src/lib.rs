//! Replicated key-value store on the Raft consensus algorithm, with leader leases
//! for reads served from the leader's local state machine.
//!
//! Based on:
//! - "In Search of an Understandable Consensus Algorithm" (Ongaro & Ousterhout)
//! - Diego Ongaro's PhD dissertation (§6.4.1 on lease-based reads)

pub mod client_api;
pub mod cluster;
pub mod command;
pub mod config;
pub mod election;
pub mod file_storage;
pub mod kv;
pub mod lease;
pub mod node;
pub mod replication;
pub mod runtime;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;
pub mod types;

pub use command::Command;
pub use config::TimerConfig;
pub use kv::{ClientReply, ClientRequest, KvStore};
pub use node::{Node, Role};
pub use runtime::{Admission, Event, Runtime};
pub use storage::{MemoryStorage, PersistedRecord, Storage};
pub use types::{LogEntry, LogIndex, Message, NodeId, Operation, Term};
