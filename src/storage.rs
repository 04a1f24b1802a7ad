use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// Durable image of everything a node must remember across a crash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedRecord {
    pub commit_length: LogIndex,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

/// Storage abstraction for Raft persistent state. §5.1, Figure 2 (Persistent state on all
/// servers): currentTerm, votedFor, and log must be stored on stable storage and survive
/// crashes. The runtime saves the whole record after every mutation and before sending any
/// reply that depends on it, so `save` must be durable when it returns and must never leave
/// a record whose commit length runs past its log.
pub trait Storage {
    type Error;

    /// Load the last saved record, or the defaults on first start.
    fn load(&self) -> Result<PersistedRecord, Self::Error>;

    /// Replace the saved record.
    fn save(&mut self, record: &PersistedRecord) -> Result<(), Self::Error>;
}

/// In-memory storage for testing. Survives a simulated crash as long as the
/// value itself is kept.
#[derive(Default)]
pub struct MemoryStorage {
    record: PersistedRecord,
    saves: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `save` was called.
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl Storage for MemoryStorage {
    type Error = std::convert::Infallible;

    fn load(&self) -> Result<PersistedRecord, Self::Error> {
        Ok(self.record.clone())
    }

    fn save(&mut self, record: &PersistedRecord) -> Result<(), Self::Error> {
        self.record = record.clone();
        self.saves += 1;
        Ok(())
    }
}
