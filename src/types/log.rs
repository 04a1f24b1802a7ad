use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::primitives::Term;

/// What a log entry does to the state machine once committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Term-fencing entry appended by every new leader.
    NoOp,
    Set { key: String, value: String },
}

/// A single entry in the replicated log. Its position is implicit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub operation: Operation,
}

impl LogEntry {
    pub fn noop(term: Term) -> Self {
        Self {
            term,
            operation: Operation::NoOp,
        }
    }

    pub fn set(term: Term, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            term,
            operation: Operation::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseEntryError {
    #[error("malformed log entry: {0:?}")]
    Malformed(String),
    #[error("invalid term in log entry: {0:?}")]
    InvalidTerm(String),
}

/// On-disk line format: `NO_OP <term>` or `SET <key> <value> <term>`.
impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operation {
            Operation::NoOp => write!(f, "NO_OP {}", self.term.get()),
            Operation::Set { key, value } => {
                write!(f, "SET {} {} {}", key, value, self.term.get())
            }
        }
    }
}

impl FromStr for LogEntry {
    type Err = ParseEntryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let (operation, term) = match parts.as_slice() {
            ["NO_OP", term] => (Operation::NoOp, *term),
            ["SET", key, value, term] => (
                Operation::Set {
                    key: (*key).to_string(),
                    value: (*value).to_string(),
                },
                *term,
            ),
            _ => return Err(ParseEntryError::Malformed(line.to_string())),
        };
        let term: u64 = term
            .parse()
            .map_err(|_| ParseEntryError::InvalidTerm(term.to_string()))?;
        Ok(LogEntry {
            term: Term::from(term),
            operation,
        })
    }
}
