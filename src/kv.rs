use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, Operation};

/// The replicated state machine: a string map fed by committed `SET` entries.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a committed operation. No-ops leave the map untouched.
    pub fn apply(&mut self, operation: &Operation) {
        if let Operation::Set { key, value } = operation {
            self.data.insert(key.clone(), value.clone());
        }
    }

    /// Current value, or the empty string if the key was never set.
    pub fn get(&self, key: &str) -> &str {
        self.data.get(key).map_or("", String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseRequestError {
    #[error("empty request")]
    Empty,
    #[error("unknown command {0:?}, expected GET or SET")]
    UnknownCommand(String),
    #[error("usage: GET <key>")]
    GetUsage,
    #[error("usage: SET <key> <value>")]
    SetUsage,
}

/// A client command: `GET <key>` or `SET <key> <value>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientRequest {
    Get { key: String },
    Set { key: String, value: String },
}

impl FromStr for ClientRequest {
    type Err = ParseRequestError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = text.split_whitespace().collect();
        match parts.as_slice() {
            [] => Err(ParseRequestError::Empty),
            ["GET", key] => Ok(Self::Get {
                key: (*key).to_string(),
            }),
            ["GET", ..] => Err(ParseRequestError::GetUsage),
            ["SET", key, value] => Ok(Self::Set {
                key: (*key).to_string(),
                value: (*value).to_string(),
            }),
            ["SET", ..] => Err(ParseRequestError::SetUsage),
            [other, ..] => Err(ParseRequestError::UnknownCommand((*other).to_string())),
        }
    }
}

/// Reply to a client command. `leader_id` lets a client follow redirects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReply {
    pub data: String,
    pub leader_id: Option<NodeId>,
    pub success: bool,
}

impl ClientReply {
    pub fn ok(data: impl Into<String>, leader_id: Option<NodeId>) -> Self {
        Self {
            data: data.into(),
            leader_id,
            success: true,
        }
    }

    pub fn fail(data: impl Into<String>, leader_id: Option<NodeId>) -> Self {
        Self {
            data: data.into(),
            leader_id,
            success: false,
        }
    }

    /// This node cannot serve the request; try `leader_id` instead.
    pub fn redirect(leader_id: Option<NodeId>) -> Self {
        Self::fail("", leader_id)
    }
}
