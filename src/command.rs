use crate::types::{Message, NodeId};

/// Side effects the node asks its runtime to carry out.
#[derive(Debug)]
pub enum Command {
    /// Send a message to a specific peer.
    Send { to: NodeId, message: Message },
    /// This node just stopped being leader. Reads parked behind the lease
    /// should be redirected to `leader_id`.
    LeadershipLost { leader_id: Option<NodeId> },
}
