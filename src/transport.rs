use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Message, NodeId};

/// Largest frame a peer may send us.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown peer: {0}")]
    UnknownPeer(NodeId),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Wire envelope: a Raft message with the sender's identity.
#[derive(Serialize, Deserialize)]
struct Envelope {
    from: NodeId,
    message: Message,
}

/// TCP transport for Raft RPCs.
///
/// Every message, request or reply, is one connection carrying a 4-byte big-endian
/// length prefix and a JSON `Envelope`. A background thread accepts connections and
/// hands each to a short-lived reader thread that forwards the decoded message into
/// the receive channel. Sends are fire-and-forget on their own threads with bounded
/// connect and write timeouts: a lost message looks exactly like a slow peer, and the
/// next election or heartbeat round retries.
pub struct Transport {
    local_id: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    rpc_timeout: Duration,
    rx: mpsc::Receiver<(NodeId, Message)>,
    listener: Arc<TcpListener>,
}

impl Transport {
    /// Bind a listener on `addr` and start accepting inbound Raft RPCs.
    pub fn bind(
        local_id: NodeId,
        addr: SocketAddr,
        peers: HashMap<NodeId, SocketAddr>,
        rpc_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self::start(local_id, listener, peers, rpc_timeout))
    }

    fn start(
        local_id: NodeId,
        listener: TcpListener,
        peers: HashMap<NodeId, SocketAddr>,
        rpc_timeout: Duration,
    ) -> Self {
        let listener = Arc::new(listener);
        let (tx, rx) = mpsc::channel();
        let listener_bg = Arc::clone(&listener);
        thread::spawn(move || accept_loop(listener_bg, tx, rpc_timeout));
        Self {
            local_id,
            peers,
            rpc_timeout,
            rx,
            listener,
        }
    }

    /// Send a message to a peer. Only an unknown peer fails synchronously; delivery
    /// failures are logged on the sending thread and otherwise ignored.
    pub fn send(&self, to: NodeId, message: Message) -> Result<(), TransportError> {
        let addr = self
            .peers
            .get(&to)
            .copied()
            .ok_or(TransportError::UnknownPeer(to))?;
        let from = self.local_id;
        let timeout = self.rpc_timeout;
        thread::spawn(move || {
            if let Err(e) = dial_and_send(addr, from, message, timeout) {
                debug!(peer = %to, %addr, error = %e, "send failed");
            }
        });
        Ok(())
    }

    /// Block until a message arrives or `timeout` elapses. Returns `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<(NodeId, Message)> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The address this transport is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

fn accept_loop(
    listener: Arc<TcpListener>,
    tx: mpsc::Sender<(NodeId, Message)>,
    read_timeout: Duration,
) {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let tx = tx.clone();
                thread::spawn(move || {
                    // Bound how long a slow or misbehaving sender can hold the thread.
                    let _ = stream.set_read_timeout(Some(read_timeout));
                    match read_envelope(&stream) {
                        Ok(env) => {
                            let _ = tx.send((env.from, env.message));
                        }
                        Err(e) => debug!(%remote, error = %e, "dropped inbound frame"),
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "raft listener stopped accepting");
                break;
            }
        }
    }
}

/// Read one length-prefixed JSON envelope from the stream.
fn read_envelope(mut stream: &TcpStream) -> Result<Envelope, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(serde_json::from_slice(&buf)?)
}

/// Connect, send one length-prefixed JSON envelope, and close.
fn dial_and_send(
    addr: SocketAddr,
    from: NodeId,
    message: Message,
    timeout: Duration,
) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(&Envelope { from, message })?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    let len = bytes.len() as u32;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}
