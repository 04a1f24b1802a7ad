use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::client_api::Pending;
use crate::command::Command;
use crate::config::{ConfigError, TimerConfig};
use crate::file_storage::{FileStorage, FileStorageError};
use crate::kv::{ClientReply, ClientRequest};
use crate::runtime::{Admission, Event, PendingWrites, Runtime};
use crate::transport::{Transport, TransportError};
use crate::types::NodeId;

/// Upper bound on one blocking wait, so client requests are picked up promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("storage: {0}")]
    Storage(#[from] FileStorageError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

pub struct Config {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub peers: HashMap<NodeId, SocketAddr>,
    pub data_dir: PathBuf,
    pub timers: TimerConfig,
}

type Responder = oneshot::Sender<ClientReply>;

/// A running Raft KV node: persistent log on disk, RPCs over TCP.
///
/// The event loop is the only owner of the runtime, so timers, peer messages and
/// client requests are applied one at a time.
pub struct Server {
    runtime: Runtime<FileStorage>,
    transport: Transport,
    client_rx: mpsc::Receiver<Pending>,
    pending_writes: PendingWrites<Responder>,
    deferred: Vec<(ClientRequest, Responder)>,
}

impl Server {
    /// Open storage, restore persistent state and bind the Raft listener.
    pub fn start(config: Config, client_rx: mpsc::Receiver<Pending>) -> Result<Self, ServerError> {
        config.timers.validate()?;

        let storage = FileStorage::open(&config.data_dir)?;
        let peer_ids: Vec<NodeId> = config.peers.keys().copied().collect();
        let rpc_timeout = config.timers.rpc_timeout;
        let runtime = Runtime::from_storage(config.id, peer_ids, storage, config.timers)?;

        let transport = Transport::bind(config.id, config.addr, config.peers, rpc_timeout)?;

        let node = runtime.node();
        info!(
            node = %config.id,
            addr = %config.addr,
            term = %node.persistent.current_term,
            log_len = node.persistent.log.len(),
            commit = %node.volatile.commit_length,
            "raft node started"
        );

        Ok(Self {
            runtime,
            transport,
            client_rx,
            pending_writes: PendingWrites::new(),
            deferred: Vec::new(),
        })
    }

    /// Run the Raft event loop. Returns only on a storage error.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            // Drain fired timers before blocking; back-to-back timeouts must not be skipped.
            while let Some(event) = self.runtime.poll_timers() {
                let commands = self.runtime.handle(event)?;
                self.dispatch(commands);
            }

            self.drain_client_requests()?;
            self.settle()?;

            // Block until the next timer deadline or an incoming message, whichever comes first.
            let wait = self
                .runtime
                .next_deadline()
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);

            if let Some((from, message)) = self.transport.recv_timeout(wait) {
                let commands = self.runtime.handle(Event::Message { from, message })?;
                self.dispatch(commands);
                self.settle()?;
            }
        }
    }

    /// Admit client requests that arrived since the last iteration.
    fn drain_client_requests(&mut self) -> Result<(), ServerError> {
        while let Ok((request, responder)) = self.client_rx.try_recv() {
            self.admit(request, responder)?;
        }
        Ok(())
    }

    fn admit(&mut self, request: ClientRequest, responder: Responder) -> Result<(), ServerError> {
        match self.runtime.serve(request)? {
            Admission::Reply(reply) => {
                let _ = responder.send(reply);
            }
            Admission::Deferred(request) => self.deferred.push((request, responder)),
            Admission::Write { index, entry } => {
                if let Some(displaced) = self.pending_writes.insert(index, entry, responder) {
                    let _ = displaced.send(self.runtime.write_reply(false));
                }
            }
        }
        Ok(())
    }

    /// Retry deferred requests, then reply to writes whose index was applied.
    fn settle(&mut self) -> Result<(), ServerError> {
        for (request, responder) in std::mem::take(&mut self.deferred) {
            // Clients that gave up.
            if responder.is_closed() {
                continue;
            }
            self.admit(request, responder)?;
        }

        let applied = self.runtime.take_applied();
        for (responder, committed) in self.pending_writes.resolve(&applied) {
            let _ = responder.send(self.runtime.write_reply(committed));
        }
        self.pending_writes.retain(|responder| !responder.is_closed());
        Ok(())
    }

    fn dispatch(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Send { to, message } => {
                    if let Err(e) = self.transport.send(to, message) {
                        warn!(peer = %to, error = %e, "dropping outbound message");
                    }
                }
                Command::LeadershipLost { leader_id } => {
                    for (_, responder) in self.deferred.drain(..) {
                        let _ = responder.send(ClientReply::redirect(leader_id));
                    }
                }
            }
        }
    }
}
