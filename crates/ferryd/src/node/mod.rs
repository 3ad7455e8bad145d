//! Peer node: the primary socket, the event loop, and the handle every
//! other component talks to.
//!
//! Lifecycle: `PeerNode::bind` (Idle → Bound) then `PeerNode::start`
//! (Bound → Listening). The loop owns accept and dispatch; each connection
//! gets a reader task that feeds control messages back over a bounded mpsc
//! channel and streams chunks to a receive worker of its own.

mod listener;
mod reader;

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};

use ferry_core::message::BUSY_MESSAGE;
use ferry_core::wire::encode_message;
use ferry_core::{FerryConfig, SocketId, WireError};
use ferry_services::{
    socket_writer, ConnectionTable, DownloadLedger, MessageQueue, Reassembler, SocketRole,
    SocketWriter, TableError,
};

use crate::dispatch;
use crate::transfer::{self, InboundChunk, TransferEvent};

/// Reader events the loop may have queued before readers wait.
const EVENT_BACKLOG: usize = 1024;

/// What reader tasks report to the event loop.
#[derive(Debug)]
pub enum NodeEvent {
    Text {
        socket_id: SocketId,
        text: String,
    },
    /// First chunk on a connection with no live receive worker.
    Transfer {
        socket_id: SocketId,
        chunks: mpsc::Receiver<InboundChunk>,
    },
    Closed {
        socket_id: SocketId,
        reason: Option<String>,
    },
}

// ── Bound ─────────────────────────────────────────────────────────────────────

/// A node whose primary socket is bound but not yet accepting.
pub struct PeerNode {
    listener: TcpListener,
    config: FerryConfig,
    local_addr: SocketAddr,
}

impl PeerNode {
    /// Bind the primary socket per `config.network`. Must run inside a
    /// Tokio runtime.
    pub async fn bind(config: FerryConfig) -> Result<Self, NodeError> {
        let std_listener = listener::bind_primary(
            &config.network.listen_host,
            config.network.base_port,
            config.network.bind_attempts,
        )?;
        let listener = TcpListener::from_std(std_listener).map_err(NodeError::Bind)?;
        let local_addr = listener.local_addr().map_err(NodeError::Bind)?;
        tracing::info!(addr = %local_addr, "primary socket bound");
        Ok(Self {
            listener,
            config,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start listening. Spawns the event loop and returns a handle to it.
    pub fn start(self) -> NodeHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BACKLOG);
        let (shutdown_tx, _) = broadcast::channel(1);
        let (completions_tx, _) = broadcast::channel(64);

        let table = ConnectionTable::new(self.config.network.max_connections);
        let primary_id = table.allocate_id();
        if let Err(e) = table.add_socket(
            primary_id,
            SocketRole::Primary,
            None,
            Some(self.local_addr),
            None,
        ) {
            tracing::warn!(error = %e, "failed to register primary socket");
        }

        let reassembler = Reassembler::new(
            self.config.transfer.staging_dir.clone(),
            self.config.transfer.download_dir.clone(),
        );

        let handle = NodeHandle {
            shared: Arc::new(NodeShared {
                table,
                queue: MessageQueue::new(),
                downloads: DownloadLedger::new(),
                reassembler,
                readers: DashMap::new(),
                local_addr: self.local_addr,
                config: self.config,
                events: events_tx,
                shutdown: shutdown_tx,
                completions: completions_tx,
                loop_task: Mutex::new(None),
            }),
        };

        let event_loop = EventLoop {
            listener: self.listener,
            node: handle.clone(),
            events: events_rx,
            receiving: HashSet::new(),
            shutdown: handle.shared.shutdown.subscribe(),
        };
        let task = tokio::spawn(event_loop.run());
        *handle
            .shared
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!(addr = %self.local_addr, "node listening");
        handle
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

struct NodeShared {
    table: ConnectionTable,
    queue: MessageQueue,
    downloads: DownloadLedger,
    reassembler: Reassembler,
    /// Reader tasks by socket, so `close` can stop them.
    readers: DashMap<SocketId, AbortHandle>,
    local_addr: SocketAddr,
    config: FerryConfig,
    events: mpsc::Sender<NodeEvent>,
    shutdown: broadcast::Sender<()>,
    completions: broadcast::Sender<TransferEvent>,
    loop_task: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    shared: Arc<NodeShared>,
}

impl NodeHandle {
    /// Open an outbound connection and register it under `name`.
    pub async fn connect(
        &self,
        name: Option<&str>,
        host: &str,
        port: u16,
    ) -> Result<SocketId, NodeError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| NodeError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let id = self.shared.table.allocate_id();
        self.shared.table.add_socket(
            id,
            SocketRole::Server,
            name.map(str::to_string),
            peer_addr,
            Some(socket_writer(write_half)),
        )?;
        self.spawn_reader(id, read_half);
        tracing::info!(socket_id = id, name = ?name, host, port, "connected");
        Ok(id)
    }

    fn spawn_reader<R>(&self, socket_id: SocketId, reader: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let task = tokio::spawn(reader::read_frames(
            socket_id,
            reader,
            self.shared.events.clone(),
            self.shared.shutdown.subscribe(),
        ));
        self.shared.readers.insert(socket_id, task.abort_handle());
        // The reader may already have hit EOF and been reaped.
        if !self.shared.table.contains(socket_id) {
            self.shared.readers.remove(&socket_id);
        }
    }

    /// Send a control message to one socket.
    pub async fn send_to(&self, socket_id: SocketId, text: &str) -> Result<(), NodeError> {
        self.shared
            .table
            .send(socket_id, &encode_message(text))
            .await?;
        tracing::trace!(socket_id, bytes = text.len(), "message sent");
        Ok(())
    }

    /// Send a control message to the lowest-id socket carrying `name`.
    pub async fn send_to_name(&self, name: &str, text: &str) -> Result<SocketId, NodeError> {
        let socket_id = self
            .shared
            .table
            .find_by_name(name)
            .ok_or_else(|| NodeError::UnknownName(name.to_string()))?;
        self.send_to(socket_id, text).await?;
        Ok(socket_id)
    }

    /// Drop a connection: remove its entry and stop its reader. Dropping the
    /// writer closes our side of the stream.
    pub fn close(&self, socket_id: SocketId) -> bool {
        if let Some((_, reader)) = self.shared.readers.remove(&socket_id) {
            reader.abort();
        }
        match self.shared.table.remove_socket(socket_id) {
            Some(entry) => {
                tracing::info!(socket_id, role = %entry.role, name = ?entry.name, "connection closed locally");
                true
            }
            None => false,
        }
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.shared.table
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.shared.queue
    }

    pub fn downloads(&self) -> &DownloadLedger {
        &self.shared.downloads
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.shared.reassembler
    }

    pub fn config(&self) -> &FerryConfig {
        &self.shared.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Port other peers reach this node on.
    pub fn public_port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    pub fn subscribe_completions(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.completions.subscribe()
    }

    pub(crate) fn notify(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.shared.completions.send(event);
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shared.shutdown.subscribe()
    }

    /// Signal the loop, readers, and consumers to stop.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(());
    }

    /// Wait for the event loop to exit. Only the first caller gets the
    /// loop's result; later callers return immediately.
    pub async fn join(&self) -> anyhow::Result<()> {
        let task = self
            .shared
            .loop_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => task.await.context("event loop panicked")?,
            None => Ok(()),
        }
    }
}

// ── Listening ─────────────────────────────────────────────────────────────────

struct EventLoop {
    listener: TcpListener,
    node: NodeHandle,
    events: mpsc::Receiver<NodeEvent>,
    /// Sockets that have had a receive worker.
    receiving: HashSet<SocketId>,
    shutdown: broadcast::Receiver<()>,
}

impl EventLoop {
    async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("event loop shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted.context("accept on primary socket failed")?;
                    self.admit(stream, addr);
                }

                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let table = self.node.table();
        let (read_half, write_half) = stream.into_split();
        let writer = socket_writer(write_half);
        let id = table.allocate_id();

        match table.add_socket(id, SocketRole::Client, None, Some(addr), Some(writer.clone())) {
            Ok(()) => {
                self.node.spawn_reader(id, read_half);
                tracing::info!(socket_id = id, peer = %addr, "connection accepted");
            }
            Err(TableError::Full { max }) => {
                tracing::warn!(peer = %addr, max, "connection table full, refusing");
                tokio::spawn(refuse(writer, addr));
            }
            Err(e) => tracing::warn!(peer = %addr, error = %e, "failed to register connection"),
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Text { socket_id, text } => dispatch::dispatch_text(&self.node, socket_id, text),
            NodeEvent::Transfer { socket_id, chunks } => {
                tracing::debug!(socket_id, "inbound transfer started");
                let table = self.node.table();
                self.receiving.retain(|id| table.contains(*id));
                self.receiving.insert(socket_id);
                transfer::spawn_receive(self.node.clone(), socket_id, chunks);
            }
            NodeEvent::Closed { socket_id, reason } => {
                self.node.shared.readers.remove(&socket_id);
                let had_worker = self.receiving.remove(&socket_id);
                let Some(entry) = self.node.table().remove_socket(socket_id) else {
                    return;
                };
                match reason {
                    Some(reason) => tracing::warn!(
                        socket_id,
                        role = %entry.role,
                        name = ?entry.name,
                        reason = %reason,
                        "connection dropped"
                    ),
                    None => tracing::info!(
                        socket_id,
                        role = %entry.role,
                        name = ?entry.name,
                        "connection closed by peer"
                    ),
                }
                // A worker settles its own downloads when its chunks stop.
                if !had_worker {
                    transfer::fail_unstarted(&self.node, entry.name.as_deref());
                }
            }
        }
    }
}

/// Tell a refused client why, then hang up.
async fn refuse(writer: SocketWriter, addr: SocketAddr) {
    let busy = encode_message(BUSY_MESSAGE);
    let mut w = writer.lock().await;
    if let Err(e) = w.write_all(&busy).await {
        tracing::debug!(peer = %addr, error = %e, "failed to send busy message");
    }
    let _ = w.shutdown().await;
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("no free port in {attempts} attempt(s) from {base}")]
    BindExhausted { base: u16, attempts: u16 },
    #[error("invalid listen address {0:?}")]
    InvalidAddress(String),
    #[error("failed to bind primary socket: {0}")]
    Bind(#[source] io::Error),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("no socket named {0:?}")]
    UnknownName(String),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
