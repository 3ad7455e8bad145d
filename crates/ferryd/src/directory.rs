//! Directory server: answers `list`, `addFiles`, `getFile`, and
//! `getFileForTransfer` from the node's message queue.
//!
//! The registry belongs to this task alone. Files disappear when the socket
//! that registered them closes; the connection table's modification marker
//! tells us when to look.
//!
//! Replies go through a small outbox per socket, drained by its own task, so
//! a client that stops reading only ever stalls its own replies.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use ferry_core::message::files_added_message;
use ferry_core::{FileLocation, FileOffer, Message, SocketId, TransferOrder};
use ferry_services::{FileRegistry, QueuedMessage};

use crate::node::NodeHandle;

const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Replies a socket may have waiting before the directory gives up on it.
const OUTBOX_CAPACITY: usize = 256;

/// Hosts a peer may advertise to mean "whatever address you see me on".
fn is_unspecified_host(host: &str) -> bool {
    host == "*"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
}

pub struct DirectoryServer {
    node: NodeHandle,
    registry: FileRegistry,
    seen_marker: u64,
    outboxes: HashMap<SocketId, mpsc::Sender<String>>,
    shutdown: broadcast::Receiver<()>,
}

impl DirectoryServer {
    pub fn new(node: NodeHandle) -> Self {
        let shutdown = node.subscribe_shutdown();
        let seen_marker = node.table().last_modified();
        Self {
            node,
            registry: FileRegistry::new(),
            seen_marker,
            outboxes: HashMap::new(),
            shutdown,
        }
    }

    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        tracing::info!(port = self.node.public_port(), "directory server running");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(files = self.registry.len(), "directory server shutting down");
                    return Ok(());
                }

                _ = prune.tick() => self.prune_if_changed(),

                msg = self.node.queue().recv() => {
                    self.prune_if_changed();
                    self.handle(msg);
                    // Let outboxes drain before the next request.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Drop files owned by sockets that have gone away, if anything changed.
    pub fn prune_if_changed(&mut self) {
        let marker = self.node.table().last_modified();
        if marker == self.seen_marker {
            return;
        }
        self.seen_marker = marker;

        let table = self.node.table();
        self.outboxes.retain(|socket_id, _| table.contains(*socket_id));
        let removed = self.registry.retain_owners(|owner| table.contains(owner));
        for record in &removed {
            tracing::info!(
                file_id = record.file_id,
                name = %record.name,
                owner = record.owner,
                "owner disconnected, file unlisted"
            );
        }
    }

    /// Answer one request. The reply is queued for the asking socket, never
    /// written inline.
    pub fn handle(&mut self, msg: QueuedMessage) {
        let QueuedMessage { socket_id, text } = msg;
        let message = match Message::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(socket_id, error = %e, "malformed request dropped");
                return;
            }
        };

        let reply = match message {
            Message::List => Some(self.registry.render_listing()),
            Message::AddFiles { host, port, files } => Some(self.add_files(socket_id, &host, port, files)),
            Message::GetFile { file_id } => Some(self.locate(file_id).encode()),
            Message::GetFileForTransfer { file_id, socket_id: requester } => {
                Some(self.resolve_transfer(socket_id, file_id, requester).encode())
            }
            other => {
                tracing::warn!(socket_id, verb = ?other.verb(), "unexpected request ignored");
                None
            }
        };

        if let Some(reply) = reply {
            self.reply(socket_id, reply);
        }
    }

    fn reply(&mut self, socket_id: SocketId, reply: String) {
        let node = &self.node;
        let outbox = self
            .outboxes
            .entry(socket_id)
            .or_insert_with(|| spawn_outbox(node.clone(), socket_id));

        match outbox.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(socket_id, backlog = OUTBOX_CAPACITY, "client not reading replies, dropping connection");
                self.outboxes.remove(&socket_id);
                self.node.close(socket_id);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(socket_id, "reply dropped, connection already gone");
                self.outboxes.remove(&socket_id);
            }
        }
    }

    fn add_files(&mut self, owner: SocketId, host: &str, port: u16, files: Vec<FileOffer>) -> String {
        let host = if is_unspecified_host(host) {
            match self.node.table().get(owner).and_then(|e| e.peer_addr) {
                Some(addr) => addr.ip().to_string(),
                None => host.to_string(),
            }
        } else {
            host.to_string()
        };

        let count = files.len();
        for offer in files {
            let name = offer.name.clone();
            let file_id = self.registry.register(owner, &host, port, offer);
            tracing::info!(file_id, name = %name, owner, host = %host, port, "file registered");
        }
        files_added_message(count)
    }

    fn locate(&self, file_id: ferry_core::FileId) -> Message {
        match self.registry.get(file_id) {
            Some(record) => Message::FileAddress(Some(FileLocation {
                file_id,
                host: record.host.clone(),
                port: record.port,
                name: Some(record.name.clone()),
                size: Some(record.size),
            })),
            None => {
                tracing::debug!(file_id, "lookup for unknown file");
                Message::FileAddress(None)
            }
        }
    }

    /// Only the owner learns the local path of its own file.
    fn resolve_transfer(&self, asker: SocketId, file_id: ferry_core::FileId, requester: SocketId) -> Message {
        match self.registry.get(file_id) {
            Some(record) if record.owner == asker => Message::InitiateFileTransfer(Some(TransferOrder {
                file_id,
                socket_id: requester,
                path: record.path.clone(),
            })),
            Some(record) => {
                tracing::warn!(file_id, asker, owner = record.owner, "path lookup by non-owner refused");
                Message::InitiateFileTransfer(None)
            }
            None => Message::InitiateFileTransfer(None),
        }
    }
}

/// Deliver replies to one socket in order. Ends when the directory drops the
/// sender or a write fails.
fn spawn_outbox(node: NodeHandle, socket_id: SocketId) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
    tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            if let Err(e) = node.send_to(socket_id, &reply).await {
                tracing::warn!(socket_id, error = %e, "failed to send directory response");
                break;
            }
        }
    });
    tx
}
