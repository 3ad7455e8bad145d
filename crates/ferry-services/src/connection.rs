//! Connection table: every live socket a node knows about.
//!
//! Shared between the event loop, which adds and removes entries, and
//! consumer tasks, which look sockets up by name and write to them. The
//! capacity check is an atomic slot reservation so concurrent accepts can
//! never push the table past its maximum.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use ferry_core::SocketId;

/// Write half of a connection. The lock keeps whole frames from interleaving.
pub type SocketWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Wrap any async writer for storage in the table.
pub fn socket_writer<W>(writer: W) -> SocketWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// What a socket is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// The listening socket.
    Primary,
    /// Outbound connection this node opened to another node.
    Server,
    /// Inbound connection accepted on the primary socket.
    Client,
}

impl std::fmt::Display for SocketRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SocketRole::Primary => "primary",
            SocketRole::Server => "server",
            SocketRole::Client => "client",
        })
    }
}

/// Public view of one table entry.
#[derive(Debug, Clone)]
pub struct SocketEntry {
    pub id: SocketId,
    pub role: SocketRole,
    pub name: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub opened_at: Instant,
}

struct Connection {
    entry: SocketEntry,
    writer: Option<SocketWriter>,
}

struct TableInner {
    entries: DashMap<SocketId, Connection>,
    /// Non-primary entries currently holding a slot.
    occupied: AtomicUsize,
    max_connections: usize,
    generation: AtomicU64,
    next_id: AtomicU32,
}

/// The connection table. Clones share the same state.
#[derive(Clone)]
pub struct ConnectionTable {
    inner: Arc<TableInner>,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Arc::new(TableInner {
                entries: DashMap::new(),
                occupied: AtomicUsize::new(0),
                max_connections,
                generation: AtomicU64::new(0),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Hand out a fresh socket id. Ids are never reused within a table.
    pub fn allocate_id(&self) -> SocketId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a socket.
    ///
    /// Fails with `TableError::Full` once the non-primary entries have
    /// reached the maximum; the primary socket never counts against it.
    pub fn add_socket(
        &self,
        id: SocketId,
        role: SocketRole,
        name: Option<String>,
        peer_addr: Option<SocketAddr>,
        writer: Option<SocketWriter>,
    ) -> Result<(), TableError> {
        match self.inner.entries.entry(id) {
            Entry::Occupied(_) => Err(TableError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                if role != SocketRole::Primary {
                    let max = self.inner.max_connections;
                    self.inner
                        .occupied
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                            (n < max).then_some(n + 1)
                        })
                        .map_err(|_| TableError::Full { max })?;
                }
                slot.insert(Connection {
                    entry: SocketEntry {
                        id,
                        role,
                        name,
                        peer_addr,
                        opened_at: Instant::now(),
                    },
                    writer,
                });
                self.bump();
                Ok(())
            }
        }
    }

    /// Remove a socket, releasing its slot. Returns the removed entry.
    pub fn remove_socket(&self, id: SocketId) -> Option<SocketEntry> {
        let (_, conn) = self.inner.entries.remove(&id)?;
        if conn.entry.role != SocketRole::Primary {
            self.inner.occupied.fetch_sub(1, Ordering::AcqRel);
        }
        self.bump();
        Some(conn.entry)
    }

    fn bump(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Modification marker. Changes on every add and remove.
    pub fn last_modified(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    pub fn get(&self, id: SocketId) -> Option<SocketEntry> {
        self.inner.entries.get(&id).map(|c| c.entry.clone())
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.inner.entries.contains_key(&id)
    }

    /// Lowest-id socket carrying `name`. Duplicate names are allowed, so the
    /// earliest registration wins.
    pub fn find_by_name(&self, name: &str) -> Option<SocketId> {
        self.inner
            .entries
            .iter()
            .filter(|c| c.entry.name.as_deref() == Some(name))
            .map(|c| c.entry.id)
            .min()
    }

    pub fn writer(&self, id: SocketId) -> Option<SocketWriter> {
        self.inner.entries.get(&id).and_then(|c| c.writer.clone())
    }

    /// Write `bytes` to a socket in full.
    pub async fn send(&self, id: SocketId, bytes: &[u8]) -> Result<(), TableError> {
        let writer = match self.inner.entries.get(&id) {
            Some(conn) => conn.writer.clone().ok_or(TableError::NoWriter(id))?,
            None => return Err(TableError::UnknownSocket(id)),
        };
        let mut w = writer.lock().await;
        w.write_all(bytes)
            .await
            .map_err(|source| TableError::Io { id, source })?;
        w.flush().await.map_err(|source| TableError::Io { id, source })
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Number of non-primary entries.
    pub fn occupied(&self) -> usize {
        self.inner.occupied.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.inner.max_connections
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.inner.max_connections
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("connection table full ({max} connections)")]
    Full { max: usize },
    #[error("socket {0} is already registered")]
    DuplicateId(SocketId),
    #[error("no socket with id {0}")]
    UnknownSocket(SocketId),
    #[error("socket {0} has no writer")]
    NoWriter(SocketId),
    #[error("write to socket {id} failed: {source}")]
    Io {
        id: SocketId,
        #[source]
        source: std::io::Error,
    },
}
