//! Requester-side helpers for talking to the directory server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use ferry_core::message::{add_files_batches, ADD_FILES_BUDGET};
use ferry_core::wire::parse_address;
use ferry_core::{FileId, FileOffer, Message, SocketId};
use ferry_services::{QueueError, QueuedMessage};

use crate::node::{NodeError, NodeHandle};

/// Name the directory connection is registered under in the table.
pub const DIRECTORY_SOCKET_NAME: &str = "central_server";

/// Host advertised when no public host is configured. The directory
/// replaces it with the address it sees the connection come from.
const UNSPECIFIED_HOST: &str = "0.0.0.0";

/// What `DirectoryClient::share` sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareSummary {
    pub files: usize,
    /// `addFiles` messages sent; one acknowledgement comes back for each.
    pub messages: usize,
}

pub struct DirectoryClient {
    node: NodeHandle,
    socket_id: SocketId,
}

impl DirectoryClient {
    /// Connect to the directory at `addr` (`host:port`).
    pub async fn connect(node: NodeHandle, addr: &str) -> Result<Self, NodeError> {
        let (host, port) = parse_address(addr)?;
        let socket_id = node.connect(Some(DIRECTORY_SOCKET_NAME), &host, port).await?;
        Ok(Self { node, socket_id })
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    pub fn node(&self) -> &NodeHandle {
        &self.node
    }

    /// Offer files to the directory. Directories in `paths` are walked.
    ///
    /// Long lists go out as several `addFiles` messages, each small enough
    /// for the directory to accept. The directory acknowledges every one.
    pub async fn share(&self, paths: &[PathBuf]) -> Result<ShareSummary> {
        let files = collect_files(paths).await?;
        let mut offers = Vec::with_capacity(files.len());
        for path in files {
            offers.push(offer_for(&path).await?);
        }
        if offers.is_empty() {
            return Ok(ShareSummary::default());
        }

        let configured = &self.node.config().network.public_host;
        let host = if configured.is_empty() {
            UNSPECIFIED_HOST
        } else {
            configured.as_str()
        };
        let count = offers.len();
        let batches = add_files_batches(host, self.node.public_port(), offers, ADD_FILES_BUDGET);
        for (i, batch) in batches.iter().enumerate() {
            self.node
                .send_to(self.socket_id, &batch.encode())
                .await
                .with_context(|| format!("sending file list {} of {} to directory", i + 1, batches.len()))?;
        }
        tracing::info!(count, messages = batches.len(), "files offered to directory");
        Ok(ShareSummary {
            files: count,
            messages: batches.len(),
        })
    }

    pub async fn list(&self) -> Result<(), NodeError> {
        self.node.send_to(self.socket_id, &Message::List.encode()).await
    }

    /// Ask where `file_id` lives. The node follows up on the answer by
    /// itself; watch `subscribe_completions` for the result.
    pub async fn request_file(&self, file_id: FileId) -> Result<(), NodeError> {
        self.node
            .send_to(self.socket_id, &Message::GetFile { file_id }.encode())
            .await
    }

    /// Next queued response, from any socket.
    pub async fn next_response(&self, timeout: Duration) -> Result<QueuedMessage, QueueError> {
        self.node.queue().recv_timeout(timeout).await
    }
}

async fn offer_for(path: &Path) -> Result<FileOffer> {
    let path = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("resolving {}", path.display()))?;
    let size = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("reading metadata of {}", path.display()))?
        .len();
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?
        .to_string();
    let path = path
        .to_str()
        .with_context(|| format!("{} is not valid UTF-8", path.display()))?
        .to_string();
    Ok(FileOffer { name, size, path })
}

/// Expand `paths` into regular files, walking directories recursively.
/// Hidden entries inside walked directories are skipped.
pub async fn collect_files(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = paths.to_vec();
    pending.reverse();

    while let Some(path) = pending.pop() {
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if meta.is_file() {
            files.push(path);
            continue;
        }
        if !meta.is_dir() {
            continue;
        }

        let mut entries = tokio::fs::read_dir(&path)
            .await
            .with_context(|| format!("listing {}", path.display()))?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden {
                children.push(entry.path());
            }
        }
        children.sort();
        children.reverse();
        pending.extend(children);
    }
    Ok(files)
}
