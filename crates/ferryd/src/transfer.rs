//! Transfer workers: one spawned task per outbound file and one per inbound
//! connection carrying chunks. Each owns its inputs; results go out on the
//! node's completion channel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc;

use ferry_core::{ChunkHeader, FileId, SocketId, TransferOrder};
use ferry_services::{send_file, ChunkOutcome, SendSummary};

use crate::node::NodeHandle;

/// Outcome of a transfer, broadcast to `NodeHandle::subscribe_completions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Sent {
        file_id: FileId,
        socket_id: SocketId,
        chunks: u32,
    },
    Received {
        file_id: FileId,
        path: PathBuf,
    },
    Failed {
        file_id: FileId,
        reason: String,
    },
}

/// Name a chunk is staged under when no download was recorded for its id.
pub fn fallback_name(file_id: FileId) -> String {
    format!("file-{file_id}")
}

/// Stream the file named in `order` to the socket named in `order`.
pub(crate) fn spawn_send(node: NodeHandle, order: TransferOrder) {
    tokio::spawn(async move {
        match send_order(&node, &order).await {
            Ok(summary) => {
                tracing::info!(
                    file_id = order.file_id,
                    socket_id = order.socket_id,
                    chunks = summary.chunks,
                    bytes = summary.bytes,
                    "file transfer sent"
                );
                node.notify(TransferEvent::Sent {
                    file_id: order.file_id,
                    socket_id: order.socket_id,
                    chunks: summary.chunks,
                });
            }
            Err(e) => {
                tracing::warn!(
                    file_id = order.file_id,
                    socket_id = order.socket_id,
                    error = %format!("{e:#}"),
                    "file transfer failed"
                );
                node.notify(TransferEvent::Failed {
                    file_id: order.file_id,
                    reason: format!("{e:#}"),
                });
            }
        }
    });
}

async fn send_order(node: &NodeHandle, order: &TransferOrder) -> Result<SendSummary> {
    let writer = node
        .table()
        .writer(order.socket_id)
        .with_context(|| format!("socket {} is no longer connected", order.socket_id))?;
    let capacity = node.config().transfer.chunk_capacity;
    send_file(Path::new(&order.path), order.file_id, capacity, &writer)
        .await
        .with_context(|| format!("sending {}", order.path))
}

/// One decoded chunk frame on its way to a receive worker.
#[derive(Debug)]
pub struct InboundChunk {
    pub header: ChunkHeader,
    pub payload: Bytes,
}

/// Stage the chunks arriving on one connection, in arrival order.
///
/// A completed file finishes its download and hangs up the connection it
/// came in on. When the chunks stop, because the connection closed or the
/// node is shutting down, every file still incomplete is abandoned and its
/// download marked failed.
pub(crate) fn spawn_receive(
    node: NodeHandle,
    socket_id: SocketId,
    mut chunks: mpsc::Receiver<InboundChunk>,
) {
    tokio::spawn(async move {
        let mut shutdown = node.subscribe_shutdown();
        let mut unfinished: HashMap<FileId, String> = HashMap::new();
        let mut rejected: HashSet<FileId> = HashSet::new();

        loop {
            let chunk = tokio::select! {
                _ = shutdown.recv() => break,
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            let file_id = chunk.header.file_id;
            if rejected.contains(&file_id) {
                continue;
            }
            let name = node
                .downloads()
                .name_for(file_id)
                .unwrap_or_else(|| fallback_name(file_id));

            match stage_chunk(&node, &name, &chunk).await {
                Ok(ChunkOutcome::Staged { received, total }) => {
                    node.downloads().record_progress(file_id, received, total);
                    unfinished.insert(file_id, name);
                }
                Ok(ChunkOutcome::Duplicate) => {}
                Ok(ChunkOutcome::Completed(path)) => {
                    unfinished.remove(&file_id);
                    let total = chunk.header.total_chunks;
                    node.downloads().record_progress(file_id, total, total);
                    node.downloads().complete(file_id, path.clone());
                    tracing::info!(file_id, name = %name, path = %path.display(), "download complete");
                    node.notify(TransferEvent::Received { file_id, path });
                    if close_transfer_socket(&node, socket_id, file_id) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        file_id,
                        socket_id,
                        index = chunk.header.index,
                        error = %format!("{e:#}"),
                        "chunk rejected"
                    );
                    unfinished.remove(&file_id);
                    rejected.insert(file_id);
                    node.reassembler().abandon(&name).await;
                    fail_download(&node, file_id, format!("{e:#}"));
                    if close_transfer_socket(&node, socket_id, file_id) {
                        break;
                    }
                }
            }
        }

        for (file_id, name) in unfinished {
            node.reassembler().abandon(&name).await;
            fail_download(&node, file_id, "connection closed before the file was complete".into());
        }
    });
}

async fn stage_chunk(node: &NodeHandle, name: &str, chunk: &InboundChunk) -> Result<ChunkOutcome> {
    let header = &chunk.header;
    // Every chunk but an empty file's carries at least one byte.
    if let Some(size) = node.downloads().get(header.file_id).and_then(|r| r.size) {
        anyhow::ensure!(
            u64::from(header.total_chunks) <= size.max(1),
            "{} chunks is more than a {size}-byte file can need",
            header.total_chunks
        );
    }
    Ok(node
        .reassembler()
        .add_chunk(name, header, &chunk.payload)
        .await?)
}

fn fail_download(node: &NodeHandle, file_id: FileId, reason: String) {
    node.downloads().fail(file_id);
    node.notify(TransferEvent::Failed { file_id, reason });
}

/// A download connection, named by its file id, that closed before a
/// single chunk came in.
pub(crate) fn fail_unstarted(node: &NodeHandle, socket_name: Option<&str>) {
    let Some(file_id) = socket_name.and_then(|name| name.parse::<FileId>().ok()) else {
        return;
    };
    let pending = node
        .downloads()
        .get(file_id)
        .is_some_and(|r| !r.status.is_finished());
    if pending {
        tracing::warn!(file_id, "download connection closed before any data arrived");
        fail_download(node, file_id, "connection closed before the file arrived".into());
    }
}

/// The requester opens one connection per download, named by the file id.
/// Once the file is whole that connection has no further use.
fn close_transfer_socket(node: &NodeHandle, socket_id: SocketId, file_id: FileId) -> bool {
    let named_for_file = node
        .table()
        .get(socket_id)
        .and_then(|entry| entry.name)
        .is_some_and(|name| name == file_id.to_string());
    named_for_file && node.close(socket_id)
}
