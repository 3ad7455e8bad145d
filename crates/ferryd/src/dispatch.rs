//! Routes incoming control messages by verb.
//!
//! Transfer verbs are acted on here; everything else goes to the message
//! queue for the application (or the directory consumer) to interpret.

use ferry_core::{FileId, FileLocation, Message, SocketId};

use crate::client::DIRECTORY_SOCKET_NAME;
use crate::node::{NodeError, NodeHandle};
use crate::transfer::{self, fallback_name, TransferEvent};

/// Handle one text frame from `socket_id`. Never blocks the event loop:
/// anything that does network I/O runs in its own task.
pub(crate) fn dispatch_text(node: &NodeHandle, socket_id: SocketId, text: String) {
    let message = match Message::parse(&text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(socket_id, error = %e, "malformed message dropped");
            return;
        }
    };

    match message {
        Message::InitiateFileTransfer(Some(order)) => {
            if !is_directory(node, socket_id) {
                tracing::warn!(socket_id, file_id = order.file_id, "transfer order not from the directory, ignored");
                return;
            }
            tracing::debug!(file_id = order.file_id, to = order.socket_id, "transfer order received");
            transfer::spawn_send(node.clone(), order);
        }
        Message::InitiateFileTransfer(None) => {
            tracing::warn!(socket_id, "directory would not resolve a transfer");
        }
        Message::FileRequest { file_id } => {
            let node = node.clone();
            tokio::spawn(async move {
                if let Err(e) = forward_file_request(&node, socket_id, file_id).await {
                    tracing::warn!(socket_id, file_id, error = %e, "could not forward file request");
                }
            });
        }
        Message::FileAddress(Some(location)) => {
            let node = node.clone();
            tokio::spawn(async move {
                let file_id = location.file_id;
                if let Err(e) = fetch(&node, location).await {
                    tracing::warn!(file_id, error = %e, "could not request file from owner");
                    node.downloads().fail(file_id);
                    node.notify(TransferEvent::Failed {
                        file_id,
                        reason: e.to_string(),
                    });
                }
            });
        }
        Message::FileAddress(None) => {
            tracing::warn!(socket_id, "requested file is not registered");
            node.queue().enqueue(socket_id, text);
        }
        _ => {
            tracing::trace!(socket_id, bytes = text.len(), "message queued");
            node.queue().enqueue(socket_id, text);
        }
    }
}

fn is_directory(node: &NodeHandle, socket_id: SocketId) -> bool {
    node.table()
        .get(socket_id)
        .and_then(|entry| entry.name)
        .is_some_and(|name| name == DIRECTORY_SOCKET_NAME)
}

/// Owner side: a requester wants `file_id`. Ask the directory for the local
/// path on the requester's behalf.
async fn forward_file_request(
    node: &NodeHandle,
    socket_id: SocketId,
    file_id: FileId,
) -> Result<(), NodeError> {
    let lookup = Message::GetFileForTransfer { file_id, socket_id }.encode();
    node.send_to_name(DIRECTORY_SOCKET_NAME, &lookup).await?;
    tracing::debug!(file_id, requester = socket_id, "file request forwarded to directory");
    Ok(())
}

/// Requester side: the directory said where `location.file_id` lives.
async fn fetch(node: &NodeHandle, location: FileLocation) -> Result<SocketId, NodeError> {
    let file_id = location.file_id;
    let name = location.name.unwrap_or_else(|| fallback_name(file_id));
    node.downloads().record_request(file_id, name, location.size);

    let socket_id = node
        .connect(Some(&file_id.to_string()), &location.host, location.port)
        .await?;
    node.send_to(socket_id, &Message::FileRequest { file_id }.encode())
        .await?;
    tracing::info!(file_id, socket_id, host = %location.host, port = location.port, "file requested from owner");
    Ok(socket_id)
}
