//! Per-connection reader task.

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, mpsc};

use ferry_core::wire::MAX_PAYLOAD_FIELD;
use ferry_core::{Frame, FrameDecoder, SocketId};

use super::NodeEvent;
use crate::transfer::InboundChunk;

/// Chunks a connection may have decoded ahead of its receive worker.
pub(crate) const CHUNK_BACKLOG: usize = 64;

/// Decode frames off one connection. Control messages go to the event loop;
/// chunks go straight to the connection's receive worker.
///
/// Both hand-offs wait when the other side is behind, and no more is read
/// from the socket until they succeed. Ends with a `Closed` event on EOF,
/// read error, or an undecodable stream. Accepts any payload length the
/// header can express so peers configured with a different chunk capacity
/// still interoperate.
pub(crate) async fn read_frames<R>(
    socket_id: SocketId,
    mut reader: R,
    events: mpsc::Sender<NodeEvent>,
    mut shutdown: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new(MAX_PAYLOAD_FIELD);
    let mut chunks = None;

    let reason = 'read: loop {
        loop {
            let frame = match decoder.decode() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => break 'read Some(e.to_string()),
            };
            let delivered = match frame {
                Frame::Text(text) => events.send(NodeEvent::Text { socket_id, text }).await.is_ok(),
                Frame::Chunk { header, payload } => {
                    let chunk = InboundChunk { header, payload };
                    forward_chunk(socket_id, &events, &mut chunks, chunk).await
                }
            };
            if !delivered {
                return;
            }
        }

        tokio::select! {
            _ = shutdown.recv() => return,
            read = reader.read_buf(decoder.buffer_mut()) => match read {
                Ok(0) => break 'read None,
                Ok(_) => {}
                Err(e) => break 'read Some(e.to_string()),
            },
        }
    };

    if decoder.pending() > 0 {
        tracing::debug!(socket_id, bytes = decoder.pending(), "discarding partial frame");
    }
    // The worker sees the end of its chunks before the loop hears of the close.
    drop(chunks);
    let _ = events.send(NodeEvent::Closed { socket_id, reason }).await;
}

/// Hand `chunk` to this connection's receive worker. When there is none yet,
/// or the last one has finished, ask the loop to start another.
async fn forward_chunk(
    socket_id: SocketId,
    events: &mpsc::Sender<NodeEvent>,
    worker: &mut Option<mpsc::Sender<InboundChunk>>,
    chunk: InboundChunk,
) -> bool {
    let chunk = match worker.as_ref() {
        Some(tx) => match tx.send(chunk).await {
            Ok(()) => return true,
            Err(mpsc::error::SendError(chunk)) => chunk,
        },
        None => chunk,
    };

    let (tx, rx) = mpsc::channel(CHUNK_BACKLOG);
    if tx.send(chunk).await.is_err() {
        return false;
    }
    *worker = Some(tx);
    events
        .send(NodeEvent::Transfer { socket_id, chunks: rx })
        .await
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::wire::{encode_chunk, encode_message, ChunkHeader};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn routes_text_to_loop_and_chunks_to_worker() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(read_frames(5, local, tx, shutdown_rx));

        let header = ChunkHeader::for_payload(1, 2, 1, b"abc");
        remote.write_all(&encode_message("list")).await.unwrap();
        remote.write_all(&encode_chunk(&header, b"abc").unwrap()).await.unwrap();
        let second = ChunkHeader::for_payload(1, 2, 2, b"de");
        remote.write_all(&encode_chunk(&second, b"de").unwrap()).await.unwrap();
        drop(remote);

        match rx.recv().await.unwrap() {
            NodeEvent::Text { socket_id: 5, text } => assert_eq!(text, "list"),
            other => panic!("unexpected {other:?}"),
        }
        let mut chunks = match rx.recv().await.unwrap() {
            NodeEvent::Transfer { socket_id: 5, chunks } => chunks,
            other => panic!("unexpected {other:?}"),
        };
        let indexes = [
            chunks.recv().await.unwrap().header.index,
            chunks.recv().await.unwrap().header.index,
        ];
        assert_eq!(indexes, [1, 2]);
        assert!(chunks.recv().await.is_none());
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeEvent::Closed { socket_id: 5, reason: None }
        ));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn slow_worker_holds_back_the_reader() {
        let (mut remote, local) = tokio::io::duplex(256 * 1024);
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(read_frames(3, local, tx, shutdown_rx));

        let sent = CHUNK_BACKLOG + 20;
        for index in 1..=sent as u32 {
            let header = ChunkHeader::for_payload(9, sent as u32, index, b"xyz");
            remote.write_all(&encode_chunk(&header, b"xyz").unwrap()).await.unwrap();
        }
        drop(remote);

        let mut chunks = match rx.recv().await.unwrap() {
            NodeEvent::Transfer { chunks, .. } => chunks,
            other => panic!("unexpected {other:?}"),
        };
        // The peer is done, but the reader cannot get past the full backlog.
        let early = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(early.is_err(), "reader finished ahead of its worker");

        let mut received = 0;
        while chunks.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, sent);
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::Closed { socket_id: 3, .. }));
    }

    #[tokio::test]
    async fn finished_worker_is_replaced_on_next_chunk() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(read_frames(4, local, tx, shutdown_rx));

        let first = ChunkHeader::for_payload(1, 1, 1, b"a");
        remote.write_all(&encode_chunk(&first, b"a").unwrap()).await.unwrap();
        let mut chunks = match rx.recv().await.unwrap() {
            NodeEvent::Transfer { chunks, .. } => chunks,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(chunks.recv().await.unwrap().header.file_id, 1);
        drop(chunks);

        let next = ChunkHeader::for_payload(2, 1, 1, b"b");
        remote.write_all(&encode_chunk(&next, b"b").unwrap()).await.unwrap();
        let mut chunks = match rx.recv().await.unwrap() {
            NodeEvent::Transfer { chunks, .. } => chunks,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(chunks.recv().await.unwrap().header.file_id, 2);
    }

    #[tokio::test]
    async fn garbage_header_closes_with_reason() {
        let (mut remote, local) = tokio::io::duplex(1024);
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(read_frames(2, local, tx, shutdown_rx));

        let mut junk = b"fileTransfer\r\n".to_vec();
        junk.extend_from_slice(&[b'?'; 60]);
        remote.write_all(&junk).await.unwrap();

        match rx.recv().await.unwrap() {
            NodeEvent::Closed { socket_id: 2, reason: Some(_) } => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_stops_reader_without_event() {
        let (_remote, local) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(read_frames(1, local, tx, shutdown_rx));
        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
