//! Message queue: ordinary responses waiting for the application.
//!
//! The event loop enqueues, a consumer task dequeues. Strict FIFO across all
//! sockets; nothing is coalesced or dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use ferry_core::SocketId;

/// One message as it arrived, tagged with the socket it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub socket_id: SocketId,
    pub text: String,
}

#[derive(Default)]
struct QueueInner {
    items: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
}

#[derive(Clone, Default)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, socket_id: SocketId, text: impl Into<String>) {
        self.items().push_back(QueuedMessage {
            socket_id,
            text: text.into(),
        });
        self.inner.notify.notify_one();
    }

    /// Pop the oldest message without waiting.
    pub fn try_dequeue(&self) -> Result<QueuedMessage, QueueError> {
        self.items().pop_front().ok_or(QueueError::Empty)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Wait for the next message.
    pub async fn recv(&self) -> QueuedMessage {
        loop {
            if let Ok(msg) = self.try_dequeue() {
                return msg;
            }
            // notify_one stores a permit when nobody is waiting, so an
            // enqueue between the check above and this await is not lost.
            self.inner.notify.notified().await;
        }
    }

    /// Wait for the next message, giving up after `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<QueuedMessage, QueueError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| QueueError::TimedOut(timeout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("message queue is empty")]
    Empty,
    #[error("no message within {0:?}")]
    TimedOut(Duration),
}
