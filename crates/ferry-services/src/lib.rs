//! ferry-services: shared node state: connections, queued messages, the
//! directory's file registry, chunked transfers, and the download ledger.

pub mod connection;
pub mod downloads;
pub mod file_transfer;
pub mod queue;
pub mod registry;

pub use connection::{socket_writer, ConnectionTable, SocketEntry, SocketRole, SocketWriter, TableError};
pub use downloads::{DownloadLedger, DownloadRecord, DownloadStatus};
pub use file_transfer::{send_file, ChunkOutcome, Reassembler, SendSummary, TransferError};
pub use queue::{MessageQueue, QueueError, QueuedMessage};
pub use registry::{FileRecord, FileRegistry};
