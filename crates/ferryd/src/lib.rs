//! ferryd: peer node, directory server, and transfer workers.

pub mod client;
pub mod directory;
mod dispatch;
pub mod node;
pub mod transfer;

pub use client::{DirectoryClient, ShareSummary, DIRECTORY_SOCKET_NAME};
pub use directory::DirectoryServer;
pub use node::{NodeError, NodeHandle, PeerNode};
pub use transfer::TransferEvent;
