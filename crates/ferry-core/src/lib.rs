//! ferry-core: wire format, protocol messages, and configuration.
//! All other ferry crates depend on this one.

pub mod config;
pub mod message;
pub mod wire;

pub use config::{ConfigError, FerryConfig};
pub use message::{FileLocation, FileOffer, Message, TransferOrder};
pub use wire::{ChunkHeader, FileId, Frame, FrameDecoder, SocketId, WireError};
