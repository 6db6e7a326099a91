//! Shared data model for the stowage transfer engine.
//!
//! Types here cross crate boundaries: the store adapters, the transfer
//! engine, and any caller polling progress all speak in these.

mod config;
mod content_type;
mod types;

pub use config::{EngineConfig, DEFAULT_CHUNK_SIZE};
pub use content_type::{format_size, guess_content_type};
pub use types::{
    ChunkDescriptor, DestinationState, DestinationStatus, ObjectId, ProgressSnapshot,
    StoredObjectMetadata, TransferDirection, TransferState,
};
