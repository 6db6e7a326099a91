//! Chunked transfer engine with multi-destination replication, progress
//! tracking, and range-based streaming reads.
//!
//! The engine splits a byte stream into ordered fixed-size chunks
//! ([`ChunkStream`]), moves them to one or more remote destinations with
//! retry and backpressure ([`TransferSession`], [`ReplicationCoordinator`]),
//! exposes progress snapshots ([`ProgressTracker`]), and re-serves stored
//! objects through byte-range reads for streaming playback
//! ([`RangeServer`]). [`TransferEngine`] ties these together behind the
//! surface callers use.

mod chunk;
mod engine;
mod progress;
mod range;
mod replicate;
mod session;

pub use chunk::{checksum_bytes, Chunk, ChunkStream};
pub use engine::TransferEngine;
pub use progress::{ProgressCallback, ProgressTracker, SessionProgress, SpeedCalculator};
pub use range::{DownloadStream, RangeRead, RangeServer};
pub use replicate::{Destination, ReplicationCoordinator};
pub use session::{SessionOutcome, SourceReader, TransferSession, UploadRequest};

use stowage_store::StoreError;
use stowage_types::ObjectId;

/// Errors produced by the transfer engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The source stream ended mid-chunk before reaching its declared size.
    #[error("source ended early: expected {expected} bytes, received {received}")]
    ShortRead { expected: u64, received: u64 },

    /// A destination rejected a chunk after retries were exhausted.
    #[error("chunk {sequence} to {destination} failed after {attempts} attempts: {source}")]
    ChunkPut {
        destination: String,
        sequence: u64,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The requested byte range lies outside the object.
    #[error("range start {start} outside object of {size} bytes")]
    RangeNotSatisfiable { start: u64, size: u64 },

    /// `start()` was invoked on a session that already left `Created`.
    #[error("session already started")]
    AlreadyStarted,

    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Every reachable destination was exhausted for a read.
    #[error("no destination reachable for object {0}")]
    DestinationUnavailable(ObjectId),

    /// The destination set handed to the engine is unusable.
    #[error("invalid destination set: {0}")]
    InvalidDestinations(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}
