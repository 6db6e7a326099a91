use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a stored object.
///
/// Assigned once at upload start, immutable thereafter. The string form is
/// what adapters embed in their backing keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Descriptor of one chunk within a transfer.
///
/// Sequence numbers within a session are contiguous from 0; offsets are
/// contiguous and non-overlapping, covering exactly `[0, total_size)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub sequence: u64,
    /// Byte offset of this chunk within the object.
    pub offset: u64,
    /// Length of this chunk in bytes.
    pub length: u64,
    /// SHA-256 hex digest of the chunk data, when integrity verification
    /// is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ChunkDescriptor {
    /// Offset of the first byte past this chunk.
    pub fn end_offset(&self) -> u64 {
        self.offset + self.length
    }
}

/// Direction of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "download")]
    Download,
}

/// Lifecycle state of a transfer session.
///
/// `Created` precedes the first chunk dispatch; the other three states are
/// terminal and a session never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// State of one destination within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationState {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "failed")]
    Failed,
}

/// Per-(session, destination) transfer status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationStatus {
    pub destination: String,
    pub state: DestinationState,
    /// Total acknowledged bytes at this destination.
    pub bytes_transferred: u64,
    /// Highest sequence number for which this and every lower sequence
    /// number are acknowledged. Advances contiguously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_chunk_acked: Option<u64>,
    pub retry_count: u32,
}

/// Read-only progress view for one session, recomputed on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub state: TransferState,
    pub bytes_transferred: u64,
    /// Unknown until EOF for uploads from a live stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub current_rate_bytes_per_sec: f64,
}

/// Metadata record for a fully stored object.
///
/// Written once when the primary destination completes; never mutated
/// except on delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObjectMetadata {
    pub object_id: ObjectId,
    /// Original file name, used for key layout and content-type guessing.
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Name of the destination holding the authoritative copy.
    pub primary_location: String,
    /// Set only when the backup destination holds every chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_location: Option<String>,
}
