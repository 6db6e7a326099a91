//! The capability interface every destination implements.

use async_trait::async_trait;

use stowage_types::{ChunkDescriptor, ObjectId, StoredObjectMetadata};

use crate::StoreError;

/// A remote destination that receives and replays chunks.
///
/// Implementations must tolerate chunk puts arriving out of sequence order
/// (the engine dispatches concurrently) and must support partial-content
/// reads once an object is complete, down to single-byte ranges.
#[async_trait]
pub trait RemoteStoreAdapter: Send + Sync {
    /// Stable name of this destination, used in status reporting, metadata
    /// locations, and logs.
    fn name(&self) -> &str;

    /// Stores one chunk of a pending object.
    async fn put_chunk(
        &self,
        object_id: &ObjectId,
        descriptor: &ChunkDescriptor,
        data: &[u8],
    ) -> Result<(), StoreError>;

    /// Marks a pending object as fully written. Called once after every
    /// chunk is acknowledged, before metadata is recorded.
    async fn complete_object(&self, object_id: &ObjectId) -> Result<(), StoreError>;

    /// Abandons a pending object, discarding partially written chunks.
    /// Maps onto the store's own multi-part-abort mechanism where one
    /// exists.
    async fn abort_object(&self, object_id: &ObjectId) -> Result<(), StoreError>;

    /// Reads the inclusive byte range `[start, end]` of a stored object.
    ///
    /// Fails with [`StoreError::RangeNotSatisfiable`] when `start` exceeds
    /// the object's known size.
    async fn get_range(
        &self,
        object_id: &ObjectId,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StoreError>;

    /// Returns the object's size, or `None` if it does not exist.
    async fn head_object(&self, object_id: &ObjectId) -> Result<Option<u64>, StoreError>;

    /// Lists metadata of stored objects whose id starts with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObjectMetadata>, StoreError>;

    /// Deletes a stored object and its metadata record.
    async fn delete_object(&self, object_id: &ObjectId) -> Result<(), StoreError>;

    /// Records the metadata of a completed object.
    async fn put_metadata(&self, meta: &StoredObjectMetadata) -> Result<(), StoreError>;

    /// Reads the metadata record of an object, or `None` if absent.
    async fn get_metadata(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<StoredObjectMetadata>, StoreError>;
}
