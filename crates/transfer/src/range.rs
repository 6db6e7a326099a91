//! Range reads over stored objects.
//!
//! [`RangeServer`] answers byte-range requests against the primary store
//! and falls back to the backup when the primary is transiently broken and
//! the backup is known to hold a full copy. Reads are stateless; the same
//! range can be served any number of times.

use std::sync::Arc;

use tracing::{debug, warn};

use stowage_store::RemoteStoreAdapter;
use stowage_types::{ObjectId, StoredObjectMetadata};

use crate::TransferError;

/// A satisfied range request.
#[derive(Debug, Clone)]
pub struct RangeRead {
    pub data: Vec<u8>,
    /// First byte position served, inclusive.
    pub start: u64,
    /// Last byte position served, inclusive.
    pub end: u64,
    pub total_size: u64,
}

impl RangeRead {
    /// `Content-Range` header value for this read.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total_size)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Stateless reader over a primary store plus an optional backup.
#[derive(Clone)]
pub struct RangeServer {
    primary: Arc<dyn RemoteStoreAdapter>,
    backup: Option<Arc<dyn RemoteStoreAdapter>>,
}

impl RangeServer {
    pub fn new(
        primary: Arc<dyn RemoteStoreAdapter>,
        backup: Option<Arc<dyn RemoteStoreAdapter>>,
    ) -> Self {
        Self { primary, backup }
    }

    /// Object record, primary first. The backup is consulted only on a
    /// retryable primary error.
    pub async fn metadata(
        &self,
        object_id: &ObjectId,
    ) -> Result<StoredObjectMetadata, TransferError> {
        match self.primary.get_metadata(object_id).await {
            Ok(Some(meta)) => return Ok(meta),
            Ok(None) => return Err(TransferError::NotFound(object_id.clone())),
            Err(e) if e.is_retryable() => {
                warn!(
                    object_id = %object_id,
                    error = %e,
                    "primary metadata read failed, trying backup"
                );
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(backup) = &self.backup {
            match backup.get_metadata(object_id).await {
                Ok(Some(meta)) => return Ok(meta),
                // A backup miss says nothing about the primary's contents;
                // the primary is down, not the object absent.
                Ok(None) => {}
                Err(e) => {
                    warn!(object_id = %object_id, error = %e, "backup metadata read failed");
                }
            }
        }
        Err(TransferError::DestinationUnavailable(object_id.clone()))
    }

    /// Serves `[start, end]` of an object. `end == None` means to EOF; an
    /// `end` past EOF is clamped. `start >= size` is unsatisfiable.
    pub async fn read(
        &self,
        object_id: &ObjectId,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeRead, TransferError> {
        let meta = self.metadata(object_id).await?;
        let size = meta.size;
        if start >= size {
            return Err(TransferError::RangeNotSatisfiable { start, size });
        }
        let end = end.unwrap_or(size - 1).min(size - 1);
        if end < start {
            return Err(TransferError::RangeNotSatisfiable { start, size });
        }

        match self.primary.get_range(object_id, start, end).await {
            Ok(data) => {
                return Ok(RangeRead {
                    data,
                    start,
                    end,
                    total_size: size,
                });
            }
            Err(e) if e.is_retryable() && meta.backup_location.is_some() => {
                warn!(
                    object_id = %object_id,
                    start,
                    end,
                    error = %e,
                    "primary range read failed, trying backup"
                );
            }
            Err(e) => return Err(e.into()),
        }

        // The metadata's backup_location is only set when the backup holds
        // every chunk, so a fallback read serves the same bytes.
        if let Some(backup) = &self.backup {
            match backup.get_range(object_id, start, end).await {
                Ok(data) => {
                    debug!(object_id = %object_id, start, end, "range served from backup");
                    return Ok(RangeRead {
                        data,
                        start,
                        end,
                        total_size: size,
                    });
                }
                Err(e) => {
                    warn!(object_id = %object_id, error = %e, "backup range read failed");
                }
            }
        }
        Err(TransferError::DestinationUnavailable(object_id.clone()))
    }
}

/// Pulls a stored object front to back in fixed-size reads.
pub struct DownloadStream {
    server: RangeServer,
    object_id: ObjectId,
    total_size: u64,
    offset: u64,
    read_size: u64,
}

impl DownloadStream {
    pub fn new(server: RangeServer, object_id: ObjectId, total_size: u64, read_size: u64) -> Self {
        Self {
            server,
            object_id,
            total_size,
            offset: 0,
            read_size: read_size.max(1),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Next sequential block, or `None` past EOF.
    pub async fn next_block(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        if self.offset >= self.total_size {
            return Ok(None);
        }
        let end = (self.offset + self.read_size - 1).min(self.total_size - 1);
        let read = self.server.read(&self.object_id, self.offset, Some(end)).await?;
        self.offset = read.end + 1;
        Ok(Some(read.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use stowage_store::MemoryStore;
    use stowage_types::ChunkDescriptor;

    async fn seed(store: &MemoryStore, id: &ObjectId, data: &[u8], backup_location: Option<&str>) {
        let descriptor = ChunkDescriptor {
            sequence: 0,
            offset: 0,
            length: data.len() as u64,
            checksum: None,
        };
        store.put_chunk(id, &descriptor, data).await.unwrap();
        store.complete_object(id).await.unwrap();
        store
            .put_metadata(&StoredObjectMetadata {
                object_id: id.clone(),
                name: "blob.bin".into(),
                size: data.len() as u64,
                content_type: "application/octet-stream".into(),
                created_at: Utc::now(),
                primary_location: "primary".into(),
                backup_location: backup_location.map(String::from),
            })
            .await
            .unwrap();
    }

    fn bytes(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn serves_inner_range_with_content_range() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let id = ObjectId::from("obj");
        let data = bytes(5000);
        seed(&primary, &id, &data, None).await;

        let server = RangeServer::new(primary, None);
        let read = server.read(&id, 1000, Some(1999)).await.unwrap();
        assert_eq!(read.len(), 1000);
        assert_eq!(read.data, data[1000..2000]);
        assert_eq!(read.total_size, 5000);
        assert_eq!(read.content_range(), "bytes 1000-1999/5000");
    }

    #[tokio::test]
    async fn open_ended_and_clamped_ranges() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let id = ObjectId::from("obj");
        let data = bytes(100);
        seed(&primary, &id, &data, None).await;

        let server = RangeServer::new(primary, None);
        let tail = server.read(&id, 90, None).await.unwrap();
        assert_eq!(tail.data, data[90..]);
        assert_eq!(tail.end, 99);

        let clamped = server.read(&id, 50, Some(10_000)).await.unwrap();
        assert_eq!(clamped.end, 99);
        assert_eq!(clamped.data, data[50..]);
    }

    #[tokio::test]
    async fn repeated_reads_are_identical() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let id = ObjectId::from("obj");
        seed(&primary, &id, &bytes(1000), None).await;

        let server = RangeServer::new(primary, None);
        let first = server.read(&id, 100, Some(499)).await.unwrap();
        let second = server.read(&id, 100, Some(499)).await.unwrap();
        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn start_past_eof_is_unsatisfiable() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let id = ObjectId::from("obj");
        seed(&primary, &id, &bytes(100), None).await;

        let server = RangeServer::new(primary, None);
        let err = server.read(&id, 100, None).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::RangeNotSatisfiable { start: 100, size: 100 }
        ));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let server = RangeServer::new(primary, None);
        let err = server.read(&ObjectId::from("nope"), 0, None).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)));
    }

    #[tokio::test]
    async fn falls_back_to_backup_on_transient_primary_failure() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let backup = Arc::new(MemoryStore::new("backup"));
        let id = ObjectId::from("obj");
        let data = bytes(1000);
        seed(&primary, &id, &data, Some("backup")).await;
        seed(&backup, &id, &data, Some("backup")).await;

        let server = RangeServer::new(primary.clone(), Some(backup));
        primary.fail_next_reads(1);
        let read = server.read(&id, 0, Some(99)).await.unwrap();
        assert_eq!(read.data, data[..100]);
    }

    #[tokio::test]
    async fn no_fallback_without_backup_location() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let backup = Arc::new(MemoryStore::new("backup"));
        let id = ObjectId::from("obj");
        let data = bytes(1000);
        // The backup copy is partial, so the record carries no backup
        // location and transient primary failures must surface.
        seed(&primary, &id, &data, None).await;

        let server = RangeServer::new(primary.clone(), Some(backup));
        primary.fail_next_reads(1);
        let err = server.read(&id, 0, Some(99)).await.unwrap_err();
        assert!(matches!(err, TransferError::Store(_)));
    }

    #[tokio::test]
    async fn primary_outage_with_empty_backup_is_unavailable_not_missing() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let backup = Arc::new(MemoryStore::new("backup"));
        let id = ObjectId::from("obj");
        seed(&primary, &id, &bytes(100), None).await;

        // Primary is down transiently; the backup never saw this object.
        // That must read as an outage, not as the object being absent.
        primary.fail_next_metadata_reads(u32::MAX);
        let server = RangeServer::new(primary, Some(backup));
        let err = server.metadata(&id).await.unwrap_err();
        assert!(matches!(err, TransferError::DestinationUnavailable(_)));
    }

    #[tokio::test]
    async fn download_stream_walks_whole_object() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let id = ObjectId::from("obj");
        let data = bytes(2500);
        seed(&primary, &id, &data, None).await;

        let server = RangeServer::new(primary, None);
        let mut stream = DownloadStream::new(server, id, 2500, 1000);
        let mut out = Vec::new();
        let mut blocks = 0;
        while let Some(block) = stream.next_block().await.unwrap() {
            out.extend_from_slice(&block);
            blocks += 1;
        }
        assert_eq!(blocks, 3);
        assert_eq!(out, data);
    }
}
