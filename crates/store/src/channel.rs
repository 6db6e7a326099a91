//! Backup channel store.
//!
//! Stores each chunk as a message in an external broadcast channel and
//! reassembles byte ranges from the relevant messages on read. The channel
//! transport itself (message posting, fetching, deletion) is behind
//! [`ChannelClient`] so the store logic stays decoupled from any SDK and
//! testable with mocks.
//!
//! The part index lives in memory only: this destination is a best-effort
//! backup and its index is rebuilt by re-uploading, not recovered.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use stowage_types::{format_size, ChunkDescriptor, ObjectId, StoredObjectMetadata};

use crate::{RemoteStoreAdapter, StoreError};

/// Abstract message transport for the backup channel.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Posts one binary part with a caption; returns the message id.
    async fn post_part(&self, caption: &str, data: &[u8]) -> Result<i64, StoreError>;

    /// Fetches the binary payload of a previously posted message.
    async fn fetch_part(&self, message_id: i64) -> Result<Vec<u8>, StoreError>;

    /// Deletes the given messages.
    async fn delete_parts(&self, message_ids: &[i64]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct ChannelPart {
    message_id: i64,
    length: u64,
}

#[derive(Default)]
struct ChannelObject {
    /// Parts keyed by byte offset. One part per chunk.
    parts: BTreeMap<u64, ChannelPart>,
    complete: bool,
    meta: Option<StoredObjectMetadata>,
}

impl ChannelObject {
    fn size(&self) -> u64 {
        if let Some(ref meta) = self.meta {
            meta.size
        } else {
            self.parts.values().map(|p| p.length).sum()
        }
    }

    fn message_ids(&self) -> Vec<i64> {
        self.parts.values().map(|p| p.message_id).collect()
    }
}

/// [`RemoteStoreAdapter`] over a message channel.
pub struct BackupChannelStore<C> {
    name: String,
    client: C,
    index: RwLock<HashMap<String, ChannelObject>>,
}

impl<C: ChannelClient> BackupChannelStore<C> {
    pub fn new(name: impl Into<String>, client: C) -> Self {
        Self {
            name: name.into(),
            client,
            index: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<C: ChannelClient> RemoteStoreAdapter for BackupChannelStore<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_chunk(
        &self,
        object_id: &ObjectId,
        descriptor: &ChunkDescriptor,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let caption = format!(
            "{object_id} part {} offset {} ({})",
            descriptor.sequence,
            descriptor.offset,
            format_size(descriptor.length),
        );
        let message_id = self.client.post_part(&caption, data).await?;

        let mut index = self.index.write().unwrap();
        let entry = index.entry(object_id.to_string()).or_default();
        entry.parts.insert(
            descriptor.offset,
            ChannelPart {
                message_id,
                length: descriptor.length,
            },
        );
        debug!(
            object_id = %object_id,
            sequence = descriptor.sequence,
            message_id,
            "posted backup part"
        );
        Ok(())
    }

    async fn complete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let mut index = self.index.write().unwrap();
        let entry = index
            .get_mut(object_id.as_str())
            .ok_or_else(|| StoreError::NoPendingUpload {
                key: object_id.to_string(),
            })?;
        entry.complete = true;
        Ok(())
    }

    async fn abort_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let ids = {
            let mut index = self.index.write().unwrap();
            match index.get(object_id.as_str()) {
                Some(entry) if !entry.complete => {
                    let ids = entry.message_ids();
                    index.remove(object_id.as_str());
                    ids
                }
                _ => return Ok(()),
            }
        };
        if !ids.is_empty() {
            self.client.delete_parts(&ids).await?;
        }
        Ok(())
    }

    async fn get_range(
        &self,
        object_id: &ObjectId,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StoreError> {
        // Resolve overlapping parts under the lock, fetch outside it.
        let (size, wanted) = {
            let index = self.index.read().unwrap();
            let entry = index
                .get(object_id.as_str())
                .ok_or_else(|| StoreError::NotFound {
                    key: object_id.to_string(),
                })?;
            let size = entry.size();
            if start >= size {
                return Err(StoreError::RangeNotSatisfiable { start, size });
            }
            let end = end.min(size - 1);
            let wanted: Vec<(u64, ChannelPart)> = entry
                .parts
                .iter()
                .filter(|(offset, part)| {
                    let part_end = **offset + part.length; // exclusive
                    part_end > start && **offset <= end
                })
                .map(|(offset, part)| (*offset, *part))
                .collect();
            (size, wanted)
        };

        let end = end.min(size - 1);
        let mut out = Vec::with_capacity((end - start + 1) as usize);
        for (offset, part) in wanted {
            let data = self.client.fetch_part(part.message_id).await?;
            let part_end = offset + data.len() as u64;
            let from = start.max(offset) - offset;
            let to = (end + 1).min(part_end) - offset;
            out.extend_from_slice(&data[from as usize..to as usize]);
        }
        Ok(out)
    }

    async fn head_object(&self, object_id: &ObjectId) -> Result<Option<u64>, StoreError> {
        let index = self.index.read().unwrap();
        Ok(index.get(object_id.as_str()).map(|e| e.size()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObjectMetadata>, StoreError> {
        let index = self.index.read().unwrap();
        let mut metas: Vec<StoredObjectMetadata> = index
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .filter_map(|(_, e)| e.meta.clone())
            .collect();
        metas.sort_by(|a, b| a.object_id.as_str().cmp(b.object_id.as_str()));
        Ok(metas)
    }

    async fn delete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let ids = {
            let mut index = self.index.write().unwrap();
            let entry = index
                .remove(object_id.as_str())
                .ok_or_else(|| StoreError::NotFound {
                    key: object_id.to_string(),
                })?;
            entry.message_ids()
        };
        if !ids.is_empty() {
            self.client.delete_parts(&ids).await?;
        }
        Ok(())
    }

    async fn put_metadata(&self, meta: &StoredObjectMetadata) -> Result<(), StoreError> {
        let mut index = self.index.write().unwrap();
        let entry = index.entry(meta.object_id.to_string()).or_default();
        entry.meta = Some(meta.clone());
        Ok(())
    }

    async fn get_metadata(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<StoredObjectMetadata>, StoreError> {
        let index = self.index.read().unwrap();
        Ok(index
            .get(object_id.as_str())
            .and_then(|e| e.meta.clone()))
    }
}
