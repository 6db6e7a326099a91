//! In-memory store adapter.
//!
//! The reference implementation of [`RemoteStoreAdapter`] semantics: chunk
//! puts may arrive in any order, completion checks contiguity, range reads
//! serve arbitrary subranges. Used by the engine test suites and usable as
//! a scratch destination.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use stowage_types::{ChunkDescriptor, ObjectId, StoredObjectMetadata};

use crate::{RemoteStoreAdapter, StoreError};

#[derive(Default)]
struct ObjectEntry {
    /// Chunk data keyed by byte offset.
    chunks: BTreeMap<u64, Vec<u8>>,
    complete: bool,
    meta: Option<StoredObjectMetadata>,
}

impl ObjectEntry {
    fn size(&self) -> u64 {
        if let Some(ref meta) = self.meta {
            meta.size
        } else {
            self.chunks.values().map(|c| c.len() as u64).sum()
        }
    }

    fn is_contiguous(&self) -> bool {
        let mut expected = 0u64;
        for (offset, data) in &self.chunks {
            if *offset != expected {
                return false;
            }
            expected += data.len() as u64;
        }
        true
    }
}

#[derive(Default)]
struct FaultState {
    /// Remaining put_chunk calls to fail. `u32::MAX` fails forever.
    failing_puts: u32,
    puts_retryable: bool,
    /// Remaining get_range calls to fail (always retryable).
    failing_reads: u32,
    /// Remaining get_metadata calls to fail (always retryable).
    failing_meta_reads: u32,
}

/// Thread-safe in-memory [`RemoteStoreAdapter`].
pub struct MemoryStore {
    name: String,
    objects: RwLock<HashMap<String, ObjectEntry>>,
    faults: Mutex<FaultState>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            faults: Mutex::new(FaultState::default()),
        }
    }

    /// Makes the next `count` put_chunk calls fail. Fault injection for
    /// retry and failover tests; `u32::MAX` fails indefinitely.
    pub fn fail_next_puts(&self, count: u32, retryable: bool) {
        let mut faults = self.faults.lock().unwrap();
        faults.failing_puts = count;
        faults.puts_retryable = retryable;
    }

    /// Makes the next `count` get_range calls fail with a retryable error.
    pub fn fail_next_reads(&self, count: u32) {
        let mut faults = self.faults.lock().unwrap();
        faults.failing_reads = count;
    }

    /// Makes the next `count` get_metadata calls fail with a retryable
    /// error.
    pub fn fail_next_metadata_reads(&self, count: u32) {
        let mut faults = self.faults.lock().unwrap();
        faults.failing_meta_reads = count;
    }

    fn take_put_fault(&self) -> Option<StoreError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.failing_puts == 0 {
            return None;
        }
        if faults.failing_puts != u32::MAX {
            faults.failing_puts -= 1;
        }
        Some(StoreError::Network {
            message: "injected put failure".into(),
            retryable: faults.puts_retryable,
        })
    }

    fn take_read_fault(&self) -> Option<StoreError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.failing_reads == 0 {
            return None;
        }
        if faults.failing_reads != u32::MAX {
            faults.failing_reads -= 1;
        }
        Some(StoreError::Network {
            message: "injected read failure".into(),
            retryable: true,
        })
    }

    fn take_meta_read_fault(&self) -> Option<StoreError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.failing_meta_reads == 0 {
            return None;
        }
        if faults.failing_meta_reads != u32::MAX {
            faults.failing_meta_reads -= 1;
        }
        Some(StoreError::Network {
            message: "injected metadata read failure".into(),
            retryable: true,
        })
    }

    /// Assembled bytes of an object, in offset order. Test helper.
    pub fn object_bytes(&self, object_id: &ObjectId) -> Option<Vec<u8>> {
        let objects = self.objects.read().unwrap();
        let entry = objects.get(object_id.as_str())?;
        let mut out = Vec::new();
        for data in entry.chunks.values() {
            out.extend_from_slice(data);
        }
        Some(out)
    }

    /// Number of chunks held for an object. Test helper.
    pub fn chunk_count(&self, object_id: &ObjectId) -> usize {
        let objects = self.objects.read().unwrap();
        objects
            .get(object_id.as_str())
            .map(|e| e.chunks.len())
            .unwrap_or(0)
    }

    /// Whether the object was marked complete.
    pub fn is_complete(&self, object_id: &ObjectId) -> bool {
        let objects = self.objects.read().unwrap();
        objects
            .get(object_id.as_str())
            .map(|e| e.complete)
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteStoreAdapter for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_chunk(
        &self,
        object_id: &ObjectId,
        descriptor: &ChunkDescriptor,
        data: &[u8],
    ) -> Result<(), StoreError> {
        if descriptor.length != data.len() as u64 {
            return Err(StoreError::Other {
                message: format!(
                    "descriptor length {} does not match data length {}",
                    descriptor.length,
                    data.len()
                ),
            });
        }
        if let Some(err) = self.take_put_fault() {
            return Err(err);
        }
        let mut objects = self.objects.write().unwrap();
        let entry = objects.entry(object_id.to_string()).or_default();
        entry.chunks.insert(descriptor.offset, data.to_vec());
        Ok(())
    }

    async fn complete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap();
        let entry = objects
            .get_mut(object_id.as_str())
            .ok_or_else(|| StoreError::NoPendingUpload {
                key: object_id.to_string(),
            })?;
        if !entry.is_contiguous() {
            return Err(StoreError::Other {
                message: format!("object {object_id} has gaps, cannot complete"),
            });
        }
        entry.complete = true;
        Ok(())
    }

    async fn abort_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap();
        if let Some(entry) = objects.get(object_id.as_str()) {
            if !entry.complete {
                objects.remove(object_id.as_str());
            }
        }
        Ok(())
    }

    async fn get_range(
        &self,
        object_id: &ObjectId,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StoreError> {
        if let Some(err) = self.take_read_fault() {
            return Err(err);
        }
        let objects = self.objects.read().unwrap();
        let entry = objects
            .get(object_id.as_str())
            .ok_or_else(|| StoreError::NotFound {
                key: object_id.to_string(),
            })?;

        let size = entry.size();
        if start >= size {
            return Err(StoreError::RangeNotSatisfiable { start, size });
        }
        let end = end.min(size - 1);

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        for (offset, data) in &entry.chunks {
            let chunk_start = *offset;
            let chunk_end = chunk_start + data.len() as u64; // exclusive
            if chunk_end <= start || chunk_start > end {
                continue;
            }
            let from = start.max(chunk_start) - chunk_start;
            let to = (end + 1).min(chunk_end) - chunk_start;
            out.extend_from_slice(&data[from as usize..to as usize]);
        }
        Ok(out)
    }

    async fn head_object(&self, object_id: &ObjectId) -> Result<Option<u64>, StoreError> {
        let objects = self.objects.read().unwrap();
        Ok(objects.get(object_id.as_str()).map(|e| e.size()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObjectMetadata>, StoreError> {
        let objects = self.objects.read().unwrap();
        let mut metas: Vec<StoredObjectMetadata> = objects
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .filter_map(|(_, e)| e.meta.clone())
            .collect();
        metas.sort_by(|a, b| a.object_id.as_str().cmp(b.object_id.as_str()));
        Ok(metas)
    }

    async fn delete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap();
        objects
            .remove(object_id.as_str())
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                key: object_id.to_string(),
            })
    }

    async fn put_metadata(&self, meta: &StoredObjectMetadata) -> Result<(), StoreError> {
        let mut objects = self.objects.write().unwrap();
        let entry = objects.entry(meta.object_id.to_string()).or_default();
        entry.meta = Some(meta.clone());
        Ok(())
    }

    async fn get_metadata(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<StoredObjectMetadata>, StoreError> {
        if let Some(err) = self.take_meta_read_fault() {
            return Err(err);
        }
        let objects = self.objects.read().unwrap();
        Ok(objects
            .get(object_id.as_str())
            .and_then(|e| e.meta.clone()))
    }
}
