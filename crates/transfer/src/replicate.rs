//! Multi-destination chunk replication.
//!
//! A [`ReplicationCoordinator`] fans each chunk out to every configured
//! destination concurrently. The mandatory destination gates success; a
//! best-effort destination that exhausts its retries is marked failed and
//! skipped for the remainder of the session without failing the transfer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stowage_store::RemoteStoreAdapter;
use stowage_types::{DestinationState, DestinationStatus, EngineConfig, ObjectId};

use crate::chunk::Chunk;
use crate::progress::SessionProgress;
use crate::TransferError;

/// A replication target: an adapter plus its failure policy.
pub struct Destination {
    pub adapter: Arc<dyn RemoteStoreAdapter>,
    pub mandatory: bool,
}

impl Destination {
    /// A destination whose failure fails the whole transfer.
    pub fn mandatory(adapter: Arc<dyn RemoteStoreAdapter>) -> Self {
        Self {
            adapter,
            mandatory: true,
        }
    }

    /// A destination replicated on a best-effort basis.
    pub fn best_effort(adapter: Arc<dyn RemoteStoreAdapter>) -> Self {
        Self {
            adapter,
            mandatory: false,
        }
    }
}

// ---------------------------------------------------------------------------
// DestinationTracker
// ---------------------------------------------------------------------------

struct TrackerState {
    state: DestinationState,
    bytes_transferred: u64,
    /// Next sequence expected to extend the contiguous acked prefix.
    next_expected: u64,
    /// Acked sequences beyond the contiguous prefix, seq -> chunk length.
    out_of_order: BTreeMap<u64, u64>,
    retry_count: u32,
}

/// Per-destination delivery state. Chunks may be acked out of order; the
/// contiguous prefix determines `last_chunk_acked`.
pub struct DestinationTracker {
    name: String,
    mandatory: bool,
    inner: Mutex<TrackerState>,
}

impl DestinationTracker {
    fn new(name: String, mandatory: bool) -> Self {
        Self {
            name,
            mandatory,
            inner: Mutex::new(TrackerState {
                state: DestinationState::Pending,
                bytes_transferred: 0,
                next_expected: 0,
                out_of_order: BTreeMap::new(),
                retry_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record_ack(&self, sequence: u64, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        if s.state == DestinationState::Pending {
            s.state = DestinationState::Active;
        }
        s.bytes_transferred += bytes;
        if sequence == s.next_expected {
            s.next_expected += 1;
            // Drain any already-acked successors.
            loop {
                let next = s.next_expected;
                if s.out_of_order.remove(&next).is_none() {
                    break;
                }
                s.next_expected += 1;
            }
        } else {
            s.out_of_order.insert(sequence, bytes);
        }
    }

    pub fn record_retry(&self) {
        let mut s = self.inner.lock().unwrap();
        s.retry_count += 1;
    }

    pub fn mark_active(&self) {
        let mut s = self.inner.lock().unwrap();
        if s.state == DestinationState::Pending {
            s.state = DestinationState::Active;
        }
    }

    pub fn mark_failed(&self) {
        let mut s = self.inner.lock().unwrap();
        s.state = DestinationState::Failed;
    }

    pub fn mark_complete(&self) {
        let mut s = self.inner.lock().unwrap();
        if s.state != DestinationState::Failed {
            s.state = DestinationState::Complete;
        }
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().unwrap().state == DestinationState::Failed
    }

    /// Number of chunks in the contiguous acked prefix.
    pub fn acked_prefix(&self) -> u64 {
        self.inner.lock().unwrap().next_expected
    }

    pub fn status(&self) -> DestinationStatus {
        let s = self.inner.lock().unwrap();
        DestinationStatus {
            destination: self.name.clone(),
            state: s.state,
            bytes_transferred: s.bytes_transferred,
            last_chunk_acked: s.next_expected.checked_sub(1),
            retry_count: s.retry_count,
        }
    }
}

// ---------------------------------------------------------------------------
// ReplicationCoordinator
// ---------------------------------------------------------------------------

struct Entry {
    adapter: Arc<dyn RemoteStoreAdapter>,
    tracker: Arc<DestinationTracker>,
    primary: bool,
}

/// Drives one object's chunks to every destination with per-destination
/// retry and failure accounting.
pub struct ReplicationCoordinator {
    object_id: ObjectId,
    entries: Vec<Entry>,
    config: EngineConfig,
    cancel: CancellationToken,
    progress: Arc<SessionProgress>,
}

impl ReplicationCoordinator {
    /// The first destination is the primary; its acks drive session progress.
    pub fn new(
        object_id: ObjectId,
        destinations: &[Destination],
        config: EngineConfig,
        cancel: CancellationToken,
        progress: Arc<SessionProgress>,
    ) -> Self {
        let entries = destinations
            .iter()
            .enumerate()
            .map(|(i, dest)| Entry {
                adapter: Arc::clone(&dest.adapter),
                tracker: Arc::new(DestinationTracker::new(
                    dest.adapter.name().to_string(),
                    dest.mandatory,
                )),
                primary: i == 0,
            })
            .collect();
        Self {
            object_id,
            entries,
            config,
            cancel,
            progress,
        }
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Sends one chunk to every live destination concurrently.
    ///
    /// Returns an error only when a mandatory destination exhausts its
    /// retry budget or the session is cancelled.
    pub async fn dispatch(&self, chunk: Arc<Chunk>) -> Result<(), TransferError> {
        let futures: Vec<_> = self
            .entries
            .iter()
            .map(|entry| self.put_with_retry(entry, Arc::clone(&chunk)))
            .collect();
        for result in join_all(futures).await {
            result?;
        }
        Ok(())
    }

    async fn put_with_retry(&self, entry: &Entry, chunk: Arc<Chunk>) -> Result<(), TransferError> {
        if entry.tracker.is_failed() {
            return Ok(());
        }
        entry.tracker.mark_active();

        let sequence = chunk.descriptor.sequence;
        let length = chunk.descriptor.length;
        let mut attempt: u32 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let put = entry
                .adapter
                .put_chunk(&self.object_id, &chunk.descriptor, &chunk.data);
            let outcome = tokio::time::timeout(self.config.chunk_timeout, put).await;

            let err = match outcome {
                Ok(Ok(())) => {
                    entry.tracker.record_ack(sequence, length);
                    if entry.primary {
                        self.progress.record_acked(length);
                    }
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => stowage_store::StoreError::Network {
                    message: format!("chunk {sequence} timed out"),
                    retryable: true,
                },
            };

            if err.is_retryable() && attempt < self.config.max_attempts {
                let delay = self.config.backoff_delay(attempt);
                debug!(
                    destination = entry.tracker.name(),
                    sequence,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "chunk put failed, retrying"
                );
                entry.tracker.record_retry();
                attempt += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                }
                continue;
            }

            entry.tracker.mark_failed();
            if entry.tracker.mandatory {
                return Err(TransferError::ChunkPut {
                    destination: entry.tracker.name().to_string(),
                    sequence,
                    attempts: attempt,
                    source: err,
                });
            }
            warn!(
                destination = entry.tracker.name(),
                sequence,
                attempts = attempt,
                error = %err,
                "best-effort destination failed, continuing without it"
            );
            return Ok(());
        }
    }

    pub fn statuses(&self) -> Vec<DestinationStatus> {
        self.entries.iter().map(|e| e.tracker.status()).collect()
    }

    pub fn primary(&self) -> &Arc<dyn RemoteStoreAdapter> {
        &self.entries[0].adapter
    }

    pub fn primary_tracker(&self) -> &Arc<DestinationTracker> {
        &self.entries[0].tracker
    }

    /// Name of a non-mandatory destination that acked every chunk, if any.
    pub fn fully_replicated_backup(&self, total_chunks: u64) -> Option<String> {
        self.entries
            .iter()
            .find(|e| {
                !e.tracker.mandatory
                    && !e.tracker.is_failed()
                    && e.tracker.acked_prefix() == total_chunks
            })
            .map(|e| e.tracker.name().to_string())
    }

    pub fn backup_fully_replicated(&self, total_chunks: u64) -> bool {
        self.fully_replicated_backup(total_chunks).is_some()
    }

    /// Finalizes every surviving destination and marks it complete.
    pub async fn complete_all(&self) -> Result<(), TransferError> {
        for entry in &self.entries {
            if entry.tracker.is_failed() {
                continue;
            }
            match entry.adapter.complete_object(&self.object_id).await {
                Ok(()) => entry.tracker.mark_complete(),
                Err(e) if entry.tracker.mandatory => return Err(e.into()),
                Err(e) => {
                    warn!(
                        destination = entry.tracker.name(),
                        error = %e,
                        "best-effort destination failed to finalize"
                    );
                    entry.tracker.mark_failed();
                }
            }
        }
        Ok(())
    }

    /// Discards partial state on every destination. Errors are logged,
    /// never propagated.
    pub async fn abort_all(&self) {
        for entry in &self.entries {
            if let Err(e) = entry.adapter.abort_object(&self.object_id).await {
                warn!(
                    destination = entry.tracker.name(),
                    error = %e,
                    "failed to discard partial upload"
                );
            }
        }
    }

    /// Writes the object record to the primary and, when the backup holds a
    /// full copy, to the backup as well.
    pub async fn put_metadata(
        &self,
        meta: &stowage_types::StoredObjectMetadata,
    ) -> Result<(), TransferError> {
        for entry in &self.entries {
            if entry.tracker.is_failed() {
                continue;
            }
            let result = entry.adapter.put_metadata(meta).await;
            match result {
                Ok(()) => {}
                Err(e) if entry.tracker.mandatory => return Err(e.into()),
                Err(e) => warn!(
                    destination = entry.tracker.name(),
                    error = %e,
                    "failed to write backup metadata record"
                ),
            }
        }
        Ok(())
    }
}
