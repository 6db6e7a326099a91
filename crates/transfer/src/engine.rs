//! Engine facade.
//!
//! [`TransferEngine`] ties the pieces together: destinations are fixed at
//! construction, uploads run as sessions, reads go through the range
//! server, and progress is answered from the shared tracker.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use stowage_store::RemoteStoreAdapter;
use stowage_types::{EngineConfig, ObjectId, ProgressSnapshot, StoredObjectMetadata};

use crate::progress::ProgressTracker;
use crate::range::{DownloadStream, RangeRead, RangeServer};
use crate::replicate::Destination;
use crate::session::{TransferSession, UploadRequest};
use crate::TransferError;

/// Chunked transfer engine over a fixed set of destinations.
///
/// The first destination is the primary: its acknowledgments drive
/// progress, its success gates completion, and its copy serves reads.
/// Any further destinations replicate according to their own policy.
pub struct TransferEngine {
    config: EngineConfig,
    destinations: Vec<Destination>,
    tracker: Arc<ProgressTracker>,
    sessions: RwLock<HashMap<String, Arc<TransferSession>>>,
}

impl TransferEngine {
    pub fn new(destinations: Vec<Destination>, config: EngineConfig) -> Result<Self, TransferError> {
        if destinations.is_empty() {
            return Err(TransferError::InvalidDestinations(
                "at least one destination is required".into(),
            ));
        }
        if !destinations[0].mandatory {
            return Err(TransferError::InvalidDestinations(
                "the first destination is the primary and must be mandatory".into(),
            ));
        }
        let tracker = Arc::new(ProgressTracker::new(config.progress_retention));
        Ok(Self {
            config,
            destinations,
            tracker,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Starts an upload and returns its running session.
    pub fn upload(&self, request: UploadRequest) -> Result<Arc<TransferSession>, TransferError> {
        self.purge_expired();
        let session_id = uuid::Uuid::new_v4().to_string();
        let progress =
            self.tracker
                .register(&session_id, request.total_size, self.config.rate_window);
        let session = TransferSession::new(
            session_id,
            request,
            &self.destinations,
            self.config.clone(),
            progress,
        );
        session.start()?;
        self.sessions
            .write()
            .unwrap()
            .insert(session.session_id().to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// A running or recently finished session by id.
    pub fn session(&self, session_id: &str) -> Option<Arc<TransferSession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Progress snapshot for a session, or `None` if unknown or expired.
    pub fn progress(&self, session_id: &str) -> Option<ProgressSnapshot> {
        self.tracker.snapshot(session_id)
    }

    /// Drops bookkeeping for a finished session.
    pub fn release(&self, session_id: &str) {
        self.sessions.write().unwrap().remove(session_id);
        self.tracker.remove(session_id);
    }

    /// Drops terminal sessions older than the progress retention TTL.
    /// Runs on every `upload` call; callers without regular uploads can
    /// invoke it directly.
    pub fn purge_expired(&self) {
        self.tracker.purge_expired();
        let mut sessions = self.sessions.write().unwrap();
        // After the tracker sweep, a terminal session without a tracker
        // entry has outlived its retention (or was already observed).
        sessions.retain(|id, session| {
            !session.state().is_terminal() || self.tracker.snapshot(id).is_some()
        });
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    fn primary(&self) -> Arc<dyn RemoteStoreAdapter> {
        Arc::clone(&self.destinations[0].adapter)
    }

    fn backup(&self) -> Option<Arc<dyn RemoteStoreAdapter>> {
        self.destinations
            .iter()
            .find(|d| !d.mandatory)
            .map(|d| Arc::clone(&d.adapter))
    }

    /// A stateless range reader over the engine's destinations.
    pub fn range_server(&self) -> RangeServer {
        RangeServer::new(self.primary(), self.backup())
    }

    /// Serves `[start, end]` of a stored object.
    pub async fn stream_range(
        &self,
        object_id: &ObjectId,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeRead, TransferError> {
        self.range_server().read(object_id, start, end).await
    }

    /// Sequential full-object download.
    pub async fn download(&self, object_id: &ObjectId) -> Result<DownloadStream, TransferError> {
        let server = self.range_server();
        let meta = server.metadata(object_id).await?;
        Ok(DownloadStream::new(
            server,
            object_id.clone(),
            meta.size,
            self.config.effective_chunk_size() as u64,
        ))
    }

    /// Object record from the primary (backup on transient failure).
    pub async fn metadata(
        &self,
        object_id: &ObjectId,
    ) -> Result<StoredObjectMetadata, TransferError> {
        self.range_server().metadata(object_id).await
    }

    /// Stored objects under a key prefix, from the primary.
    pub async fn list_objects(
        &self,
        prefix: &str,
    ) -> Result<Vec<StoredObjectMetadata>, TransferError> {
        Ok(self.primary().list_objects(prefix).await?)
    }

    /// Deletes an object from the primary and, best effort, the backup.
    pub async fn delete_object(&self, object_id: &ObjectId) -> Result<(), TransferError> {
        self.primary().delete_object(object_id).await?;
        if let Some(backup) = self.backup() {
            if let Err(e) = backup.delete_object(object_id).await {
                warn!(object_id = %object_id, error = %e, "backup delete failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use stowage_store::{MemoryStore, StoreError};
    use stowage_types::{ChunkDescriptor, TransferState};

    use crate::session::SourceReader;

    /// Fails every `period`-th put with a retryable error, succeeds on
    /// retry. Delegates everything else to an inner [`MemoryStore`].
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        period: u64,
        put_calls: AtomicU64,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStore>, period: u64) -> Self {
            Self {
                inner,
                period,
                put_calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteStoreAdapter for FlakyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn put_chunk(
            &self,
            object_id: &ObjectId,
            descriptor: &ChunkDescriptor,
            data: &[u8],
        ) -> Result<(), StoreError> {
            let call = self.put_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call % self.period == 0 {
                return Err(StoreError::Network {
                    message: format!("injected failure on call {call}"),
                    retryable: true,
                });
            }
            self.inner.put_chunk(object_id, descriptor, data).await
        }

        async fn complete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
            self.inner.complete_object(object_id).await
        }

        async fn abort_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
            self.inner.abort_object(object_id).await
        }

        async fn get_range(
            &self,
            object_id: &ObjectId,
            start: u64,
            end: u64,
        ) -> Result<Vec<u8>, StoreError> {
            self.inner.get_range(object_id, start, end).await
        }

        async fn head_object(&self, object_id: &ObjectId) -> Result<Option<u64>, StoreError> {
            self.inner.head_object(object_id).await
        }

        async fn list_objects(
            &self,
            prefix: &str,
        ) -> Result<Vec<StoredObjectMetadata>, StoreError> {
            self.inner.list_objects(prefix).await
        }

        async fn delete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
            self.inner.delete_object(object_id).await
        }

        async fn put_metadata(&self, meta: &StoredObjectMetadata) -> Result<(), StoreError> {
            self.inner.put_metadata(meta).await
        }

        async fn get_metadata(
            &self,
            object_id: &ObjectId,
        ) -> Result<Option<StoredObjectMetadata>, StoreError> {
            self.inner.get_metadata(object_id).await
        }
    }

    fn fast_config(chunk_size: usize) -> EngineConfig {
        EngineConfig {
            chunk_size,
            max_attempts: 4,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
            chunk_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn source(data: Vec<u8>) -> SourceReader {
        Box::new(Cursor::new(data))
    }

    fn payload(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn engine_rejects_bad_destination_sets() {
        let err = TransferEngine::new(vec![], EngineConfig::default())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidDestinations(_)));

        let backup_only = vec![Destination::best_effort(
            Arc::new(MemoryStore::new("b")) as Arc<dyn RemoteStoreAdapter>
        )];
        let err = TransferEngine::new(backup_only, EngineConfig::default())
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidDestinations(_)));
    }

    #[tokio::test]
    async fn upload_replicates_and_completes_despite_flaky_backup() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let backup_inner = Arc::new(MemoryStore::new("backup"));
        // Every third put to the backup fails once and is retried.
        let backup = Arc::new(FlakyStore::new(Arc::clone(&backup_inner), 3));

        let engine = TransferEngine::new(
            vec![
                Destination::mandatory(primary.clone() as Arc<dyn RemoteStoreAdapter>),
                Destination::best_effort(backup as Arc<dyn RemoteStoreAdapter>),
            ],
            fast_config(16),
        )
        .unwrap();

        let data = payload(250);
        let session = engine
            .upload(UploadRequest::new("video.mp4", Some(250), source(data.clone())))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Completed);

        let id = session.object_id().clone();
        assert_eq!(primary.chunk_count(&id), 16);
        assert!(primary.is_complete(&id));
        assert_eq!(primary.object_bytes(&id).unwrap(), data);
        assert_eq!(backup_inner.object_bytes(&id).unwrap(), data);

        let outcome = session.outcome();
        let meta = outcome.metadata.unwrap();
        assert_eq!(meta.size, 250);
        assert_eq!(meta.content_type, "video/mp4");
        assert_eq!(meta.primary_location, "primary");
        assert_eq!(meta.backup_location.as_deref(), Some("backup"));

        for status in &outcome.destinations {
            assert_eq!(status.bytes_transferred, 250);
            assert_eq!(status.last_chunk_acked, Some(15));
        }
    }

    #[tokio::test]
    async fn upload_without_declared_size_completes() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary.clone() as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(16),
        )
        .unwrap();

        let data = payload(100);
        let session = engine
            .upload(UploadRequest::new("notes.txt", None, source(data.clone())))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Completed);

        let meta = session.outcome().metadata.unwrap();
        assert_eq!(meta.size, 100);
        assert!(meta.backup_location.is_none());
        assert_eq!(primary.object_bytes(session.object_id()).unwrap(), data);
    }

    #[tokio::test]
    async fn primary_failure_fails_session_without_metadata() {
        let primary = Arc::new(MemoryStore::new("primary"));
        primary.fail_next_puts(u32::MAX, true);
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary.clone() as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(16),
        )
        .unwrap();

        let session = engine
            .upload(UploadRequest::new("blob.bin", Some(64), source(payload(64))))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Failed);

        let outcome = session.outcome();
        assert!(outcome.metadata.is_none());
        assert!(primary
            .get_metadata(session.object_id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn truncated_source_fails_session() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary.clone() as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(16),
        )
        .unwrap();

        // Declares 200 bytes but the source holds 100.
        let session = engine
            .upload(UploadRequest::new("blob.bin", Some(200), source(payload(100))))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Failed);
        assert!(session.outcome().metadata.is_none());
    }

    #[tokio::test]
    async fn stream_range_serves_uploaded_object() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(512),
        )
        .unwrap();

        let data = payload(5000);
        let session = engine
            .upload(UploadRequest::new("movie.mkv", Some(5000), source(data.clone())))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Completed);

        let id = session.object_id();
        let read = engine.stream_range(id, 1000, Some(1999)).await.unwrap();
        assert_eq!(read.len(), 1000);
        assert_eq!(read.data, data[1000..2000]);
        assert_eq!(read.total_size, 5000);
        assert_eq!(read.content_range(), "bytes 1000-1999/5000");

        // The same request is answered identically again.
        let again = engine.stream_range(id, 1000, Some(1999)).await.unwrap();
        assert_eq!(again.data, read.data);
    }

    #[tokio::test]
    async fn download_reassembles_uploaded_object() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(256),
        )
        .unwrap();

        let data = payload(1000);
        let session = engine
            .upload(UploadRequest::new("a.bin", Some(1000), source(data.clone())))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Completed);

        let mut stream = engine.download(session.object_id()).await.unwrap();
        let mut out = Vec::new();
        while let Some(block) = stream.next_block().await.unwrap() {
            out.extend_from_slice(&block);
        }
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn progress_reaches_terminal_and_expires_on_observe() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(16),
        )
        .unwrap();

        let session = engine
            .upload(UploadRequest::new("a.bin", Some(64), source(payload(64))))
            .unwrap();
        let sid = session.session_id().to_string();
        assert_eq!(session.await_completion().await, TransferState::Completed);

        let snap = engine.progress(&sid).unwrap();
        assert_eq!(snap.state, TransferState::Completed);
        assert_eq!(snap.bytes_transferred, 64);
        assert_eq!(snap.percent, Some(100.0));

        let observed = engine.tracker().observe(&sid).unwrap();
        assert!(observed.state.is_terminal());
        assert!(engine.progress(&sid).is_none());
    }

    #[tokio::test]
    async fn permanently_failing_backup_completes_without_backup_location() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let backup = Arc::new(MemoryStore::new("backup"));
        backup.fail_next_puts(u32::MAX, false);

        let engine = TransferEngine::new(
            vec![
                Destination::mandatory(primary.clone() as Arc<dyn RemoteStoreAdapter>),
                Destination::best_effort(backup.clone() as Arc<dyn RemoteStoreAdapter>),
            ],
            fast_config(16),
        )
        .unwrap();

        let data = payload(96);
        let session = engine
            .upload(UploadRequest::new("a.bin", Some(96), source(data.clone())))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Completed);

        let id = session.object_id();
        assert_eq!(primary.object_bytes(id).unwrap(), data);
        assert_eq!(backup.chunk_count(id), 0);

        let outcome = session.outcome();
        let meta = outcome.metadata.unwrap();
        assert!(meta.backup_location.is_none());
        let backup_status = outcome
            .destinations
            .iter()
            .find(|s| s.destination == "backup")
            .unwrap();
        assert_eq!(backup_status.state, stowage_types::DestinationState::Failed);
    }

    #[tokio::test]
    async fn expired_terminal_sessions_are_swept() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let config = EngineConfig {
            progress_retention: Duration::from_millis(0),
            ..fast_config(16)
        };
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary as Arc<dyn RemoteStoreAdapter>
            )],
            config,
        )
        .unwrap();

        let session = engine
            .upload(UploadRequest::new("a.bin", Some(32), source(payload(32))))
            .unwrap();
        let sid = session.session_id().to_string();
        assert_eq!(session.await_completion().await, TransferState::Completed);
        assert!(engine.session(&sid).is_some());

        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.purge_expired();
        assert!(engine.session(&sid).is_none());
        assert!(engine.progress(&sid).is_none());
    }

    #[tokio::test]
    async fn list_and_delete_objects() {
        let primary = Arc::new(MemoryStore::new("primary"));
        let engine = TransferEngine::new(
            vec![Destination::mandatory(
                primary as Arc<dyn RemoteStoreAdapter>
            )],
            fast_config(16),
        )
        .unwrap();

        let session = engine
            .upload(UploadRequest::new("song.mp3", Some(32), source(payload(32))))
            .unwrap();
        assert_eq!(session.await_completion().await, TransferState::Completed);
        let id = session.object_id().clone();

        let listed = engine.list_objects("").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "song.mp3");

        engine.delete_object(&id).await.unwrap();
        assert!(matches!(
            engine.metadata(&id).await.unwrap_err(),
            TransferError::NotFound(_)
        ));
    }
}
