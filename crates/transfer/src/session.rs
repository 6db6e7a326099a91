//! Transfer session lifecycle.
//!
//! A [`TransferSession`] owns one upload end to end: it pulls chunks from
//! the source, hands them to the replication coordinator under a bounded
//! in-flight window, and settles into exactly one terminal state. Waiters
//! observe the terminal transition through a watch channel.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stowage_types::{
    guess_content_type, DestinationStatus, EngineConfig, ObjectId, StoredObjectMetadata,
    TransferDirection, TransferState,
};

use crate::chunk::ChunkStream;
use crate::progress::SessionProgress;
use crate::replicate::{Destination, ReplicationCoordinator};
use crate::TransferError;

/// Boxed byte source feeding an upload.
pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

/// Everything needed to start an upload.
pub struct UploadRequest {
    /// Explicit object id; a fresh one is generated when absent.
    pub object_id: Option<ObjectId>,
    /// Original file name, used for content-type detection and listings.
    pub name: String,
    /// Declared size in bytes when known up front.
    pub total_size: Option<u64>,
    pub source: SourceReader,
}

impl UploadRequest {
    pub fn new(name: impl Into<String>, total_size: Option<u64>, source: SourceReader) -> Self {
        Self {
            object_id: None,
            name: name.into(),
            total_size,
            source,
        }
    }
}

/// Final report of a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub state: TransferState,
    /// Present only when the session completed.
    pub metadata: Option<StoredObjectMetadata>,
    pub destinations: Vec<DestinationStatus>,
}

/// One in-flight transfer. Created by the engine, driven by a spawned task.
pub struct TransferSession {
    session_id: String,
    object_id: ObjectId,
    direction: TransferDirection,
    name: String,
    config: EngineConfig,
    /// Caller-facing cancellation. Cancelling it marks the session
    /// `Cancelled` rather than `Failed`.
    cancel: CancellationToken,
    /// Internal stop signal, tripped by cancel or a mandatory failure.
    stop: CancellationToken,
    state: Mutex<TransferState>,
    state_tx: watch::Sender<TransferState>,
    progress: Arc<SessionProgress>,
    coordinator: Arc<ReplicationCoordinator>,
    source: Mutex<Option<ChunkStream<SourceReader>>>,
    metadata: Mutex<Option<StoredObjectMetadata>>,
}

impl TransferSession {
    /// `progress` must be registered under `session_id` by the caller.
    pub fn new(
        session_id: String,
        request: UploadRequest,
        destinations: &[Destination],
        config: EngineConfig,
        progress: Arc<SessionProgress>,
    ) -> Arc<Self> {
        let object_id = request.object_id.unwrap_or_else(ObjectId::generate);
        let cancel = CancellationToken::new();
        let stop = cancel.child_token();
        let coordinator = Arc::new(ReplicationCoordinator::new(
            object_id.clone(),
            destinations,
            config.clone(),
            stop.clone(),
            Arc::clone(&progress),
        ));
        let stream = ChunkStream::new(
            request.source,
            config.effective_chunk_size(),
            request.total_size,
            config.verify_checksums,
        );
        let (state_tx, _) = watch::channel(TransferState::Created);

        Arc::new(Self {
            session_id,
            object_id,
            direction: TransferDirection::Upload,
            name: request.name,
            config,
            cancel,
            stop,
            state: Mutex::new(TransferState::Created),
            state_tx,
            progress,
            coordinator,
            source: Mutex::new(Some(stream)),
            metadata: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().unwrap()
    }

    /// Requests cancellation. Settles the session into `Cancelled` once
    /// in-flight chunk puts have wound down.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Spawns the driving task. Errors if the session already started.
    pub fn start(self: &Arc<Self>) -> Result<(), TransferError> {
        if !self.transition(TransferState::Created, TransferState::Active) {
            return Err(TransferError::AlreadyStarted);
        }
        self.progress.set_state(TransferState::Active);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.run().await;
        });
        Ok(())
    }

    /// Resolves once the session reaches a terminal state.
    pub async fn await_completion(&self) -> TransferState {
        let mut rx = self.state_tx.subscribe();
        // An error here means the sender dropped, which cannot happen
        // while `self` is alive; the current value is still correct.
        let _ = rx.wait_for(|s| s.is_terminal()).await;
        let state = *rx.borrow();
        state
    }

    /// Final report. Meaningful once the session is terminal.
    pub fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            state: self.state(),
            metadata: self.metadata.lock().unwrap().clone(),
            destinations: self.coordinator.statuses(),
        }
    }

    async fn run(self: Arc<Self>) {
        let result = self.drive().await;

        let terminal = if self.cancel.is_cancelled() {
            TransferState::Cancelled
        } else {
            match &result {
                Ok(()) => TransferState::Completed,
                Err(_) => TransferState::Failed,
            }
        };

        if terminal != TransferState::Completed {
            let acked = self.coordinator.primary_tracker().status();
            info!(
                session_id = %self.session_id,
                object_id = %self.object_id,
                state = ?terminal,
                bytes_confirmed = acked.bytes_transferred,
                last_chunk = ?acked.last_chunk_acked,
                "transfer did not complete, discarding partial upload"
            );
            self.coordinator.abort_all().await;
        }
        if let Err(e) = &result {
            if terminal == TransferState::Failed {
                warn!(
                    session_id = %self.session_id,
                    object_id = %self.object_id,
                    error = %e,
                    "transfer failed"
                );
            }
        }

        self.settle(terminal);
    }

    async fn drive(&self) -> Result<(), TransferError> {
        let mut stream = self
            .source
            .lock()
            .unwrap()
            .take()
            .ok_or(TransferError::AlreadyStarted)?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut join_set: JoinSet<Result<(), TransferError>> = JoinSet::new();
        let mut failure: Option<TransferError> = None;

        loop {
            // Backpressure: a permit is held for the lifetime of each
            // in-flight dispatch, so at most max_in_flight chunks are
            // buffered beyond the source.
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
                _ = self.stop.cancelled() => break,
            };

            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    failure.get_or_insert(e);
                    self.stop.cancel();
                    break;
                }
            };

            let chunk = Arc::new(chunk);
            let stop = self.stop.clone();
            let coordinator = Arc::clone(&self.coordinator);
            join_set.spawn(async move {
                let result = coordinator.dispatch(chunk).await;
                drop(permit);
                if result.is_err() {
                    stop.cancel();
                }
                result
            });

            // Collect any already-finished dispatches so a mandatory
            // failure surfaces before the whole source is consumed.
            while let Some(done) = join_set.try_join_next() {
                Self::fold_result(&mut failure, done);
            }
        }

        while let Some(done) = join_set.join_next().await {
            Self::fold_result(&mut failure, done);
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let total_bytes = stream.bytes_read();
        let total_chunks = stream.chunks_produced();
        self.progress.set_total_size(total_bytes);

        self.coordinator.complete_all().await?;

        let backup_location = self.coordinator.fully_replicated_backup(total_chunks);
        let meta = StoredObjectMetadata {
            object_id: self.object_id.clone(),
            name: self.name.clone(),
            size: total_bytes,
            content_type: guess_content_type(&self.name).to_string(),
            created_at: Utc::now(),
            primary_location: self.coordinator.primary().name().to_string(),
            backup_location,
        };
        self.coordinator.put_metadata(&meta).await?;
        *self.metadata.lock().unwrap() = Some(meta);

        info!(
            session_id = %self.session_id,
            object_id = %self.object_id,
            size = total_bytes,
            chunks = total_chunks,
            "transfer completed"
        );
        Ok(())
    }

    fn fold_result(
        failure: &mut Option<TransferError>,
        done: Result<Result<(), TransferError>, tokio::task::JoinError>,
    ) {
        match done {
            // Cancellation fallout from a prior failure is not the cause.
            Ok(Err(TransferError::Cancelled)) | Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failure.get_or_insert(e);
            }
            Err(join_err) => {
                failure.get_or_insert(TransferError::Io(std::io::Error::other(join_err)));
            }
        }
    }

    /// Compare-and-set on the session state. Terminal states never leave.
    fn transition(&self, from: TransferState, to: TransferState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != from || state.is_terminal() {
            return false;
        }
        *state = to;
        // send_replace stores the value even with no live receivers, so a
        // later subscriber still observes the transition.
        self.state_tx.send_replace(to);
        true
    }

    fn settle(&self, terminal: TransferState) {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_terminal() {
                return;
            }
            *state = terminal;
        }
        self.progress.set_state(terminal);
        self.state_tx.send_replace(terminal);
    }
}
