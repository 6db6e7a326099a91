//! Process-wide progress registry.
//!
//! One [`SessionProgress`] per transfer session, owned by the registry and
//! updated by the task acknowledging chunks (single writer per key).
//! Readers poll [`ProgressTracker::snapshot`]; an optional callback hook
//! plus a periodic notifier cover push-style consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use stowage_types::{ProgressSnapshot, TransferState};

/// Default interval for the periodic push notifier.
const DEFAULT_NOTIFY_INTERVAL: Duration = Duration::from_millis(500);

/// Callback invoked with a progress snapshot.
pub type ProgressCallback = Box<dyn Fn(ProgressSnapshot) + Send + Sync>;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Transfer rate over a sliding window of acknowledgment samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: 100,
                window,
            }),
        }
    }

    /// Records `bytes` acknowledged at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        let cutoff = now - s.window;
        s.samples.retain(|sample| sample.timestamp >= cutoff);
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second within the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        if s.samples.len() < 2 {
            return 0.0;
        }
        let first = &s.samples[0];
        let last = &s.samples[s.samples.len() - 1];
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimated seconds to transfer `remaining` bytes; `None` at zero rate.
    pub fn eta_seconds(&self, remaining: u64) -> Option<f64> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(remaining as f64 / speed)
    }
}

// ---------------------------------------------------------------------------
// SessionProgress
// ---------------------------------------------------------------------------

struct ProgressInner {
    state: TransferState,
    bytes_transferred: u64,
    total_size: Option<u64>,
    terminal_at: Option<Instant>,
}

/// Live progress state of one session. Snapshots are derived on read.
pub struct SessionProgress {
    session_id: String,
    inner: RwLock<ProgressInner>,
    speed: SpeedCalculator,
}

impl SessionProgress {
    fn new(session_id: String, total_size: Option<u64>, rate_window: Duration) -> Self {
        Self {
            session_id,
            inner: RwLock::new(ProgressInner {
                state: TransferState::Created,
                bytes_transferred: 0,
                total_size,
                terminal_at: None,
            }),
            speed: SpeedCalculator::new(rate_window),
        }
    }

    /// Adds acknowledged bytes. Monotonic by construction.
    pub fn record_acked(&self, bytes: u64) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.bytes_transferred += bytes;
        }
        self.speed.add_sample(bytes);
    }

    /// Fixes the total size once it becomes known (stream EOF).
    pub fn set_total_size(&self, total: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.total_size = Some(total);
    }

    pub fn set_state(&self, state: TransferState) {
        let mut inner = self.inner.write().unwrap();
        inner.state = state;
        if state.is_terminal() && inner.terminal_at.is_none() {
            inner.terminal_at = Some(Instant::now());
        }
    }

    pub fn state(&self) -> TransferState {
        self.inner.read().unwrap().state
    }

    /// How long ago the session reached a terminal state.
    fn terminal_elapsed(&self) -> Option<Duration> {
        self.inner.read().unwrap().terminal_at.map(|t| t.elapsed())
    }

    /// Most recently published state as a read-only snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.inner.read().unwrap();
        let percent = inner.total_size.map(|total| {
            if total == 0 {
                100.0
            } else {
                (inner.bytes_transferred as f64 / total as f64) * 100.0
            }
        });
        let eta_seconds = match (inner.state, inner.total_size) {
            (TransferState::Active, Some(total)) => self
                .speed
                .eta_seconds(total.saturating_sub(inner.bytes_transferred)),
            _ => None,
        };
        ProgressSnapshot {
            session_id: self.session_id.clone(),
            state: inner.state,
            bytes_transferred: inner.bytes_transferred,
            total_size: inner.total_size,
            percent,
            eta_seconds,
            current_rate_bytes_per_sec: self.speed.bytes_per_second(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

/// Registry of per-session progress, keyed by session id.
///
/// Entries appear when a session starts and disappear once the caller has
/// observed a terminal snapshot or the retention TTL has passed.
pub struct ProgressTracker {
    inner: Arc<RwLock<TrackerInner>>,
    stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    retention: Duration,
}

struct TrackerInner {
    sessions: HashMap<String, Arc<SessionProgress>>,
    callbacks: Vec<ProgressCallback>,
}

impl ProgressTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TrackerInner {
                sessions: HashMap::new(),
                callbacks: Vec::new(),
            })),
            stop: Mutex::new(None),
            retention,
        }
    }

    /// Creates and registers the progress entry for a new session.
    pub fn register(
        &self,
        session_id: &str,
        total_size: Option<u64>,
        rate_window: Duration,
    ) -> Arc<SessionProgress> {
        let progress = Arc::new(SessionProgress::new(
            session_id.to_string(),
            total_size,
            rate_window,
        ));
        let mut inner = self.inner.write().unwrap();
        inner
            .sessions
            .insert(session_id.to_string(), Arc::clone(&progress));
        progress
    }

    /// Latest snapshot for a session, or `None` if unknown or expired.
    pub fn snapshot(&self, session_id: &str) -> Option<ProgressSnapshot> {
        let progress = {
            let inner = self.inner.read().unwrap();
            inner.sessions.get(session_id).cloned()
        }?;
        if progress
            .terminal_elapsed()
            .is_some_and(|elapsed| elapsed > self.retention)
        {
            self.remove(session_id);
            return None;
        }
        Some(progress.snapshot())
    }

    /// Like [`snapshot`](Self::snapshot), but drops the entry once a
    /// terminal state has been handed to the caller.
    pub fn observe(&self, session_id: &str) -> Option<ProgressSnapshot> {
        let snapshot = self.snapshot(session_id)?;
        if snapshot.state.is_terminal() {
            self.remove(session_id);
        }
        Some(snapshot)
    }

    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.sessions.remove(session_id);
    }

    /// Drops every terminal entry older than the retention TTL.
    pub fn purge_expired(&self) {
        let mut inner = self.inner.write().unwrap();
        let retention = self.retention;
        inner.sessions.retain(|_, progress| {
            !progress
                .terminal_elapsed()
                .is_some_and(|elapsed| elapsed > retention)
        });
    }

    /// Registers a push callback, invoked by the periodic notifier.
    pub fn on_progress(&self, callback: ProgressCallback) {
        let mut inner = self.inner.write().unwrap();
        inner.callbacks.push(callback);
    }

    /// Sends a one-time notification for a session to all callbacks.
    pub fn notify(&self, session_id: &str) {
        let inner = self.inner.read().unwrap();
        if let Some(progress) = inner.sessions.get(session_id) {
            let snapshot = progress.snapshot();
            for cb in &inner.callbacks {
                cb(snapshot.clone());
            }
        }
    }

    /// Starts periodic notifications for active sessions in a background
    /// task. Call [`stop`](Self::stop) to cancel.
    pub fn start_notifier(&self, interval: Option<Duration>) {
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        {
            let mut stop = self.stop.lock().unwrap();
            drop(stop.take());
            *stop = Some(tx);
        }

        let inner = Arc::clone(&self.inner);
        let interval = interval.unwrap_or(DEFAULT_NOTIFY_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let i = inner.read().unwrap();
                        for progress in i.sessions.values() {
                            if progress.state() == TransferState::Active {
                                let snapshot = progress.snapshot();
                                for cb in &i.callbacks {
                                    cb(snapshot.clone());
                                }
                            }
                        }
                    }
                    _ = &mut rx => break,
                }
            }
        });
    }

    /// Stops the periodic notifier task.
    pub fn stop_notifier(&self) {
        let mut stop = self.stop.lock().unwrap();
        // Dropping the sender signals the task to exit.
        drop(stop.take());
    }
}
