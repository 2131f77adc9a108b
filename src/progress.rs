//! Thread-safe progress state machine with callback observers
//!
//! One tracker instance lives per parse call. Mutating calls notify
//! registered callbacks synchronously with an immutable snapshot;
//! callback panics are swallowed so an observer can never abort the
//! parse. Cancellation is a cooperative flag polled by the parse loop.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// States of a tracked parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProgressState {
    /// Created, not started
    Initialized,
    /// Actively processing chunks
    Running,
    /// Temporarily suspended
    Paused,
    /// Finished normally (terminal)
    Completed,
    /// Stopped by a cancellation request (terminal)
    Cancelled,
    /// Stopped by an error (terminal)
    Error,
}

impl ProgressState {
    /// True for states that permit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressState::Completed | ProgressState::Cancelled | ProgressState::Error
        )
    }
}

/// Immutable snapshot of progress, handed to callbacks
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Current state
    pub state: ProgressState,
    /// Bytes processed so far
    pub processed_bytes: u64,
    /// Total bytes, when the source size is known
    pub total_bytes: Option<u64>,
    /// Index of the chunk currently being processed
    pub current_chunk: usize,
    /// Estimated total chunk count, when known
    pub total_chunks: Option<usize>,
    /// Last status or error message
    pub message: Option<String>,
    /// When `start` was called
    pub started_at: Option<Instant>,
    /// When the last mutation happened
    pub updated_at: Instant,
}

impl ProgressInfo {
    fn new(total_bytes: Option<u64>, total_chunks: Option<usize>) -> Self {
        Self {
            state: ProgressState::Initialized,
            processed_bytes: 0,
            total_bytes,
            current_chunk: 0,
            total_chunks,
            message: None,
            started_at: None,
            updated_at: Instant::now(),
        }
    }

    /// Fraction of the source processed, when the total is known
    pub fn progress_ratio(&self) -> Option<f64> {
        let total = self.total_bytes?;
        if total == 0 {
            return Some(1.0);
        }
        Some((self.processed_bytes as f64 / total as f64).min(1.0))
    }

    /// Throughput in bytes per second since `start`
    pub fn processing_speed(&self) -> Option<f64> {
        let elapsed = self.started_at?.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.processed_bytes as f64 / elapsed)
    }

    /// Estimated time until completion, when total and speed are known
    pub fn estimated_remaining_time(&self) -> Option<Duration> {
        let total = self.total_bytes?;
        let speed = self.processing_speed()?;
        if speed <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.processed_bytes) as f64;
        Some(Duration::from_secs_f64(remaining / speed))
    }
}

/// Observer invoked with a snapshot after every mutating call
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Thread-safe progress state machine with a cancellation flag
pub struct ProgressTracker {
    info: Mutex<ProgressInfo>,
    callbacks: Mutex<Vec<Arc<dyn Fn(&ProgressInfo) + Send + Sync>>>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("info", &self.get_info())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl ProgressTracker {
    /// Creates a tracker. `total_bytes` is optional; without it the
    /// ratio-based derived reads are disabled.
    pub fn new(total_bytes: Option<u64>, total_chunks: Option<usize>) -> Self {
        Self {
            info: Mutex::new(ProgressInfo::new(total_bytes, total_chunks)),
            callbacks: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Registers a callback invoked synchronously on every mutation
    pub fn add_callback(&self, callback: ProgressCallback) {
        self.callbacks.lock().unwrap().push(Arc::from(callback));
    }

    /// Returns a snapshot of the current progress
    pub fn get_info(&self) -> ProgressInfo {
        self.info.lock().unwrap().clone()
    }

    /// Current state
    pub fn state(&self) -> ProgressState {
        self.info.lock().unwrap().state
    }

    /// Whether cancellation was requested. Readable independently of
    /// the state lock so the parse loop can poll it cheaply.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Sets the totals before the parse starts. Ignored once the
    /// tracker has left the Initialized state.
    pub fn set_totals(&self, total_bytes: Option<u64>, total_chunks: Option<usize>) {
        self.mutate(|info| {
            if info.state != ProgressState::Initialized {
                return false;
            }
            info.total_bytes = total_bytes;
            info.total_chunks = total_chunks;
            true
        });
    }

    /// Transitions Initialized -> Running
    pub fn start(&self) {
        self.mutate(|info| {
            if info.state != ProgressState::Initialized {
                return false;
            }
            info.state = ProgressState::Running;
            info.started_at = Some(Instant::now());
            true
        });
    }

    /// Records absolute progress. Ignored unless Running. Processed
    /// bytes never decrease and never exceed the known total.
    pub fn update(&self, processed_bytes: u64, current_chunk: usize) {
        self.mutate(|info| {
            if info.state != ProgressState::Running {
                return false;
            }
            let mut bytes = processed_bytes.max(info.processed_bytes);
            if let Some(total) = info.total_bytes {
                bytes = bytes.min(total);
            }
            info.processed_bytes = bytes;
            info.current_chunk = current_chunk.max(info.current_chunk);
            true
        });
    }

    /// Records incremental progress. Ignored unless Running.
    pub fn increment(&self, bytes: u64) {
        self.mutate(|info| {
            if info.state != ProgressState::Running {
                return false;
            }
            let mut updated = info.processed_bytes.saturating_add(bytes);
            if let Some(total) = info.total_bytes {
                updated = updated.min(total);
            }
            info.processed_bytes = updated;
            info.current_chunk += 1;
            true
        });
    }

    /// Transitions Running -> Paused
    pub fn pause(&self) {
        self.mutate(|info| {
            if info.state != ProgressState::Running {
                return false;
            }
            info.state = ProgressState::Paused;
            true
        });
    }

    /// Transitions Paused -> Running
    pub fn resume(&self) {
        self.mutate(|info| {
            if info.state != ProgressState::Paused {
                return false;
            }
            info.state = ProgressState::Running;
            true
        });
    }

    /// Terminal transition to Completed, clamping processed to total
    pub fn complete(&self, message: Option<String>) {
        self.mutate(|info| {
            if info.state.is_terminal() {
                return false;
            }
            info.state = ProgressState::Completed;
            if let Some(total) = info.total_bytes {
                info.processed_bytes = total;
            }
            if message.is_some() {
                info.message = message;
            }
            true
        });
    }

    /// Terminal transition to Cancelled; also raises the cancellation
    /// flag for the parse loop.
    pub fn cancel(&self, message: Option<String>) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.mutate(|info| {
            if info.state.is_terminal() {
                return false;
            }
            info.state = ProgressState::Cancelled;
            if message.is_some() {
                info.message = message;
            }
            true
        });
    }

    /// Terminal transition to Error, retaining the message
    pub fn error(&self, message: String) {
        self.mutate(|info| {
            if info.state.is_terminal() {
                return false;
            }
            info.state = ProgressState::Error;
            info.message = Some(message);
            true
        });
    }

    /// Applies a mutation under the lock, then notifies callbacks with
    /// a snapshot taken after the mutation. Rejected transitions
    /// notify nobody, so an observer reacting to a snapshot cannot
    /// trigger an endless notification cycle.
    fn mutate<F: FnOnce(&mut ProgressInfo) -> bool>(&self, f: F) {
        let snapshot = {
            let mut info = self.info.lock().unwrap();
            if !f(&mut info) {
                return;
            }
            info.updated_at = Instant::now();
            info.clone()
        };
        self.notify(&snapshot);
    }

    /// Invokes callbacks with neither lock held, so an observer may
    /// call back into the tracker (e.g. to cancel). Panicking
    /// observers are ignored.
    fn notify(&self, snapshot: &ProgressInfo) {
        let callbacks: Vec<_> = self.callbacks.lock().unwrap().to_vec();
        for callback in callbacks {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(snapshot)));
        }
    }
}
