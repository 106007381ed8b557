//! Persisted Queue for E621 Downloader
//!
//! This module provides functionality for:
//! 1. Durable pagination cursors and completion flags per search
//! 2. A FIFO of filtered batches waiting to be downloaded
//! 3. Invalidating all of it when the configuration fingerprint changes
//! 4. Bounded waiting for new batches with an abort signal

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::pipeline::post::Post;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue state belongs to configuration {found}, expected {expected}")]
    Stale { expected: String, found: String },
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Where a search continues from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Cursor {
    /// Nothing fetched yet; the next page is the newest.
    #[default]
    Start,
    /// The next page holds posts with ids below this one.
    Before(u64),
    /// The last page was short.
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchProgress {
    pub cursor: Cursor,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueBatch {
    pub directory: String,
    pub posts: Vec<Post>,
}

/// Everything needed to resume a run of one configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedQueueState {
    pub fingerprint: String,
    pub searches: BTreeMap<String, SearchProgress>,
    pub pending: VecDeque<QueueBatch>,
    pub countdowns: BTreeMap<String, Option<u64>>,
}

impl PersistedQueueState {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            ..Self::default()
        }
    }

    /// Reads a saved state. `Ok(None)` when nothing was saved.
    pub fn load(path: &Path, fingerprint: &str) -> QueueResult<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: Self = serde_json::from_str(&content)?;
        if state.fingerprint != fingerprint {
            return Err(QueueError::Stale {
                expected: fingerprint.to_string(),
                found: state.fingerprint,
            });
        }
        Ok(Some(state))
    }

    /// Writes through a temporary file so a crash leaves either the old or the new state.
    pub fn save(&self, path: &Path) -> QueueResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// The queue shared by the producer and the coordinator.
///
/// Cursors and completion flags are written only by the producer; the pending
/// front and countdowns only by the coordinator.
#[derive(Debug)]
pub struct BatchQueue {
    path: PathBuf,
    state: Mutex<PersistedQueueState>,
    notify: Notify,
    aborted: AtomicBool,
    producer_done: AtomicBool,
    resumed: bool,
}

impl BatchQueue {
    /// Loads the saved state for `fingerprint`, or starts fresh when there is
    /// none or it belongs to a different configuration.
    pub fn open(path: impl Into<PathBuf>, fingerprint: &str) -> QueueResult<Self> {
        let path = path.into();
        let (state, resumed) = match PersistedQueueState::load(&path, fingerprint) {
            Ok(Some(state)) => {
                info!(
                    "Resuming queue with {} pending batches from {}",
                    state.pending.len(),
                    path.display()
                );
                (state, true)
            }
            Ok(None) => (PersistedQueueState::new(fingerprint), false),
            Err(QueueError::Stale { expected, found }) => {
                warn!(%expected, %found, "Configuration changed since the last run, discarding queue state");
                (PersistedQueueState::new(fingerprint), false)
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            notify: Notify::new(),
            aborted: AtomicBool::new(false),
            producer_done: AtomicBool::new(false),
            resumed,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when state from an earlier run was picked up.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn progress(&self, directory: &str) -> SearchProgress {
        self.state
            .lock()
            .searches
            .get(directory)
            .cloned()
            .unwrap_or_default()
    }

    pub fn saved_countdowns(&self) -> BTreeMap<String, Option<u64>> {
        self.state.lock().countdowns.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Advances a search and enqueues its batch in one persisted step.
    pub fn record_page(&self, directory: &str, cursor: Cursor, batch: Option<QueueBatch>) -> QueueResult<()> {
        {
            let mut state = self.state.lock();
            let progress = state.searches.entry(directory.to_string()).or_default();
            progress.cursor = cursor;
            if cursor == Cursor::Exhausted {
                progress.completed = true;
            }
            if let Some(batch) = batch.filter(|b| !b.posts.is_empty()) {
                state.pending.push_back(batch);
            }
            state.save(&self.path)?;
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn mark_completed(&self, directory: &str) -> QueueResult<()> {
        let mut state = self.state.lock();
        state
            .searches
            .entry(directory.to_string())
            .or_default()
            .completed = true;
        state.save(&self.path)
    }

    /// The oldest pending batch, waiting at most `wait` for one to arrive.
    /// The batch stays queued until `finish_batch`.
    pub async fn next_batch(&self, wait: Duration) -> Option<QueueBatch> {
        if let Some(batch) = self.front() {
            return Some(batch);
        }
        if self.is_aborted() || self.producer_done.load(Ordering::Acquire) {
            return None;
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.front()
    }

    fn front(&self) -> Option<QueueBatch> {
        self.state.lock().pending.front().cloned()
    }

    /// Drops the front batch and records the countdowns left after it.
    pub fn finish_batch(&self, countdowns: BTreeMap<String, Option<u64>>) -> QueueResult<()> {
        let mut state = self.state.lock();
        if let Some(batch) = state.pending.pop_front() {
            debug!(directory = %batch.directory, posts = batch.posts.len(), "Batch finished");
        }
        state.countdowns = countdowns;
        state.save(&self.path)
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn mark_producer_done(&self) {
        self.producer_done.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// The producer has finished and every batch has been consumed.
    pub fn is_drained(&self) -> bool {
        self.producer_done.load(Ordering::Acquire) && self.state.lock().pending.is_empty()
    }

    pub fn persist(&self) -> QueueResult<()> {
        self.state.lock().save(&self.path)
    }

    /// Removes the saved state after a completed run.
    pub fn clear(&self) -> QueueResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
