// Build Event Log
//
// Append-only, per-build sequence of events. The log is the single
// authority for ordering: every committed event for a build carries a
// `seq` from the contiguous range 1..=N.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

mod reader;
mod store;

pub use reader::LogReader;
pub use store::{EventLogStore, InMemoryLogStore};

/// Per-build sequence number. Zero means "nothing committed".
pub type Seq = u64;

/// Stable identifier for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(pub Uuid);

impl BuildId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BuildQueued,
    StageStarted,
    StageCompleted,
    LogLine,
    BuildSucceeded,
    BuildFailed,
    BuildCancelled,
}

impl EventKind {
    /// Terminal events end every stream that delivers them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::BuildSucceeded | EventKind::BuildFailed | EventKind::BuildCancelled
        )
    }

    /// Wire name, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BuildQueued => "build_queued",
            EventKind::StageStarted => "stage_started",
            EventKind::StageCompleted => "stage_completed",
            EventKind::LogLine => "log_line",
            EventKind::BuildSucceeded => "build_succeeded",
            EventKind::BuildFailed => "build_failed",
            EventKind::BuildCancelled => "build_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable fact about a build's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub build_id: BuildId,
    pub seq: Seq,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    /// Store-level CAS failure: someone else committed `expected - 1` first.
    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: Seq, actual: Seq },

    /// The per-build append could not be serialized within the retry budget.
    #[error("append conflict on build {build_id} after {attempts} attempts")]
    AppendConflict { build_id: BuildId, attempts: u32 },

    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

/// Default number of CAS attempts per append before giving up.
pub const DEFAULT_CAS_RETRY_BUDGET: u32 = 3;

/// Ordered, durable event log backed by an [`EventLogStore`].
///
/// Appends to the same build are serialized by a per-build async lock;
/// appends to different builds never contend. The store's CAS check
/// covers writers outside this process.
pub struct EventLog<S: EventLogStore> {
    store: S,
    append_locks: Mutex<HashMap<BuildId, Arc<tokio::sync::Mutex<()>>>>,
    cas_retry_budget: u32,
}

impl<S: EventLogStore> EventLog<S> {
    pub fn new(store: S) -> Self {
        Self::with_retry_budget(store, DEFAULT_CAS_RETRY_BUDGET)
    }

    pub fn with_retry_budget(store: S, cas_retry_budget: u32) -> Self {
        Self {
            store,
            append_locks: Mutex::new(HashMap::new()),
            cas_retry_budget: cas_retry_budget.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Assign the next `seq` for `build_id` and commit the event.
    ///
    /// Returns the committed event; its `seq` is the assigned number.
    pub async fn append(
        &self,
        build_id: BuildId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<BuildEvent, LogError> {
        let lock = self.build_lock(build_id);
        let result = {
            let _guard = lock.lock().await;
            self.append_serialized(build_id, kind, payload).await
        };
        drop(lock);
        self.prune_lock(build_id);
        result
    }

    async fn append_serialized(
        &self,
        build_id: BuildId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<BuildEvent, LogError> {
        for attempt in 1..=self.cas_retry_budget {
            let current = self.store.current_seq(&build_id).await?;
            let event = BuildEvent {
                build_id,
                seq: current + 1,
                kind,
                payload: payload.clone(),
                occurred_at: Utc::now(),
            };

            match self.store.insert(&event).await {
                Ok(()) => {
                    debug!(%build_id, seq = event.seq, kind = %kind, "event committed");
                    return Ok(event);
                }
                Err(LogError::VersionConflict { expected, actual }) => {
                    warn!(%build_id, attempt, expected, actual, "append lost CAS race");
                }
                Err(e) => return Err(e),
            }
        }

        Err(LogError::AppendConflict {
            build_id,
            attempts: self.cas_retry_budget,
        })
    }

    /// Lazily read every committed event with `seq > after_seq`.
    pub fn read_from(&self, build_id: BuildId, after_seq: Seq, page_size: usize) -> LogReader<'_, S> {
        LogReader::new(&self.store, build_id, after_seq, page_size)
    }

    /// Highest committed `seq`, 0 if none.
    pub async fn latest_seq(&self, build_id: BuildId) -> Result<Seq, LogError> {
        self.store.current_seq(&build_id).await
    }

    fn build_lock(&self, build_id: BuildId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.append_locks.lock();
        Arc::clone(locks.entry(build_id).or_default())
    }

    // Drops the map entry once no appender holds or waits on it.
    fn prune_lock(&self, build_id: BuildId) {
        let mut locks = self.append_locks.lock();
        if let Some(lock) = locks.get(&build_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&build_id);
            }
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.append_locks.lock().len()
    }
}
