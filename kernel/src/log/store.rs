// Event Log Storage Abstraction
//
// Defines the durability contract for the build event log.
// Production deployments back this with a shared row store so any
// serving instance can replay any build.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{BuildEvent, BuildId, LogError, Seq};

/// Storage backend for the event log.
///
/// Properties required from implementations:
/// - Append-only
/// - Ordered by `seq` within a build
/// - Durable once `insert` returns
/// - CAS semantics on `seq`
///
/// Implementations MUST NOT:
/// - Reorder events
/// - Mutate existing events
/// - Allow `seq` gaps
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Persist an event.
    ///
    /// Implementations must enforce:
    /// - event.seq == current_seq(event.build_id) + 1
    ///
    /// and answer with `LogError::VersionConflict` otherwise.
    async fn insert(&self, event: &BuildEvent) -> Result<(), LogError>;

    /// Load up to `limit` events with `seq > after`, ascending.
    async fn load_after(
        &self,
        build_id: &BuildId,
        after: Seq,
        limit: usize,
    ) -> Result<Vec<BuildEvent>, LogError>;

    /// Highest persisted `seq` for the build, 0 if none.
    async fn current_seq(&self, build_id: &BuildId) -> Result<Seq, LogError>;
}

/// Process-local store. Suitable for a single serving instance and tests.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    builds: RwLock<HashMap<BuildId, Vec<BuildEvent>>>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLogStore for InMemoryLogStore {
    async fn insert(&self, event: &BuildEvent) -> Result<(), LogError> {
        let mut builds = self.builds.write();
        let events = builds.entry(event.build_id).or_default();
        let expected = events.last().map(|e| e.seq + 1).unwrap_or(1);

        if event.seq != expected {
            return Err(LogError::VersionConflict {
                expected,
                actual: event.seq,
            });
        }

        events.push(event.clone());
        Ok(())
    }

    async fn load_after(
        &self,
        build_id: &BuildId,
        after: Seq,
        limit: usize,
    ) -> Result<Vec<BuildEvent>, LogError> {
        let builds = self.builds.read();
        let Some(events) = builds.get(build_id) else {
            return Ok(Vec::new());
        };

        // seq N lives at index N - 1.
        let start = usize::try_from(after).unwrap_or(usize::MAX).min(events.len());
        Ok(events[start..].iter().take(limit).cloned().collect())
    }

    async fn current_seq(&self, build_id: &BuildId) -> Result<Seq, LogError> {
        Ok(self
            .builds
            .read()
            .get(build_id)
            .and_then(|events| events.last())
            .map(|e| e.seq)
            .unwrap_or(0))
    }
}
