// Pipeline Emitter
//
// The contract the build pipeline honors when it reports progress:
// commit through the event log, absorb append conflicts with bounded
// backoff, then publish the committed event to live subscribers.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::LiveBridge;
use crate::config::AppendRetryConfig;
use crate::log::{BuildEvent, BuildId, EventKind, EventLog, EventLogStore, LogError};

pub struct BuildEmitter<S: EventLogStore> {
    log: Arc<EventLog<S>>,
    bridge: Arc<LiveBridge>,
    retry: AppendRetryConfig,
}

impl<S: EventLogStore> BuildEmitter<S> {
    pub fn new(log: Arc<EventLog<S>>, bridge: Arc<LiveBridge>, retry: AppendRetryConfig) -> Self {
        Self { log, bridge, retry }
    }

    /// Commit one event and fan it out.
    ///
    /// Each call commits at most one event. Deduplicating logically
    /// identical events across caller retries is the pipeline's job.
    pub async fn emit(
        &self,
        build_id: BuildId,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> Result<BuildEvent, LogError> {
        let mut attempt = 1;
        let event = loop {
            match self.log.append(build_id, kind, payload.clone()).await {
                Ok(event) => break event,
                Err(LogError::AppendConflict { .. }) if attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(%build_id, attempt, ?backoff, "append conflict, backing off");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let delivered = self.bridge.publish(&event);
        debug!(%build_id, seq = event.seq, kind = %event.kind, delivered, "event published");
        Ok(event)
    }
}
