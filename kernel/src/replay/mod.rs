// Replay Coordinator
//
// Moves a connection from replay of history to the live tail with no
// gap and no duplicate. The connection writer's `last_emitted_seq` is
// the only cursor: replay starts after it, the live subscription is
// pinned to it, and every live delivery is checked against it.

use tracing::{debug, warn};

use crate::log::{BuildEvent, BuildId, EventKind, EventLog, EventLogStore, LogError, Seq};
use crate::writer::{ConnectionWriter, FrameSink, WriteError};

/// Errors that can occur while replaying or tailing.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("log read failed: {0}")]
    Log(#[from] LogError),

    #[error("write failed: {0}")]
    Write(#[from] WriteError),
}

/// Whether the stream is still open after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Open,
    Terminal(EventKind),
}

/// Resolve the client's claimed checkpoint against the log.
///
/// A checkpoint past the committed tail is a protocol violation; the
/// connection falls back to a full replay instead of guessing.
pub async fn resolve_checkpoint<S: EventLogStore>(
    log: &EventLog<S>,
    build_id: BuildId,
    requested: Seq,
) -> Result<Seq, LogError> {
    if requested == 0 {
        return Ok(0);
    }

    let latest = log.latest_seq(build_id).await?;
    if requested > latest {
        warn!(
            %build_id,
            checkpoint = requested,
            latest,
            "checkpoint beyond committed range, replaying from start"
        );
        return Ok(0);
    }
    Ok(requested)
}

pub struct ReplayCoordinator<'a, S: EventLogStore, K: FrameSink> {
    log: &'a EventLog<S>,
    writer: &'a ConnectionWriter<K>,
    build_id: BuildId,
    page_size: usize,
}

impl<'a, S: EventLogStore, K: FrameSink> ReplayCoordinator<'a, S, K> {
    pub fn new(
        log: &'a EventLog<S>,
        writer: &'a ConnectionWriter<K>,
        build_id: BuildId,
        page_size: usize,
    ) -> Self {
        Self {
            log,
            writer,
            build_id,
            page_size,
        }
    }

    pub fn last_emitted_seq(&self) -> Seq {
        self.writer.last_emitted_seq()
    }

    /// Floor for the live subscription: the next `seq` this connection needs.
    pub fn live_floor(&self) -> Seq {
        self.last_emitted_seq() + 1
    }

    /// The terminal kind, if the client already holds the build's terminal
    /// event. Such a connection has nothing left to wait for.
    pub async fn finished_at_checkpoint(&self) -> Result<Option<EventKind>, ReplayError> {
        let last = self.last_emitted_seq();
        if last == 0 {
            return Ok(None);
        }

        let held = self.log.read_from(self.build_id, last - 1, 1).next_page().await?;
        let kind = held
            .and_then(|page| page.into_iter().next())
            .map(|event| event.kind)
            .filter(EventKind::is_terminal);
        if let Some(kind) = kind {
            debug!(build_id = %self.build_id, checkpoint = last, %kind, "client already holds the terminal event");
        }
        Ok(kind)
    }

    /// Stream every committed event after `last_emitted_seq`.
    pub async fn drain(&self) -> Result<Progress, ReplayError> {
        self.catch_up(None).await
    }

    /// Handle one delivery from the live bridge.
    pub async fn on_live(&self, event: &BuildEvent) -> Result<Progress, ReplayError> {
        let last = self.last_emitted_seq();

        if event.seq <= last {
            debug!(build_id = %self.build_id, seq = event.seq, last, "dropping already delivered live event");
            return Ok(Progress::Open);
        }

        if event.seq > last + 1 {
            debug!(
                build_id = %self.build_id,
                seq = event.seq,
                last,
                "live delivery skipped ahead, re-reading gap from log"
            );
            if let Progress::Terminal(kind) = self.catch_up(Some(event.seq)).await? {
                return Ok(Progress::Terminal(kind));
            }
            // The log read already covered this event.
            if event.seq <= self.last_emitted_seq() {
                return Ok(Progress::Open);
            }
        }

        if event.seq != self.last_emitted_seq() + 1 {
            warn!(
                build_id = %self.build_id,
                seq = event.seq,
                last = self.last_emitted_seq(),
                "gap could not be repaired yet, deferring to next resync"
            );
            return Ok(Progress::Open);
        }

        self.deliver(event).await
    }

    /// Re-read any committed tail the bridge failed to deliver.
    pub async fn resync(&self) -> Result<Progress, ReplayError> {
        let latest = self.log.latest_seq(self.build_id).await?;
        if latest > self.last_emitted_seq() {
            debug!(
                build_id = %self.build_id,
                latest,
                last = self.last_emitted_seq(),
                "log is ahead of live delivery, catching up"
            );
            return self.catch_up(None).await;
        }
        Ok(Progress::Open)
    }

    async fn catch_up(&self, until: Option<Seq>) -> Result<Progress, ReplayError> {
        let mut reader = self
            .log
            .read_from(self.build_id, self.last_emitted_seq(), self.page_size);

        while let Some(page) = reader.next_page().await? {
            for event in &page {
                if until.is_some_and(|until| event.seq > until) {
                    return Ok(Progress::Open);
                }
                if let Progress::Terminal(kind) = self.deliver(event).await? {
                    return Ok(Progress::Terminal(kind));
                }
            }
        }
        Ok(Progress::Open)
    }

    async fn deliver(&self, event: &BuildEvent) -> Result<Progress, ReplayError> {
        self.writer.emit(event).await?;
        if event.kind.is_terminal() {
            Ok(Progress::Terminal(event.kind))
        } else {
            Ok(Progress::Open)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::InMemoryLogStore;
    use crate::state::ConnectionId;
    use crate::writer::MemorySink;
    use serde_json::json;

    async fn log_with(build: BuildId, kinds: &[EventKind]) -> EventLog<InMemoryLogStore> {
        let log = EventLog::new(InMemoryLogStore::default());
        for kind in kinds {
            log.append(build, *kind, json!({})).await.unwrap();
        }
        log
    }

    async fn committed(log: &EventLog<InMemoryLogStore>, build: BuildId, seq: Seq) -> BuildEvent {
        log.read_from(build, seq - 1, 1)
            .next_page()
            .await
            .unwrap()
            .unwrap()
            .remove(0)
    }

    fn lines(n: usize) -> Vec<EventKind> {
        vec![EventKind::LogLine; n]
    }

    #[tokio::test]
    async fn drain_replays_everything_after_checkpoint() {
        let build = BuildId::new();
        let log = log_with(build, &lines(5)).await;
        let sink = MemorySink::new();
        let writer = ConnectionWriter::resuming(ConnectionId::new(), build, sink.clone(), 2);
        let coordinator = ReplayCoordinator::new(&log, &writer, build, 2);

        assert_eq!(coordinator.drain().await.unwrap(), Progress::Open);
        assert_eq!(sink.event_seqs(), vec![3, 4, 5]);
        assert_eq!(coordinator.live_floor(), 6);
    }

    #[tokio::test]
    async fn drain_stops_at_terminal_event() {
        let build = BuildId::new();
        let log = log_with(
            build,
            &[EventKind::BuildQueued, EventKind::BuildFailed, EventKind::LogLine],
        )
        .await;
        let sink = MemorySink::new();
        let writer = ConnectionWriter::new(ConnectionId::new(), build, sink.clone());
        let coordinator = ReplayCoordinator::new(&log, &writer, build, 16);

        assert_eq!(
            coordinator.drain().await.unwrap(),
            Progress::Terminal(EventKind::BuildFailed)
        );
        assert_eq!(sink.event_seqs(), vec![1, 2]);
    }

    #[tokio::test]
    async fn live_duplicates_are_ignored() {
        let build = BuildId::new();
        let log = log_with(build, &lines(3)).await;
        let sink = MemorySink::new();
        let writer = ConnectionWriter::new(ConnectionId::new(), build, sink.clone());
        let coordinator = ReplayCoordinator::new(&log, &writer, build, 16);
        coordinator.drain().await.unwrap();

        let again = committed(&log, build, 2).await;
        assert_eq!(coordinator.on_live(&again).await.unwrap(), Progress::Open);
        assert_eq!(sink.event_seqs(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn live_gap_is_repaired_from_the_log() {
        let build = BuildId::new();
        let log = log_with(build, &lines(2)).await;
        let sink = MemorySink::new();
        let writer = ConnectionWriter::new(ConnectionId::new(), build, sink.clone());
        let coordinator = ReplayCoordinator::new(&log, &writer, build, 16);
        coordinator.drain().await.unwrap();

        for _ in 0..4 {
            log.append(build, EventKind::LogLine, json!({})).await.unwrap();
        }

        // Bridge delivered 5 but lost 3 and 4.
        let fifth = committed(&log, build, 5).await;
        coordinator.on_live(&fifth).await.unwrap();
        assert_eq!(sink.event_seqs(), vec![1, 2, 3, 4, 5]);

        let sixth = committed(&log, build, 6).await;
        coordinator.on_live(&sixth).await.unwrap();
        assert_eq!(sink.event_seqs(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn resync_picks_up_undelivered_tail() {
        let build = BuildId::new();
        let log = log_with(build, &lines(1)).await;
        let sink = MemorySink::new();
        let writer = ConnectionWriter::new(ConnectionId::new(), build, sink.clone());
        let coordinator = ReplayCoordinator::new(&log, &writer, build, 16);
        coordinator.drain().await.unwrap();

        log.append(build, EventKind::BuildSucceeded, json!({})).await.unwrap();

        assert_eq!(
            coordinator.resync().await.unwrap(),
            Progress::Terminal(EventKind::BuildSucceeded)
        );
        assert_eq!(sink.event_seqs(), vec![1, 2]);
    }

    #[tokio::test]
    async fn checkpoint_on_terminal_event_is_already_finished() {
        let build = BuildId::new();
        let log = log_with(build, &[EventKind::LogLine, EventKind::BuildFailed]).await;

        for (checkpoint, expected) in [(0, None), (1, None), (2, Some(EventKind::BuildFailed))] {
            let writer = ConnectionWriter::resuming(ConnectionId::new(), build, MemorySink::new(), checkpoint);
            let coordinator = ReplayCoordinator::new(&log, &writer, build, 16);
            assert_eq!(coordinator.finished_at_checkpoint().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn checkpoint_past_tail_resets_to_full_replay() {
        let build = BuildId::new();
        let log = log_with(build, &lines(3)).await;

        assert_eq!(resolve_checkpoint(&log, build, 2).await.unwrap(), 2);
        assert_eq!(resolve_checkpoint(&log, build, 3).await.unwrap(), 3);
        assert_eq!(resolve_checkpoint(&log, build, 9).await.unwrap(), 0);
        assert_eq!(resolve_checkpoint(&log, BuildId::new(), 1).await.unwrap(), 0);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Whatever the bridge does (reorder, duplicate, drop), the
            /// client sees each committed seq after its checkpoint once,
            /// in order.
            #[test]
            fn any_live_interleaving_yields_a_strict_complete_sequence(
                total in 1u64..30,
                checkpoint_pick in 0u64..30,
                deliveries in prop::collection::vec(1u64..30, 0..60),
            ) {
                let checkpoint = checkpoint_pick % (total + 1);
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();

                let emitted = runtime.block_on(async {
                    let build = BuildId::new();
                    let log = log_with(build, &lines(total as usize)).await;
                    let sink = MemorySink::new();
                    let writer = ConnectionWriter::resuming(
                        ConnectionId::new(),
                        build,
                        sink.clone(),
                        checkpoint,
                    );
                    let coordinator = ReplayCoordinator::new(&log, &writer, build, 4);

                    for seq in deliveries.iter().map(|d| (d - 1) % total + 1) {
                        let event = committed(&log, build, seq).await;
                        coordinator.on_live(&event).await.unwrap();
                    }
                    coordinator.resync().await.unwrap();
                    sink.event_seqs()
                });

                prop_assert_eq!(emitted, (checkpoint + 1..=total).collect::<Vec<_>>());
            }
        }
    }
}
