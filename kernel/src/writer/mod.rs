// Connection Writer
//
// The single point of output for a connection. Event, heartbeat and
// error frames are written under one async lock, so two logical frames
// never interleave on the wire. The lock covers one frame write only.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::error;

use crate::frame::{self, ErrorFrame, Frame, FrameError};
use crate::invariants::{EmitCursor, InvariantEngine, InvariantViolation};
use crate::log::{BuildEvent, BuildId, Seq};
use crate::state::ConnectionId;

mod sink;

pub use sink::{ChannelSink, FrameSink, MemorySink, SinkClosed, WriteSink};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// The frame would break a stream invariant. The connection is aborted.
    #[error(transparent)]
    Violation(#[from] InvariantViolation),

    /// The client went away.
    #[error("client disconnected")]
    Closed,

    /// An earlier failure already aborted this writer.
    #[error("writer aborted")]
    Aborted,

    /// The terminal event was already written.
    #[error("stream already finished")]
    Finished,

    #[error(transparent)]
    Encode(#[from] FrameError),
}

struct WriterInner<K> {
    sink: K,
    invariants: InvariantEngine,
    last_emitted_seq: Seq,
    aborted: bool,
    /// Set once a terminal event is on the wire.
    finished: bool,
}

pub struct ConnectionWriter<K: FrameSink> {
    connection_id: ConnectionId,
    build_id: BuildId,
    inner: Mutex<WriterInner<K>>,
    // Mirror of `inner.last_emitted_seq`, readable without the lock.
    last_emitted: AtomicU64,
}

impl<K: FrameSink> ConnectionWriter<K> {
    pub fn new(connection_id: ConnectionId, build_id: BuildId, sink: K) -> Self {
        Self::resuming(connection_id, build_id, sink, 0)
    }

    /// Writer for a client that already holds every event up to `checkpoint`.
    pub fn resuming(connection_id: ConnectionId, build_id: BuildId, sink: K, checkpoint: Seq) -> Self {
        Self {
            connection_id,
            build_id,
            inner: Mutex::new(WriterInner {
                sink,
                invariants: InvariantEngine::for_stream(),
                last_emitted_seq: checkpoint,
                aborted: false,
                finished: false,
            }),
            last_emitted: AtomicU64::new(checkpoint),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Highest `seq` actually written to the client.
    pub fn last_emitted_seq(&self) -> Seq {
        self.last_emitted.load(Ordering::Acquire)
    }

    /// Write one event frame.
    ///
    /// Rejects (and aborts the connection on) any event that does not
    /// advance past `last_emitted_seq`.
    pub async fn emit(&self, event: &BuildEvent) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().await;
        Self::check_open(&inner)?;

        let cursor = EmitCursor {
            build_id: self.build_id,
            last_emitted_seq: inner.last_emitted_seq,
        };
        if let Err(violation) = inner.invariants.evaluate(&cursor, event) {
            error!(
                connection_id = %self.connection_id,
                build_id = %self.build_id,
                seq = event.seq,
                last_emitted_seq = cursor.last_emitted_seq,
                %violation,
                "refusing frame, aborting connection"
            );
            inner.aborted = true;
            return Err(violation.into());
        }

        let bytes = frame::encode_event(event)?;
        Self::send(&mut inner, bytes).await?;

        inner.last_emitted_seq = event.seq;
        inner.finished = event.kind.is_terminal();
        self.last_emitted.store(event.seq, Ordering::Release);
        Ok(())
    }

    /// Write a keep-alive frame. Never carries or advances a `seq`.
    ///
    /// A no-op once the terminal event is written, so it always stays the
    /// last frame.
    pub async fn emit_heartbeat(&self) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().await;
        if inner.finished {
            return Ok(());
        }
        Self::check_open(&inner)?;
        Self::send(&mut inner, frame::heartbeat()).await
    }

    /// Write a final error frame and stop accepting output.
    pub async fn emit_error(&self, error: ErrorFrame) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().await;
        Self::check_open(&inner)?;
        let bytes = Frame::Error(error).encode()?;
        let result = Self::send(&mut inner, bytes).await;
        inner.aborted = true;
        result
    }

    pub async fn is_aborted(&self) -> bool {
        self.inner.lock().await.aborted
    }

    fn check_open(inner: &WriterInner<K>) -> Result<(), WriteError> {
        if inner.aborted {
            Err(WriteError::Aborted)
        } else if inner.finished {
            Err(WriteError::Finished)
        } else {
            Ok(())
        }
    }

    async fn send(inner: &mut WriterInner<K>, bytes: Bytes) -> Result<(), WriteError> {
        if inner.sink.send(bytes).await.is_err() {
            inner.aborted = true;
            return Err(WriteError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EventKind;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn event(build_id: BuildId, seq: Seq) -> BuildEvent {
        BuildEvent {
            build_id,
            seq,
            kind: EventKind::LogLine,
            payload: json!({ "line": format!("step {seq}") }),
            occurred_at: Utc::now(),
        }
    }

    fn writer(build: BuildId) -> (ConnectionWriter<MemorySink>, MemorySink) {
        let sink = MemorySink::new();
        (
            ConnectionWriter::new(ConnectionId::new(), build, sink.clone()),
            sink,
        )
    }

    #[tokio::test]
    async fn emit_advances_last_emitted_seq() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);

        writer.emit(&event(build, 1)).await.unwrap();
        writer.emit(&event(build, 2)).await.unwrap();

        assert_eq!(writer.last_emitted_seq(), 2);
        assert_eq!(sink.event_seqs(), vec![1, 2]);
    }

    #[tokio::test]
    async fn heartbeat_does_not_touch_seq() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);

        writer.emit(&event(build, 1)).await.unwrap();
        writer.emit_heartbeat().await.unwrap();

        assert_eq!(writer.last_emitted_seq(), 1);
        let seqs: Vec<Option<Seq>> = sink.frames().iter().map(Frame::seq).collect();
        assert_eq!(seqs, vec![Some(1), None]);
        assert_eq!(sink.frames()[1], Frame::Heartbeat);
    }

    #[tokio::test]
    async fn non_monotonic_emit_aborts_the_connection() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);

        writer.emit(&event(build, 1)).await.unwrap();
        writer.emit(&event(build, 2)).await.unwrap();

        let err = writer.emit(&event(build, 2)).await.unwrap_err();
        assert!(matches!(err, WriteError::Violation(ref v) if v.invariant == "monotonic-seq"));

        // Nothing further reaches the client.
        assert!(matches!(
            writer.emit(&event(build, 3)).await,
            Err(WriteError::Aborted)
        ));
        assert!(matches!(
            writer.emit_heartbeat().await,
            Err(WriteError::Aborted)
        ));
        assert!(writer.is_aborted().await);
        assert_eq!(sink.event_seqs(), vec![1, 2]);
        assert_eq!(writer.last_emitted_seq(), 2);
    }

    #[tokio::test]
    async fn resumed_writer_refuses_events_the_client_has() {
        let build = BuildId::new();
        let sink = MemorySink::new();
        let writer = ConnectionWriter::resuming(ConnectionId::new(), build, sink.clone(), 3);

        assert!(matches!(
            writer.emit(&event(build, 3)).await,
            Err(WriteError::Violation(_))
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn closed_sink_reports_disconnect() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);
        sink.close();

        assert!(matches!(
            writer.emit(&event(build, 1)).await,
            Err(WriteError::Closed)
        ));
        assert_eq!(writer.last_emitted_seq(), 0);
    }

    #[tokio::test]
    async fn error_frame_is_final() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);

        writer
            .emit_error(ErrorFrame {
                code: "log_unavailable".into(),
                message: "store offline".into(),
                retryable: true,
            })
            .await
            .unwrap();

        assert!(matches!(
            writer.emit(&event(build, 1)).await,
            Err(WriteError::Aborted)
        ));
        assert!(matches!(sink.frames().as_slice(), [Frame::Error(e)] if e.retryable));
    }

    #[tokio::test]
    async fn terminal_event_is_the_last_frame() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);

        writer.emit(&event(build, 1)).await.unwrap();
        let terminal = BuildEvent {
            kind: EventKind::BuildSucceeded,
            ..event(build, 2)
        };
        writer.emit(&terminal).await.unwrap();

        writer.emit_heartbeat().await.unwrap();
        assert!(matches!(
            writer.emit(&event(build, 3)).await,
            Err(WriteError::Finished)
        ));
        assert!(matches!(sink.frames().last(), Some(Frame::Event(e)) if e.seq == 2));
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_heartbeats_never_split_event_frames() {
        let build = BuildId::new();
        let (writer, sink) = writer(build);
        let writer = Arc::new(writer);

        let beats = {
            let writer = Arc::clone(&writer);
            tokio::spawn(async move {
                for _ in 0..200 {
                    writer.emit_heartbeat().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for seq in 1..=200 {
            writer.emit(&event(build, seq)).await.unwrap();
            tokio::task::yield_now().await;
        }
        beats.await.unwrap();

        let frames = sink.frames();
        assert_eq!(frames.len(), 400);
        assert_eq!(sink.event_seqs(), (1..=200).collect::<Vec<_>>());
    }
}
