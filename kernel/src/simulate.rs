// End-to-End Stream Simulation
//
// Runs the full streaming path in memory:
// pipeline -> log -> gate -> replay -> bridge -> writer -> captured frames.
// Also checks a captured SSE transcript the way a client would.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::acl::StaticAcl;
use crate::bridge::LiveBridge;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::frame::{split_frames, ErrorFrame, Frame, FrameError};
use crate::log::{BuildId, EventKind, EventLog, InMemoryLogStore, LogError, Seq};
use crate::pipeline::BuildEmitter;
use crate::stream::{StreamOutcome, StreamRequest, StreamService};
use crate::writer::MemorySink;

/// One event the scripted pipeline reports.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedEvent {
    pub build_id: BuildId,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Pipeline activity around one client connection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineScript {
    /// Committed before the client connects.
    pub history: Vec<ScriptedEvent>,
    /// Committed once the client is live.
    pub live: Vec<ScriptedEvent>,
}

impl PipelineScript {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug)]
pub struct SimulationResult {
    pub outcome: Result<StreamOutcome, StreamError>,
    /// Raw SSE text the client would have received.
    pub capture: String,
    pub frames: Vec<Frame>,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("pipeline emit failed: {0}")]
    Emit(#[from] LogError),
}

/// Run one scripted connection.
///
/// The stream is cancelled `idle_timeout` after the last live event if
/// the build never reaches a terminal event.
pub async fn simulate_stream(
    script: &PipelineScript,
    acl: StaticAcl,
    request: StreamRequest,
    config: StreamConfig,
    idle_timeout: Duration,
) -> Result<SimulationResult, SimulationError> {
    let log = Arc::new(EventLog::with_retry_budget(
        InMemoryLogStore::default(),
        config.cas_retry_budget,
    ));
    let bridge = Arc::new(LiveBridge::from_config(&config));
    let emitter = BuildEmitter::new(Arc::clone(&log), Arc::clone(&bridge), config.append_retry.clone());
    let service = StreamService::new(Arc::clone(&log), Arc::clone(&bridge), acl, config);

    for event in &script.history {
        emitter.emit(event.build_id, event.kind, event.payload.clone()).await?;
    }

    let build_id = request.build_id;
    let sink = MemorySink::new();
    let cancel = CancellationToken::new();

    let serve = service.serve(request, sink.clone(), cancel.clone());
    let drive = async {
        let live = async {
            while bridge.subscriber_count(build_id) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        // A connection that never goes live still gets the script; resync
        // or the next reconnect picks it up from the log.
        if tokio::time::timeout(idle_timeout, live).await.is_err() {
            debug!(%build_id, ?idle_timeout, "stream never went live, emitting live script anyway");
        }

        for event in &script.live {
            emitter.emit(event.build_id, event.kind, event.payload.clone()).await?;
        }
        tokio::time::sleep(idle_timeout).await;
        cancel.cancel();
        Ok::<(), SimulationError>(())
    };
    tokio::pin!(serve, drive);

    let mut driving = true;
    let outcome = loop {
        tokio::select! {
            outcome = &mut serve => break outcome,
            driven = &mut drive, if driving => {
                driving = false;
                driven?;
            }
        }
    };

    let capture = sink.text();
    let frames = sink.frames();
    Ok(SimulationResult {
        outcome,
        capture,
        frames,
    })
}

/// What a client learned from one SSE capture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureReport {
    pub events: usize,
    pub heartbeats: usize,
    pub first_seq: Option<Seq>,
    /// The `last-event-id` to send on reconnect.
    pub resume_from: Option<Seq>,
    pub terminal: Option<EventKind>,
    pub error: Option<ErrorFrame>,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("frame {index} does not parse: {source}")]
    Malformed {
        index: usize,
        #[source]
        source: FrameError,
    },

    #[error("frame {index} has id {seq} after {previous}")]
    OutOfOrder { index: usize, previous: Seq, seq: Seq },

    #[error("frame {index} follows the terminal event")]
    AfterTerminal { index: usize },
}

/// Decode a capture and check ids are strictly increasing.
pub fn verify_capture(capture: &str) -> Result<CaptureReport, CaptureError> {
    let mut report = CaptureReport::default();

    for (index, chunk) in split_frames(capture).enumerate() {
        let frame = Frame::decode(chunk).map_err(|source| CaptureError::Malformed { index, source })?;

        match frame {
            Frame::Heartbeat => report.heartbeats += 1,
            Frame::Error(error) => report.error = Some(error),
            Frame::Event(event) => {
                if report.terminal.is_some() {
                    return Err(CaptureError::AfterTerminal { index });
                }
                if let Some(previous) = report.resume_from {
                    if event.seq <= previous {
                        return Err(CaptureError::OutOfOrder {
                            index,
                            previous,
                            seq: event.seq,
                        });
                    }
                }
                report.first_seq.get_or_insert(event.seq);
                report.resume_from = Some(event.seq);
                report.events += 1;
                if event.kind.is_terminal() {
                    report.terminal = Some(event.kind);
                }
            }
        }
    }

    Ok(report)
}
