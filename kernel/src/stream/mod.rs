// Build Stream Service
//
// One task per client connection:
// authorize -> replay history -> subscribe live -> tail until terminal.
// Heartbeats run beside it on the same connection writer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AccessControl, AuthorizationGate, CallerIdentity, Decision};
use crate::bridge::{BridgeError, LiveBridge};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::frame::parse_last_event_id;
use crate::log::{BuildId, EventKind, EventLog, EventLogStore, Seq};
use crate::replay::{resolve_checkpoint, Progress, ReplayCoordinator, ReplayError};
use crate::state::{CloseReason, Connection, StateError, Transition};
use crate::writer::{ConnectionWriter, FrameSink, WriteError};

/// A client's request to stream one build.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub build_id: BuildId,
    pub caller: CallerIdentity,
    /// Resume header sent on reconnect, verbatim.
    pub last_event_id: Option<String>,
}

impl StreamRequest {
    pub fn new(build_id: BuildId, caller: CallerIdentity) -> Self {
        Self {
            build_id,
            caller,
            last_event_id: None,
        }
    }

    pub fn resuming_after(mut self, last_event_id: impl Into<String>) -> Self {
        self.last_event_id = Some(last_event_id.into());
        self
    }
}

/// How a stream that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Terminal build event delivered, stream closed cleanly.
    Completed { last_seq: Seq, terminal: EventKind },
    /// The server side cancelled the connection.
    Cancelled { last_seq: Seq },
    /// The client went away.
    Disconnected { last_seq: Seq },
}

enum Exit {
    Terminal(EventKind),
    Interrupted,
    Disconnected,
}

enum RunError {
    Replay(ReplayError),
    Stream(StreamError),
}

impl From<ReplayError> for RunError {
    fn from(err: ReplayError) -> Self {
        RunError::Replay(err)
    }
}

impl From<StreamError> for RunError {
    fn from(err: StreamError) -> Self {
        RunError::Stream(err)
    }
}

impl From<BridgeError> for RunError {
    fn from(err: BridgeError) -> Self {
        RunError::Stream(err.into())
    }
}

impl From<StateError> for RunError {
    fn from(err: StateError) -> Self {
        RunError::Stream(err.into())
    }
}

pub struct StreamService<S: EventLogStore, A: AccessControl> {
    log: Arc<EventLog<S>>,
    bridge: Arc<LiveBridge>,
    gate: AuthorizationGate<A>,
    config: StreamConfig,
}

impl<S: EventLogStore, A: AccessControl> StreamService<S, A> {
    pub fn new(log: Arc<EventLog<S>>, bridge: Arc<LiveBridge>, acl: A, config: StreamConfig) -> Self {
        Self {
            log,
            bridge,
            gate: AuthorizationGate::new(acl),
            config,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Serve one connection until a terminal event, an error, or cancellation.
    ///
    /// `cancel` is fired by the transport when the client disconnects or
    /// the server shuts down; every outstanding read and the live
    /// subscription are released when it fires.
    pub async fn serve<K: FrameSink + 'static>(
        &self,
        request: StreamRequest,
        sink: K,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome, StreamError> {
        let requested = match parse_last_event_id(request.last_event_id.as_deref()) {
            Ok(seq) => seq,
            Err(e) => {
                warn!(build_id = %request.build_id, error = %e, "unusable resume id, replaying from start");
                0
            }
        };

        let mut connection = Connection::accept(request.build_id, request.caller, requested);
        let build_id = connection.build_id;
        info!(
            connection_id = %connection.id,
            %build_id,
            caller = connection.caller.subject(),
            checkpoint = requested,
            "stream requested"
        );

        let decision = until_cancelled(&cancel, self.gate.authorize(&connection.caller, build_id)).await;
        match decision {
            None => {
                connection.advance(Transition::Close(CloseReason::Cancelled))?;
                return Ok(StreamOutcome::Cancelled { last_seq: requested });
            }
            Some(Decision::Denied(_)) => {
                connection.advance(Transition::Close(CloseReason::Denied))?;
                return Err(StreamError::AuthorizationDenied);
            }
            Some(Decision::Authorized(_)) => connection.advance(Transition::Authorized)?,
        }

        let checkpoint = match until_cancelled(&cancel, resolve_checkpoint(&*self.log, build_id, requested)).await {
            None => {
                connection.advance(Transition::Close(CloseReason::Cancelled))?;
                return Ok(StreamOutcome::Cancelled { last_seq: requested });
            }
            Some(Err(e)) => {
                let err = StreamError::from(e);
                warn!(connection_id = %connection.id, %build_id, error = %err, "stream failed before replay");
                let writer = ConnectionWriter::resuming(connection.id, build_id, sink, requested);
                if let Err(e) = writer.emit_error(err.to_error_frame()).await {
                    debug!(connection_id = %connection.id, error = %e, "error frame not delivered");
                }
                connection.advance(Transition::Close(CloseReason::Failed))?;
                return Err(err);
            }
            Some(Ok(checkpoint)) => checkpoint,
        };
        connection.checkpoint = checkpoint;

        let writer = Arc::new(ConnectionWriter::resuming(connection.id, build_id, sink, checkpoint));
        let session = cancel.child_token();
        let heartbeats = spawn_heartbeats(
            Arc::clone(&writer),
            self.config.heartbeat_interval(),
            session.clone(),
        );

        let result = self.run(&mut connection, &writer, &session).await;

        session.cancel();
        if let Err(e) = heartbeats.await {
            warn!(connection_id = %connection.id, error = %e, "heartbeat task failed");
        }

        let last_seq = writer.last_emitted_seq();
        let exit = match result {
            Ok(exit) => Ok(exit),
            Err(RunError::Replay(ReplayError::Write(WriteError::Closed | WriteError::Aborted))) => {
                Ok(Exit::Disconnected)
            }
            Err(RunError::Replay(ReplayError::Write(e))) => Err(StreamError::ProtocolViolation(e.to_string())),
            Err(RunError::Replay(ReplayError::Log(e))) => Err(e.into()),
            Err(RunError::Stream(e)) => Err(e),
        };

        let (reason, outcome) = match exit {
            Ok(Exit::Terminal(terminal)) => (
                CloseReason::Terminal,
                Ok(StreamOutcome::Completed { last_seq, terminal }),
            ),
            Ok(Exit::Interrupted) if cancel.is_cancelled() => {
                (CloseReason::Cancelled, Ok(StreamOutcome::Cancelled { last_seq }))
            }
            Ok(Exit::Interrupted | Exit::Disconnected) => {
                (CloseReason::Disconnected, Ok(StreamOutcome::Disconnected { last_seq }))
            }
            Err(err) => {
                warn!(
                    connection_id = %connection.id,
                    %build_id,
                    last_seq,
                    code = err.code(),
                    error = %err,
                    "stream failed"
                );
                // A writer aborted by an invariant violation refuses this too.
                if let Err(e) = writer.emit_error(err.to_error_frame()).await {
                    debug!(connection_id = %connection.id, error = %e, "error frame not delivered");
                }
                (CloseReason::Failed, Err(err))
            }
        };

        connection.advance(Transition::Close(reason))?;
        info!(connection_id = %connection.id, %build_id, last_seq, ?reason, "stream closed");
        outcome
    }

    async fn run<K: FrameSink>(
        &self,
        connection: &mut Connection,
        writer: &ConnectionWriter<K>,
        session: &CancellationToken,
    ) -> Result<Exit, RunError> {
        let build_id = connection.build_id;
        let coordinator = ReplayCoordinator::new(&*self.log, writer, build_id, self.config.replay_page_size);

        // A reconnect after the terminal event closes without going live.
        match until_cancelled(session, coordinator.finished_at_checkpoint()).await {
            None => return Ok(Exit::Interrupted),
            Some(finished) => {
                if let Some(kind) = finished? {
                    return Ok(Exit::Terminal(kind));
                }
            }
        }

        // History first. Nothing live is accepted until it is exhausted.
        match until_cancelled(session, coordinator.drain()).await {
            None => return Ok(Exit::Interrupted),
            Some(progress) => {
                if let Progress::Terminal(kind) = progress? {
                    return Ok(Exit::Terminal(kind));
                }
            }
        }

        // Pin the live floor to this connection's own replay endpoint,
        // then pick up anything committed between drain and subscribe.
        let mut subscription = self.bridge.subscribe(build_id, coordinator.live_floor())?;
        match until_cancelled(session, coordinator.drain()).await {
            None => return Ok(Exit::Interrupted),
            Some(progress) => {
                if let Progress::Terminal(kind) = progress? {
                    return Ok(Exit::Terminal(kind));
                }
            }
        }

        connection.advance(Transition::HistoryDrained)?;
        debug!(
            connection_id = %connection.id,
            %build_id,
            replayed_through = coordinator.last_emitted_seq(),
            "stream is live"
        );

        let period = self.config.heartbeat_interval();
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                _ = session.cancelled() => return Ok(Exit::Interrupted),
                delivery = subscription.recv() => match delivery {
                    Some(event) => until_cancelled(session, coordinator.on_live(&event)).await,
                    None => return Err(BridgeError::Closed { build_id }.into()),
                },
                _ = resync.tick() => until_cancelled(session, coordinator.resync()).await,
            };

            match step {
                None => return Ok(Exit::Interrupted),
                Some(progress) => {
                    if let Progress::Terminal(kind) = progress? {
                        return Ok(Exit::Terminal(kind));
                    }
                }
            }
        }
    }
}

async fn until_cancelled<F: Future>(token: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        output = future => Some(output),
    }
}

/// Keep-alive frames on their own task. A failed write means the client
/// is gone, which ends the whole session.
fn spawn_heartbeats<K: FrameSink + 'static>(
    writer: Arc<ConnectionWriter<K>>,
    period: Duration,
    session: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = writer.emit_heartbeat().await {
                        debug!(connection_id = %writer.connection_id(), error = %e, "heartbeat failed, ending session");
                        session.cancel();
                        break;
                    }
                }
            }
        }
    })
}
