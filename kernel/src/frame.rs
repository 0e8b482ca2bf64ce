// Wire Frames
//
// Server-sent-events text framing for build streams:
//
//   id: <seq>
//   event: <kind>
//   data: <json BuildEvent>
//
// Heartbeats are SSE comments and carry no id. Each frame ends with a
// blank line.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::{BuildEvent, Seq};

const HEARTBEAT: &str = ": heartbeat\n\n";
const ERROR_EVENT: &str = "error";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to serialize frame data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("invalid last event id: {0:?}")]
    InvalidLastEventId(String),
}

/// Body of a terminal error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
    /// Whether reconnecting with the last seen id can succeed.
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(BuildEvent),
    Heartbeat,
    Error(ErrorFrame),
}

impl Frame {
    /// The frame identifier, if it has one. Only events do.
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Frame::Event(event) => Some(event.seq),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        match self {
            Frame::Event(event) => encode_event(event),
            Frame::Heartbeat => Ok(heartbeat()),
            Frame::Error(error) => Ok(Bytes::from(format!(
                "event: {ERROR_EVENT}\ndata: {}\n\n",
                serde_json::to_string(error)?
            ))),
        }
    }

    /// Parse a single frame (with or without its trailing blank line).
    pub fn decode(text: &str) -> Result<Frame, FrameError> {
        let mut id = None;
        let mut event = None;
        let mut data = None;
        let mut comment = false;

        for line in text.lines().filter(|l| !l.is_empty()) {
            if line.starts_with(':') {
                comment = true;
                continue;
            }
            let (field, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::Malformed(format!("line without field: {line:?}")))?;
            let value = value.strip_prefix(' ').unwrap_or(value);
            match field {
                "id" => id = Some(value),
                "event" => event = Some(value),
                "data" => data = Some(value),
                _ => {}
            }
        }

        match (id, event, data) {
            (None, None, None) if comment => Ok(Frame::Heartbeat),
            (None, Some(ERROR_EVENT), Some(data)) => Ok(Frame::Error(serde_json::from_str(data)?)),
            (Some(id), _, Some(data)) => {
                let event: BuildEvent = serde_json::from_str(data)?;
                if id != event.seq.to_string() {
                    return Err(FrameError::Malformed(format!(
                        "frame id {id} does not match seq {}",
                        event.seq
                    )));
                }
                Ok(Frame::Event(event))
            }
            _ => Err(FrameError::Malformed(format!("unrecognized frame: {text:?}"))),
        }
    }
}

/// Encode an event frame without taking ownership of the event.
pub fn encode_event(event: &BuildEvent) -> Result<Bytes, FrameError> {
    Ok(Bytes::from(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.seq,
        event.kind,
        serde_json::to_string(event)?
    )))
}

pub fn heartbeat() -> Bytes {
    Bytes::from_static(HEARTBEAT.as_bytes())
}

/// Split an SSE capture into individual frames.
pub fn split_frames(capture: &str) -> impl Iterator<Item = &str> {
    capture.split("\n\n").filter(|chunk| !chunk.trim().is_empty())
}

/// Parse the resume checkpoint a reconnecting client sends.
///
/// A missing or empty value is a fresh connection (checkpoint 0).
pub fn parse_last_event_id(value: Option<&str>) -> Result<Seq, FrameError> {
    match value.map(str::trim) {
        None | Some("") => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| FrameError::InvalidLastEventId(raw.to_string())),
    }
}
