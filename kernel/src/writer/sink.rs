// Frame Sinks
//
// Where a connection writer's bytes go. A failed send means the client
// is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::frame::{split_frames, Frame};
use crate::log::Seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame sink closed")]
pub struct SinkClosed;

/// Destination for encoded frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Deliver one complete frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed>;
}

/// Hands frames to a transport task over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.sender.send(frame).await.map_err(|_| SinkClosed)
    }
}

/// Writes frames straight to an async byte stream, flushing each one.
#[derive(Debug)]
pub struct WriteSink<W> {
    writer: W,
}

impl<W> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + Sync> FrameSink for WriteSink<W> {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.writer.write_all(&frame).await.map_err(|_| SinkClosed)?;
        self.writer.flush().await.map_err(|_| SinkClosed)
    }
}

/// Collects frames in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the client hanging up.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Everything written so far, as one SSE capture.
    pub fn text(&self) -> String {
        self.frames
            .lock()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes))
            .collect()
    }

    /// Decoded frames, skipping anything that fails to parse.
    pub fn frames(&self) -> Vec<Frame> {
        let text = self.text();
        split_frames(&text)
            .filter_map(|chunk| Frame::decode(chunk).ok())
            .collect()
    }

    /// `seq` of every event frame, in write order.
    pub fn event_seqs(&self) -> Vec<Seq> {
        self.frames().iter().filter_map(Frame::seq).collect()
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkClosed);
        }
        self.frames.lock().push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::heartbeat;

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (mut sink, mut receiver) = ChannelSink::channel(4);
        sink.send(heartbeat()).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), heartbeat());

        drop(receiver);
        assert_eq!(sink.send(heartbeat()).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn write_sink_writes_whole_frames() {
        let mut sink = WriteSink::new(Vec::new());
        sink.send(heartbeat()).await.unwrap();
        sink.send(heartbeat()).await.unwrap();
        assert_eq!(sink.into_inner(), b": heartbeat\n\n: heartbeat\n\n".to_vec());
    }

    #[tokio::test]
    async fn memory_sink_clones_share_frames() {
        let sink = MemorySink::new();
        let mut writer_side = sink.clone();
        writer_side.send(heartbeat()).await.unwrap();
        assert_eq!(sink.frames(), vec![Frame::Heartbeat]);

        sink.close();
        assert!(writer_side.send(heartbeat()).await.is_err());
        assert_eq!(sink.len(), 1);
    }
}
