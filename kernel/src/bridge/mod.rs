// Live Bridge
//
// Fans newly committed events out to every subscriber of a build.
// Delivery is best-effort: a full subscriber buffer drops the event for
// that subscriber only. Ordering truth stays with the event log; the
// replay coordinator repairs whatever the bridge misses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::config::StreamConfig;
use crate::log::{BuildEvent, BuildId, Seq};

/// Counter for generating unique subscriber IDs
static SUBSCRIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("maximum subscribers reached for build {build_id} ({max})")]
    MaxSubscribers { build_id: BuildId, max: usize },

    #[error("live feed for build {build_id} closed")]
    Closed { build_id: BuildId },
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    /// Lowest `seq` this subscriber wants.
    floor: Seq,
    sender: mpsc::Sender<Arc<BuildEvent>>,
}

impl Subscriber {
    #[inline]
    fn wants(&self, seq: Seq) -> bool {
        seq >= self.floor
    }

    #[inline]
    fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// In-process fan-out keyed by build.
#[derive(Debug)]
pub struct LiveBridge {
    subscribers: RwLock<HashMap<BuildId, Vec<Subscriber>>>,
    buffer: usize,
    max_per_build: usize,
    dropped: AtomicU64,
}

impl LiveBridge {
    pub fn new(buffer: usize, max_per_build: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
            max_per_build,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.subscriber_buffer, config.max_subscribers_per_build)
    }

    /// Subscribe to events of `build_id` with `seq >= from_seq`.
    ///
    /// The returned subscription unsubscribes itself when dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        build_id: BuildId,
        from_seq: Seq,
    ) -> Result<Subscription, BridgeError> {
        let mut subscribers = self.subscribers.write();
        let build_subscribers = subscribers.entry(build_id).or_default();

        if build_subscribers.len() >= self.max_per_build {
            let max = self.max_per_build;
            if build_subscribers.is_empty() {
                subscribers.remove(&build_id);
            }
            return Err(BridgeError::MaxSubscribers { build_id, max });
        }

        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = SUBSCRIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        build_subscribers.push(Subscriber {
            id,
            floor: from_seq,
            sender,
        });

        debug!(%build_id, subscriber_id = id, from_seq, "live subscription opened");

        Ok(Subscription {
            id,
            build_id,
            receiver,
            bridge: Arc::clone(self),
            released: false,
        })
    }

    /// Remove a subscriber. Idempotent: returns whether anything was removed.
    pub fn unsubscribe(&self, build_id: BuildId, id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(build_subscribers) = subscribers.get_mut(&build_id) else {
            return false;
        };

        let original_len = build_subscribers.len();
        build_subscribers.retain(|s| s.id != id);
        let removed = build_subscribers.len() != original_len;

        if build_subscribers.is_empty() {
            subscribers.remove(&build_id);
        }
        if removed {
            debug!(%build_id, subscriber_id = id, "live subscription closed");
        }
        removed
    }

    /// Deliver a committed event to every interested subscriber.
    ///
    /// Returns the number of subscribers that accepted the event.
    pub fn publish(&self, event: &BuildEvent) -> usize {
        let subscribers = self.subscribers.read();
        let Some(build_subscribers) = subscribers.get(&event.build_id) else {
            return 0;
        };

        let event = Arc::new(event.clone());
        let mut sent_count = 0;

        for subscriber in build_subscribers.iter().filter(|s| s.wants(event.seq)) {
            match subscriber.sender.try_send(Arc::clone(&event)) {
                Ok(()) => sent_count += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        build_id = %event.build_id,
                        seq = event.seq,
                        subscriber_id = subscriber.id,
                        "subscriber buffer full, delivery dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        sent_count
    }

    pub fn subscriber_count(&self, build_id: BuildId) -> usize {
        self.subscribers
            .read()
            .get(&build_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliveries dropped on full buffers since start.
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Clean up subscribers whose receivers are gone.
    pub fn cleanup_disconnected(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        let mut removed = 0;
        subscribers.retain(|_, build_subscribers| {
            let original_len = build_subscribers.len();
            build_subscribers.retain(Subscriber::is_connected);
            removed += original_len - build_subscribers.len();
            !build_subscribers.is_empty()
        });
        removed
    }
}

impl Default for LiveBridge {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

/// Receiving half of one live subscription.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    build_id: BuildId,
    receiver: mpsc::Receiver<Arc<BuildEvent>>,
    bridge: Arc<LiveBridge>,
    released: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    /// Next delivered event, `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<BuildEvent>> {
        self.receiver.recv().await
    }

    /// Release the bridge registration. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.released {
            self.released = true;
            self.bridge.unsubscribe(self.build_id, self.id);
            self.receiver.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
