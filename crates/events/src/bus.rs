//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the publish/subscribe hub for [`ExtractionEvent`]s and is
//! shared via `Arc<EventBus>`. Subscribers either take the raw receiver or
//! a [`TopicSubscription`] that only yields events for one topic.

use quantimage_core::job_events::{ExtractionEvent, Topic};
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process fan-out event bus.
///
/// ```rust
/// use quantimage_events::bus::EventBus;
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
/// # drop(rx);
/// ```
pub struct EventBus {
    sender: broadcast::Sender<ExtractionEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest un-consumed messages are dropped
    /// and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// With no active subscribers the event is silently dropped.
    pub fn publish(&self, event: ExtractionEvent) {
        // A SendError only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ExtractionEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events matching a single topic.
    pub fn subscribe_topic(&self, topic: Topic) -> TopicSubscription {
        TopicSubscription {
            topic,
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// TopicSubscription
// ---------------------------------------------------------------------------

/// Outcome of waiting on a [`TopicSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// An event for the subscribed topic.
    Event(ExtractionEvent),
    /// The receiver fell behind and `n` events were dropped. Consumers
    /// should re-read the state they care about.
    Lagged(u64),
}

/// A receiver filtered to one [`Topic`].
pub struct TopicSubscription {
    topic: Topic,
    receiver: broadcast::Receiver<ExtractionEvent>,
}

impl TopicSubscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next matching event.
    ///
    /// Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.matches(&self.topic) => return Some(Delivery::Event(event)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(topic = %self.topic, skipped = n, "Topic subscription lagged");
                    return Some(Delivery::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
