use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::{trace, warn};

use crate::serial::SerialMessage;

/// Something that happened to the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A device was connected.
    Connected,

    /// The device is no longer connected.
    Disconnected,

    /// Something went wrong with the session.
    ErrorOccurred(String),
}

impl Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::Connected => write!(f, "connected"),
            LifecycleEvent::Disconnected => write!(f, "disconnected"),
            LifecycleEvent::ErrorOccurred(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// A lifecycle event and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampedEvent {
    /// The event.
    pub inner: LifecycleEvent,

    /// When the event happened.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TimestampedEvent {
    /// Stamp an event with the current time.
    pub fn new(event: LifecycleEvent) -> Self {
        Self {
            inner: event,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Display for TimestampedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S%.3f"), self.inner)
    }
}

/// A named broadcast channel.
///
/// Messages go to whoever is subscribed at the time of publishing, and are not kept around.
#[derive(Debug, Clone)]
pub struct Topic<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// A topic where each subscriber may lag at most `capacity` messages behind.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { name, tx }
    }

    /// The name of this topic.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Send a message to all current subscribers.
    /// Returns how many subscribers there were, possibly zero.
    pub fn publish(&self, message: T) -> usize {
        match self.tx.send(message) {
            Ok(receivers) => {
                trace!(topic = self.name, receivers, "Published");
                receivers
            }
            Err(_) => {
                trace!(topic = self.name, "Published to nobody");
                0
            }
        }
    }

    /// Receive messages published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            topic: self.name,
            rx: self.tx.subscribe(),
        }
    }

    /// How many subscribers are attached right now.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receives messages from a [`Topic`].
#[derive(Debug)]
pub struct Subscription<T> {
    topic: &'static str,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Wait for the next message.
    ///
    /// If this subscriber fell behind, the oldest messages are skipped.
    /// `None` means the topic is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = self.topic, skipped, "Subscriber lagging, messages lost");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(topic = self.topic, skipped, "Subscriber lagging, messages lost");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Receive messages as a stream.
    /// Lag is logged and skipped over.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin {
        let topic = self.topic;

        BroadcastStream::new(self.rx).filter_map(move |message| match message {
            Ok(message) => Some(message),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(topic, skipped, "Subscriber lagging, messages lost");
                None
            }
        })
    }
}

/// The two topics a session publishes to.
#[derive(Debug, Clone)]
pub struct EventBus {
    logs: Topic<SerialMessage>,
    events: Topic<TimestampedEvent>,
}

impl EventBus {
    /// Create the bus, see [`Topic::new`] regarding capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: Topic::new("log-data", capacity),
            events: Topic::new("lifecycle-events", capacity),
        }
    }

    /// Publish a line of device output.
    pub fn publish_log(&self, line: SerialMessage) -> usize {
        self.logs.publish(line)
    }

    /// Publish a lifecycle event, stamped with the current time.
    pub fn publish_event(&self, event: LifecycleEvent) -> usize {
        self.events.publish(TimestampedEvent::new(event))
    }

    /// Receive device output from now on.
    pub fn subscribe_logs(&self) -> Subscription<SerialMessage> {
        self.logs.subscribe()
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe_events(&self) -> Subscription<TimestampedEvent> {
        self.events.subscribe()
    }

    pub(crate) fn logs(&self) -> &Topic<SerialMessage> {
        &self.logs
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn subscriber_gets_one_copy() {
        let bus = EventBus::new(16);
        let mut logs = bus.subscribe_logs();

        assert_eq!(bus.publish_log("hello".into()), 1);

        assert_eq!(logs.recv().await, Some("hello".into()));
        assert_eq!(logs.try_recv(), None);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_messages() {
        let bus = EventBus::new(16);

        bus.publish_log("before".into());
        let mut logs = bus.subscribe_logs();
        bus.publish_log("after".into());

        assert_eq!(logs.recv().await, Some("after".into()));
        assert_eq!(logs.try_recv(), None);
    }

    #[tokio::test]
    async fn every_subscriber_gets_everything() {
        let bus = EventBus::new(16);
        let mut subscribers = (0..5).map(|_| bus.subscribe_logs()).collect::<Vec<_>>();

        for i in 0..5 {
            assert_eq!(bus.publish_log(format!("line {i}").into()), 5);
        }

        for subscriber in &mut subscribers {
            for i in 0..5 {
                assert_eq!(subscriber.recv().await, Some(format!("line {i}").into()));
            }
            assert_eq!(subscriber.try_recv(), None);
        }
    }

    #[test]
    fn publishing_to_nobody_is_fine() {
        let bus = EventBus::new(16);

        assert_eq!(bus.publish_log("anyone?".into()), 0);
        assert_eq!(bus.publish_event(LifecycleEvent::Connected), 0);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let bus = EventBus::new(16);
        let mut logs = bus.subscribe_logs();
        let mut events = bus.subscribe_events();

        bus.publish_event(LifecycleEvent::Connected);

        assert_eq!(events.recv().await.unwrap().inner, LifecycleEvent::Connected);
        assert_eq!(logs.try_recv(), None);
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_oldest() {
        let bus = EventBus::new(2);
        let mut logs = bus.subscribe_logs();

        for i in 0..5 {
            bus.publish_log(format!("{i}").into());
        }

        assert_eq!(logs.recv().await, Some("3".into()));
        assert_eq!(logs.recv().await, Some("4".into()));
    }

    #[tokio::test]
    async fn as_stream() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe_events().into_stream();

        bus.publish_event(LifecycleEvent::ErrorOccurred("oops".into()));
        bus.publish_event(LifecycleEvent::Disconnected);

        assert_eq!(
            events.next().await.unwrap().inner,
            LifecycleEvent::ErrorOccurred("oops".into())
        );
        assert_eq!(
            events.next().await.unwrap().inner,
            LifecycleEvent::Disconnected
        );
    }

    #[test]
    fn subscriber_count() {
        let bus = EventBus::new(16);
        let a = bus.subscribe_logs();
        let _b = bus.subscribe_logs();

        assert_eq!(bus.logs().subscriber_count(), 2);
        drop(a);
        assert_eq!(bus.logs().subscriber_count(), 1);
    }
}
