//! Event bus for dev-tools subscriptions
//!
//! The bus is an explicit value owned by the process context and handed to
//! whoever needs to publish or subscribe. Subscriptions are streams filtered by
//! topic; several topics can be watched at once by fanning their streams in
//! with [`merge_async`].

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

use crate::merge::{merge_async, MergedStream};
use crate::version::UpdateStatus;

/// Default number of events buffered per subscriber
pub const DEFAULT_CAPACITY: usize = 64;

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Messages published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    /// A log line from a project or device
    Log { level: LogLevel, message: String },
    /// Bundler progress, 0 to 100
    BuildProgress { percent: u8 },
    /// A module update check found something
    UpdateAvailable(UpdateStatus),
    /// A device attached to the dev server
    DeviceConnected { name: String },
}

/// Category an event is delivered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Logs,
    Build,
    Updates,
    Devices,
}

impl Event {
    /// Topic subscribers must watch to receive this event
    pub fn topic(&self) -> Topic {
        match self {
            Event::Log { .. } => Topic::Logs,
            Event::BuildProgress { .. } => Topic::Build,
            Event::UpdateAvailable(_) => Topic::Updates,
            Event::DeviceConnected { .. } => Topic::Devices,
        }
    }
}

/// Publish/subscribe hub for [`Event`]s
///
/// Cloning the bus yields another handle to the same channel. Subscription
/// streams end once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber
    ///
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes `event`, returning how many subscribers were listening
    ///
    /// Publishing with nobody subscribed is not an error; the event is dropped.
    pub fn publish(&self, event: Event) -> usize {
        trace!(topic = ?event.topic(), "publishing event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Subscribes to events of one topic
    ///
    /// Only events published after this call are delivered. A subscriber that
    /// falls more than the bus capacity behind skips the events it missed.
    pub fn subscribe(&self, topic: Topic) -> BoxStream<'static, Event> {
        let receiver = self.sender.subscribe();
        stream::unfold(receiver, move |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.topic() == topic => return Some((event, receiver)),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(?topic, skipped, "subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Subscribes to several topics as one stream, in arrival order
    ///
    /// Repeated topics are subscribed once, so each event is delivered once.
    pub fn subscribe_many(
        &self,
        topics: impl IntoIterator<Item = Topic>,
    ) -> MergedStream<BoxStream<'static, Event>> {
        let mut seen = HashSet::new();
        merge_async(
            topics
                .into_iter()
                .filter(|topic| seen.insert(*topic))
                .map(|topic| self.subscribe(topic)),
        )
    }
}
