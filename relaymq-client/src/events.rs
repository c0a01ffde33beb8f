//! The user event bus.
//!
//! Every completed client operation produces exactly one [`UserEvent`],
//! delivered to the [`User`](crate::User) facade's listeners in
//! registration order. Publisher and consumer workers hold only an
//! [`EventSink`] - a one-way send handle - so no component ever needs a
//! reference back to the facade.

use std::fmt::Display;
use tokio::sync::mpsc;

/// The closed set of event kinds. One tag per user intent, plus
/// [`Tag::TopicDeleted`], which a consumer receives when its topic is
/// deleted on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// A post of ours finished publishing
    MessageSent,
    /// A post arrived on a topic we listen to
    MessageReceived,
    /// Our create-topic request completed
    TopicCreated,
    /// A topic we listen to is gone from the server
    TopicDeleted,
    /// Our delete-topic request completed
    ServerTopicDeleted,
    /// We started listening to a topic
    TopicListened,
    /// A topic from the profile was re-attached on load
    TopicLoaded,
    /// We stopped listening to a topic
    TopicListenStopped,
}

/// Outcome of one completed operation.
#[derive(Debug, Clone)]
pub struct UserEvent {
    pub tag: Tag,
    pub topic_name: String,
    pub success: bool,
    /// Why the operation failed; `None` exactly when `success` is true.
    pub cause: Option<String>,
}

impl UserEvent {
    pub fn successful(tag: Tag, topic_name: impl Into<String>) -> Self {
        Self {
            tag,
            topic_name: topic_name.into(),
            success: true,
            cause: None,
        }
    }

    pub fn failed(tag: Tag, topic_name: impl Into<String>, cause: impl Display) -> Self {
        Self {
            tag,
            topic_name: topic_name.into(),
            success: false,
            cause: Some(cause.to_string()),
        }
    }
}

/// Receives every event of one user, in the order the operations completed.
pub trait UserListener: Send {
    fn on_event(&mut self, event: &UserEvent);
}

/// One-way handle into the user's event processor.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<UserEvent>,
}

impl EventSink {
    /// Creates the sink and the receiving end the facade drains.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<UserEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fires an event. Silently drops it if the user is gone, since a
    /// worker outliving its user has nobody left to tell.
    pub fn fire(&self, event: UserEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_event_carries_the_cause() {
        let event = UserEvent::failed(Tag::MessageSent, "t", "connection to server lost");
        assert!(!event.success);
        assert_eq!(event.cause.as_deref(), Some("connection to server lost"));
    }

    #[tokio::test]
    async fn sink_delivers_in_fire_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.fire(UserEvent::successful(Tag::TopicCreated, "a"));
        sink.fire(UserEvent::successful(Tag::TopicListened, "a"));

        assert_eq!(rx.recv().await.unwrap().tag, Tag::TopicCreated);
        assert_eq!(rx.recv().await.unwrap().tag, Tag::TopicListened);
    }
}
