//! The publisher node: creates topics, deletes topics and pushes posts.
//!
//! Every method spawns one task that opens one connection to the owning
//! broker, performs one request and fires one event. Nothing blocks the
//! caller.

use futures::SinkExt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use relaymq::protocol::{Frame, Packet, Post, PostId, Request};

use crate::discovery::{request_with_ack, CiManager};
use crate::error::ClientError;
use crate::events::{EventSink, Tag, UserEvent};
use crate::Result;

/// Generates a post id: the current time in nanoseconds since the epoch.
///
/// Ids must be unique within a topic and monotonic within a publisher
/// session; nanosecond timestamps give both, and make cross-publisher
/// collisions vanishingly unlikely.
pub fn next_post_id() -> PostId {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_nanos() as PostId
}

/// Client-side node responsible for creating topics and pushing posts to
/// them.
pub struct Publisher {
    ci_manager: Arc<CiManager>,
    events: EventSink,
}

impl Publisher {
    pub fn new(ci_manager: Arc<CiManager>, events: EventSink) -> Self {
        Self { ci_manager, events }
    }

    /// Pushes a post to its topic's owning broker. Completion fires
    /// [`Tag::MessageSent`].
    pub fn publish(&self, post: Post, topic_name: &str) {
        debug!(topic = topic_name, post = post.info.id, "publishing post");
        let ci_manager = Arc::clone(&self.ci_manager);
        let events = self.events.clone();
        let topic_name = topic_name.to_owned();

        tokio::spawn(async move {
            let result = push_post(&ci_manager, &post, &topic_name).await;
            events.fire(outcome(Tag::MessageSent, &topic_name, result));
        });
    }

    /// Asks the owning broker to create a topic. Completion fires
    /// [`Tag::TopicCreated`].
    pub fn create_topic(&self, topic_name: &str) {
        debug!(topic = topic_name, "creating topic");
        let ci_manager = Arc::clone(&self.ci_manager);
        let events = self.events.clone();
        let topic_name = topic_name.to_owned();

        tokio::spawn(async move {
            let result = async {
                let request = Request::CreateTopic(topic_name.clone());
                let (_, success) = request_with_ack(&ci_manager, request).await?;
                if success {
                    Ok(())
                } else {
                    Err(ClientError::TopicExists(topic_name.clone()))
                }
            }
            .await;
            events.fire(outcome(Tag::TopicCreated, &topic_name, result));
        });
    }

    /// Asks the owning broker to delete a topic. Completion fires
    /// [`Tag::ServerTopicDeleted`]; consumers of the topic observe the
    /// deletion on their own streams.
    pub fn delete_topic(&self, topic_name: &str) {
        debug!(topic = topic_name, "deleting topic");
        let ci_manager = Arc::clone(&self.ci_manager);
        let events = self.events.clone();
        let topic_name = topic_name.to_owned();

        tokio::spawn(async move {
            let result = async {
                let request = Request::DeleteTopic(topic_name.clone());
                let (_, success) = request_with_ack(&ci_manager, request).await?;
                if success {
                    Ok(())
                } else {
                    Err(ClientError::NoSuchTopic(topic_name.clone()))
                }
            }
            .await;
            events.fire(outcome(Tag::ServerTopicDeleted, &topic_name, result));
        });
    }
}

async fn push_post(ci_manager: &CiManager, post: &Post, topic_name: &str) -> Result<()> {
    let request = Request::DataPacketSend(topic_name.to_owned());
    let (mut framed, success) = request_with_ack(ci_manager, request).await?;
    if !success {
        return Err(ClientError::NoSuchTopic(topic_name.to_owned()));
    }

    framed.send(Frame::PostCount(1)).await?;
    framed.send(Frame::PostInfo(post.info.clone())).await?;
    for packet in Packet::from_post(post) {
        framed.send(Frame::Packet(packet)).await?;
    }
    Ok(())
}

fn outcome(tag: Tag, topic_name: &str, result: Result<()>) -> UserEvent {
    match result {
        Ok(()) => UserEvent::successful(tag, topic_name),
        Err(e) => UserEvent::failed(tag, topic_name, e),
    }
}
