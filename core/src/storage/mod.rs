//! # Topic Persistence
//!
//! The broker persists every completed post through the [`TopicStore`]
//! contract so that consumers reconnecting after a broker restart still
//! receive everything they have not seen. The contract is a plug-in
//! boundary: any engine that is durable, per-topic, ordered and
//! crash-consistent at post granularity will do.
//!
//! [`fs::TopicFileStore`] is the reference engine, keeping one directory per
//! topic with a `HEAD` pointer and per-post back-links.

pub mod fs;

pub use fs::TopicFileStore;

use crate::protocol::{Post, Topic};
use crate::Result;

/// Durable store for topics and their posts.
///
/// Callers serialise access (the broker keeps each store instance behind a
/// single lock), so implementations need not be thread-safe themselves.
pub trait TopicStore: Send {
    /// Creates an empty topic. Fails if the topic already exists.
    fn create_topic(&mut self, topic_name: &str) -> Result<()>;

    /// Removes a topic and every post in it.
    fn delete_topic(&mut self, topic_name: &str) -> Result<()>;

    /// Durably appends one completed post to a topic.
    fn write_post(&mut self, post: &Post, topic_name: &str) -> Result<()>;

    /// Loads every stored topic with its posts ordered earliest to latest.
    fn read_all_topics(&self) -> Result<Vec<Topic>>;
}
