//! # RelayMQ Core Library
//!
//! RelayMQ is a distributed publish/subscribe post delivery fabric. A mesh of
//! cooperating broker nodes owns topics by hash-partitioning; publisher and
//! consumer clients discover the broker that owns a topic and stream posts to
//! and from it over persistent TCP connections.
//!
//! This crate provides the broker side of the fabric together with the wire
//! protocol both sides speak:
//!
//! - [`protocol`] - framed binary codec, record types and the topic-ownership hash
//! - [`topic`] - the per-topic in-memory log with subscriber fan-out
//! - [`topic_manager`] - thread-safe registry of topics and their consumer streams
//! - [`broker`] - TCP listeners, request dispatch and the push/pull workers
//! - [`storage`] - the pluggable topic store and its file-system reference engine
//! - [`config`] - broker configuration and endpoint files
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaymq::{Broker, BrokerConfig};
//! use relaymq::storage::TopicFileStore;
//!
//! #[tokio::main]
//! async fn main() -> relaymq::Result<()> {
//!     let config = BrokerConfig::default();
//!     let store = TopicFileStore::new(&config.data_dir)?;
//!     let broker = Broker::new(config, Box::new(store)).await?;
//!     broker.run().await
//! }
//! ```
//!
//! Ordering guarantee: per topic, the record sequence observed by any one
//! consumer is a prefix of the broker's append sequence for that topic. No
//! ordering is promised across topics.

pub mod broker;
pub mod config;
pub mod protocol;
pub mod storage;
pub mod topic;
pub mod topic_manager;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use protocol::{
    topic_hash, ConnectionInfo, Packet, Post, PostId, PostInfo, Request, Topic, TopicToken,
    FETCH_ALL_POSTS,
};
pub use storage::TopicStore;
pub use topic::BrokerTopic;
pub use topic_manager::BrokerTopicManager;

use thiserror::Error;

/// RelayMQ error types
///
/// Every failure surfaced by this crate is one of these variants. Domain
/// errors (`TopicExists`, `NoSuchTopic`) are reported to clients as an
/// unsuccessful acknowledgement; protocol violations are fatal for the
/// offending connection.
#[derive(Debug, Error)]
pub enum RelaymqError {
    /// Socket or file-system I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record or unexpected record type on a connection
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A topic with this name already exists somewhere in the cluster
    #[error("topic '{0}' already exists")]
    TopicExists(String),

    /// No topic with this name is owned by this broker
    #[error("no topic named '{0}'")]
    NoSuchTopic(String),

    /// A persisted post file does not match the `{id}-{poster}.{ext}` pattern
    #[error("bad post filename: {0}")]
    BadFileName(String),

    /// Invalid configuration value or endpoint file
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, RelaymqError>;
