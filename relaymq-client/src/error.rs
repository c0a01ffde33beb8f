//! Error types for the RelayMQ client library

use relaymq::RelaymqError;

/// Main error type for client operations.
///
/// Public facade methods never return these directly; outcomes surface as
/// [`crate::UserEvent`]s carrying the error's message as the cause.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// I/O failure on a socket or the local file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error bubbled up from the shared wire codec or storage layer
    #[error(transparent)]
    Wire(#[from] RelaymqError),

    /// The broker closed the connection mid-exchange
    #[error("connection to server lost")]
    ConnectionLost,

    /// The broker replied with a record the exchange does not allow
    #[error("unexpected reply from broker: {0}")]
    UnexpectedReply(String),

    /// No topic with this name (on the broker or in the local state)
    #[error("topic '{0}' does not exist")]
    NoSuchTopic(String),

    /// A topic with this name already exists
    #[error("topic '{0}' already exists")]
    TopicExists(String),

    /// No profile with this name in the profile store
    #[error("profile '{0}' does not exist")]
    NoSuchProfile(String),

    /// The current profile is not subscribed to the topic
    #[error("not subscribed to topic '{0}'")]
    NotSubscribed(String),

    /// This consumer already has a live stream for the topic
    #[error("already listening to topic '{0}'")]
    AlreadyListening(String),
}
