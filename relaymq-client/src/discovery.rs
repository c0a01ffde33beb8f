//! Broker discovery and the topic-to-broker cache.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use relaymq::protocol::{ConnectionInfo, Frame, FrameCodec, Request};

use crate::error::ClientError;
use crate::Result;

/// A framed client connection to a broker.
pub(crate) type Transport = Framed<TcpStream, FrameCodec>;

pub(crate) async fn connect(ci: &ConnectionInfo) -> Result<Transport> {
    let stream = TcpStream::connect((ci.host.as_str(), ci.port)).await?;
    Ok(Framed::new(stream, FrameCodec::new()))
}

/// Resolves which broker owns a topic, caching answers for the lifetime of
/// the session.
///
/// Cache entries are never invalidated: cluster membership only grows and
/// topics never move between brokers, so an answer stays correct until the
/// owning broker dies, at which point the topic is unavailable anyway.
pub struct CiManager {
    default_broker: ConnectionInfo,
    cache: DashMap<String, ConnectionInfo>,
}

impl CiManager {
    /// Creates a manager that will direct discovery requests at the given
    /// default broker, which must be the cluster leader.
    pub fn new(default_broker: ConnectionInfo) -> Self {
        Self {
            default_broker,
            cache: DashMap::new(),
        }
    }

    /// The endpoint of the broker owning `topic_name`, from cache or by
    /// asking the default broker.
    pub async fn connection_info_for(&self, topic_name: &str) -> Result<ConnectionInfo> {
        if let Some(ci) = self.cache.get(topic_name) {
            return Ok(ci.clone());
        }

        let mut framed = connect(&self.default_broker).await?;
        framed
            .send(Frame::Request(Request::BrokerDiscovery(
                topic_name.to_owned(),
            )))
            .await?;

        match framed.next().await {
            Some(Ok(Frame::ConnectionInfo(ci))) => {
                debug!(topic = topic_name, owner = %ci, "resolved topic owner");
                self.cache.insert(topic_name.to_owned(), ci.clone());
                Ok(ci)
            }
            Some(Ok(other)) => Err(ClientError::UnexpectedReply(format!("{other:?}"))),
            Some(Err(e)) => Err(e.into()),
            None => Err(ClientError::ConnectionLost),
        }
    }
}

/// Opens a connection to the owner of `topic_name`, sends the request and
/// reads the broker's boolean acknowledgement. The shared first half of
/// every non-discovery exchange.
pub(crate) async fn request_with_ack(
    ci_manager: &CiManager,
    request: Request,
) -> Result<(Transport, bool)> {
    let ci = ci_manager
        .connection_info_for(request.topic_name())
        .await?;
    let mut framed = connect(&ci).await?;
    framed.send(Frame::Request(request)).await?;

    match framed.next().await {
        Some(Ok(Frame::Bool(success))) => Ok((framed, success)),
        Some(Ok(other)) => Err(ClientError::UnexpectedReply(format!("{other:?}"))),
        Some(Err(e)) => Err(e.into()),
        None => Err(ClientError::ConnectionLost),
    }
}
