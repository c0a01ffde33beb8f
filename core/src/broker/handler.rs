//! Per-connection request handling.
//!
//! The first record of every client connection is a [`Request`]; everything
//! after it depends on the request type. Discovery, create and delete are
//! one-shot exchanges. `DataPacketSend` turns the connection into a
//! publisher stream drained by the pull-loop, and `InitialiseConsumer` turns
//! it into a keep-alive consumer stream fed by a push worker until one side
//! closes.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::server::BrokerContext;
use crate::protocol::{
    Frame, FrameCodec, Packet, PostAssembler, PostInfo, Request, TopicToken, FETCH_ALL_POSTS,
    KEEP_ALIVE,
};
use crate::topic::{BrokerTopic, TopicRecord};
use crate::{RelaymqError, Result};

type Transport = Framed<TcpStream, FrameCodec>;

/// Entry point for a connection accepted on the client port.
pub(crate) async fn handle_client(socket: TcpStream, ctx: Arc<BrokerContext>) {
    if let Err(e) = client_connection(socket, ctx).await {
        // a protocol violation or lost socket is fatal for this connection only
        debug!(error = %e, "client connection ended with error");
    }
}

async fn client_connection(socket: TcpStream, ctx: Arc<BrokerContext>) -> Result<()> {
    let mut framed = Framed::new(socket, FrameCodec::new());

    let request = match framed.next().await {
        Some(Ok(Frame::Request(request))) => request,
        Some(Ok(other)) => {
            return Err(RelaymqError::Protocol(format!(
                "expected a request header, got {other:?}"
            )))
        }
        Some(Err(e)) => return Err(e),
        None => return Ok(()), // connected and left without asking anything
    };

    debug!(?request, "dispatching client request");
    match request {
        Request::BrokerDiscovery(topic_name) => {
            let owner = ctx.peers.owner_of(&topic_name, &ctx.advertised);
            debug!(topic = %topic_name, owner = %owner, "discovery");
            framed.send(Frame::ConnectionInfo(owner)).await
        }
        Request::CreateTopic(topic_name) => {
            let success = match ctx.manager.add_topic(&topic_name) {
                Ok(topic) => {
                    info!(topic = %topic_name, "topic created");
                    spawn_persistence_worker(topic, Arc::clone(&ctx));
                    true
                }
                Err(RelaymqError::TopicExists(_)) => false,
                Err(e) => {
                    warn!(topic = %topic_name, error = %e, "topic creation failed");
                    false
                }
            };
            framed.send(Frame::Bool(success)).await
        }
        Request::DeleteTopic(topic_name) => {
            let success = match ctx.manager.remove_topic(&topic_name) {
                Ok(()) => {
                    info!(topic = %topic_name, "topic deleted");
                    true
                }
                Err(RelaymqError::NoSuchTopic(_)) => false,
                Err(e) => {
                    warn!(topic = %topic_name, error = %e, "topic deletion failed");
                    false
                }
            };
            framed.send(Frame::Bool(success)).await
        }
        Request::DataPacketSend(topic_name) => {
            let Ok(topic) = ctx.manager.topic(&topic_name) else {
                return framed.send(Frame::Bool(false)).await;
            };
            framed.send(Frame::Bool(true)).await?;
            pull_posts(&mut framed, &topic).await
        }
        Request::InitialiseConsumer(token) => consumer_stream(framed, token, ctx).await,
    }
}

/// The pull-loop: drains a publisher's finite post stream into the topic.
///
/// Each post is validated and buffered whole before it is appended, so a
/// malformed stream (foreign post id, out-of-order index, reserved id) never
/// leaves a half-read post in the log; the connection is simply dropped.
async fn pull_posts(framed: &mut Transport, topic: &BrokerTopic) -> Result<()> {
    let count = match next_frame(framed).await? {
        Frame::PostCount(count) if count >= 0 => count,
        Frame::PostCount(count) => {
            return Err(RelaymqError::Protocol(format!("negative post count {count}")))
        }
        other => {
            return Err(RelaymqError::Protocol(format!(
                "expected a post count, got {other:?}"
            )))
        }
    };

    for _ in 0..count {
        let info = match next_frame(framed).await? {
            Frame::PostInfo(info) if info.id != FETCH_ALL_POSTS => info,
            Frame::PostInfo(info) => {
                return Err(RelaymqError::Protocol(format!(
                    "post uses the reserved id {}",
                    info.id
                )))
            }
            other => {
                return Err(RelaymqError::Protocol(format!(
                    "expected a post header, got {other:?}"
                )))
            }
        };

        let packets = read_post_packets(framed, &info).await?;
        debug!(topic = topic.name(), post = info.id, packets = packets.len(), "post received");
        topic.append_post(info, packets);
    }

    Ok(())
}

/// Reads one post's packets up to and including the final one.
async fn read_post_packets(framed: &mut Transport, info: &PostInfo) -> Result<Vec<Packet>> {
    let mut packets = Vec::new();
    loop {
        let packet = match next_frame(framed).await? {
            Frame::Packet(packet) => packet,
            other => {
                return Err(RelaymqError::Protocol(format!(
                    "expected a packet, got {other:?}"
                )))
            }
        };

        if packet.post_id != info.id {
            return Err(RelaymqError::Protocol(format!(
                "packet for post {} inside post {}",
                packet.post_id, info.id
            )));
        }
        if packet.index != packets.len() as u32 {
            return Err(RelaymqError::Protocol(format!(
                "packet index {} out of order, expected {}",
                packet.index,
                packets.len()
            )));
        }

        let is_final = packet.is_final;
        packets.push(packet);
        if is_final {
            return Ok(packets);
        }
    }
}

/// A consumer-facing streaming connection.
///
/// After the successful acknowledgement the broker writes the keep-alive
/// post count, the backfill of posts after the token's id, and then tails
/// the topic until the consumer goes away, the topic is removed or the
/// broker shuts down.
async fn consumer_stream(
    mut framed: Transport,
    token: TopicToken,
    ctx: Arc<BrokerContext>,
) -> Result<()> {
    let Ok(topic) = ctx.manager.topic(&token.name) else {
        return framed.send(Frame::Bool(false)).await;
    };

    let (disconnect_tx, disconnect_rx) = oneshot::channel();
    let Ok(consumer_id) = ctx.manager.register_consumer(&token.name, disconnect_tx) else {
        // the topic vanished between lookup and registration
        return framed.send(Frame::Bool(false)).await;
    };

    // snapshot and subscription are atomic, so backfill plus tail is exactly
    // the topic's append sequence with nothing lost or repeated
    let (backfill, subscriber_id, records) = topic.subscribe_from(token.last_seen_id);

    debug!(
        topic = %token.name,
        since = token.last_seen_id,
        backfill = backfill.len(),
        "consumer attached"
    );

    let result = async {
        framed.send(Frame::Bool(true)).await?;
        framed.send(Frame::PostCount(KEEP_ALIVE)).await?;

        for (info, packets) in backfill {
            framed.send(Frame::PostInfo(info)).await?;
            for packet in packets {
                framed.send(Frame::Packet(packet)).await?;
            }
        }

        push_records(&mut framed, records, disconnect_rx, &ctx).await
    }
    .await;

    topic.unsubscribe(subscriber_id);
    ctx.manager.deregister_consumer(&token.name, consumer_id);
    debug!(topic = %token.name, "consumer detached");
    result
}

/// The keep-alive push worker: forwards topic records to one consumer until
/// the stream ends. Returning drops the socket, which the consumer observes
/// as end-of-stream.
async fn push_records(
    framed: &mut Transport,
    mut records: mpsc::Receiver<TopicRecord>,
    mut disconnect: oneshot::Receiver<()>,
    ctx: &BrokerContext,
) -> Result<()> {
    let mut shutdown = ctx.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            record = records.recv() => match record {
                Some(TopicRecord::Header(info)) => framed.send(Frame::PostInfo(info)).await?,
                Some(TopicRecord::Fragment(packet)) => framed.send(Frame::Packet(packet)).await?,
                // topic closed, or this subscriber was detached as too slow
                None => return Ok(()),
            },
            _ = &mut disconnect => return Ok(()),
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

/// Entry point for a connection accepted on the peer port: a follower
/// announcing its client endpoint to the leader.
pub(crate) async fn handle_peer(socket: TcpStream, ctx: Arc<BrokerContext>) {
    let mut framed = Framed::new(socket, FrameCodec::new());

    match framed.next().await {
        Some(Ok(Frame::ConnectionInfo(ci))) => {
            info!(peer = %ci, "peer broker joined the cluster");
            ctx.peers.add(ci);
        }
        Some(Ok(other)) => {
            warn!(?other, "peer sent an unexpected record; ignoring connection");
            return;
        }
        Some(Err(e)) => {
            warn!(error = %e, "bad peer announcement; ignoring connection");
            return;
        }
        None => return,
    }

    // hold the connection open; the peer's slot survives even if it drops
    let mut shutdown = ctx.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                None => {
                    debug!("peer connection closed");
                    return;
                }
                Some(Ok(frame)) => warn!(?frame, "unexpected record on peer connection"),
                Some(Err(_)) => return,
            },
            _ = shutdown.recv() => return,
        }
    }
}

/// Spawns the durability hook of one topic: a subscriber whose worker
/// persists every completed post through the manager's store.
///
/// The subscription is unbounded, so a publisher burst outrunning the disk
/// queues records instead of costing a post; the receiver only ends when
/// the topic is removed. A store failure means the durability guarantee is
/// gone, so the worker initiates a graceful broker shutdown to surface the
/// fault.
pub(crate) fn spawn_persistence_worker(topic: Arc<BrokerTopic>, ctx: Arc<BrokerContext>) {
    let (_, mut records) = topic.subscribe();
    let mut shutdown = ctx.shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut assembler = PostAssembler::new();
        loop {
            let record = tokio::select! {
                record = records.recv() => record,
                _ = shutdown.recv() => return,
            };

            match record {
                Some(TopicRecord::Header(info)) => assembler.begin_post(info),
                Some(TopicRecord::Fragment(packet)) => {
                    let Some(post) = assembler.add_fragment(packet) else {
                        continue;
                    };
                    if let Err(e) = ctx.manager.persist_post(&post, topic.name()) {
                        error!(
                            topic = topic.name(),
                            post = post.info.id,
                            error = %e,
                            "persisting post failed; shutting broker down"
                        );
                        let _ = ctx.shutdown_tx.send(());
                        return;
                    }
                    debug!(topic = topic.name(), post = post.info.id, "post persisted");
                }
                None => return, // topic removed
            }
        }
    });
}

async fn next_frame(framed: &mut Transport) -> Result<Frame> {
    match framed.next().await {
        Some(result) => result,
        None => Err(RelaymqError::Protocol("stream ended mid-record".into())),
    }
}
