//! # Per-Topic In-Memory Log
//!
//! A [`BrokerTopic`] is the broker's in-memory, append-only record of one
//! topic: the ordered post headers plus the packet list of every post.
//! Appends and subscriber notification are serialised under one per-topic
//! lock, so every subscriber observes a prefix of the append sequence.
//!
//! Subscribers are channels rather than callbacks: appending is a
//! non-blocking send. Consumer streams attach through bounded channels, and
//! one whose buffer overflows (or whose worker has gone away) is detached
//! on the spot so a slow consumer never stalls the topic. The durability
//! hook attaches through an unbounded channel instead: it must observe
//! every record, so backpressure may cost memory but never a post.

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::{Packet, PostId, PostInfo, FETCH_ALL_POSTS};

/// Buffered records per subscriber before it is considered too slow and
/// detached.
const SUBSCRIBER_BUFFER: usize = 1024;

/// One record of a topic's append sequence, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRecord {
    Header(PostInfo),
    Fragment(Packet),
}

/// Handle identifying an attached subscriber, handed out by
/// [`BrokerTopic::subscribe_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

enum SubscriberChannel {
    /// Consumer stream; detached when full or closed
    Bounded(mpsc::Sender<TopicRecord>),
    /// Durability hook; detached only once its worker is gone
    Unbounded(mpsc::UnboundedSender<TopicRecord>),
}

struct SubscriberHandle {
    id: SubscriberId,
    channel: SubscriberChannel,
}

/// The in-memory log of a single topic.
pub struct BrokerTopic {
    name: String,
    log: Mutex<TopicLog>,
}

/// A sentinel header with id [`FETCH_ALL_POSTS`] occupies position zero so
/// that "posts since -1" naturally returns the whole log.
struct TopicLog {
    post_infos: Vec<PostInfo>,
    packets_by_post: HashMap<PostId, Vec<Packet>>,
    index_by_post: HashMap<PostId, usize>,
    subscribers: Vec<SubscriberHandle>,
    next_subscriber: u64,
}

impl BrokerTopic {
    /// Constructs an empty topic log.
    pub fn new(name: impl Into<String>) -> Self {
        let mut index_by_post = HashMap::new();
        index_by_post.insert(FETCH_ALL_POSTS, 0);

        Self {
            name: name.into(),
            log: Mutex::new(TopicLog {
                post_infos: vec![PostInfo::sentinel()],
                packets_by_post: HashMap::new(),
                index_by_post,
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends one complete post - header first, then its packets in index
    /// order - and notifies every subscriber, all under the topic lock.
    ///
    /// Publishing a whole post atomically keeps half-read posts of a failed
    /// publisher connection out of the log.
    pub fn append_post(&self, info: PostInfo, packets: Vec<Packet>) {
        let mut log = self.log.lock();
        log.append_header(info.clone());
        log.notify(&self.name, TopicRecord::Header(info));

        for packet in packets {
            log.append_fragment(packet.clone());
            log.notify(&self.name, TopicRecord::Fragment(packet));
        }
    }

    /// Returns every post strictly after the one with `since`, earliest
    /// first, each paired with its packets.
    ///
    /// An unknown id yields an empty result: the broker may have restarted
    /// since the consumer last saw that post, which is not an error - the
    /// consumer resumes from the ids it learns next.
    pub fn posts_since(&self, since: PostId) -> Vec<(PostInfo, Vec<Packet>)> {
        self.log.lock().posts_since(since)
    }

    /// Atomically snapshots the log after `since` and attaches a new
    /// subscriber, so the returned backfill plus the channel stream is a
    /// gapless, duplicate-free prefix continuation.
    pub fn subscribe_from(
        &self,
        since: PostId,
    ) -> (
        Vec<(PostInfo, Vec<Packet>)>,
        SubscriberId,
        mpsc::Receiver<TopicRecord>,
    ) {
        let mut log = self.log.lock();
        let backfill = log.posts_since(since);

        let id = SubscriberId(log.next_subscriber);
        log.next_subscriber += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        log.subscribers.push(SubscriberHandle {
            id,
            channel: SubscriberChannel::Bounded(tx),
        });

        (backfill, id, rx)
    }

    /// Attaches the durability subscriber at the current tail of the log,
    /// without any backfill.
    ///
    /// The channel is unbounded: the persistence hook must see every record
    /// exactly once, so it is never detached for falling behind the way a
    /// slow consumer is. Its receiver only ends when the topic is closed.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::UnboundedReceiver<TopicRecord>) {
        let mut log = self.log.lock();

        let id = SubscriberId(log.next_subscriber);
        log.next_subscriber += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        log.subscribers.push(SubscriberHandle {
            id,
            channel: SubscriberChannel::Unbounded(tx),
        });

        (id, rx)
    }

    /// Detaches a subscriber. Returns whether it was still attached.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut log = self.log.lock();
        let before = log.subscribers.len();
        log.subscribers.retain(|sub| sub.id != id);
        log.subscribers.len() != before
    }

    /// Drops every subscriber channel, waking their workers with an
    /// end-of-stream. Called when the topic is removed from its broker.
    pub fn close(&self) {
        self.log.lock().subscribers.clear();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.log.lock().subscribers.len()
    }
}

impl TopicLog {
    fn append_header(&mut self, info: PostInfo) {
        let id = info.id;
        self.post_infos.push(info);
        self.packets_by_post.insert(id, Vec::new());
        self.index_by_post.insert(id, self.post_infos.len() - 1);
    }

    fn append_fragment(&mut self, packet: Packet) {
        // append_post guarantees the header was appended first
        self.packets_by_post
            .entry(packet.post_id)
            .or_default()
            .push(packet);
    }

    fn posts_since(&self, since: PostId) -> Vec<(PostInfo, Vec<Packet>)> {
        let Some(&index) = self.index_by_post.get(&since) else {
            return Vec::new();
        };

        self.post_infos[index + 1..]
            .iter()
            .map(|info| {
                let packets = self
                    .packets_by_post
                    .get(&info.id)
                    .cloned()
                    .unwrap_or_default();
                (info.clone(), packets)
            })
            .collect()
    }

    /// Non-blocking fan-out. A bounded subscriber that cannot take the
    /// record right now has either overflowed its buffer or lost its
    /// worker; it is detached and the remaining subscribers are still
    /// notified. An unbounded subscriber always takes the record and is
    /// only dropped once its worker is gone.
    fn notify(&mut self, topic_name: &str, record: TopicRecord) {
        self.subscribers.retain(|sub| match &sub.channel {
            SubscriberChannel::Bounded(tx) => match tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(topic = topic_name, "detaching slow subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
            SubscriberChannel::Unbounded(tx) => tx.send(record.clone()).is_ok(),
        });
    }
}
