use bytes::Bytes;

/// Identifier of a post within a topic. Generated by the publisher, unique
/// per topic and monotonic within a publisher session.
pub type PostId = i64;

/// Reserved id used by a consumer to request every post of a topic. Never
/// assigned to a real post.
pub const FETCH_ALL_POSTS: PostId = -1;

/// Post count announcing an unbounded stream: the consumer keeps reading
/// records until the connection closes.
pub const KEEP_ALIVE: i32 = i32::MAX;

/// Maximum payload carried by a single packet. Larger posts are fragmented.
pub const MAX_PACKET_PAYLOAD: usize = 64 * 1024;

/// The immutable header of a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostInfo {
    pub poster_name: String,
    pub file_extension: String,
    pub id: PostId,
}

impl PostInfo {
    pub fn new(
        poster_name: impl Into<String>,
        file_extension: impl Into<String>,
        id: PostId,
    ) -> Self {
        Self {
            poster_name: poster_name.into(),
            file_extension: file_extension.into(),
            id,
        }
    }

    /// The placeholder header occupying position zero of every topic log, so
    /// that "posts since [`FETCH_ALL_POSTS`]" yields the whole log.
    pub fn sentinel() -> Self {
        Self::new("", "", FETCH_ALL_POSTS)
    }
}

/// One fragment of a post. Fragments share the post id, appear in index
/// order and exactly the last one carries the `is_final` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub post_id: PostId,
    pub index: u32,
    pub is_final: bool,
    pub payload: Bytes,
}

impl Packet {
    /// Fragments a post into packets of at most [`MAX_PACKET_PAYLOAD`] bytes.
    /// Every post yields at least one packet, even when its data is empty.
    pub fn from_post(post: &Post) -> Vec<Packet> {
        let data = &post.data;
        let chunks = data.len().div_ceil(MAX_PACKET_PAYLOAD).max(1);

        (0..chunks)
            .map(|i| {
                let start = i * MAX_PACKET_PAYLOAD;
                let end = data.len().min(start + MAX_PACKET_PAYLOAD);
                Packet {
                    post_id: post.info.id,
                    index: i as u32,
                    is_final: i == chunks - 1,
                    payload: data.slice(start..end),
                }
            })
            .collect()
    }
}

/// One logical message: a header plus its reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub info: PostInfo,
    pub data: Bytes,
}

impl Post {
    pub fn new(info: PostInfo, data: impl Into<Bytes>) -> Self {
        Self {
            info,
            data: data.into(),
        }
    }

    /// Reassembles a post from its packets. The packets are expected in index
    /// order with the final one last, as produced by [`Packet::from_post`].
    pub fn from_packets(packets: &[Packet], info: PostInfo) -> Self {
        let total = packets.iter().map(|p| p.payload.len()).sum();
        let mut data = Vec::with_capacity(total);
        for packet in packets {
            data.extend_from_slice(&packet.payload);
        }
        Self {
            info,
            data: Bytes::from(data),
        }
    }
}

/// A named, ordered, append-only sequence of posts, as handed to and from
/// the topic store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub posts: Vec<Post>,
}

impl Topic {
    pub fn new(name: impl Into<String>, posts: Vec<Post>) -> Self {
        Self {
            name: name.into(),
            posts,
        }
    }

    /// Id of the latest post, or [`FETCH_ALL_POSTS`] for an empty topic.
    pub fn last_post_id(&self) -> PostId {
        self.posts.last().map_or(FETCH_ALL_POSTS, |p| p.info.id)
    }
}

/// A consumer's resume cursor: topic name plus the id of the last post the
/// consumer has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicToken {
    pub name: String,
    pub last_seen_id: PostId,
}

impl TopicToken {
    pub fn new(name: impl Into<String>, last_seen_id: PostId) -> Self {
        Self {
            name: name.into(),
            last_seen_id,
        }
    }
}

/// A client-facing broker endpoint, passed around the cluster so clients can
/// reach whichever broker owns a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The request header a client sends as the first record of every
/// connection. The broker dispatches on the variant and replies as described
/// in the broker module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Announce a finite stream of posts for the named topic
    DataPacketSend(String),
    /// Open a keep-alive consumer stream resuming after the token's last id
    InitialiseConsumer(TopicToken),
    /// Ask which broker owns the named topic
    BrokerDiscovery(String),
    /// Create the named topic on this broker
    CreateTopic(String),
    /// Delete the named topic from this broker
    DeleteTopic(String),
}

impl Request {
    /// The topic this request concerns.
    pub fn topic_name(&self) -> &str {
        match self {
            Request::DataPacketSend(name)
            | Request::BrokerDiscovery(name)
            | Request::CreateTopic(name)
            | Request::DeleteTopic(name) => name,
            Request::InitialiseConsumer(token) => &token.name,
        }
    }
}

/// One framed record on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(Request),
    PostInfo(PostInfo),
    Packet(Packet),
    ConnectionInfo(ConnectionInfo),
    TopicToken(TopicToken),
    Bool(bool),
    PostCount(i32),
}

/// Incrementally reassembles posts from a record stream.
///
/// Both the broker's persistence worker and the client consumer read
/// interleaved header/fragment records; this accumulator hands back a
/// complete [`Post`] whenever a final packet arrives.
#[derive(Debug, Default)]
pub struct PostAssembler {
    current: Option<(PostInfo, Vec<Packet>)>,
}

impl PostAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts accumulating a new post. Any unfinished previous post is
    /// discarded; the stream never interleaves posts.
    pub fn begin_post(&mut self, info: PostInfo) {
        self.current = Some((info, Vec::new()));
    }

    /// Adds a fragment, returning the completed post once the final packet
    /// arrives. Fragments without a preceding header are dropped.
    pub fn add_fragment(&mut self, packet: Packet) -> Option<Post> {
        let (info, packets) = self.current.as_mut()?;
        if packet.post_id != info.id {
            return None;
        }

        let is_final = packet.is_final;
        packets.push(packet);

        if is_final {
            let (info, packets) = self.current.take().expect("checked above");
            Some(Post::from_packets(&packets, info))
        } else {
            None
        }
    }
}
