//! The consumer node: keep-alive topic streams and the local post buffer.
//!
//! For every listened topic the consumer runs one long-lived pull worker on
//! a dedicated connection. Arriving records are reassembled into posts and
//! buffered until the application drains them with [`Consumer::pull`]; each
//! completed post also fires [`Tag::MessageReceived`].
//!
//! How a stream ends tells the consumer what happened: end-of-stream means
//! the topic was deleted on the server ([`Tag::TopicDeleted`]), while a
//! local stop request cancels the worker ([`Tag::TopicListenStopped`]).

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use relaymq::protocol::{
    Frame, Post, PostAssembler, PostId, Request, TopicToken, FETCH_ALL_POSTS,
};

use crate::discovery::{request_with_ack, CiManager, Transport};
use crate::error::ClientError;
use crate::events::{EventSink, Tag, UserEvent};
use crate::Result;

/// How a pull worker is being cancelled.
enum StopSignal {
    /// The user asked to stop listening; the worker announces it with
    /// [`Tag::TopicListenStopped`]
    User,
    /// A profile switch is tearing the stream down; no user-visible event,
    /// so bookkeeping cannot touch the successor profile's topics
    Silent,
}

/// State of one listened topic.
struct ListenedTopic {
    /// Completed posts not yet drained by `pull`
    buffered: Vec<Post>,
    /// Id of the last completed post; the resume cursor for reconnects
    pointer: PostId,
    assembler: PostAssembler,
    /// Cancels the pull worker; taken by the first stop request
    stop: Option<oneshot::Sender<StopSignal>>,
    /// Ties the entry to the worker that created it, so a worker winding
    /// down late cannot remove a successor's entry for the same topic
    epoch: u64,
}

/// Client-side node responsible for listening to topics and pulling posts
/// from them.
pub struct Consumer {
    ci_manager: Arc<CiManager>,
    events: EventSink,
    topics: Arc<Mutex<HashMap<String, ListenedTopic>>>,
    next_epoch: AtomicU64,
}

impl Consumer {
    pub fn new(ci_manager: Arc<CiManager>, events: EventSink) -> Self {
        Self {
            ci_manager,
            events,
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Starts listening to a topic from its beginning. Completion fires
    /// [`Tag::TopicListened`].
    pub fn listen_for_new_topic(&self, topic_name: &str) {
        self.listen(topic_name.to_owned(), FETCH_ALL_POSTS, Tag::TopicListened);
    }

    /// Re-attaches to a topic from the profile, resuming after the last
    /// post already on disk. Completion fires [`Tag::TopicLoaded`].
    pub fn listen_for_existing_topic(&self, topic_name: &str, last_seen: PostId) {
        self.listen(topic_name.to_owned(), last_seen, Tag::TopicLoaded);
    }

    /// Returns all posts buffered since the previous `pull`, earliest
    /// first. Draining leaves the stream attached.
    pub fn pull(&self, topic_name: &str) -> Result<Vec<Post>> {
        let mut topics = self.topics.lock();
        let entry = topics
            .get_mut(topic_name)
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))?;
        Ok(std::mem::take(&mut entry.buffered))
    }

    /// The resume cursor of a listened topic.
    pub fn pointer(&self, topic_name: &str) -> Result<PostId> {
        let topics = self.topics.lock();
        topics
            .get(topic_name)
            .map(|entry| entry.pointer)
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))
    }

    /// Stops listening to a topic. Purely local: cancels the pull worker,
    /// which closes the connection and fires [`Tag::TopicListenStopped`].
    pub fn stop_listening_for_topic(&self, topic_name: &str) {
        let stop = {
            let mut topics = self.topics.lock();
            topics.get_mut(topic_name).and_then(|entry| entry.stop.take())
        };

        match stop {
            Some(stop) => {
                // worker fires the event once it has wound down
                let _ = stop.send(StopSignal::User);
            }
            None => self.events.fire(UserEvent::failed(
                Tag::TopicListenStopped,
                topic_name,
                ClientError::NoSuchTopic(topic_name.to_owned()),
            )),
        }
    }

    /// Replaces the set of listened topics, as happens on a profile switch.
    /// Existing streams are cancelled silently (the switch is not a
    /// user-initiated stop); each new topic is attached with
    /// [`Tag::TopicLoaded`].
    pub fn set_topics(&self, topics: Vec<(String, PostId)>) {
        {
            let mut current = self.topics.lock();
            for (_, entry) in current.iter_mut() {
                if let Some(stop) = entry.stop.take() {
                    let _ = stop.send(StopSignal::Silent);
                }
            }
            // cleared eagerly so re-listening does not race the old workers
            current.clear();
        }

        for (topic_name, last_seen) in topics {
            self.listen(topic_name, last_seen, Tag::TopicLoaded);
        }
    }

    fn listen(&self, topic_name: String, since: PostId, tag: Tag) {
        if self.topics.lock().contains_key(&topic_name) {
            self.events.fire(UserEvent::failed(
                tag,
                &topic_name,
                ClientError::AlreadyListening(topic_name.clone()),
            ));
            return;
        }

        debug!(topic = %topic_name, since, "attaching to topic");
        let ci_manager = Arc::clone(&self.ci_manager);
        let events = self.events.clone();
        let topics = Arc::clone(&self.topics);
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let attached = async {
                let request =
                    Request::InitialiseConsumer(TopicToken::new(topic_name.clone(), since));
                let (framed, success) = request_with_ack(&ci_manager, request).await?;
                if success {
                    Ok(framed)
                } else {
                    Err(ClientError::NoSuchTopic(topic_name.clone()))
                }
            }
            .await;

            let framed = match attached {
                Ok(framed) => framed,
                Err(e) => {
                    events.fire(UserEvent::failed(tag, &topic_name, e));
                    return;
                }
            };

            let (stop_tx, stop_rx) = oneshot::channel();
            topics.lock().insert(
                topic_name.clone(),
                ListenedTopic {
                    buffered: Vec::new(),
                    pointer: since,
                    assembler: PostAssembler::new(),
                    stop: Some(stop_tx),
                    epoch,
                },
            );
            events.fire(UserEvent::successful(tag, &topic_name));

            pull_worker(framed, topic_name, topics, events, stop_rx, epoch).await;
        });
    }
}

/// Removes a topic entry, but only if it still belongs to the worker with
/// the given epoch. Returns whether it did: a worker whose entry is already
/// gone was cancelled or replaced, and must not report topic state.
fn forget_entry(
    topics: &Mutex<HashMap<String, ListenedTopic>>,
    topic_name: &str,
    epoch: u64,
) -> bool {
    let mut topics = topics.lock();
    if topics.get(topic_name).is_some_and(|entry| entry.epoch == epoch) {
        topics.remove(topic_name);
        true
    } else {
        false
    }
}

/// Drains one keep-alive stream until the server closes it, an error breaks
/// it, or a local stop cancels it.
async fn pull_worker(
    mut framed: Transport,
    topic_name: String,
    topics: Arc<Mutex<HashMap<String, ListenedTopic>>>,
    events: EventSink,
    mut stop: oneshot::Receiver<StopSignal>,
    epoch: u64,
) {
    // the keep-alive stream opens with its unbounded post count
    match framed.next().await {
        Some(Ok(Frame::PostCount(_))) => {}
        _ => {
            if forget_entry(&topics, &topic_name, epoch) {
                events.fire(UserEvent::failed(
                    Tag::MessageReceived,
                    &topic_name,
                    ClientError::ConnectionLost,
                ));
            }
            return;
        }
    }

    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(Frame::PostInfo(info))) => {
                    let mut topics = topics.lock();
                    if let Some(entry) = topics.get_mut(&topic_name) {
                        if entry.epoch == epoch {
                            entry.assembler.begin_post(info);
                        }
                    }
                }
                Some(Ok(Frame::Packet(packet))) => {
                    let completed = {
                        let mut topics = topics.lock();
                        match topics.get_mut(&topic_name) {
                            Some(entry) if entry.epoch == epoch => {
                                match entry.assembler.add_fragment(packet) {
                                    Some(post) => {
                                        entry.pointer = post.info.id;
                                        entry.buffered.push(post);
                                        true
                                    }
                                    None => false,
                                }
                            }
                            // replaced by a newer stream; wind down quietly
                            _ => return,
                        }
                    };
                    if completed {
                        events.fire(UserEvent::successful(Tag::MessageReceived, &topic_name));
                    }
                }
                Some(Ok(other)) => {
                    debug!(topic = %topic_name, ?other, "unexpected record on pull stream");
                    if forget_entry(&topics, &topic_name, epoch) {
                        events.fire(UserEvent::failed(
                            Tag::MessageReceived,
                            &topic_name,
                            ClientError::UnexpectedReply(format!("{other:?}")),
                        ));
                    }
                    return;
                }
                Some(Err(e)) => {
                    if forget_entry(&topics, &topic_name, epoch) {
                        events.fire(UserEvent::failed(Tag::MessageReceived, &topic_name, e));
                    }
                    return;
                }
                // clean end-of-stream: the topic is gone from the server
                None => {
                    debug!(topic = %topic_name, "stream closed by server");
                    if forget_entry(&topics, &topic_name, epoch) {
                        events.fire(UserEvent::successful(Tag::TopicDeleted, &topic_name));
                    }
                    return;
                }
            },
            signal = &mut stop => {
                let owned = forget_entry(&topics, &topic_name, epoch);
                // a dropped sender means the entry was replaced; wind down
                // as quietly as a profile switch
                if owned && matches!(signal, Ok(StopSignal::User)) {
                    debug!(topic = %topic_name, "stream stopped locally");
                    events.fire(UserEvent::successful(Tag::TopicListenStopped, &topic_name));
                } else {
                    debug!(topic = %topic_name, "stream cancelled by profile switch");
                }
                return;
            }
        }
    }
}
