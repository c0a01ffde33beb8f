//! The user facade: the single entry point applications interact with.
//!
//! A [`User`] bundles a publisher, a consumer, the profile store and the
//! event bus. Methods map one-to-one onto user intents and return
//! immediately; each completed operation surfaces as one [`UserEvent`].
//!
//! A built-in bookkeeping step runs before any registered listener: it
//! keeps the in-memory profile and the on-disk profile store in sync with
//! what the events report (new subscription, deleted topic, unread posts).
//! Applications add listeners on top, never replace this behaviour.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relaymq::protocol::{ConnectionInfo, Post, PostInfo};

use crate::consumer::Consumer;
use crate::discovery::CiManager;
use crate::events::{EventSink, Tag, UserEvent, UserListener};
use crate::profile::{Profile, ProfileFileStore, ProfileStore};
use crate::publisher::{next_post_id, Publisher};
use crate::Result;

/// Facade over the client side of the delivery fabric.
///
/// Construction needs a running tokio runtime: the event processor and all
/// workers are spawned onto it.
pub struct User {
    inner: Arc<UserInner>,
}

struct UserInner {
    events: EventSink,
    publisher: Publisher,
    consumer: Consumer,
    store: Mutex<ProfileFileStore>,
    profile: Mutex<Profile>,
    listeners: Mutex<Vec<Box<dyn UserListener>>>,
}

impl User {
    /// Creates a profile on disk and a user managing it.
    pub fn create_new(
        default_broker: ConnectionInfo,
        profiles_dir: impl Into<PathBuf>,
        profile_name: &str,
    ) -> Result<Self> {
        Self::build(default_broker, profiles_dir, profile_name, false)
    }

    /// Loads an existing profile and re-attaches to every topic it is
    /// subscribed to, firing [`Tag::TopicLoaded`] per topic.
    pub fn load_existing(
        default_broker: ConnectionInfo,
        profiles_dir: impl Into<PathBuf>,
        profile_name: &str,
    ) -> Result<Self> {
        Self::build(default_broker, profiles_dir, profile_name, true)
    }

    fn build(
        default_broker: ConnectionInfo,
        profiles_dir: impl Into<PathBuf>,
        profile_name: &str,
        existing: bool,
    ) -> Result<Self> {
        let (events, event_rx) = EventSink::channel();
        let ci_manager = Arc::new(CiManager::new(default_broker));
        let publisher = Publisher::new(Arc::clone(&ci_manager), events.clone());
        let consumer = Consumer::new(ci_manager, events.clone());

        let mut store = ProfileFileStore::new(profiles_dir)?;
        let profile = if existing {
            let topics = store.load_profile(profile_name)?;
            Profile::from_topics(profile_name, topics)
        } else {
            store.create_new_profile(profile_name)?;
            Profile::new(profile_name)
        };

        let subscriptions = profile.subscriptions();

        let inner = Arc::new(UserInner {
            events,
            publisher,
            consumer,
            store: Mutex::new(store),
            profile: Mutex::new(profile),
            listeners: Mutex::new(Vec::new()),
        });

        tokio::spawn(event_loop(Arc::clone(&inner), event_rx));

        for (topic_name, last_seen) in subscriptions {
            inner
                .consumer
                .listen_for_existing_topic(&topic_name, last_seen);
        }

        Ok(Self { inner })
    }

    /// Sends a post to a topic the current profile is subscribed to.
    /// Fires [`Tag::MessageSent`].
    pub fn post(&self, post: Post, topic_name: &str) {
        if !self.inner.subscribed(topic_name) {
            self.inner.fire_not_subscribed(Tag::MessageSent, topic_name);
            return;
        }
        self.inner.publisher.publish(post, topic_name);
    }

    /// Builds a post from raw data on behalf of the current profile and
    /// sends it. Fires [`Tag::MessageSent`].
    pub fn post_data(&self, data: impl Into<bytes::Bytes>, file_extension: &str, topic_name: &str) {
        let info = PostInfo::new(self.profile_name(), file_extension, next_post_id());
        self.post(Post::new(info, data), topic_name);
    }

    /// Creates a topic on the cluster. Fires [`Tag::TopicCreated`]; on
    /// success the user automatically starts listening to the new topic.
    pub fn create_topic(&self, topic_name: &str) {
        self.inner.publisher.create_topic(topic_name);
    }

    /// Deletes a topic the current profile is subscribed to. Fires
    /// [`Tag::ServerTopicDeleted`] for this user; every listening user
    /// observes [`Tag::TopicDeleted`] through its own stream.
    pub fn delete_topic(&self, topic_name: &str) {
        if !self.inner.subscribed(topic_name) {
            self.inner
                .fire_not_subscribed(Tag::ServerTopicDeleted, topic_name);
            return;
        }
        self.inner.publisher.delete_topic(topic_name);
    }

    /// Drains all posts received on a topic since the previous pull,
    /// records them in the profile and persists them to the profile store.
    pub fn pull(&self, topic_name: &str) -> Result<Vec<Post>> {
        let posts = self.inner.consumer.pull(topic_name)?;
        debug!(topic = topic_name, posts = posts.len(), "pulled posts");

        self.inner.profile.lock().update_topic(topic_name, &posts)?;
        let mut store = self.inner.store.lock();
        for post in &posts {
            store.save_post(post, topic_name)?;
        }

        Ok(posts)
    }

    /// Starts listening to a topic. Fires [`Tag::TopicListened`].
    pub fn listen_for_new_topic(&self, topic_name: &str) {
        self.inner.consumer.listen_for_new_topic(topic_name);
    }

    /// Stops listening to a topic the current profile is subscribed to.
    /// Fires [`Tag::TopicListenStopped`].
    pub fn stop_listening_for_topic(&self, topic_name: &str) {
        if !self.inner.subscribed(topic_name) {
            self.inner
                .fire_not_subscribed(Tag::TopicListenStopped, topic_name);
            return;
        }
        self.inner.consumer.stop_listening_for_topic(topic_name);
    }

    /// Switches to a freshly created profile.
    pub fn switch_to_new_profile(&self, profile_name: &str) -> Result<()> {
        self.inner.store.lock().create_new_profile(profile_name)?;
        *self.inner.profile.lock() = Profile::new(profile_name);
        self.inner.consumer.set_topics(Vec::new());
        Ok(())
    }

    /// Switches to an existing profile and re-attaches to its topics.
    pub fn switch_to_existing_profile(&self, profile_name: &str) -> Result<()> {
        let topics = self.inner.store.lock().load_profile(profile_name)?;
        let profile = Profile::from_topics(profile_name, topics);
        let subscriptions = profile.subscriptions();
        *self.inner.profile.lock() = profile;
        self.inner.consumer.set_topics(subscriptions);
        Ok(())
    }

    /// Registers a listener; listeners see every event in registration
    /// order, after the built-in bookkeeping has run.
    pub fn add_listener(&self, listener: Box<dyn UserListener>) {
        self.inner.listeners.lock().push(listener);
    }

    pub fn profile_name(&self) -> String {
        self.inner.profile.lock().name().to_owned()
    }

    pub fn unread_count(&self, topic_name: &str) -> Result<u32> {
        self.inner.profile.lock().unread_count(topic_name)
    }

    pub fn is_subscribed(&self, topic_name: &str) -> bool {
        self.inner.subscribed(topic_name)
    }
}

impl UserInner {
    fn subscribed(&self, topic_name: &str) -> bool {
        self.profile.lock().is_subscribed(topic_name)
    }

    fn fire_not_subscribed(&self, tag: Tag, topic_name: &str) {
        self.events.fire(UserEvent::failed(
            tag,
            topic_name,
            crate::ClientError::NotSubscribed(topic_name.to_owned()),
        ));
    }

    /// The built-in bookkeeping run for every event before user listeners.
    fn bookkeep(&self, event: &UserEvent) {
        if !event.success {
            return;
        }

        let topic_name = event.topic_name.as_str();
        match event.tag {
            Tag::MessageReceived => {
                if let Err(e) = self.profile.lock().mark_unread(topic_name) {
                    debug!(topic = topic_name, error = %e, "post for unknown topic");
                }
            }
            Tag::TopicCreated => {
                // the creating user always listens to its new topic
                self.consumer.listen_for_new_topic(topic_name);
            }
            Tag::TopicListened => {
                if self.profile.lock().add_topic(topic_name).is_ok() {
                    if let Err(e) = self.store.lock().create_topic(topic_name) {
                        self.events
                            .fire(UserEvent::failed(Tag::TopicListened, topic_name, e));
                    }
                }
            }
            Tag::TopicDeleted | Tag::TopicListenStopped => {
                if self.profile.lock().remove_topic(topic_name).is_ok() {
                    if let Err(e) = self.store.lock().delete_topic(topic_name) {
                        warn!(topic = topic_name, error = %e, "could not drop local topic");
                    }
                }
            }
            Tag::MessageSent | Tag::ServerTopicDeleted | Tag::TopicLoaded => {}
        }
    }
}

/// Drains the event channel for the lifetime of the user: bookkeeping
/// first, then fan-out to the registered listeners in order.
async fn event_loop(inner: Arc<UserInner>, mut events: mpsc::UnboundedReceiver<UserEvent>) {
    while let Some(event) = events.recv().await {
        debug!(tag = ?event.tag, topic = %event.topic_name, success = event.success, "event");
        inner.bookkeep(&event);
        for listener in inner.listeners.lock().iter_mut() {
            listener.on_event(&event);
        }
    }
}
