//! # Broker Topic Registry
//!
//! [`BrokerTopicManager`] owns every topic of one broker: the in-memory logs,
//! the set of consumer connections attached to each topic, and the durable
//! [`TopicStore`] behind them. All three live behind their own lock, always
//! taken in the order topics, then consumers, then store, and never held
//! across socket I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::protocol::Packet;
use crate::storage::TopicStore;
use crate::topic::BrokerTopic;
use crate::{RelaymqError, Result};

/// Identifies one consumer connection within the manager.
pub type ConsumerId = u64;

/// Thread-safe registry of a broker's topics and consumer connections.
///
/// Invariant: the key sets of the topic map and the consumer map are equal
/// between any two mutator calls.
pub struct BrokerTopicManager {
    topics: Mutex<HashMap<String, Arc<BrokerTopic>>>,
    consumers: Mutex<HashMap<String, HashMap<ConsumerId, oneshot::Sender<()>>>>,
    store: Mutex<Box<dyn TopicStore>>,
    next_consumer: AtomicU64,
}

impl BrokerTopicManager {
    /// Builds the registry by reloading every topic from the store.
    pub fn new(store: Box<dyn TopicStore>) -> Result<Self> {
        let manager = Self {
            topics: Mutex::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            store: Mutex::new(store),
            next_consumer: AtomicU64::new(0),
        };

        let stored = manager.store.lock().read_all_topics()?;
        for stored_topic in stored {
            info!(
                topic = %stored_topic.name,
                posts = stored_topic.posts.len(),
                "reloaded topic from store"
            );

            let topic = Arc::new(BrokerTopic::new(&stored_topic.name));
            for post in &stored_topic.posts {
                topic.append_post(post.info.clone(), Packet::from_post(post));
            }

            manager.topics.lock().insert(stored_topic.name.clone(), topic);
            manager
                .consumers
                .lock()
                .insert(stored_topic.name, HashMap::new());
        }

        Ok(manager)
    }

    pub fn topic_exists(&self, topic_name: &str) -> bool {
        self.topics.lock().contains_key(topic_name)
    }

    /// Looks up a topic by name.
    pub fn topic(&self, topic_name: &str) -> Result<Arc<BrokerTopic>> {
        self.topics
            .lock()
            .get(topic_name)
            .cloned()
            .ok_or_else(|| RelaymqError::NoSuchTopic(topic_name.to_owned()))
    }

    /// Every topic currently registered.
    pub fn topics(&self) -> Vec<Arc<BrokerTopic>> {
        self.topics.lock().values().cloned().collect()
    }

    /// Creates a topic in the registry and the store.
    ///
    /// On a store failure the registry entry is rolled back so the maps and
    /// the store stay consistent.
    pub fn add_topic(&self, topic_name: &str) -> Result<Arc<BrokerTopic>> {
        let topic = Arc::new(BrokerTopic::new(topic_name));
        {
            let mut topics = self.topics.lock();
            if topics.contains_key(topic_name) {
                return Err(RelaymqError::TopicExists(topic_name.to_owned()));
            }
            topics.insert(topic_name.to_owned(), Arc::clone(&topic));
        }
        self.consumers
            .lock()
            .insert(topic_name.to_owned(), HashMap::new());

        if let Err(e) = self.store.lock().create_topic(topic_name) {
            warn!(topic = topic_name, error = %e, "store rejected topic creation");
            self.topics.lock().remove(topic_name);
            self.consumers.lock().remove(topic_name);
            return Err(e);
        }

        Ok(topic)
    }

    /// Removes a topic: drops it from the registry, disconnects every
    /// consumer attached to it, then deletes it from the store.
    pub fn remove_topic(&self, topic_name: &str) -> Result<()> {
        let removed = self.topics.lock().remove(topic_name);
        let Some(topic) = removed else {
            return Err(RelaymqError::NoSuchTopic(topic_name.to_owned()));
        };
        // wake the persistence worker and any push worker still draining
        topic.close();

        if let Some(attached) = self.consumers.lock().remove(topic_name) {
            for (_, shutdown) in attached {
                // a worker that already exited is fine
                let _ = shutdown.send(());
            }
        }

        self.store.lock().delete_topic(topic_name)
    }

    /// Attaches a consumer connection to a topic. The returned id pairs with
    /// the shutdown channel: the manager fires it when the topic is removed
    /// or the broker shuts down.
    pub fn register_consumer(
        &self,
        topic_name: &str,
        shutdown: oneshot::Sender<()>,
    ) -> Result<ConsumerId> {
        if !self.topic_exists(topic_name) {
            return Err(RelaymqError::NoSuchTopic(topic_name.to_owned()));
        }

        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        if let Some(attached) = self.consumers.lock().get_mut(topic_name) {
            attached.insert(id, shutdown);
        }
        Ok(id)
    }

    /// Detaches a consumer connection, called by its push worker on exit.
    pub fn deregister_consumer(&self, topic_name: &str, id: ConsumerId) {
        if let Some(attached) = self.consumers.lock().get_mut(topic_name) {
            attached.remove(&id);
        }
    }

    /// Persists one completed post.
    pub fn persist_post(&self, post: &crate::protocol::Post, topic_name: &str) -> Result<()> {
        self.store.lock().write_post(post, topic_name)
    }

    /// Disconnects every consumer of every topic, part of orderly broker
    /// shutdown.
    pub fn close(&self) {
        debug!("closing all consumer connections");
        let mut consumers = self.consumers.lock();
        for (_, attached) in consumers.iter_mut() {
            for (_, shutdown) in attached.drain() {
                let _ = shutdown.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Post, PostInfo, Topic};
    use bytes::Bytes;

    /// In-memory store stub for registry tests.
    #[derive(Default)]
    struct MemoryStore {
        topics: HashMap<String, Vec<Post>>,
        fail_writes: bool,
    }

    impl TopicStore for MemoryStore {
        fn create_topic(&mut self, topic_name: &str) -> Result<()> {
            if self.fail_writes {
                return Err(RelaymqError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.topics.insert(topic_name.into(), Vec::new());
            Ok(())
        }

        fn delete_topic(&mut self, topic_name: &str) -> Result<()> {
            self.topics.remove(topic_name);
            Ok(())
        }

        fn write_post(&mut self, post: &Post, topic_name: &str) -> Result<()> {
            self.topics
                .get_mut(topic_name)
                .ok_or_else(|| RelaymqError::NoSuchTopic(topic_name.into()))?
                .push(post.clone());
            Ok(())
        }

        fn read_all_topics(&self) -> Result<Vec<Topic>> {
            Ok(self
                .topics
                .iter()
                .map(|(name, posts)| Topic::new(name.clone(), posts.clone()))
                .collect())
        }
    }

    #[test]
    fn add_topic_then_lookup() {
        let manager = BrokerTopicManager::new(Box::<MemoryStore>::default()).unwrap();

        manager.add_topic("news").unwrap();
        assert!(manager.topic_exists("news"));
        assert_eq!(manager.topic("news").unwrap().name(), "news");
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let manager = BrokerTopicManager::new(Box::<MemoryStore>::default()).unwrap();

        manager.add_topic("news").unwrap();
        assert!(matches!(
            manager.add_topic("news"),
            Err(RelaymqError::TopicExists(_))
        ));
    }

    #[test]
    fn store_failure_rolls_back_the_registry_entry() {
        let store = MemoryStore {
            fail_writes: true,
            ..Default::default()
        };
        let manager = BrokerTopicManager::new(Box::new(store)).unwrap();

        assert!(manager.add_topic("news").is_err());
        assert!(!manager.topic_exists("news"));
    }

    #[test]
    fn remove_unknown_topic_fails() {
        let manager = BrokerTopicManager::new(Box::<MemoryStore>::default()).unwrap();
        assert!(matches!(
            manager.remove_topic("ghost"),
            Err(RelaymqError::NoSuchTopic(_))
        ));
    }

    #[test]
    fn register_consumer_requires_the_topic() {
        let manager = BrokerTopicManager::new(Box::<MemoryStore>::default()).unwrap();
        let (tx, _rx) = oneshot::channel();
        assert!(manager.register_consumer("ghost", tx).is_err());
    }

    #[tokio::test]
    async fn remove_topic_disconnects_attached_consumers() {
        let manager = BrokerTopicManager::new(Box::<MemoryStore>::default()).unwrap();
        manager.add_topic("news").unwrap();

        let (tx, rx) = oneshot::channel();
        manager.register_consumer("news", tx).unwrap();

        manager.remove_topic("news").unwrap();
        assert!(rx.await.is_ok());
        assert!(!manager.topic_exists("news"));
    }

    #[tokio::test]
    async fn close_disconnects_consumers_of_every_topic() {
        let manager = BrokerTopicManager::new(Box::<MemoryStore>::default()).unwrap();
        manager.add_topic("a").unwrap();
        manager.add_topic("b").unwrap();

        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        manager.register_consumer("a", tx_a).unwrap();
        manager.register_consumer("b", tx_b).unwrap();

        manager.close();
        assert!(rx_a.await.is_ok());
        assert!(rx_b.await.is_ok());
    }

    #[test]
    fn reload_restores_topics_and_posts() {
        let mut store = MemoryStore::default();
        store.create_topic("news").unwrap();
        store
            .write_post(
                &Post::new(PostInfo::new("alice", "txt", 5), Bytes::from_static(b"hi")),
                "news",
            )
            .unwrap();

        let manager = BrokerTopicManager::new(Box::new(store)).unwrap();
        let topic = manager.topic("news").unwrap();

        let posts = topic.posts_since(crate::protocol::FETCH_ALL_POSTS);
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0.id, 5);
    }
}
