//! The local profile: subscribed topics, their saved posts and unread
//! counts, plus the store that persists them.
//!
//! A profile directory mirrors the broker's topic store layout, one topic
//! subdirectory per subscription, holding only the posts this user has
//! actually pulled.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use relaymq::protocol::{Post, PostId, Topic};
use relaymq::storage::{TopicFileStore, TopicStore};

use crate::error::ClientError;
use crate::Result;

/// In-memory state of one user profile.
pub struct Profile {
    name: String,
    topics: HashMap<String, Topic>,
    unread: HashMap<String, u32>,
}

impl Profile {
    /// A fresh profile with no subscriptions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topics: HashMap::new(),
            unread: HashMap::new(),
        }
    }

    /// Rebuilds a profile from the topics its store holds.
    pub fn from_topics(name: impl Into<String>, topics: Vec<Topic>) -> Self {
        let mut profile = Self::new(name);
        for topic in topics {
            profile.unread.insert(topic.name.clone(), 0);
            profile.topics.insert(topic.name.clone(), topic);
        }
        profile
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_subscribed(&self, topic_name: &str) -> bool {
        self.topics.contains_key(topic_name)
    }

    /// Names and resume cursors of every subscribed topic.
    pub fn subscriptions(&self) -> Vec<(String, PostId)> {
        self.topics
            .values()
            .map(|topic| (topic.name.clone(), topic.last_post_id()))
            .collect()
    }

    /// Id of the last saved post of a topic.
    pub fn last_post_id(&self, topic_name: &str) -> Result<PostId> {
        self.topics
            .get(topic_name)
            .map(Topic::last_post_id)
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))
    }

    /// Subscribes to a new, empty topic.
    pub fn add_topic(&mut self, topic_name: &str) -> Result<()> {
        if self.is_subscribed(topic_name) {
            return Err(ClientError::TopicExists(topic_name.to_owned()));
        }
        self.topics
            .insert(topic_name.to_owned(), Topic::new(topic_name, Vec::new()));
        self.unread.insert(topic_name.to_owned(), 0);
        Ok(())
    }

    pub fn remove_topic(&mut self, topic_name: &str) -> Result<()> {
        if self.topics.remove(topic_name).is_none() {
            return Err(ClientError::NoSuchTopic(topic_name.to_owned()));
        }
        self.unread.remove(topic_name);
        Ok(())
    }

    /// Appends freshly pulled posts to a subscribed topic.
    pub fn update_topic(&mut self, topic_name: &str, posts: &[Post]) -> Result<()> {
        let topic = self
            .topics
            .get_mut(topic_name)
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))?;
        topic.posts.extend_from_slice(posts);
        Ok(())
    }

    pub fn mark_unread(&mut self, topic_name: &str) -> Result<()> {
        let count = self
            .unread
            .get_mut(topic_name)
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))?;
        *count += 1;
        Ok(())
    }

    pub fn clear_unread(&mut self, topic_name: &str) -> Result<()> {
        let count = self
            .unread
            .get_mut(topic_name)
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))?;
        *count = 0;
        Ok(())
    }

    pub fn unread_count(&self, topic_name: &str) -> Result<u32> {
        self.unread
            .get(topic_name)
            .copied()
            .ok_or_else(|| ClientError::NoSuchTopic(topic_name.to_owned()))
    }
}

/// Persistence contract for user profiles. One profile is "current" at a
/// time; topic operations apply to it.
pub trait ProfileStore: Send {
    /// Creates an empty profile and makes it current.
    fn create_new_profile(&mut self, profile_name: &str) -> Result<()>;

    /// Makes an existing profile current and loads its topics.
    fn load_profile(&mut self, profile_name: &str) -> Result<Vec<Topic>>;

    /// Creates a topic directory in the current profile.
    fn create_topic(&mut self, topic_name: &str) -> Result<()>;

    /// Removes a topic and its posts from the current profile.
    fn delete_topic(&mut self, topic_name: &str) -> Result<()>;

    /// Saves one pulled post into the current profile.
    fn save_post(&mut self, post: &Post, topic_name: &str) -> Result<()>;
}

/// Directory-per-profile store; each profile reuses the broker's topic
/// store layout for its topic subdirectories.
pub struct ProfileFileStore {
    root: PathBuf,
    current: Option<(String, TopicFileStore)>,
}

impl ProfileFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ClientError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("profile root '{}' is not an existing directory", root.display()),
            )));
        }
        Ok(Self {
            root,
            current: None,
        })
    }

    fn current_store(&mut self) -> Result<&mut TopicFileStore> {
        self.current
            .as_mut()
            .map(|(_, store)| store)
            .ok_or_else(|| ClientError::NoSuchProfile("<none selected>".to_owned()))
    }
}

impl ProfileStore for ProfileFileStore {
    fn create_new_profile(&mut self, profile_name: &str) -> Result<()> {
        let dir = self.root.join(profile_name);
        fs::create_dir(&dir)?;
        self.current = Some((profile_name.to_owned(), TopicFileStore::new(dir)?));
        Ok(())
    }

    fn load_profile(&mut self, profile_name: &str) -> Result<Vec<Topic>> {
        let dir = self.root.join(profile_name);
        if !dir.is_dir() {
            return Err(ClientError::NoSuchProfile(profile_name.to_owned()));
        }

        let store = TopicFileStore::new(dir)?;
        let topics = store.read_all_topics()?;
        self.current = Some((profile_name.to_owned(), store));
        Ok(topics)
    }

    fn create_topic(&mut self, topic_name: &str) -> Result<()> {
        Ok(self.current_store()?.create_topic(topic_name)?)
    }

    fn delete_topic(&mut self, topic_name: &str) -> Result<()> {
        Ok(self.current_store()?.delete_topic(topic_name)?)
    }

    fn save_post(&mut self, post: &Post, topic_name: &str) -> Result<()> {
        Ok(self.current_store()?.write_post(post, topic_name)?)
    }
}
