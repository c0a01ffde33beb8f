//! File-system reference implementation of the [`TopicStore`] contract.
//!
//! Layout, one directory per topic:
//!
//! ```text
//! <root>/<topic>/HEAD                      name of the newest post file, or empty
//! <root>/<topic>/{id}-{poster}.{ext}       raw payload of one post
//! <root>/<topic>/{id}-{poster}.{ext}.meta  post file that was HEAD when this one was written
//! ```
//!
//! The `.meta` sidecars form a singly-linked list from newest to oldest, so
//! loading a topic walks the chain from `HEAD` and reverses. Writing a post
//! is payload first, then the back-link, then the `HEAD` swing, which keeps
//! a crash from ever corrupting posts already on disk.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::TopicStore;
use crate::protocol::{Post, PostInfo, Topic};
use crate::{RelaymqError, Result};

const HEAD: &str = "HEAD";
const META_EXTENSION: &str = ".meta";

fn post_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<id>-?\d+)-(?P<poster>\w+)\.(?P<ext>.*)$").expect("pattern is valid")
    })
}

/// Stores topics as directories under a root that must already exist.
pub struct TopicFileStore {
    root: PathBuf,
}

impl TopicFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(RelaymqError::Config(format!(
                "topic store root '{}' is not an existing directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    fn topic_dir(&self, topic_name: &str) -> PathBuf {
        self.root.join(topic_name)
    }

    fn head_path(&self, topic_name: &str) -> PathBuf {
        self.topic_dir(topic_name).join(HEAD)
    }

    fn topic_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    fn read_topic(&self, topic_name: &str) -> Result<Topic> {
        let dir = self.topic_dir(topic_name);

        // walk the back-link chain newest to oldest
        let mut posts = Vec::new();
        let mut next = head_contents(&self.head_path(topic_name))?;
        while let Some(file_name) = next {
            let info = post_info_from_file_name(&file_name)?;
            let data = fs::read(dir.join(&file_name))?;
            posts.push(Post::new(info, data));

            let meta = dir.join(format!("{file_name}{META_EXTENSION}"));
            next = head_contents(&meta)?;
        }

        posts.reverse();
        Ok(Topic::new(topic_name, posts))
    }
}

impl TopicStore for TopicFileStore {
    fn create_topic(&mut self, topic_name: &str) -> Result<()> {
        fs::create_dir(self.topic_dir(topic_name))?;
        fs::write(self.head_path(topic_name), b"")?;
        Ok(())
    }

    fn delete_topic(&mut self, topic_name: &str) -> Result<()> {
        fs::remove_dir_all(self.topic_dir(topic_name))?;
        Ok(())
    }

    fn write_post(&mut self, post: &Post, topic_name: &str) -> Result<()> {
        let dir = self.topic_dir(topic_name);
        let file_name = file_name_for(&post.info);

        fs::write(dir.join(&file_name), &post.data)?;

        let head = self.head_path(topic_name);
        let previous_head = fs::read(&head)?;
        fs::write(dir.join(format!("{file_name}{META_EXTENSION}")), previous_head)?;
        fs::write(head, file_name.as_bytes())?;
        Ok(())
    }

    fn read_all_topics(&self) -> Result<Vec<Topic>> {
        self.topic_names()?
            .into_iter()
            .map(|name| self.read_topic(&name))
            .collect()
    }
}

/// Reads a HEAD or meta file, mapping empty contents to "no further post".
fn head_contents(path: &Path) -> Result<Option<String>> {
    let contents = fs::read(path)?;
    if contents.is_empty() {
        return Ok(None);
    }
    String::from_utf8(contents)
        .map(Some)
        .map_err(|_| RelaymqError::BadFileName(format!("{} is not UTF-8", path.display())))
}

fn file_name_for(info: &PostInfo) -> String {
    format!("{}-{}.{}", info.id, info.poster_name, info.file_extension)
}

fn post_info_from_file_name(file_name: &str) -> Result<PostInfo> {
    let captures = post_file_pattern()
        .captures(file_name)
        .ok_or_else(|| RelaymqError::BadFileName(file_name.to_owned()))?;

    let id = captures["id"]
        .parse()
        .map_err(|_| RelaymqError::BadFileName(file_name.to_owned()))?;

    Ok(PostInfo::new(&captures["poster"], &captures["ext"], id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn store() -> (TempDir, TopicFileStore) {
        let dir = TempDir::new().unwrap();
        let store = TopicFileStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn post(id: i64, poster: &str, ext: &str, data: &'static [u8]) -> Post {
        Post::new(PostInfo::new(poster, ext, id), Bytes::from_static(data))
    }

    #[test]
    fn missing_root_is_rejected() {
        assert!(matches!(
            TopicFileStore::new("/nonexistent/relaymq-store"),
            Err(RelaymqError::Config(_))
        ));
    }

    #[test]
    fn create_topic_writes_empty_head() {
        let (dir, mut store) = store();
        store.create_topic("news").unwrap();

        let head = dir.path().join("news").join("HEAD");
        assert_eq!(fs::read(head).unwrap(), b"");
    }

    #[test]
    fn duplicate_create_fails() {
        let (_dir, mut store) = store();
        store.create_topic("news").unwrap();
        assert!(store.create_topic("news").is_err());
    }

    #[test]
    fn write_then_read_preserves_order_and_contents() {
        let (_dir, mut store) = store();
        store.create_topic("news").unwrap();

        store.write_post(&post(1, "alice", "txt", b"first"), "news").unwrap();
        store.write_post(&post(2, "bob", "md", b"second"), "news").unwrap();
        store.write_post(&post(3, "alice", "txt", b"third"), "news").unwrap();

        let topics = store.read_all_topics().unwrap();
        assert_eq!(topics.len(), 1);

        let topic = &topics[0];
        assert_eq!(topic.name, "news");
        assert_eq!(
            topic.posts.iter().map(|p| p.info.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(topic.posts[0].data, Bytes::from_static(b"first"));
        assert_eq!(topic.posts[1].info.poster_name, "bob");
        assert_eq!(topic.posts[1].info.file_extension, "md");
    }

    #[test]
    fn negative_ids_survive_the_filename_format() {
        let (_dir, mut store) = store();
        store.create_topic("t").unwrap();
        store.write_post(&post(-42, "eve", "bin", b"x"), "t").unwrap();

        let topics = store.read_all_topics().unwrap();
        assert_eq!(topics[0].posts[0].info.id, -42);
    }

    #[test]
    fn head_points_at_latest_post() {
        let (dir, mut store) = store();
        store.create_topic("t").unwrap();
        store.write_post(&post(1, "alice", "txt", b"a"), "t").unwrap();
        store.write_post(&post(2, "alice", "txt", b"b"), "t").unwrap();

        let head = fs::read_to_string(dir.path().join("t").join("HEAD")).unwrap();
        assert_eq!(head, "2-alice.txt");
    }

    #[test]
    fn delete_topic_removes_the_directory() {
        let (dir, mut store) = store();
        store.create_topic("t").unwrap();
        store.write_post(&post(1, "alice", "txt", b"a"), "t").unwrap();

        store.delete_topic("t").unwrap();
        assert!(!dir.path().join("t").exists());
        assert!(store.read_all_topics().unwrap().is_empty());
    }

    #[test]
    fn unparseable_post_filename_fails_the_load() {
        let (dir, mut store) = store();
        store.create_topic("t").unwrap();

        // hand-corrupt the head to point at a malformed file name
        fs::write(dir.path().join("t").join("garbage"), b"data").unwrap();
        fs::write(dir.path().join("t").join("HEAD"), b"garbage").unwrap();

        assert!(matches!(
            store.read_all_topics(),
            Err(RelaymqError::BadFileName(_))
        ));
    }

    #[test]
    fn filename_pattern_golden_cases() {
        assert!(post_info_from_file_name("1-alice.txt").is_ok());
        assert!(post_info_from_file_name("-7-bob_2.tar.gz").is_ok());
        assert!(post_info_from_file_name("x-alice.txt").is_err());
        assert!(post_info_from_file_name("1-al ice.txt").is_err());
        assert!(post_info_from_file_name("1-alice").is_err());

        let info = post_info_from_file_name("-7-bob_2.tar.gz").unwrap();
        assert_eq!(info.id, -7);
        assert_eq!(info.poster_name, "bob_2");
        assert_eq!(info.file_extension, "tar.gz");
    }
}
