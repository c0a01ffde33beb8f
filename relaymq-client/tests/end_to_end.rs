//! Facade-level scenarios against a real in-process broker.

use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use relaymq::config::BrokerConfig;
use relaymq::protocol::ConnectionInfo;
use relaymq::storage::TopicFileStore;
use relaymq::Broker;
use relaymq_client::{Tag, User, UserEvent, UserListener};

/// Forwards every event into a channel the test can await on.
struct EventCollector {
    tx: mpsc::UnboundedSender<UserEvent>,
}

impl UserListener for EventCollector {
    fn on_event(&mut self, event: &UserEvent) {
        let _ = self.tx.send(event.clone());
    }
}

async fn start_broker(data_dir: &Path) -> ConnectionInfo {
    let config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        advertised_host: "127.0.0.1".to_string(),
        client_port: 0,
        peer_port: 0,
        data_dir: data_dir.to_path_buf(),
        leader: None,
    };
    let store = TopicFileStore::new(data_dir).unwrap();
    let broker = Broker::new(config, Box::new(store)).await.unwrap();
    let addr = broker.client_addr().unwrap();
    tokio::spawn(broker.run());
    ConnectionInfo::new("127.0.0.1", addr.port())
}

fn new_user(broker: &ConnectionInfo, profiles: &TempDir, name: &str) -> (User, EventStream) {
    let user = User::create_new(broker.clone(), profiles.path(), name).unwrap();
    let events = watch(&user);
    (user, events)
}

type EventStream = mpsc::UnboundedReceiver<UserEvent>;

fn watch(user: &User) -> EventStream {
    let (tx, rx) = mpsc::unbounded_channel();
    user.add_listener(Box::new(EventCollector { tx }));
    rx
}

/// Waits for the next event with the given tag, skipping unrelated ones.
async fn await_event(events: &mut EventStream, tag: Tag) -> UserEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if event.tag == tag {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {tag:?}"))
}

#[tokio::test]
async fn create_publish_pull_across_two_users() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let bob_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");
    let (bob, mut bob_events) = new_user(&broker, &bob_dir, "bob");

    alice.create_topic("t");
    assert!(await_event(&mut alice_events, Tag::TopicCreated).await.success);
    // creating a topic subscribes the creator automatically
    assert!(await_event(&mut alice_events, Tag::TopicListened).await.success);

    bob.listen_for_new_topic("t");
    assert!(await_event(&mut bob_events, Tag::TopicListened).await.success);

    alice.post_data("hi", "txt", "t");
    assert!(await_event(&mut alice_events, Tag::MessageSent).await.success);

    let received = await_event(&mut bob_events, Tag::MessageReceived).await;
    assert!(received.success);
    assert_eq!(received.topic_name, "t");

    let posts = bob.pull("t").unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].data.as_ref(), b"hi");
    assert_eq!(posts[0].info.poster_name, "alice");
    assert_eq!(posts[0].info.file_extension, "txt");

    // drained; the next pull is empty but the stream stays attached
    assert!(bob.pull("t").unwrap().is_empty());
}

#[tokio::test]
async fn unread_count_follows_received_posts() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");

    alice.create_topic("t");
    await_event(&mut alice_events, Tag::TopicListened).await;

    alice.post_data("one", "txt", "t");
    await_event(&mut alice_events, Tag::MessageReceived).await;
    alice.post_data("two", "txt", "t");
    await_event(&mut alice_events, Tag::MessageReceived).await;

    assert_eq!(alice.unread_count("t").unwrap(), 2);
}

#[tokio::test]
async fn deleting_a_topic_notifies_its_listeners() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let bob_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");
    let (bob, mut bob_events) = new_user(&broker, &bob_dir, "bob");

    alice.create_topic("t");
    await_event(&mut alice_events, Tag::TopicListened).await;

    bob.listen_for_new_topic("t");
    await_event(&mut bob_events, Tag::TopicListened).await;

    // bob deletes; alice finds out through her own stream
    bob.delete_topic("t");
    assert!(await_event(&mut bob_events, Tag::ServerTopicDeleted).await.success);
    assert!(await_event(&mut alice_events, Tag::TopicDeleted).await.success);

    // the topic is gone locally too
    assert!(alice.pull("t").is_err());
    assert!(!alice.is_subscribed("t"));
}

#[tokio::test]
async fn exactly_one_of_two_concurrent_creates_wins() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let bob_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");
    let (bob, mut bob_events) = new_user(&broker, &bob_dir, "bob");

    alice.create_topic("z");
    bob.create_topic("z");

    let alice_outcome = await_event(&mut alice_events, Tag::TopicCreated).await;
    let bob_outcome = await_event(&mut bob_events, Tag::TopicCreated).await;
    assert_ne!(
        alice_outcome.success, bob_outcome.success,
        "exactly one create must win"
    );

    // and the topic exists exactly once afterwards
    let carol_dir = TempDir::new().unwrap();
    let (carol, mut carol_events) = new_user(&broker, &carol_dir, "carol");
    carol.create_topic("z");
    assert!(!await_event(&mut carol_events, Tag::TopicCreated).await.success);
    carol.listen_for_new_topic("z");
    assert!(await_event(&mut carol_events, Tag::TopicListened).await.success);
}

#[tokio::test]
async fn profile_reload_resumes_after_the_last_pulled_post() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let bob_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");

    alice.create_topic("t");
    await_event(&mut alice_events, Tag::TopicListened).await;

    // bob's first session: receive and pull the first post
    let (bob, mut bob_events) = new_user(&broker, &bob_dir, "bob");
    bob.listen_for_new_topic("t");
    await_event(&mut bob_events, Tag::TopicListened).await;

    alice.post_data("first", "txt", "t");
    await_event(&mut bob_events, Tag::MessageReceived).await;
    let first = bob.pull("t").unwrap();
    assert_eq!(first.len(), 1);
    drop(bob);

    // posts published while bob is away
    alice.post_data("second", "txt", "t");
    await_event(&mut alice_events, Tag::MessageReceived).await;
    alice.post_data("third", "txt", "t");
    await_event(&mut alice_events, Tag::MessageReceived).await;

    // bob's second session resumes from the profile's last seen id
    let bob = User::load_existing(broker.clone(), bob_dir.path(), "bob").unwrap();
    let mut bob_events = watch(&bob);
    assert!(await_event(&mut bob_events, Tag::TopicLoaded).await.success);

    await_event(&mut bob_events, Tag::MessageReceived).await;
    await_event(&mut bob_events, Tag::MessageReceived).await;

    let resumed = bob.pull("t").unwrap();
    assert_eq!(resumed.len(), 2, "exactly the missed posts are delivered");
    assert_eq!(resumed[0].data.as_ref(), b"second");
    assert_eq!(resumed[1].data.as_ref(), b"third");
}

#[tokio::test]
async fn stop_listening_is_local_and_forgets_the_topic() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");

    alice.create_topic("t");
    await_event(&mut alice_events, Tag::TopicListened).await;

    alice.stop_listening_for_topic("t");
    assert!(await_event(&mut alice_events, Tag::TopicListenStopped).await.success);

    assert!(alice.pull("t").is_err());
    assert!(!alice.is_subscribed("t"));
}

#[tokio::test]
async fn profile_switch_does_not_disturb_the_next_profiles_topics() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let profiles_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &profiles_dir, "alice");

    alice.create_topic("t");
    await_event(&mut alice_events, Tag::TopicListened).await;

    // switching tears the old stream down silently, then the new profile
    // subscribes to a topic of the same name
    alice.switch_to_new_profile("beta").unwrap();
    alice.listen_for_new_topic("t");
    await_event(&mut alice_events, Tag::TopicListened).await;

    // give the cancelled worker time to wind down
    tokio::time::sleep(Duration::from_millis(100)).await;

    // the switch must not surface as a stop, and must not have removed the
    // new profile's local topic
    while let Ok(event) = alice_events.try_recv() {
        assert_ne!(
            event.tag,
            Tag::TopicListenStopped,
            "profile switch leaked a stop event"
        );
    }
    assert!(alice.is_subscribed("t"));
    assert!(profiles_dir.path().join("beta").join("t").is_dir());
}

#[tokio::test]
async fn operations_on_unsubscribed_topics_fail_fast() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");

    alice.post_data("hi", "txt", "nowhere");
    let failed = await_event(&mut alice_events, Tag::MessageSent).await;
    assert!(!failed.success);
    assert!(failed.cause.unwrap().contains("not subscribed"));

    alice.stop_listening_for_topic("nowhere");
    assert!(!await_event(&mut alice_events, Tag::TopicListenStopped).await.success);
}

#[tokio::test]
async fn listening_to_a_missing_topic_fails() {
    let broker_dir = TempDir::new().unwrap();
    let broker = start_broker(broker_dir.path()).await;

    let alice_dir = TempDir::new().unwrap();
    let (alice, mut alice_events) = new_user(&broker, &alice_dir, "alice");

    alice.listen_for_new_topic("ghost");
    let failed = await_event(&mut alice_events, Tag::TopicListened).await;
    assert!(!failed.success);
}
