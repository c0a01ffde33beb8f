//! # RelayMQ Client Library
//!
//! The client side of the RelayMQ post delivery fabric: publisher and
//! consumer nodes, broker discovery, the local profile store and the
//! [`User`] facade that applications talk to.
//!
//! Every public operation is asynchronous in the fire-and-forget sense: it
//! returns immediately, performs one request against the broker that owns
//! the topic, and reports its outcome as exactly one [`UserEvent`] on the
//! event bus.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relaymq::protocol::ConnectionInfo;
//! use relaymq_client::User;
//!
//! #[tokio::main]
//! async fn main() -> relaymq_client::Result<()> {
//!     let broker = ConnectionInfo::new("127.0.0.1", 29621);
//!     let user = User::create_new(broker, "./profiles", "alice")?;
//!
//!     user.create_topic("news");
//!     // outcome arrives as a UserEvent on the registered listeners
//!     Ok(())
//! }
//! ```

pub mod consumer;
pub mod discovery;
pub mod error;
pub mod events;
pub mod profile;
pub mod publisher;
pub mod user;

pub use consumer::Consumer;
pub use discovery::CiManager;
pub use error::ClientError;
pub use events::{EventSink, Tag, UserEvent, UserListener};
pub use profile::{Profile, ProfileFileStore, ProfileStore};
pub use publisher::{next_post_id, Publisher};
pub use user::User;

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;
