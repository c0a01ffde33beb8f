//! # Broker Node
//!
//! A broker owns the topics the cluster's hash function assigns to it and
//! serves publishers and consumers for those topics. Every broker runs two
//! listeners: a client port for publisher/consumer requests and a peer port
//! through which follower brokers join the leader.
//!
//! - [`server`] - the [`Broker`] itself: listeners, peer bookkeeping,
//!   cluster formation and orderly shutdown
//! - [`handler`] - one task per accepted connection: request dispatch, the
//!   publisher pull-loop, the keep-alive push worker and the per-topic
//!   persistence worker

pub mod handler;
pub mod server;

pub use server::{Broker, ShutdownHandle};
