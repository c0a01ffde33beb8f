//! # RelayMQ Wire Protocol
//!
//! Every client-broker and broker-broker exchange is a single framed stream
//! of self-describing records. A frame is a `u32` big-endian length prefix
//! followed by a one-byte record tag and the record body; all integers are
//! big-endian, strings are `i16`-length-prefixed UTF-8 and payloads are
//! `i32`-length-prefixed byte arrays.
//!
//! The format is fixed: both the broker and the client crate use this module,
//! and golden-byte tests pin the encoding so independent implementations can
//! interoperate.
//!
//! ## Modules
//!
//! - [`records`] - record definitions: [`PostInfo`], [`Packet`], [`Post`],
//!   [`TopicToken`], [`ConnectionInfo`] and the [`Request`] header
//! - [`codec`] - the [`FrameCodec`] for `tokio_util::codec::Framed` transports
//! - [`hash`] - the MD5-fold topic hash that drives topic-to-broker assignment

pub mod codec;
pub mod hash;
pub mod records;

pub use codec::FrameCodec;
pub use hash::{owner_index, topic_hash};
pub use records::{
    ConnectionInfo, Frame, Packet, Post, PostAssembler, PostId, PostInfo, Request, Topic,
    TopicToken, FETCH_ALL_POSTS, KEEP_ALIVE,
};
