//! Framed binary codec for the RelayMQ wire protocol.
//!
//! Frame layout: `u32` big-endian body length, then a one-byte record tag
//! and the record body. Strings are `i16`-length-prefixed UTF-8, payloads
//! are `i32`-length-prefixed byte arrays, every integer is big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use super::records::{ConnectionInfo, Frame, Packet, PostInfo, Request, TopicToken};
use crate::{RelaymqError, Result};

const TAG_REQUEST: u8 = 0x01;
const TAG_POST_INFO: u8 = 0x02;
const TAG_PACKET: u8 = 0x03;
const TAG_CONNECTION_INFO: u8 = 0x04;
const TAG_TOPIC_TOKEN: u8 = 0x05;
const TAG_BOOL: u8 = 0x06;
const TAG_POST_COUNT: u8 = 0x07;

const REQ_DATA_PACKET_SEND: u8 = 0;
const REQ_INITIALISE_CONSUMER: u8 = 1;
const REQ_BROKER_DISCOVERY: u8 = 2;
const REQ_CREATE_TOPIC: u8 = 3;
const REQ_DELETE_TOPIC: u8 = 4;

const LENGTH_PREFIX: usize = 4;

/// Upper bound on a single frame body. A packet payload tops out at 64 KiB,
/// so anything near this limit is a corrupt or hostile stream.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Stateless codec turning a TCP stream into a stream of [`Frame`] records.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RelaymqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(RelaymqError::Protocol(format!(
                "frame of {body_len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }
        if src.len() < LENGTH_PREFIX + body_len {
            src.reserve(LENGTH_PREFIX + body_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(body_len).freeze();
        decode_body(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RelaymqError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        encode_body(&frame, &mut body);

        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

fn encode_body(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::Request(request) => {
            buf.put_u8(TAG_REQUEST);
            match request {
                Request::DataPacketSend(name) => {
                    buf.put_u8(REQ_DATA_PACKET_SEND);
                    put_string(buf, name);
                }
                Request::InitialiseConsumer(token) => {
                    buf.put_u8(REQ_INITIALISE_CONSUMER);
                    put_string(buf, &token.name);
                    buf.put_i64(token.last_seen_id);
                }
                Request::BrokerDiscovery(name) => {
                    buf.put_u8(REQ_BROKER_DISCOVERY);
                    put_string(buf, name);
                }
                Request::CreateTopic(name) => {
                    buf.put_u8(REQ_CREATE_TOPIC);
                    put_string(buf, name);
                }
                Request::DeleteTopic(name) => {
                    buf.put_u8(REQ_DELETE_TOPIC);
                    put_string(buf, name);
                }
            }
        }
        Frame::PostInfo(info) => {
            buf.put_u8(TAG_POST_INFO);
            put_string(buf, &info.poster_name);
            put_string(buf, &info.file_extension);
            buf.put_i64(info.id);
        }
        Frame::Packet(packet) => {
            buf.put_u8(TAG_PACKET);
            buf.put_i64(packet.post_id);
            buf.put_u32(packet.index);
            buf.put_u8(packet.is_final as u8);
            put_bytes(buf, &packet.payload);
        }
        Frame::ConnectionInfo(ci) => {
            buf.put_u8(TAG_CONNECTION_INFO);
            put_string(buf, &ci.host);
            buf.put_u16(ci.port);
        }
        Frame::TopicToken(token) => {
            buf.put_u8(TAG_TOPIC_TOKEN);
            put_string(buf, &token.name);
            buf.put_i64(token.last_seen_id);
        }
        Frame::Bool(value) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(*value as u8);
        }
        Frame::PostCount(count) => {
            buf.put_u8(TAG_POST_COUNT);
            buf.put_i32(*count);
        }
    }
}

fn decode_body(body: Bytes) -> Result<Frame> {
    let mut cursor = Cursor::new(body.as_ref());
    let tag = get_u8(&mut cursor)?;

    let frame = match tag {
        TAG_REQUEST => {
            let kind = get_u8(&mut cursor)?;
            let request = match kind {
                REQ_DATA_PACKET_SEND => Request::DataPacketSend(get_string(&mut cursor)?),
                REQ_INITIALISE_CONSUMER => {
                    let name = get_string(&mut cursor)?;
                    let last_seen_id = get_i64(&mut cursor)?;
                    Request::InitialiseConsumer(TopicToken { name, last_seen_id })
                }
                REQ_BROKER_DISCOVERY => Request::BrokerDiscovery(get_string(&mut cursor)?),
                REQ_CREATE_TOPIC => Request::CreateTopic(get_string(&mut cursor)?),
                REQ_DELETE_TOPIC => Request::DeleteTopic(get_string(&mut cursor)?),
                other => {
                    return Err(RelaymqError::Protocol(format!(
                        "unknown request kind {other}"
                    )))
                }
            };
            Frame::Request(request)
        }
        TAG_POST_INFO => {
            let poster_name = get_string(&mut cursor)?;
            let file_extension = get_string(&mut cursor)?;
            let id = get_i64(&mut cursor)?;
            Frame::PostInfo(PostInfo {
                poster_name,
                file_extension,
                id,
            })
        }
        TAG_PACKET => {
            let post_id = get_i64(&mut cursor)?;
            let index = get_u32(&mut cursor)?;
            let is_final = get_u8(&mut cursor)? != 0;
            let offset = cursor.position() as usize;
            let payload = get_payload(&mut cursor, &body, offset)?;
            Frame::Packet(Packet {
                post_id,
                index,
                is_final,
                payload,
            })
        }
        TAG_CONNECTION_INFO => {
            let host = get_string(&mut cursor)?;
            let port = get_u16(&mut cursor)?;
            Frame::ConnectionInfo(ConnectionInfo { host, port })
        }
        TAG_TOPIC_TOKEN => {
            let name = get_string(&mut cursor)?;
            let last_seen_id = get_i64(&mut cursor)?;
            Frame::TopicToken(TopicToken { name, last_seen_id })
        }
        TAG_BOOL => Frame::Bool(get_u8(&mut cursor)? != 0),
        TAG_POST_COUNT => Frame::PostCount(get_i32(&mut cursor)?),
        other => return Err(RelaymqError::Protocol(format!("unknown record tag {other}"))),
    };

    if cursor.has_remaining() {
        return Err(RelaymqError::Protocol(format!(
            "{} trailing bytes after record with tag {tag}",
            cursor.remaining()
        )));
    }

    Ok(frame)
}

// ==================== wire primitives ====================

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

fn get_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    ensure_remaining(cursor, 1)?;
    Ok(cursor.get_u8())
}

fn get_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    ensure_remaining(cursor, 2)?;
    Ok(cursor.get_u16())
}

fn get_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    ensure_remaining(cursor, 4)?;
    Ok(cursor.get_u32())
}

fn get_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    ensure_remaining(cursor, 4)?;
    Ok(cursor.get_i32())
}

fn get_i64(cursor: &mut Cursor<&[u8]>) -> Result<i64> {
    ensure_remaining(cursor, 8)?;
    Ok(cursor.get_i64())
}

fn get_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    ensure_remaining(cursor, 2)?;
    let len = cursor.get_i16();
    if len < 0 {
        return Err(RelaymqError::Protocol(format!("negative string length {len}")));
    }

    let len = len as usize;
    ensure_remaining(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| RelaymqError::Protocol("string is not UTF-8".into()))
}

/// Reads a length-prefixed payload as a zero-copy slice of the frame body.
fn get_payload(cursor: &mut Cursor<&[u8]>, body: &Bytes, offset: usize) -> Result<Bytes> {
    ensure_remaining(cursor, 4)?;
    let len = cursor.get_i32();
    if len < 0 {
        return Err(RelaymqError::Protocol(format!("negative payload length {len}")));
    }

    let len = len as usize;
    ensure_remaining(cursor, len)?;
    cursor.advance(len);
    Ok(body.slice(offset + 4..offset + 4 + len))
}

fn ensure_remaining(cursor: &Cursor<&[u8]>, needed: usize) -> Result<()> {
    if cursor.remaining() < needed {
        Err(RelaymqError::Protocol(format!(
            "record truncated: needed {needed} more bytes, {} available",
            cursor.remaining()
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FETCH_ALL_POSTS;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    fn round_trip(frame: Frame) {
        let mut buf = encode(frame.clone());
        let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    // The wire format is a compatibility contract; these byte sequences must
    // never change.
    #[test]
    fn golden_bytes_create_topic_request() {
        let buf = encode(Frame::Request(Request::CreateTopic("t".into())));
        assert_eq!(
            buf.as_ref(),
            [0, 0, 0, 5, TAG_REQUEST, REQ_CREATE_TOPIC, 0, 1, b't']
        );
    }

    #[test]
    fn golden_bytes_topic_token() {
        let buf = encode(Frame::Request(Request::InitialiseConsumer(TopicToken::new("ab", 3))));
        assert_eq!(
            buf.as_ref(),
            [
                0, 0, 0, 14, TAG_REQUEST, REQ_INITIALISE_CONSUMER, 0, 2, b'a', b'b', 0, 0, 0, 0,
                0, 0, 0, 3
            ]
        );
    }

    #[test]
    fn golden_bytes_packet() {
        let packet = Packet {
            post_id: 1,
            index: 0,
            is_final: true,
            payload: Bytes::from_static(b"hi"),
        };
        let buf = encode(Frame::Packet(packet));
        assert_eq!(
            buf.as_ref(),
            [
                0, 0, 0, 20, TAG_PACKET, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0, 2, b'h',
                b'i'
            ]
        );
    }

    #[test]
    fn golden_bytes_connection_info() {
        let buf = encode(Frame::ConnectionInfo(ConnectionInfo::new("h", 29621)));
        assert_eq!(
            buf.as_ref(),
            [0, 0, 0, 6, TAG_CONNECTION_INFO, 0, 1, b'h', 0x73, 0xB5]
        );
    }

    #[test]
    fn round_trips_every_record_shape() {
        round_trip(Frame::Request(Request::DataPacketSend("news".into())));
        round_trip(Frame::Request(Request::BrokerDiscovery("".into())));
        round_trip(Frame::Request(Request::DeleteTopic("news".into())));
        round_trip(Frame::PostInfo(PostInfo::new("alice", "txt", -1)));
        round_trip(Frame::Packet(Packet {
            post_id: i64::MAX,
            index: 3,
            is_final: false,
            payload: Bytes::from(vec![0u8; 100]),
        }));
        round_trip(Frame::TopicToken(TopicToken::new("t", FETCH_ALL_POSTS)));
        round_trip(Frame::Bool(true));
        round_trip(Frame::Bool(false));
        round_trip(Frame::PostCount(i32::MAX));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let full = encode(Frame::Bool(true));
        let mut partial = BytesMut::from(&full[..3]);
        assert!(FrameCodec::new().decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(RelaymqError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(0xFF);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(RelaymqError::Protocol(_))
        ));
    }

    #[test]
    fn trailing_garbage_is_a_protocol_violation() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(TAG_BOOL);
        buf.put_u8(1);
        buf.put_u8(99);
        assert!(matches!(
            FrameCodec::new().decode(&mut buf),
            Err(RelaymqError::Protocol(_))
        ));
    }

    #[test]
    fn two_frames_in_one_buffer_decode_in_order() {
        let mut buf = encode(Frame::Bool(true));
        buf.extend_from_slice(&encode(Frame::PostCount(5)));

        let mut codec = FrameCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Bool(true)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::PostCount(5)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
