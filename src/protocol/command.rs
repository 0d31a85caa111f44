//! Request and reply bodies carried inside frames.
//!
//! Layouts (big-endian, strings are `[u16 len][utf-8]`):
//!
//! | kind    | body                                                  |
//! |---------|-------------------------------------------------------|
//! | PUSH    | `[str queue][str key][u32 len][payload]`              |
//! | POP     | `[str queue][str key][u64 timeout_ms]`                |
//! | ACK     | empty                                                 |
//! | MESSAGE | `[str key][u64 enqueued_at_ms][u32 len][payload]`     |
//! | EMPTY   | empty                                                 |
//! | ERROR   | `[u16 code][str message]`                             |

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::message::Message;
use crate::protocol::frame::{
    encode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameType, HEADER_LEN,
};

pub const ERR_MALFORMED: u16 = 400;
pub const ERR_TOO_LARGE: u16 = 413;
pub const ERR_STOPPING: u16 = 503;
pub const ERR_QUEUE_FULL: u16 = 507;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Push {
        queue: String,
        key: String,
        payload: Bytes,
    },
    Pop {
        queue: String,
        key: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Message(Message),
    Empty,
    Error { code: u16, message: String },
}

impl Request {
    pub fn encode(&self, request_id: u64, dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
        let mut body = BytesMut::new();
        let kind = match self {
            Request::Push {
                queue,
                key,
                payload,
            } => {
                put_str(&mut body, "queue", queue)?;
                put_str(&mut body, "key", key)?;
                put_blob(&mut body, payload)?;
                FrameType::Push
            }
            Request::Pop {
                queue,
                key,
                timeout,
            } => {
                put_str(&mut body, "queue", queue)?;
                put_str(&mut body, "key", key)?;
                body.put_u64(timeout_millis(*timeout));
                FrameType::Pop
            }
        };
        encode_frame(
            &Frame {
                kind,
                request_id,
                payload: body.freeze(),
            },
            dst,
        )
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameDecodeError> {
        let mut body = frame.payload.clone();
        let request = match frame.kind {
            FrameType::Push => {
                let queue = get_str(&mut body, "queue")?;
                let key = get_str(&mut body, "key")?;
                let payload = get_blob(&mut body, "payload")?;
                Request::Push {
                    queue,
                    key,
                    payload,
                }
            }
            FrameType::Pop => {
                let queue = get_str(&mut body, "queue")?;
                let key = get_str(&mut body, "key")?;
                if body.remaining() < 8 {
                    return Err(FrameDecodeError::Truncated("timeout"));
                }
                let timeout = Duration::from_millis(body.get_u64());
                Request::Pop {
                    queue,
                    key,
                    timeout,
                }
            }
            other => return Err(FrameDecodeError::UnexpectedFrameType(other)),
        };
        ensure_consumed(&body)?;
        Ok(request)
    }
}

impl Reply {
    pub fn encode(&self, request_id: u64, dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
        let mut body = BytesMut::new();
        let kind = match self {
            Reply::Ack => FrameType::Ack,
            Reply::Empty => FrameType::Empty,
            Reply::Message(message) => return encode_message(request_id, message, dst),
            Reply::Error { code, message } => {
                body.put_u16(*code);
                put_str(&mut body, "message", message)?;
                FrameType::Error
            }
        };
        encode_frame(
            &Frame {
                kind,
                request_id,
                payload: body.freeze(),
            },
            dst,
        )
    }

    pub fn decode(frame: &Frame) -> Result<Self, FrameDecodeError> {
        let mut body = frame.payload.clone();
        let reply = match frame.kind {
            FrameType::Ack => Reply::Ack,
            FrameType::Empty => Reply::Empty,
            FrameType::Message => {
                let key = get_str(&mut body, "key")?;
                if body.remaining() < 8 {
                    return Err(FrameDecodeError::Truncated("enqueued_at"));
                }
                let enqueued_at = body.get_u64();
                let payload = get_blob(&mut body, "payload")?;
                Reply::Message(Message::with_timestamp(key, payload, enqueued_at))
            }
            FrameType::Error => {
                if body.remaining() < 2 {
                    return Err(FrameDecodeError::Truncated("code"));
                }
                let code = body.get_u16();
                let message = get_str(&mut body, "message")?;
                Reply::Error { code, message }
            }
            other => return Err(FrameDecodeError::UnexpectedFrameType(other)),
        };
        ensure_consumed(&body)?;
        Ok(reply)
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Reply::Error {
            code,
            message: message.into(),
        }
    }
}

/// Encodes a MESSAGE reply without wrapping the message in a [`Reply`], so
/// the caller keeps ownership if encoding fails.
pub fn encode_message(
    request_id: u64,
    message: &Message,
    dst: &mut BytesMut,
) -> Result<(), FrameEncodeError> {
    let mut body = BytesMut::new();
    put_str(&mut body, "key", message.key())?;
    body.put_u64(message.enqueued_at());
    put_blob(&mut body, message.payload())?;
    encode_frame(
        &Frame {
            kind: FrameType::Message,
            request_id,
            payload: body.freeze(),
        },
        dst,
    )
}

/// Value of the length prefix of the MESSAGE frame that carries `message`.
pub fn message_frame_len(message: &Message) -> usize {
    HEADER_LEN
        .saturating_add(2 + message.key().len())
        .saturating_add(8)
        .saturating_add(4 + message.payload().len())
}

/// Wire timeouts are whole milliseconds; round up so a positive timeout
/// never turns into a non-blocking poll.
pub fn timeout_millis(timeout: Duration) -> u64 {
    let nanos = timeout.as_nanos();
    u64::try_from(nanos.div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

fn put_str(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), FrameEncodeError> {
    let len = u16::try_from(value.len()).map_err(|_| FrameEncodeError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_blob(dst: &mut BytesMut, value: &[u8]) -> Result<(), FrameEncodeError> {
    let len = u32::try_from(value.len())
        .map_err(|_| FrameEncodeError::PayloadTooLarge(value.len()))?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

fn get_str(src: &mut Bytes, field: &'static str) -> Result<String, FrameDecodeError> {
    if src.remaining() < 2 {
        return Err(FrameDecodeError::Truncated(field));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(FrameDecodeError::Truncated(field));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameDecodeError::InvalidUtf8(field))
}

fn get_blob(src: &mut Bytes, field: &'static str) -> Result<Bytes, FrameDecodeError> {
    if src.remaining() < 4 {
        return Err(FrameDecodeError::Truncated(field));
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(FrameDecodeError::Truncated(field));
    }
    Ok(src.split_to(len))
}

fn ensure_consumed(src: &Bytes) -> Result<(), FrameDecodeError> {
    if src.has_remaining() {
        return Err(FrameDecodeError::TrailingBytes(src.remaining()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{try_decode_frame, DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_LEN};

    fn first_frame(buf: &mut BytesMut) -> Frame {
        try_decode_frame(buf, DEFAULT_MAX_FRAME_LEN)
            .unwrap()
            .expect("complete frame")
    }

    #[test]
    fn push_keeps_arbitrary_payload_bytes() {
        let payload: Vec<u8> = (0..=255u8).chain([0, 0, 0, 4]).collect();
        let req = Request::Push {
            queue: "world".into(),
            key: "hello".into(),
            payload: Bytes::from(payload),
        };
        let mut buf = BytesMut::new();
        req.encode(7, &mut buf).unwrap();
        let frame = first_frame(&mut buf);
        assert_eq!(frame.request_id, 7);
        assert_eq!(Request::decode(&frame).unwrap(), req);
    }

    #[test]
    fn pop_timeout_rounds_up_to_millis() {
        assert_eq!(timeout_millis(Duration::from_micros(1)), 1);
        assert_eq!(timeout_millis(Duration::from_secs_f64(1.5)), 1500);
        assert_eq!(timeout_millis(Duration::ZERO), 0);

        let req = Request::Pop {
            queue: "world".into(),
            key: "hello".into(),
            timeout: Duration::from_micros(2500),
        };
        let mut buf = BytesMut::new();
        req.encode(1, &mut buf).unwrap();
        match Request::decode(&first_frame(&mut buf)).unwrap() {
            Request::Pop { timeout, .. } => assert_eq!(timeout, Duration::from_millis(3)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_reply_carries_key_and_timestamp() {
        let msg = Message::with_timestamp("hello", Bytes::from_static(b""), 1234);
        let mut buf = BytesMut::new();
        Reply::Message(msg.clone()).encode(3, &mut buf).unwrap();
        assert_eq!(Reply::decode(&first_frame(&mut buf)).unwrap(), Reply::Message(msg));
    }

    #[test]
    fn message_frame_len_matches_the_encoded_frame() {
        let msg = Message::with_timestamp("hello", Bytes::from(vec![7u8; 300]), 42);
        let mut buf = BytesMut::new();
        encode_message(9, &msg, &mut buf).unwrap();
        assert_eq!(buf.len(), LENGTH_FIELD_LEN + message_frame_len(&msg));
        assert_eq!(Reply::decode(&first_frame(&mut buf)).unwrap(), Reply::Message(msg));
    }

    #[test]
    fn empty_and_error_are_distinct() {
        let mut buf = BytesMut::new();
        Reply::Empty.encode(1, &mut buf).unwrap();
        Reply::error(ERR_MALFORMED, "bad").encode(2, &mut buf).unwrap();
        assert_eq!(Reply::decode(&first_frame(&mut buf)).unwrap(), Reply::Empty);
        assert_eq!(
            Reply::decode(&first_frame(&mut buf)).unwrap(),
            Reply::Error {
                code: ERR_MALFORMED,
                message: "bad".into()
            }
        );
    }

    #[test]
    fn truncated_body_is_malformed_not_reinterpreted() {
        let mut body = BytesMut::new();
        body.put_u16(5);
        body.put_slice(b"wor");
        let frame = Frame {
            kind: FrameType::Push,
            request_id: 1,
            payload: body.freeze(),
        };
        assert_eq!(
            Request::decode(&frame),
            Err(FrameDecodeError::Truncated("queue"))
        );
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let req = Request::Pop {
            queue: "q".into(),
            key: "k".into(),
            timeout: Duration::from_secs(1),
        };
        let mut buf = BytesMut::new();
        req.encode(1, &mut buf).unwrap();
        let mut frame = first_frame(&mut buf);
        let mut payload = BytesMut::from(&frame.payload[..]);
        payload.put_u8(0xff);
        frame.payload = payload.freeze();
        assert_eq!(Request::decode(&frame), Err(FrameDecodeError::TrailingBytes(1)));
    }

    #[test]
    fn reply_kind_is_not_a_request() {
        let frame = Frame {
            kind: FrameType::Ack,
            request_id: 1,
            payload: Bytes::new(),
        };
        assert_eq!(
            Request::decode(&frame),
            Err(FrameDecodeError::UnexpectedFrameType(FrameType::Ack))
        );
    }

    #[test]
    fn invalid_utf8_key_is_malformed() {
        let mut body = BytesMut::new();
        body.put_u16(1);
        body.put_u8(b'q');
        body.put_u16(2);
        body.put_slice(&[0xc3, 0x28]);
        body.put_u64(0);
        let frame = Frame {
            kind: FrameType::Pop,
            request_id: 1,
            payload: body.freeze(),
        };
        assert_eq!(Request::decode(&frame), Err(FrameDecodeError::InvalidUtf8("key")));
    }
}
