use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const LENGTH_FIELD_LEN: usize = 4;
/// kind (u8) + request id (u64)
pub const HEADER_LEN: usize = 1 + 8;
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Push = 0x01,
    Pop = 0x02,
    Ack = 0x81,
    Message = 0x82,
    Empty = 0x83,
    Error = 0x84,
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameDecodeError;

    fn try_from(value: u8) -> Result<Self, FrameDecodeError> {
        match value {
            0x01 => Ok(FrameType::Push),
            0x02 => Ok(FrameType::Pop),
            0x81 => Ok(FrameType::Ack),
            0x82 => Ok(FrameType::Message),
            0x83 => Ok(FrameType::Empty),
            0x84 => Ok(FrameType::Error),
            other => Err(FrameDecodeError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub request_id: u64,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u32),

    #[error("unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    #[error("unexpected frame type {0:?} in this direction")]
    UnexpectedFrameType(FrameType),

    #[error("truncated field `{0}`")]
    Truncated(&'static str),

    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),

    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("field `{field}` too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: u32 },
}

/// Encode a frame into the provided buffer.
#[inline]
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameEncodeError> {
    let payload_len = frame.payload.len();
    let total_len = HEADER_LEN
        .checked_add(payload_len)
        .ok_or(FrameEncodeError::PayloadTooLarge(payload_len))?;

    if total_len > u32::MAX as usize {
        return Err(FrameEncodeError::PayloadTooLarge(payload_len));
    }

    dst.reserve(LENGTH_FIELD_LEN + total_len);
    dst.put_u32(total_len as u32);
    dst.put_u8(frame.kind.into());
    dst.put_u64(frame.request_id);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Try to decode a single frame from the buffer.
///
/// Returns `Ok(None)` if there is not yet enough data to decode a full frame.
/// An oversized length prefix is rejected as soon as it arrives.
pub fn try_decode_frame(
    src: &mut BytesMut,
    max_frame_len: u32,
) -> Result<Option<Frame>, FrameDecodeError> {
    if src.len() < LENGTH_FIELD_LEN {
        return Ok(None);
    }

    let mut length_bytes = &src[..LENGTH_FIELD_LEN];
    let frame_len = length_bytes.get_u32();

    if frame_len > max_frame_len {
        return Err(FrameDecodeError::FrameTooLarge(frame_len));
    }

    let frame_len_usize = frame_len as usize;
    if frame_len_usize < HEADER_LEN {
        return Err(FrameDecodeError::InvalidLength(frame_len));
    }

    if src.len() < LENGTH_FIELD_LEN + frame_len_usize {
        return Ok(None);
    }

    let total = LENGTH_FIELD_LEN + frame_len_usize;
    let mut frame_bytes = src.split_to(total);
    frame_bytes.advance(LENGTH_FIELD_LEN);

    let kind = FrameType::try_from(frame_bytes.get_u8())?;
    let request_id = frame_bytes.get_u64();
    let payload = frame_bytes.freeze();

    Ok(Some(Frame {
        kind,
        request_id,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: FrameType, id: u64, payload: &'static [u8]) -> Frame {
        Frame {
            kind,
            request_id: id,
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let f1 = frame(FrameType::Push, 1, b"first");
        let f2 = frame(FrameType::Pop, 2, b"");

        let mut buf = BytesMut::new();
        encode_frame(&f1, &mut buf).unwrap();
        encode_frame(&f2, &mut buf).unwrap();

        assert_eq!(try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap(), Some(f1));
        assert_eq!(try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap(), Some(f2));
        assert!(try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_needs_more_bytes() {
        let f = frame(FrameType::Ack, 99, b"short");
        let mut full = BytesMut::new();
        encode_frame(&f, &mut full).unwrap();

        // Feed one byte at a time; only the last byte completes the frame.
        let mut buf = BytesMut::new();
        let bytes = full.freeze();
        for (i, b) in bytes.iter().enumerate() {
            buf.put_u8(*b);
            let decoded = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
            if i + 1 < bytes.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(f.clone()));
            }
        }
    }

    #[test]
    fn oversized_prefix_rejected_early() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        assert_eq!(
            try_decode_frame(&mut buf, 512),
            Err(FrameDecodeError::FrameTooLarge(1024))
        );
    }

    #[test]
    fn short_length_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(&[0, 0, 0]);
        assert_eq!(
            try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN),
            Err(FrameDecodeError::InvalidLength(3))
        );
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32(HEADER_LEN as u32);
        buf.put_u8(0x7f);
        buf.put_u64(5);
        assert_eq!(
            try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN),
            Err(FrameDecodeError::UnknownFrameType(0x7f))
        );
    }
}
