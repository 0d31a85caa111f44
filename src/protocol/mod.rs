//! Wire protocol: length-prefixed frames and the request/reply bodies.

pub mod command;
pub mod frame;

pub use command::{encode_message, message_frame_len, Reply, Request};
pub use frame::{
    encode_frame, try_decode_frame, Frame, FrameDecodeError, FrameEncodeError, FrameType,
    DEFAULT_MAX_FRAME_LEN, LENGTH_FIELD_LEN,
};
