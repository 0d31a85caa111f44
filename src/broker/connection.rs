//! Per-connection state owned by a worker thread.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;

use crate::core::{Mailbox, Message, Ticket};
use crate::protocol::{
    encode_message, try_decode_frame, Frame, FrameDecodeError, FrameEncodeError, Reply,
    LENGTH_FIELD_LEN,
};

const READ_CHUNK: usize = 16 * 1024;
const INITIAL_BUFFER: usize = 8 * 1024;

/// Outcome of draining a socket into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadStatus {
    /// The socket would block; more may arrive later.
    Open,
    /// The peer closed its write half.
    Eof,
}

/// Byte-level framing state: inbound bytes waiting to become frames and
/// outbound replies waiting for the socket to accept them.
#[derive(Debug)]
pub(crate) struct StreamBuffer {
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame_len: u32,
}

impl StreamBuffer {
    pub(crate) fn new(max_frame_len: u32) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER),
            max_frame_len,
        }
    }

    /// Reads until the source would block or reports end of stream.
    pub(crate) fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match src.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        try_decode_frame(&mut self.read_buf, self.max_frame_len)
    }

    pub(crate) fn queue_reply(
        &mut self,
        request_id: u64,
        reply: &Reply,
    ) -> Result<(), FrameEncodeError> {
        let mark = self.write_buf.len();
        reply.encode(request_id, &mut self.write_buf)?;
        self.check_frame_len(mark)
    }

    /// Queues a MESSAGE reply. On failure nothing is written and the message
    /// is handed back so it can be returned to its mailbox.
    pub(crate) fn queue_message(
        &mut self,
        request_id: u64,
        message: Message,
    ) -> Result<(), (FrameEncodeError, Message)> {
        let mark = self.write_buf.len();
        if let Err(err) = encode_message(request_id, &message, &mut self.write_buf) {
            return Err((err, message));
        }
        self.check_frame_len(mark).map_err(|err| (err, message))
    }

    // Peers reject frames above the limit, so nothing larger may go out.
    fn check_frame_len(&mut self, mark: usize) -> Result<(), FrameEncodeError> {
        let len = self.write_buf.len() - mark - LENGTH_FIELD_LEN;
        if len > self.max_frame_len as usize {
            self.write_buf.truncate(mark);
            return Err(FrameEncodeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        Ok(())
    }

    /// Writes as much buffered output as the sink takes. Returns `true` once
    /// nothing is left to send.
    pub(crate) fn flush_to<W: Write>(&mut self, dst: &mut W) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            match dst.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "connection closed while writing",
                    ))
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty()
    }

    #[inline]
    pub(crate) fn buffered_input(&self) -> usize {
        self.read_buf.len()
    }
}

/// A POP that is parked on a mailbox waiting for a message or its deadline.
pub(crate) struct PendingPop {
    pub(crate) request_id: u64,
    pub(crate) seq: u64,
    /// `None` when the deadline is too far out to represent.
    pub(crate) deadline: Option<Instant>,
    pub(crate) mailbox: Arc<Mailbox>,
    pub(crate) ticket: Arc<Ticket>,
}

pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) socket: TcpStream,
    pub(crate) buffer: StreamBuffer,
    /// Requests are served one at a time; while this is set no further
    /// frames are decoded.
    pub(crate) pending: Option<PendingPop>,
    /// Readable events that arrived while a pop was parked. The socket is
    /// left alone until the pop resolves, so input cannot pile up.
    pub(crate) read_paused: bool,
    pub(crate) peer_closed: bool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        socket: TcpStream,
        max_frame_len: u32,
    ) -> Self {
        Self {
            id,
            peer,
            socket,
            buffer: StreamBuffer::new(max_frame_len),
            pending: None,
            read_paused: false,
            peer_closed: false,
        }
    }

    pub(crate) fn fill(&mut self) -> io::Result<ReadStatus> {
        let status = self.buffer.fill_from(&mut self.socket)?;
        if status == ReadStatus::Eof {
            self.peer_closed = true;
        }
        Ok(status)
    }

    pub(crate) fn flush(&mut self) -> io::Result<bool> {
        self.buffer.flush_to(&mut self.socket)
    }

    #[inline]
    pub(crate) fn pending_seq(&self) -> Option<u64> {
        self.pending.as_ref().map(|p| p.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_frame as encode, FrameType, Request, DEFAULT_MAX_FRAME_LEN};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Hands out scripted reads one at a time, then blocks.
    struct ScriptedReader {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.eof => Ok(0),
                None => Err(ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Accepts at most `budget` bytes per call, then blocks once budget runs out.
    struct TrickleWriter {
        out: Vec<u8>,
        per_call: usize,
        budget: usize,
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.per_call).min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn push_bytes(request_id: u64) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Request::Push {
            queue: "world".into(),
            key: "hello".into(),
            payload: "turbo".into(),
        }
        .encode(request_id, &mut buf)
        .unwrap();
        buf.to_vec()
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let bytes = push_bytes(7);
        let mut reader = ScriptedReader {
            chunks: bytes.iter().map(|b| vec![*b]).collect(),
            eof: false,
        };
        let mut sb = StreamBuffer::new(DEFAULT_MAX_FRAME_LEN);
        assert_eq!(sb.fill_from(&mut reader).unwrap(), ReadStatus::Open);
        let frame = sb.next_frame().unwrap().expect("complete frame");
        assert_eq!(frame.kind, FrameType::Push);
        assert_eq!(frame.request_id, 7);
        assert_eq!(sb.buffered_input(), 0);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let bytes = push_bytes(1);
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        let mut reader = ScriptedReader {
            chunks: VecDeque::from(vec![head.to_vec()]),
            eof: false,
        };
        let mut sb = StreamBuffer::new(DEFAULT_MAX_FRAME_LEN);
        sb.fill_from(&mut reader).unwrap();
        assert!(sb.next_frame().unwrap().is_none());

        reader.chunks.push_back(tail.to_vec());
        sb.fill_from(&mut reader).unwrap();
        assert!(sb.next_frame().unwrap().is_some());
    }

    #[test]
    fn two_frames_in_one_read() {
        let mut bytes = push_bytes(1);
        bytes.extend(push_bytes(2));
        let mut reader = ScriptedReader {
            chunks: VecDeque::from(vec![bytes]),
            eof: true,
        };
        let mut sb = StreamBuffer::new(DEFAULT_MAX_FRAME_LEN);
        assert_eq!(sb.fill_from(&mut reader).unwrap(), ReadStatus::Eof);
        assert_eq!(sb.next_frame().unwrap().unwrap().request_id, 1);
        assert_eq!(sb.next_frame().unwrap().unwrap().request_id, 2);
        assert!(sb.next_frame().unwrap().is_none());
    }

    #[test]
    fn short_writes_resume_where_they_stopped() {
        let mut sb = StreamBuffer::new(DEFAULT_MAX_FRAME_LEN);
        let reply = Reply::Message(Message::with_timestamp("hello", vec![9u8; 100], 5));
        sb.queue_reply(3, &reply).unwrap();

        let mut expected = BytesMut::new();
        reply.encode(3, &mut expected).unwrap();

        let mut sink = TrickleWriter {
            out: Vec::new(),
            per_call: 7,
            budget: 40,
        };
        assert!(!sb.flush_to(&mut sink).unwrap());
        assert!(sb.has_pending_output());

        sink.budget = usize::MAX;
        assert!(sb.flush_to(&mut sink).unwrap());
        assert!(!sb.has_pending_output());
        assert_eq!(sink.out, expected.to_vec());
    }

    #[test]
    fn message_over_the_frame_limit_is_handed_back() {
        let mut sb = StreamBuffer::new(64);
        sb.queue_reply(1, &Reply::Ack).unwrap();
        let queued = sb.write_buf.len();

        let message = Message::with_timestamp("hello", vec![1u8; 100], 5);
        let (err, returned) = sb.queue_message(2, message.clone()).unwrap_err();
        assert!(matches!(err, FrameEncodeError::FrameTooLarge { max: 64, .. }));
        assert_eq!(returned, message);
        assert_eq!(sb.write_buf.len(), queued, "earlier replies are kept intact");

        let small = Message::with_timestamp("hello", vec![1u8; 8], 5);
        sb.queue_message(3, small).unwrap();
        assert!(sb.write_buf.len() > queued);
    }

    #[test]
    fn oversized_frame_is_rejected_before_body_arrives() {
        let mut sb = StreamBuffer::new(64);
        let frame = Frame {
            kind: FrameType::Push,
            request_id: 1,
            payload: vec![0u8; 128].into(),
        };
        let mut wire = BytesMut::new();
        encode(&frame, &mut wire).unwrap();
        let mut reader = ScriptedReader {
            chunks: VecDeque::from(vec![wire[..16].to_vec()]),
            eof: false,
        };
        sb.fill_from(&mut reader).unwrap();
        assert!(matches!(
            sb.next_frame(),
            Err(FrameDecodeError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn pop_request_survives_framing() {
        let mut buf = BytesMut::new();
        Request::Pop {
            queue: "world".into(),
            key: "hello".into(),
            timeout: Duration::from_secs(1),
        }
        .encode(11, &mut buf)
        .unwrap();
        let mut reader = ScriptedReader {
            chunks: VecDeque::from(vec![buf.to_vec()]),
            eof: false,
        };
        let mut sb = StreamBuffer::new(DEFAULT_MAX_FRAME_LEN);
        sb.fill_from(&mut reader).unwrap();
        let frame = sb.next_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameType::Pop);
        assert!(matches!(
            Request::decode(&frame).unwrap(),
            Request::Pop { timeout, .. } if timeout == Duration::from_secs(1)
        ));
    }
}
