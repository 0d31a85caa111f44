use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::client::MessageQueue;
use crate::core::Message;
use crate::protocol::{
    try_decode_frame, FrameDecodeError, FrameEncodeError, Reply, Request, DEFAULT_MAX_FRAME_LEN,
};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed reply: {0}")]
    Decode(#[from] FrameDecodeError),

    #[error("request cannot be encoded: {0}")]
    Encode(#[from] FrameEncodeError),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("connection closed by server")]
    Closed,
}

struct Wire {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    next_request_id: u64,
    max_frame_len: u32,
}

impl Wire {
    fn call(&mut self, request: &Request) -> Result<Reply, ClientError> {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let request_id = self.next_request_id;

        self.write_buf.clear();
        request.encode(request_id, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf)?;

        let mut chunk = [0u8; 8 * 1024];
        loop {
            if let Some(frame) = try_decode_frame(&mut self.read_buf, self.max_frame_len)? {
                if frame.request_id != request_id {
                    return Err(ClientError::UnexpectedReply(format!(
                        "reply for request {} while waiting for {request_id}",
                        frame.request_id
                    )));
                }
                return match Reply::decode(&frame)? {
                    Reply::Error { code, message } => Err(ClientError::Server { code, message }),
                    reply => Ok(reply),
                };
            }

            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClientError::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Blocking connection to a running engine.
///
/// One request is in flight at a time; clones share the socket.
#[derive(Clone)]
pub struct Client {
    peer: SocketAddr,
    wire: Arc<Mutex<Wire>>,
}

impl Client {
    /// Connects with the default frame limit. Use [`Client::connect_with`]
    /// when the server runs with a larger `server.max_frame_len`.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        Self::connect_with(addr, DEFAULT_MAX_FRAME_LEN)
    }

    /// Connects accepting replies up to `max_frame_len`, which should match
    /// the server's setting so that every stored message can be received.
    pub fn connect_with<A: ToSocketAddrs>(
        addr: A,
        max_frame_len: u32,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        debug!(%peer, "connected");
        Ok(Self {
            peer,
            wire: Arc::new(Mutex::new(Wire {
                stream,
                read_buf: BytesMut::with_capacity(8 * 1024),
                write_buf: BytesMut::with_capacity(8 * 1024),
                next_request_id: 0,
                max_frame_len,
            })),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Handle for `name`. No round trip: queues are created by the server on
    /// first use.
    pub fn get_queue(&self, name: &str) -> RemoteQueue {
        RemoteQueue {
            client: self.clone(),
            name: name.to_string(),
        }
    }

    pub fn push(&self, queue: &str, key: &str, payload: Bytes) -> Result<(), ClientError> {
        let request = Request::Push {
            queue: queue.to_string(),
            key: key.to_string(),
            payload,
        };
        match self.wire.lock().call(&request)? {
            Reply::Ack => Ok(()),
            other => Err(ClientError::UnexpectedReply(format!("{other:?} to PUSH"))),
        }
    }

    pub fn pop(
        &self,
        queue: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Message>, ClientError> {
        let request = Request::Pop {
            queue: queue.to_string(),
            key: key.to_string(),
            timeout,
        };
        match self.wire.lock().call(&request)? {
            Reply::Message(message) => Ok(Some(message)),
            Reply::Empty => Ok(None),
            other => Err(ClientError::UnexpectedReply(format!("{other:?} to POP"))),
        }
    }
}

/// Queue handle bound to a [`Client`] connection.
#[derive(Clone)]
pub struct RemoteQueue {
    client: Client,
    name: String,
}

impl RemoteQueue {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl MessageQueue for RemoteQueue {
    type Error = ClientError;

    fn push(&self, key: &str, payload: Bytes) -> Result<(), ClientError> {
        self.client.push(&self.name, key, payload)
    }

    fn pop(&self, key: &str, timeout: Duration) -> Result<Option<Message>, ClientError> {
        self.client.pop(&self.name, key, timeout)
    }
}
