#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Once;
use std::time::Duration;

use bytes::BytesMut;
use turbomq::protocol::{try_decode_frame, Reply, DEFAULT_MAX_FRAME_LEN};
use turbomq::{Config, Engine};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        turbomq::logging::init_logging();
    });
}

/// Starts an engine on an ephemeral loopback port.
pub fn start_engine(workers: usize) -> (Engine, SocketAddr) {
    init_logging();
    let mut config = Config::default();
    config.server.bind_addr = "127.0.0.1:0".to_string();
    config.server.workers = Some(workers);
    let engine = Engine::new(config);
    let addr = engine.run().expect("engine failed to start");
    (engine, addr)
}

/// Frame-level client for poking at the server with hand-made bytes.
pub struct RawConn {
    pub stream: TcpStream,
    buf: BytesMut,
}

impl RawConn {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("failed to connect to server");
        stream.set_nodelay(true).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write failed");
    }

    /// Next reply, or `None` if the server closed the connection.
    pub fn recv(&mut self) -> Option<(u64, Reply)> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = try_decode_frame(&mut self.buf, DEFAULT_MAX_FRAME_LEN).unwrap() {
                let reply = Reply::decode(&frame).expect("malformed reply");
                return Some((frame.request_id, reply));
            }
            match self.stream.read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }
}
