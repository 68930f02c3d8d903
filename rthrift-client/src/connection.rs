//! A pooled connection and the blocking request/reply exchange.

use crate::config::PoolConfig;
use crate::error::ClientError;
use rthrift_protocol::{
    MessageHeader, MessageType, Protocol, ProtocolError, Readable, Reader, Writable, Writer,
};
use std::collections::BTreeMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::debug;

/// One connection owned by a single caller at a time.
pub struct PooledConnection {
    addr: SocketAddr,
    protocol: Protocol<TcpStream>,
    seq_id: i32,
    reused: bool,
    failed: bool,
    created_at: Instant,
    released_at: Option<Instant>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("addr", &self.addr)
            .field("seq_id", &self.seq_id)
            .field("reused", &self.reused)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Wraps a connected blocking socket.
    pub fn new(addr: SocketAddr, stream: TcpStream, config: &PoolConfig) -> Result<Self, ClientError> {
        stream.set_nodelay(config.nodelay)?;
        let mut protocol = Protocol::new(stream, config.protocol.clone())?;
        if let Some(header) = protocol.header_transport_mut() {
            if let Some(identity) = &config.identity {
                header.set_identity(identity.clone());
            }
            for (key, value) in &config.persistent_headers {
                header.set_persistent_header(key.clone(), value.clone());
            }
        }

        Ok(Self {
            addr,
            protocol,
            seq_id: 0,
            reused: false,
            failed: false,
            created_at: Instant::now(),
            released_at: None,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn protocol(&self) -> &Protocol<TcpStream> {
        &self.protocol
    }

    pub fn protocol_mut(&mut self) -> &mut Protocol<TcpStream> {
        &mut self.protocol
    }

    /// Whether the connection has been returned to the pool at least once.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Latches the connection as broken; the pool destroys it on return.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn mark_released(&mut self, now: Instant) {
        self.reused = true;
        self.released_at = Some(now);
    }

    pub(crate) fn is_expired(&self, now: Instant, config: &PoolConfig) -> bool {
        if let Some(max_age) = config.max_age {
            if now.duration_since(self.created_at) >= max_age {
                return true;
            }
        }
        match (config.idle_timeout, self.released_at) {
            (Some(idle_timeout), Some(released_at)) => {
                now.duration_since(released_at) >= idle_timeout
            }
            _ => false,
        }
    }

    /// Next sequence id; starts at 1 and stays within positive `i32`.
    pub fn next_seq_id(&mut self) -> i32 {
        self.seq_id = if self.seq_id == i32::MAX {
            1
        } else {
            self.seq_id + 1
        };
        self.seq_id
    }

    /// A second handle to the socket, used to force-close it from outside.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.protocol.get_ref().try_clone()
    }

    pub fn set_timeouts(
        &self,
        read: Option<Duration>,
        write: Option<Duration>,
    ) -> io::Result<()> {
        let stream = self.protocol.get_ref();
        stream.set_read_timeout(read.filter(|t| !t.is_zero()))?;
        stream.set_write_timeout(write.filter(|t| !t.is_zero()))
    }

    /// Checks, without blocking, whether the peer has closed the socket.
    ///
    /// Unsolicited bytes also count: no reply is outstanding on an idle
    /// connection, so anything readable means the stream is out of step.
    pub fn probe_closed(&self) -> bool {
        if self.protocol.buffered() > 0 {
            return true;
        }
        let stream = self.protocol.get_ref();
        if stream.set_nonblocking(true).is_err() {
            return true;
        }
        let mut byte = [0u8; 1];
        let closed = match stream.peek(&mut byte) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        stream.set_nonblocking(false).is_err() || closed
    }

    pub fn shutdown(&self) {
        let _ = self.protocol.get_ref().shutdown(Shutdown::Both);
    }

    /// Sends one request and, unless `oneway`, reads and checks its reply.
    ///
    /// Any error other than an application exception latches the
    /// connection as failed.
    pub fn exchange<A, R>(
        &mut self,
        method: &str,
        args: &A,
        oneway: bool,
        headers: &BTreeMap<String, String>,
    ) -> Result<Option<R>, ClientError>
    where
        A: Writable + ?Sized,
        R: Readable,
    {
        let result = self.try_exchange(method, args, oneway, headers);
        if let Err(err) = &result {
            if !err.keeps_connection() {
                debug!("[{}] connection latched failed: {}", self.addr, err);
                self.mark_failed();
            }
        }
        result
    }

    fn try_exchange<A, R>(
        &mut self,
        method: &str,
        args: &A,
        oneway: bool,
        headers: &BTreeMap<String, String>,
    ) -> Result<Option<R>, ClientError>
    where
        A: Writable + ?Sized,
        R: Readable,
    {
        if self.reused && self.probe_closed() {
            return Err(ClientError::PeerClosed);
        }

        let seq_id = self.next_seq_id();
        let kind = if oneway {
            MessageType::Oneway
        } else {
            MessageType::Call
        };
        if let Some(header) = self.protocol.header_transport_mut() {
            for (key, value) in headers {
                header.set_header(key.clone(), value.clone());
            }
        }

        let header = MessageHeader::new(method, kind, seq_id);
        self.write_request(&header, args).map_err(|err| {
            if err.is_peer_closed() {
                ClientError::PeerClosed
            } else {
                ClientError::from(err)
            }
        })?;

        if oneway {
            return Ok(None);
        }
        self.read_reply(method, seq_id).map(Some)
    }

    fn write_request<A: Writable + ?Sized>(
        &mut self,
        header: &MessageHeader,
        args: &A,
    ) -> Result<(), ProtocolError> {
        self.protocol.write_message_begin(header)?;
        args.write(&mut self.protocol)?;
        self.protocol.write_message_end()?;
        self.protocol.flush()
    }

    fn read_reply<R: Readable>(&mut self, method: &str, seq_id: i32) -> Result<R, ClientError> {
        let header = self.protocol.read_message_begin()?;
        if header.kind != MessageType::Reply {
            return Err(ClientError::InvalidMessageType(header.kind));
        }
        if header.name != method {
            return Err(ClientError::WrongMethodName {
                expected: method.to_string(),
                actual: header.name,
            });
        }
        if header.seq_id != seq_id {
            return Err(ClientError::SequenceMismatch {
                expected: seq_id,
                actual: header.seq_id,
            });
        }

        let reply = R::read(&mut self.protocol)?;
        self.protocol.read_message_end()?;
        Ok(reply)
    }
}
