//! Per-address connection pool.
//!
//! Each remote address gets a [`Peer`]: a bounded free-list of idle
//! connections plus an atomic count of open connections. Peers live in a
//! concurrent map, so addresses never contend with each other.

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::error::ClientError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Snapshot of one address's pool state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections, in use or idle.
    pub active: usize,
    pub idle: usize,
}

#[derive(Default)]
struct Peer {
    idle: Mutex<VecDeque<PooledConnection>>,
    active: AtomicUsize,
}

impl Peer {
    /// Reserves a slot for a new connection unless `max` is reached.
    fn try_acquire(&self, max: usize) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

pub struct Pool {
    config: PoolConfig,
    peers: DashMap<SocketAddr, Arc<Peer>>,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            peers: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn peer(&self, addr: SocketAddr) -> Arc<Peer> {
        self.peers.entry(addr).or_default().clone()
    }

    /// Hands out an idle connection to `addr`, or dials a new one.
    ///
    /// Expired idle connections are closed on the way. When the address is
    /// at `max_active` this fails with `TooManyConnections` without dialing.
    pub async fn take(&self, addr: SocketAddr) -> Result<PooledConnection, ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::PoolClosed);
        }
        let peer = self.peer(addr);

        let now = Instant::now();
        loop {
            let candidate = peer.idle.lock().pop_back();
            let Some(conn) = candidate else { break };
            if conn.is_expired(now, &self.config) {
                debug!("[{}] closing expired idle connection", addr);
                self.destroy(&peer, conn);
                continue;
            }
            return Ok(conn);
        }

        if !peer.try_acquire(self.config.max_active) {
            warn!(
                "[{}] connection limit reached ({})",
                addr, self.config.max_active
            );
            return Err(ClientError::TooManyConnections(addr));
        }

        match self.dial(addr).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                peer.release();
                Err(e)
            }
        }
    }

    async fn dial(&self, addr: SocketAddr) -> Result<PooledConnection, ClientError> {
        debug!("[{}] dialing", addr);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                debug!("[{}] connect timeout", addr);
                ClientError::Timeout
            })?
            .map_err(|e| {
                debug!("[{}] connect failed: {}", addr, e);
                ClientError::Io(e)
            })?;

        // Calls run on the blocking pool with OS-level timeouts.
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        PooledConnection::new(addr, stream, &self.config)
    }

    /// Returns a connection after use.
    ///
    /// Failed or expired connections are closed, as are connections that
    /// find the free-list full.
    pub fn put(&self, mut conn: PooledConnection) {
        let addr = conn.addr();
        let Some(peer) = self.peers.get(&addr).map(|p| Arc::clone(p.value())) else {
            conn.shutdown();
            return;
        };

        let now = Instant::now();
        if conn.is_failed() || self.closed.load(Ordering::Acquire) {
            self.destroy(&peer, conn);
            return;
        }
        if conn.is_expired(now, &self.config) {
            debug!("[{}] closing expired connection", addr);
            self.destroy(&peer, conn);
            return;
        }

        conn.mark_released(now);
        let mut idle = peer.idle.lock();
        if idle.len() < self.config.max_idle {
            idle.push_back(conn);
        } else {
            drop(idle);
            self.destroy(&peer, conn);
        }
    }

    /// Closes the idle connections to `addr`, returning how many there were.
    ///
    /// Used when one of them turned out to be closed by the peer; its
    /// siblings were most likely dropped by the same restart.
    pub fn clear_idle(&self, addr: SocketAddr) -> usize {
        let Some(peer) = self.peers.get(&addr).map(|p| Arc::clone(p.value())) else {
            return 0;
        };
        let drained: Vec<_> = peer.idle.lock().drain(..).collect();
        let count = drained.len();
        for conn in drained {
            self.destroy(&peer, conn);
        }
        count
    }

    /// Gives up the slot of a connection that was lost without being returned.
    pub fn forget(&self, addr: SocketAddr) {
        if let Some(peer) = self.peers.get(&addr) {
            peer.release();
        }
    }

    fn destroy(&self, peer: &Peer, conn: PooledConnection) {
        conn.shutdown();
        peer.release();
    }

    pub fn stats(&self, addr: SocketAddr) -> PoolStats {
        match self.peers.get(&addr) {
            Some(peer) => PoolStats {
                active: peer.active.load(Ordering::Acquire),
                idle: peer.idle.lock().len(),
            },
            None => PoolStats::default(),
        }
    }

    /// Closes every idle connection and refuses further use.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for entry in self.peers.iter() {
            let drained: Vec<_> = entry.idle.lock().drain(..).collect();
            for conn in drained {
                self.destroy(entry.value(), conn);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
