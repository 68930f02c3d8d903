//! Pool and client configuration.

use rthrift_protocol::ProtocolConfig;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Ceiling on open connections per address (in use plus idle); 0 means unlimited.
    pub max_active: usize,
    /// Capacity of each address's idle free-list.
    pub max_idle: usize,
    /// Connections older than this are closed instead of reused.
    pub max_age: Option<Duration>,
    /// Idle connections unused for longer than this are closed.
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub nodelay: bool,
    pub protocol: ProtocolConfig,
    /// Identity sent with every frame on header transport connections.
    pub identity: Option<String>,
    /// Headers sent with every frame on header transport connections.
    pub persistent_headers: BTreeMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 64,
            max_idle: 8,
            max_age: None,
            idle_timeout: Some(Duration::from_secs(60)),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            nodelay: true,
            protocol: ProtocolConfig::default(),
            identity: None,
            persistent_headers: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_persistent_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.persistent_headers.insert(key.into(), value.into());
        self
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    pub pool: PoolConfig,
    /// Retry once when a reused connection turns out to be closed.
    pub retry_on_peer_closed: bool,
    /// Deadline applied to calls whose context has none.
    pub default_deadline: Option<Duration>,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            pool: PoolConfig::default(),
            retry_on_peer_closed: true,
            default_deadline: None,
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_retry_on_peer_closed(mut self, retry: bool) -> Self {
        self.retry_on_peer_closed = retry;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rthrift_protocol::{ProtocolId, TransportKind};

    #[test]
    fn test_builders() {
        let pool = PoolConfig::new()
            .with_max_active(2)
            .with_max_idle(1)
            .with_max_age(Duration::from_secs(5))
            .with_read_timeout(None)
            .with_identity("svc")
            .with_persistent_header("tenant", "blue")
            .with_protocol(
                ProtocolConfig::default()
                    .with_transport(TransportKind::Header)
                    .with_protocol(ProtocolId::Compact),
            );
        assert_eq!(pool.max_active, 2);
        assert_eq!(pool.max_idle, 1);
        assert_eq!(pool.max_age, Some(Duration::from_secs(5)));
        assert_eq!(pool.read_timeout, None);
        assert_eq!(pool.identity.as_deref(), Some("svc"));
        assert_eq!(pool.persistent_headers.len(), 1);
        assert_eq!(pool.protocol.protocol, ProtocolId::Compact);

        let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        let client = ClientConfig::new(addr)
            .with_pool(pool)
            .with_retry_on_peer_closed(false);
        assert_eq!(client.addr, addr);
        assert!(!client.retry_on_peer_closed);
        assert_eq!(client.pool.max_idle, 1);
    }
}
