//! TCP server implementation.

use crate::buffers::BufferPool;
use crate::error::ServerError;
use crate::processor::Processor;
use parking_lot::Mutex;
use rthrift_protocol::{Protocol, ProtocolConfig, DEFAULT_PORT};
use std::any::Any;
use std::net::{Ipv4Addr, Shutdown, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Connections that stay silent this long are closed.
    pub idle_timeout: Option<Duration>,
    /// Maximum concurrent connections (0 = unlimited).
    pub max_connections: usize,
    pub protocol: ProtocolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout: Some(Duration::from_secs(300)),
            max_connections: 1000,
            protocol: ProtocolConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
    pub panics_total: AtomicU64,
}

/// RPC server dispatching every connection to one [`Processor`].
pub struct Server<P> {
    config: ServerConfig,
    processor: Arc<P>,
    buffers: Arc<BufferPool>,
    stats: Arc<ServerStats>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<P: Processor> Server<P> {
    /// Creates a new server.
    pub fn new(config: ServerConfig, processor: P) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            processor: Arc::new(processor),
            buffers: Arc::new(BufferPool::default()),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Binds the listening socket ahead of [`run`](Self::run).
    ///
    /// Returns the bound address, which differs from the configured one
    /// when binding to port 0.
    pub async fn bind(&self) -> Result<SocketAddr, ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        *self.listener.lock() = Some(listener);
        Ok(addr)
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let bound = self.listener.lock().take();
        let listener = match bound {
            Some(listener) => listener,
            None => {
                self.bind().await?;
                self.listener.lock().take().ok_or(ServerError::ShuttingDown)?
            }
        };
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Server listening on {} ({} transport, {} protocol{})",
            listener.local_addr()?,
            self.config.protocol.transport,
            self.config.protocol.protocol,
            if self.config.protocol.auto_detect {
                ", auto-detect"
            } else {
                ""
            }
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                tracing::info!("Server shutting down");
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.spawn_connection(stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let max = self.config.max_connections;
        if max > 0 && self.stats.connections_active.load(Ordering::Relaxed) >= max as u64 {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Connections are served by blocking code with OS-level timeouts.
        let stream = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("[{}] failed to prepare socket: {}", addr, e);
                self.stats.errors_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let processor = self.processor.clone();
        let buffers = self.buffers.clone();
        let stats = self.stats.clone();
        let protocol = self.config.protocol.clone();
        let idle_timeout = self.config.idle_timeout;

        tokio::spawn(async move {
            tracing::info!("Client connected: {}", addr);
            let task_stats = stats.clone();
            let task = tokio::task::spawn_blocking(move || {
                serve_connection(
                    stream,
                    addr,
                    &*processor,
                    protocol,
                    idle_timeout,
                    &buffers,
                    &task_stats,
                )
            });

            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!("Connection {} error: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_panic() => {
                    let err = ServerError::HandlerPanicked(panic_message(e.into_panic()));
                    tracing::error!("[{}] {}", addr, err);
                    stats.panics_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!("[{}] connection task failed: {}", addr, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    /// Initiates server shutdown.
    ///
    /// Stops the accept loop; connections already being served run until
    /// their peers disconnect or go idle.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the bound address once the server is listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Serves one connection until the peer leaves, goes idle, or sends
/// something the processor rejects.
fn serve_connection<P: Processor>(
    stream: std::net::TcpStream,
    addr: SocketAddr,
    processor: &P,
    protocol: ProtocolConfig,
    idle_timeout: Option<Duration>,
    buffers: &BufferPool,
    stats: &ServerStats,
) -> Result<(), ServerError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(idle_timeout.filter(|t| !t.is_zero()))?;
    let mut proto = Protocol::with_buffers(stream, protocol, buffers.get())?;

    let served = panic::catch_unwind(AssertUnwindSafe(|| loop {
        if let Err(e) = processor.process(&mut proto) {
            break ServerError::from(e);
        }
        stats.requests_total.fetch_add(1, Ordering::Relaxed);
    }));

    let (stream, channel_buffers) = proto.into_parts();
    buffers.put(channel_buffers);
    let _ = stream.shutdown(Shutdown::Both);

    // The panic still reaches the task boundary once the buffers are back.
    let err = served.unwrap_or_else(|payload| panic::resume_unwind(payload));

    if err.is_disconnect() {
        tracing::debug!("[{}] Connection closed by client", addr);
        Ok(())
    } else if err.is_idle_timeout() {
        tracing::debug!("[{}] Idle timeout", addr);
        Ok(())
    } else {
        Err(err)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
