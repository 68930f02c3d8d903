//! Call invocation over pooled connections.

use crate::config::ClientConfig;
use crate::connection::PooledConnection;
use crate::context::CallContext;
use crate::error::ClientError;
use crate::pool::Pool;
use rthrift_protocol::{Readable, Writable};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{debug, warn};

/// RPC client for one server address.
pub struct Client {
    config: ClientConfig,
    pool: Arc<Pool>,
}

impl Client {
    /// Creates a client with its own pool.
    pub fn new(config: ClientConfig) -> Self {
        let pool = Arc::new(Pool::new(config.pool.clone()));
        Self { config, pool }
    }

    /// Creates a client sharing an existing pool.
    pub fn with_pool(config: ClientConfig, pool: Arc<Pool>) -> Self {
        Self { config, pool }
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Calls `method` and decodes its reply.
    pub async fn call<A, R>(&self, ctx: &CallContext, method: &str, args: A) -> Result<R, ClientError>
    where
        A: Writable + Send + Sync + 'static,
        R: Readable + Send + 'static,
    {
        let reply = self.invoke(ctx, method, Arc::new(args), false).await?;
        // A two-way exchange always produces a reply or an error.
        reply.ok_or_else(|| ClientError::TaskFailed("reply missing".to_string()))
    }

    /// Sends `method` without waiting for a reply.
    pub async fn oneway<A>(&self, ctx: &CallContext, method: &str, args: A) -> Result<(), ClientError>
    where
        A: Writable + Send + Sync + 'static,
    {
        self.invoke::<A, rthrift_protocol::Void>(ctx, method, Arc::new(args), true)
            .await
            .map(|_| ())
    }

    async fn invoke<A, R>(
        &self,
        ctx: &CallContext,
        method: &str,
        args: Arc<A>,
        oneway: bool,
    ) -> Result<Option<R>, ClientError>
    where
        A: Writable + Send + Sync + 'static,
        R: Readable + Send + 'static,
    {
        let ctx = self.effective_context(ctx);
        let mut retried = false;
        loop {
            ctx.check()?;
            let conn = self.pool.take(self.config.addr).await?;
            let reused = conn.is_reused();

            match self.run(&ctx, conn, method, args.clone(), oneway).await {
                Err(ClientError::PeerClosed)
                    if reused && !retried && self.config.retry_on_peer_closed =>
                {
                    let cleared = self.pool.clear_idle(self.config.addr);
                    warn!(
                        "[{}] reused connection was closed by peer, retrying {} ({} idle dropped)",
                        self.config.addr, method, cleared
                    );
                    retried = true;
                }
                result => return result,
            }
        }
    }

    fn effective_context(&self, ctx: &CallContext) -> CallContext {
        let mut ctx = ctx.clone();
        if ctx.deadline.is_none() {
            if let Some(timeout) = self.config.default_deadline {
                ctx.deadline = Some(std::time::Instant::now() + timeout);
            }
        }
        ctx
    }

    /// Runs one exchange on the blocking pool while watching for
    /// cancellation; the connection goes back to the pool afterwards.
    async fn run<A, R>(
        &self,
        ctx: &CallContext,
        mut conn: PooledConnection,
        method: &str,
        args: Arc<A>,
        oneway: bool,
    ) -> Result<Option<R>, ClientError>
    where
        A: Writable + Send + Sync + 'static,
        R: Readable + Send + 'static,
    {
        let pool_config = self.pool.config();
        let prepared = conn
            .set_timeouts(
                ctx.read_timeout.or(pool_config.read_timeout),
                ctx.write_timeout.or(pool_config.write_timeout),
            )
            .and_then(|()| conn.try_clone_stream());
        let watch_stream = match prepared {
            Ok(stream) => stream,
            Err(e) => {
                conn.mark_failed();
                self.pool.put(conn);
                return Err(ClientError::Io(e));
            }
        };

        let addr = conn.addr();
        let method_name = method.to_string();
        let headers = ctx.headers.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let result = conn.exchange::<A, R>(&method_name, &*args, oneway, &headers);
            (conn, result)
        });

        let (joined, stopped) = tokio::select! {
            joined = &mut task => (joined, None),
            reason = ctx.done() => {
                debug!("[{}] {} stopped: {}", addr, method, reason);
                // Unblocks the exchange; its I/O error is superseded below.
                let _ = watch_stream.shutdown(Shutdown::Both);
                (task.await, Some(reason))
            }
        };

        let result = self.finish(addr, joined, stopped.is_some());
        match stopped {
            Some(reason) => Err(reason),
            None => result,
        }
    }

    /// Returns the connection to the pool. A `stopped` call had its socket
    /// shut down by the watcher, so the connection is latched failed even
    /// when the exchange itself completed.
    fn finish<R>(
        &self,
        addr: SocketAddr,
        joined: Result<(PooledConnection, Result<Option<R>, ClientError>), JoinError>,
        stopped: bool,
    ) -> Result<Option<R>, ClientError> {
        match joined {
            Ok((mut conn, result)) => {
                if stopped {
                    conn.mark_failed();
                }
                self.pool.put(conn);
                result
            }
            Err(e) => {
                // The connection died with the task.
                self.pool.forget(addr);
                Err(ClientError::TaskFailed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::context::CancellationToken;
    use crate::pool::PoolStats;
    use rthrift_protocol::{
        ApplicationException, ApplicationExceptionKind, ListHeader, MessageHeader, MessageType,
        Protocol, ProtocolConfig, ProtocolError, ProtocolId, Reader, TType, TransportKind, Writer,
    };
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    type Result<T> = std::result::Result<T, ProtocolError>;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct SearchRequest {
        query: String,
        page_number: i32,
        result_per_page: i32,
    }

    impl Writable for SearchRequest {
        fn write<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
            w.write_struct_begin("SearchRequest")?;
            w.write_field_begin("query", TType::String, 1)?;
            w.write_string(&self.query)?;
            w.write_field_end()?;
            w.write_field_begin("pageNumber", TType::I32, 2)?;
            w.write_i32(self.page_number)?;
            w.write_field_end()?;
            w.write_field_begin("resultPerPage", TType::I32, 3)?;
            w.write_i32(self.result_per_page)?;
            w.write_field_end()?;
            w.write_field_stop()?;
            w.write_struct_end()
        }
    }

    impl Readable for SearchRequest {
        fn read<R: Reader + ?Sized>(r: &mut R) -> Result<Self> {
            let mut out = SearchRequest::default();
            r.read_struct_begin()?;
            loop {
                let field = r.read_field_begin()?;
                if field.is_stop() {
                    break;
                }
                match (field.id, field.ttype) {
                    (1, TType::String) => out.query = r.read_string()?,
                    (2, TType::I32) => out.page_number = r.read_i32()?,
                    (3, TType::I32) => out.result_per_page = r.read_i32()?,
                    (_, ttype) => r.skip(ttype)?,
                }
                r.read_field_end()?;
            }
            r.read_struct_end()?;
            Ok(out)
        }
    }

    #[derive(Debug, Clone, PartialEq, Default)]
    struct SearchResponse {
        results: Vec<String>,
    }

    impl Writable for SearchResponse {
        fn write<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
            w.write_struct_begin("SearchResponse")?;
            w.write_field_begin("results", TType::List, 1)?;
            w.write_list_begin(ListHeader::new(TType::String, self.results.len()))?;
            for result in &self.results {
                w.write_string(result)?;
            }
            w.write_list_end()?;
            w.write_field_end()?;
            w.write_field_stop()?;
            w.write_struct_end()
        }
    }

    impl Readable for SearchResponse {
        fn read<R: Reader + ?Sized>(r: &mut R) -> Result<Self> {
            let mut out = SearchResponse::default();
            r.read_struct_begin()?;
            loop {
                let field = r.read_field_begin()?;
                if field.is_stop() {
                    break;
                }
                match (field.id, field.ttype) {
                    (1, TType::List) => {
                        let header = r.read_list_begin()?;
                        for _ in 0..header.size {
                            out.results.push(r.read_string()?);
                        }
                        r.read_list_end()?;
                    }
                    (_, ttype) => r.skip(ttype)?,
                }
                r.read_field_end()?;
            }
            r.read_struct_end()?;
            Ok(out)
        }
    }

    fn sample() -> SearchRequest {
        SearchRequest {
            query: "dummy query".to_string(),
            page_number: 2,
            result_per_page: 20,
        }
    }

    enum Reply {
        Normal,
        SeqOffset(i32),
        Name(&'static str),
        Exception,
    }

    /// Reads one Search call and answers it. Returns `None` at end of stream.
    fn answer(proto: &mut Protocol<TcpStream>, reply: Reply) -> Option<SearchRequest> {
        let header = proto.read_message_begin().ok()?;
        let request = SearchRequest::read(proto).ok()?;
        proto.read_message_end().ok()?;

        let mut out = MessageHeader::new(header.name, MessageType::Reply, header.seq_id);
        match reply {
            Reply::Normal => {}
            Reply::SeqOffset(offset) => out.seq_id += offset,
            Reply::Name(name) => out.name = name.to_string(),
            Reply::Exception => out.kind = MessageType::Exception,
        }
        proto.write_message_begin(&out).ok()?;
        if out.kind == MessageType::Exception {
            ApplicationException::new(ApplicationExceptionKind::InternalError, "search failed")
                .write(proto)
                .ok()?;
        } else {
            SearchResponse {
                results: vec![format!("{}#{}", request.query, request.page_number)],
            }
            .write(proto)
            .ok()?;
        }
        proto.write_message_end().ok()?;
        proto.flush().ok()?;
        Some(request)
    }

    /// Serves each accepted connection on its own thread with `handler`,
    /// which is called with the connection index until it returns false.
    fn spawn_server<F>(config: ProtocolConfig, handler: F) -> (SocketAddr, Arc<AtomicUsize>)
    where
        F: Fn(usize, &mut Protocol<TcpStream>) -> bool + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let handler = Arc::new(handler);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let handler = handler.clone();
                let config = config.clone();
                thread::spawn(move || {
                    let mut proto = Protocol::new(stream, config).unwrap();
                    while handler(index, &mut proto) {}
                });
            }
        });
        (addr, accepted)
    }

    fn client(addr: SocketAddr) -> Client {
        Client::new(ClientConfig::new(addr))
    }

    #[tokio::test]
    async fn test_search_call() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Normal).is_some()
        });
        let client = client(addr);

        let reply: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        assert_eq!(reply.results, vec!["dummy query#2".to_string()]);
        assert_eq!(client.pool().stats(addr), PoolStats { active: 1, idle: 1 });

        // Same connection, next sequence id.
        let reply: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        assert_eq!(reply.results.len(), 1);
        assert_eq!(client.pool().stats(addr).active, 1);
    }

    #[tokio::test]
    async fn test_search_over_compact_header_transport() {
        let protocol = ProtocolConfig::default()
            .with_transport(TransportKind::Header)
            .with_protocol(ProtocolId::Compact);
        let (tx, rx) = mpsc::channel();
        let tx = Arc::new(parking_lot::Mutex::new(tx));
        let (addr, _) = spawn_server(
            ProtocolConfig::default().with_transport(TransportKind::Header),
            move |_, proto| {
                let request = answer(proto, Reply::Normal);
                let identity = proto
                    .header_transport()
                    .and_then(|h| h.peer_identity().map(str::to_string));
                let served = request.is_some();
                if let Some(request) = request {
                    let _ = tx.lock().send((request, proto.protocol_id(), identity));
                }
                served
            },
        );

        let config = ClientConfig::new(addr).with_pool(
            PoolConfig::default()
                .with_protocol(protocol)
                .with_identity("search-client"),
        );
        let client = Client::new(config);
        let reply: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        assert_eq!(reply.results, vec!["dummy query#2".to_string()]);

        let (request, protocol, identity) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request, sample());
        assert_eq!(protocol, ProtocolId::Compact);
        assert_eq!(identity.as_deref(), Some("search-client"));
    }

    #[tokio::test]
    async fn test_sequence_mismatch_is_rejected() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::SeqOffset(1)).is_some()
        });
        let client = client(addr);

        let err = client
            .call::<_, SearchResponse>(&CallContext::new(), "Search", sample())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::SequenceMismatch {
                expected: 1,
                actual: 2
            }
        ));
        // The stream is out of step, so the connection was not kept.
        assert_eq!(client.pool().stats(addr), PoolStats { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_wrong_method_name_is_rejected() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Name("Find")).is_some()
        });
        let err = client(addr)
            .call::<_, SearchResponse>(&CallContext::new(), "Search", sample())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::WrongMethodName { actual, .. } if actual == "Find"));
    }

    #[tokio::test]
    async fn test_application_exception_keeps_connection() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Exception).is_some()
        });
        let client = client(addr);

        let err = client
            .call::<_, SearchResponse>(&CallContext::new(), "Search", sample())
            .await
            .unwrap_err();
        match err {
            ClientError::Application(e) => {
                assert_eq!(e.kind, ApplicationExceptionKind::InternalError);
                assert_eq!(e.message, "search failed");
            }
            other => panic!("expected application exception, got {other:?}"),
        }
        assert_eq!(client.pool().stats(addr), PoolStats { active: 1, idle: 1 });
    }

    #[tokio::test]
    async fn test_retry_once_on_reused_closed_connection() {
        // Every connection answers one call and then closes.
        let (addr, accepted) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Normal);
            false
        });
        let client = client(addr);

        let _: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        assert_eq!(reply.results.len(), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_disabled() {
        let (addr, accepted) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Normal);
            false
        });
        let client = Client::new(ClientConfig::new(addr).with_retry_on_peer_closed(false));

        let _: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = client
            .call::<_, SearchResponse>(&CallContext::new(), "Search", sample())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::PeerClosed));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_on_first_use() {
        // The server drops every connection without answering.
        let (addr, accepted) = spawn_server(ProtocolConfig::default(), |_, _| false);
        let client = client(addr);

        let err = client
            .call::<_, SearchResponse>(&CallContext::new(), "Search", sample())
            .await
            .unwrap_err();
        assert!(!matches!(err, ClientError::Cancelled | ClientError::DeadlineExceeded));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.pool().stats(addr).active, 0);
    }

    #[tokio::test]
    async fn test_retry_when_write_hits_closed_socket() {
        // Connections stay open for a while after the client stops sending.
        let (addr, accepted) = spawn_server(ProtocolConfig::default(), |_, proto| {
            if answer(proto, Reply::Normal).is_some() {
                return true;
            }
            thread::sleep(Duration::from_secs(2));
            false
        });
        let client = client(addr);
        let _: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();

        // Half-closed idle connection: the idle check passes, the write fails.
        let conn = client.pool().take(addr).await.unwrap();
        conn.protocol().get_ref().shutdown(Shutdown::Write).unwrap();
        assert!(!conn.probe_closed());
        client.pool().put(conn);

        let reply: SearchResponse = client
            .call(&CallContext::new(), "Search", sample())
            .await
            .unwrap();
        assert_eq!(reply.results.len(), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(client.pool().stats(addr), PoolStats { active: 1, idle: 1 });
    }

    #[tokio::test]
    async fn test_retry_skips_other_stale_connections() {
        let (addr, accepted) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Normal);
            false
        });
        let client = client(addr);
        let ctx = CallContext::new();

        let (a, b) = tokio::join!(
            client.call::<_, SearchResponse>(&ctx, "Search", sample()),
            client.call::<_, SearchResponse>(&ctx, "Search", sample()),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(client.pool().stats(addr).idle, 2);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Both idle connections are dead; the retry must dial.
        let reply: SearchResponse = client.call(&ctx, "Search", sample()).await.unwrap();
        assert_eq!(reply.results.len(), 1);
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(client.pool().stats(addr), PoolStats { active: 1, idle: 1 });
    }

    #[tokio::test]
    async fn test_stopped_call_is_not_pooled() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            answer(proto, Reply::Normal).is_some()
        });
        let client = client(addr);
        let conn = client.pool().take(addr).await.unwrap();

        // The reply was ready, but the watcher fired first and shut the socket.
        conn.shutdown();
        let reply = client.finish(addr, Ok((conn, Ok(Some(SearchResponse::default())))), true);
        assert!(reply.unwrap().is_some());
        assert_eq!(client.pool().stats(addr), PoolStats { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_oneway_does_not_wait() {
        let (tx, rx) = mpsc::channel();
        let tx = Arc::new(parking_lot::Mutex::new(tx));
        let (addr, _) = spawn_server(ProtocolConfig::default(), move |_, proto| {
            let Ok(header) = proto.read_message_begin() else {
                return false;
            };
            let request = SearchRequest::read(proto).unwrap();
            proto.read_message_end().unwrap();
            let _ = tx.lock().send((header, request));
            true
        });
        let client = client(addr);

        client
            .oneway(&CallContext::new(), "Log", sample())
            .await
            .unwrap();
        let (header, request) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(header.kind, MessageType::Oneway);
        assert_eq!(header.name, "Log");
        assert_eq!(request, sample());
        assert_eq!(client.pool().stats(addr).idle, 1);
    }

    #[tokio::test]
    async fn test_cancellation_closes_connection() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            if proto.read_message_begin().is_err() {
                return false;
            }
            thread::sleep(Duration::from_secs(3));
            false
        });
        let client = client(addr);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = client
            .call::<_, SearchResponse>(
                &CallContext::new().with_cancel(token),
                "Search",
                sample(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(client.pool().stats(addr), PoolStats { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            if proto.read_message_begin().is_err() {
                return false;
            }
            thread::sleep(Duration::from_secs(3));
            false
        });
        let client = client(addr);

        let started = Instant::now();
        let err = client
            .call::<_, SearchResponse>(
                &CallContext::new().with_timeout(Duration::from_millis(100)),
                "Search",
                sample(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_read_timeout_override() {
        let (addr, _) = spawn_server(ProtocolConfig::default(), |_, proto| {
            if proto.read_message_begin().is_err() {
                return false;
            }
            thread::sleep(Duration::from_secs(3));
            false
        });
        let client = client(addr);

        let err = client
            .call::<_, SearchResponse>(
                &CallContext::new().with_read_timeout(Duration::from_millis(100)),
                "Search",
                sample(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }

    #[tokio::test]
    async fn test_already_cancelled_context_fails_fast() {
        let (addr, accepted) = spawn_server(ProtocolConfig::default(), |_, _| false);
        let token = CancellationToken::new();
        token.cancel();

        let err = client(addr)
            .call::<_, SearchResponse>(&CallContext::new().with_cancel(token), "Search", sample())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }
}
