//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to the TagCache server so that single-key
//! operations pay one round trip instead of a handshake plus a round trip.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: At most `pool_size` live connections, idle or
//!    checked out; slots are reserved under the lock, connects happen outside it.
//! 2. **Bounded Waiting**: A full pool blocks on a condition variable until a
//!    connection is returned or the acquire timeout expires.
//! 3. **RAII Checkout**: `PooledConnection` returns or discards its socket on drop.
//! 4. **Suspect Sockets Die**: Any I/O, timeout or framing failure poisons the
//!    connection; a poisoned socket is never handed out again.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, trace};

use tagcache_common::{read_reply, Command, Reply};

use crate::{ClientError, ClientResult};

/// Pool configuration derived from `ClientConfig`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:1984".
    pub addr: String,
    /// Maximum live connections (idle + in use).
    pub pool_size: usize,
    pub connect_timeout: Duration,
    /// Read and write timeout on established sockets.
    pub io_timeout: Duration,
    /// How long `acquire` waits for a free connection when the pool is full.
    pub acquire_timeout: Duration,
    pub nodelay: bool,
    /// TCP keepalive idle interval; `None` leaves keepalive off.
    pub keepalive: Option<Duration>,
    /// Consecutive server-side errors after which a connection is recycled.
    pub failure_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            addr: "127.0.0.1:1984".to_string(),
            pool_size: 8,
            connect_timeout: Duration::from_millis(3000),
            io_timeout: Duration::from_millis(5000),
            acquire_timeout: Duration::from_millis(5000),
            nodelay: true,
            keepalive: Some(Duration::from_secs(60)),
            failure_threshold: 1,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub pool_size: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Live connections without outstanding soft failures.
    pub healthy_connections: usize,
    /// Cumulative connect, I/O, protocol and server failures.
    pub connection_failures: u64,
    pub connections_created: u64,
    /// Connections closed because they failed.
    pub connections_recycled: u64,
}

struct PoolState {
    idle: VecDeque<Connection>,
    live: usize,
    degraded_in_use: usize,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    next_id: AtomicU64,
    failures: AtomicU64,
    created: AtomicU64,
    recycled: AtomicU64,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    counters: PoolCounters,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened lazily by `acquire`.
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        if config.pool_size == 0 {
            return Err(ClientError::Configuration("pool_size must be at least 1".into()));
        }
        let state = PoolState {
            idle: VecDeque::with_capacity(config.pool_size),
            live: 0,
            degraded_in_use: 0,
            closed: false,
        };
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
                counters: PoolCounters::default(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a connection, opening one if the pool has room.
    ///
    /// # Errors
    /// - `Connection` when opening a new socket fails.
    /// - `PoolTimeout` when the pool stays full for `acquire_timeout`.
    /// - `Configuration` once the pool is closed.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let started = Instant::now();
        let deadline = started + self.inner.config.acquire_timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return Err(ClientError::Configuration("client closed".into()));
            }
            if let Some(conn) = state.idle.pop_front() {
                if conn.failures > 0 {
                    state.degraded_in_use += 1;
                }
                drop(state);
                trace!(
                    conn_id = conn.id,
                    idle_ms = conn.last_used.elapsed().as_millis() as u64,
                    "reusing pooled connection"
                );
                return Ok(PooledConnection::new(self.inner.clone(), conn));
            }
            if state.live < self.inner.config.pool_size {
                state.live += 1;
                drop(state);
                return self.open();
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::PoolTimeout {
                    waited: now - started,
                });
            }
            self.inner.available.wait_until(&mut state, deadline);
        }
    }

    fn open(&self) -> ClientResult<PooledConnection> {
        let id = self.inner.counters.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match Connection::connect(&self.inner.config, id) {
            Ok(conn) => {
                self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(addr = %self.inner.config.addr, conn_id = id, "opened connection");
                Ok(PooledConnection::new(self.inner.clone(), conn))
            }
            Err(err) => {
                self.inner.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    /// Closes idle connections and refuses further acquisitions.
    ///
    /// Checked-out connections are closed when their guard drops.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        self.inner.available.notify_all();
        debug!(closed = drained.len(), "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn health(&self) -> PoolHealth {
        let state = self.inner.state.lock();
        let idle = state.idle.len();
        let in_use = state.live.saturating_sub(idle);
        let degraded_idle = state.idle.iter().filter(|c| c.failures > 0).count();
        PoolHealth {
            pool_size: self.inner.config.pool_size,
            live: state.live,
            idle,
            in_use,
            healthy_connections: state
                .live
                .saturating_sub(degraded_idle + state.degraded_in_use),
            connection_failures: self.inner.counters.failures.load(Ordering::Relaxed),
            connections_created: self.inner.counters.created.load(Ordering::Relaxed),
            connections_recycled: self.inner.counters.recycled.load(Ordering::Relaxed),
        }
    }
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn check_in(&self, conn: Connection, checked_out_degraded: bool, keep: bool) {
        let mut state = self.state.lock();
        if checked_out_degraded {
            state.degraded_in_use = state.degraded_in_use.saturating_sub(1);
        }
        if keep && !state.closed {
            state.idle.push_back(conn);
        } else {
            state.live = state.live.saturating_sub(1);
            if !keep {
                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    conn_id = conn.id,
                    failures = conn.failures,
                    age_ms = conn.created.elapsed().as_millis() as u64,
                    "recycling connection"
                );
            }
        }
        drop(state);
        self.available.notify_one();
    }
}

/// RAII guard returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    degraded_at_checkout: bool,
    poisoned: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            degraded_at_checkout: conn.failures > 0,
            pool,
            conn: Some(conn),
            poisoned: false,
        }
    }

    /// Sends one command and reads its reply.
    ///
    /// `ERR` replies surface as `ClientError::Server` and count as a soft
    /// failure; transport and framing failures poison the connection.
    pub fn exec(&mut self, command: &Command<'_>) -> ClientResult<Reply> {
        let reply = self.round_trip(std::slice::from_ref(command))?;
        let mut replies = reply.into_iter();
        match replies.next() {
            Some(result) => result,
            None => Err(ClientError::protocol("missing reply")),
        }
    }

    /// Pipelines a batch: one write, then one reply per command in order.
    ///
    /// The outer error is a connection failure; inner errors are per-command
    /// server errors.
    pub fn exec_batch(&mut self, commands: &[Command<'_>]) -> ClientResult<Vec<ClientResult<Reply>>> {
        self.round_trip(commands)
    }

    fn round_trip(&mut self, commands: &[Command<'_>]) -> ClientResult<Vec<ClientResult<Reply>>> {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return Err(ClientError::protocol("connection already released")),
        };
        let raw = conn.exec(commands);
        let raw = match raw {
            Ok(raw) => raw,
            Err(err) => {
                self.poison();
                return Err(err);
            }
        };

        let mut results = Vec::with_capacity(raw.len());
        let mut any_failed = false;
        for (command, reply) in commands.iter().zip(raw) {
            match reply {
                Reply::Error(reason) => {
                    any_failed = true;
                    results.push(Err(ClientError::Server(reason)));
                }
                reply if command.accepts(&reply) => results.push(Ok(reply)),
                reply => {
                    self.poison();
                    return Err(ClientError::protocol(format!(
                        "unexpected reply {:?} to {}",
                        reply,
                        command.verb()
                    )));
                }
            }
        }
        if any_failed {
            self.mark_failed();
        } else {
            self.mark_ok();
        }
        Ok(results)
    }

    /// Records a soft failure; the connection is recycled at the threshold.
    pub fn mark_failed(&mut self) {
        self.pool.counters.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(conn) = self.conn.as_mut() {
            conn.failures += 1;
        }
    }

    /// Clears the consecutive failure counter.
    pub fn mark_ok(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.failures = 0;
            conn.last_used = Instant::now();
        }
    }

    /// Closes the connection on release instead of returning it.
    pub fn poison(&mut self) {
        if !self.poisoned {
            self.pool.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.poisoned = true;
    }

    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        let keep = !self.poisoned && conn.failures < self.pool.config.failure_threshold;
        self.pool.check_in(conn, self.degraded_at_checkout, keep);
    }
}

/// Single TCP connection with reusable buffers.
struct Connection {
    id: u64,
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
    created: Instant,
    last_used: Instant,
    failures: u32,
}

impl Connection {
    fn connect(config: &PoolConfig, id: u64) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        let setup = |stream: &TcpStream| -> std::io::Result<()> {
            stream.set_read_timeout(Some(config.io_timeout))?;
            stream.set_write_timeout(Some(config.io_timeout))?;
            stream.set_nodelay(config.nodelay)?;
            if let Some(idle) = config.keepalive {
                set_keepalive(stream, idle)?;
            }
            Ok(())
        };
        setup(&stream).map_err(|source| ClientError::Connection {
            addr: config.addr.clone(),
            source,
        })?;

        let now = Instant::now();
        Ok(Connection {
            id,
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
            created: now,
            last_used: now,
            failures: 0,
        })
    }

    fn exec(&mut self, commands: &[Command<'_>]) -> ClientResult<Vec<Reply>> {
        self.write_buf.clear();
        for command in commands {
            command.encode(&mut self.write_buf);
        }
        trace!(conn_id = self.id, commands = commands.len(), bytes = self.write_buf.len(), "sending");

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        let mut replies = Vec::with_capacity(commands.len());
        for _ in commands {
            replies.push(read_reply(&mut self.reader, &mut self.line_buf)?);
        }
        Ok(replies)
    }
}

fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let connect_err = |source| ClientError::Connection {
        addr: config.addr.clone(),
        source,
    };
    let addrs = config.addr.to_socket_addrs().map_err(connect_err)?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(connect_err(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "address resolved to nothing")
    })))
}

fn set_keepalive(stream: &TcpStream, idle: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle.max(Duration::from_secs(1)));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    fn config_for(addr: String, pool_size: usize) -> PoolConfig {
        PoolConfig {
            addr,
            pool_size,
            acquire_timeout: Duration::from_millis(100),
            keepalive: None,
            ..PoolConfig::default()
        }
    }

    fn spawn_echo_ok(connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let stream = stream.unwrap();
                thread::spawn(move || {
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut writer = stream;
                    let mut line = String::new();
                    while reader.read_line(&mut line).unwrap_or(0) > 0 {
                        let reply = if line.starts_with("GET") { "ERR boom\n" } else { "OK\n" };
                        writer.write_all(reply.as_bytes()).unwrap();
                        line.clear();
                    }
                });
            }
        });
        addr
    }

    /// Answers every line with `reply`, or never answers when it is `None`.
    fn spawn_scripted(reply: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                thread::spawn(move || {
                    let mut reader = BufReader::new(stream.try_clone().unwrap());
                    let mut writer = stream;
                    let mut line = String::new();
                    while reader.read_line(&mut line).unwrap_or(0) > 0 {
                        match reply {
                            Some(reply) => {
                                let _ = writer.write_all(reply.as_bytes());
                            }
                            None => thread::sleep(Duration::from_secs(2)),
                        }
                        line.clear();
                    }
                });
            }
        });
        addr
    }

    #[test]
    fn rejects_zero_pool_size() {
        let result = ConnectionPool::new(config_for("127.0.0.1:1".into(), 0));
        assert!(matches!(result, Err(ClientError::Configuration(_))));
    }

    #[test]
    fn reuses_returned_connection() {
        let addr = spawn_echo_ok(2);
        let pool = ConnectionPool::new(config_for(addr, 2)).unwrap();
        let tags: Vec<String> = Vec::new();
        let put = Command::Put {
            key: "k",
            ttl_ms: None,
            tags: &tags,
            payload: "v",
        };

        let first_id = {
            let mut conn = pool.acquire().unwrap();
            assert_eq!(conn.exec(&put).unwrap(), Reply::Ok);
            conn.id()
        };
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), first_id);
        drop(conn);

        let health = pool.health();
        assert_eq!(health.connections_created, 1);
        assert_eq!(health.live, 1);
        assert_eq!(health.idle, 1);
    }

    #[test]
    fn full_pool_times_out() {
        let addr = spawn_echo_ok(1);
        let pool = ConnectionPool::new(config_for(addr, 1)).unwrap();
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().err().unwrap();
        assert!(matches!(err, ClientError::PoolTimeout { .. }));
        assert_eq!(pool.health().live, 1);
    }

    #[test]
    fn waiting_acquire_gets_returned_connection() {
        let addr = spawn_echo_ok(1);
        let mut config = config_for(addr, 1);
        config.acquire_timeout = Duration::from_secs(2);
        let pool = ConnectionPool::new(config).unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|c| c.id()))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn server_error_recycles_at_threshold() {
        let addr = spawn_echo_ok(2);
        let pool = ConnectionPool::new(config_for(addr, 1)).unwrap();
        {
            let mut conn = pool.acquire().unwrap();
            let err = conn.exec(&Command::Get("k")).unwrap_err();
            assert!(matches!(err, ClientError::Server(ref r) if r == "boom"));
        }
        let health = pool.health();
        assert_eq!(health.live, 0);
        assert_eq!(health.connections_recycled, 1);
        assert_eq!(health.connection_failures, 1);

        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), 2);
    }

    #[test]
    fn read_timeout_poisons_connection() {
        let addr = spawn_scripted(None);
        let mut config = config_for(addr, 1);
        config.io_timeout = Duration::from_millis(50);
        let pool = ConnectionPool::new(config).unwrap();
        {
            let mut conn = pool.acquire().unwrap();
            let err = conn.exec(&Command::Get("k")).unwrap_err();
            assert!(matches!(err, ClientError::Io(_)), "{:?}", err);
            assert!(err.is_retryable());
        }
        let health = pool.health();
        assert_eq!(health.live, 0);
        assert_eq!(health.connections_recycled, 1);
        assert_eq!(health.connection_failures, 1);

        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id(), 2);
        assert_eq!(pool.health().connections_created, 2);
    }

    #[test]
    fn garbage_reply_poisons_connection() {
        let addr = spawn_scripted(Some("WAT\n"));
        let pool = ConnectionPool::new(config_for(addr, 1)).unwrap();
        {
            let mut conn = pool.acquire().unwrap();
            let err = conn.exec(&Command::Get("k")).unwrap_err();
            assert!(matches!(err, ClientError::Protocol(_)), "{:?}", err);
            assert!(!err.is_retryable());
        }
        let health = pool.health();
        assert_eq!(health.live, 0);
        assert_eq!(health.idle, 0);
        assert_eq!(health.connections_recycled, 1);
    }

    #[test]
    fn mismatched_reply_poisons_connection() {
        // `OK` is well formed but cannot answer a GET.
        let addr = spawn_scripted(Some("OK\n"));
        let pool = ConnectionPool::new(config_for(addr, 1)).unwrap();
        {
            let mut conn = pool.acquire().unwrap();
            let err = conn.exec(&Command::Get("k")).unwrap_err();
            assert!(matches!(err, ClientError::Protocol(_)), "{:?}", err);
        }
        assert_eq!(pool.health().connections_recycled, 1);
    }

    #[test]
    fn keepalive_is_enabled_on_new_connections() {
        let addr = spawn_echo_ok(1);
        let mut config = config_for(addr, 1);
        config.keepalive = Some(Duration::from_secs(30));
        let pool = ConnectionPool::new(config).unwrap();
        let conn = pool.acquire().unwrap();
        let stream = conn.conn.as_ref().unwrap().reader.get_ref();
        assert!(SockRef::from(stream).keepalive().unwrap());
    }

    #[test]
    fn refused_connect_releases_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = ConnectionPool::new(config_for(addr, 1)).unwrap();
        let err = pool.acquire().err().unwrap();
        assert!(matches!(err, ClientError::Connection { .. }));
        assert!(err.is_retryable());
        assert_eq!(pool.health().live, 0);
    }

    #[test]
    fn closed_pool_refuses_acquire() {
        let addr = spawn_echo_ok(1);
        let pool = ConnectionPool::new(config_for(addr, 1)).unwrap();
        drop(pool.acquire().unwrap());
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.health().live, 0);
        assert!(matches!(pool.acquire(), Err(ClientError::Configuration(_))));
    }
}
