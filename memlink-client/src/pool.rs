//! # Connection Pool
//!
//! Purpose: Reuse server connections across operations to avoid a connect
//! per request, while bounding idle sockets per server.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections live in a per-address stack.
//! 2. **Minimal Locking**: The mutex guards only pushes and pops; dialing,
//!    reads, writes and closes all happen outside it.
//! 3. **LIFO Reuse**: The warmest connection is handed out first so cold ones
//!    age out on the server side.
//! 4. **Boundary Invariant**: A connection is pooled only when its last
//!    exchange ended cleanly at a response boundary.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --get_conn--> InUse --exchange ok / resumable error--> Idle
//!                         \--io or protocol error, pool full--> Closed
//! ```
//!
//! ## Deadlines
//!
//! The configured timeout bounds the connect and, separately, each whole
//! exchange. Sockets carry no timeout of their own between exchanges.

use std::collections::HashMap;
use std::io::{self, BufReader, Read, Write};
use std::mem;
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use memlink_common::protocol::{self, Request};
use memlink_common::{Item, McError, McResult};

use crate::selector::ServerAddr;

/// Reply decoder, one of the `protocol::read_*` functions.
pub(crate) type Decoder<T> = fn(&mut BufReader<Transport>, &mut Vec<u8>) -> McResult<T>;

/// Write buffers above this capacity are not kept between requests.
const MAX_RETAINED_WRITE_BUF: usize = 64 * 1024;

/// Pool settings derived from the client configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connect/read/write timeout; `None` disables deadlines.
    pub timeout: Option<Duration>,
    /// Maximum idle connections kept per server address.
    pub max_idle_per_addr: usize,
}

struct PoolInner {
    config: PoolConfig,
    free: Mutex<HashMap<ServerAddr, Vec<Connection>>>,
}

/// Connection pool handle, cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                free: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Checks out a connection to `addr`, dialing one if none is idle.
    pub fn get_conn(&self, addr: &ServerAddr) -> McResult<PooledConnection> {
        if let Some(conn) = self.pop_idle(addr) {
            return Ok(PooledConnection::new(self.clone(), conn));
        }
        let conn = Connection::dial(addr, self.inner.config.timeout)?;
        Ok(PooledConnection::new(self.clone(), conn))
    }

    /// Returns a connection to its free list, or closes it.
    ///
    /// Connections that are not `reusable`, or that would push the free list
    /// past its cap, are closed.
    pub fn release_conn(&self, conn: Connection, reusable: bool) {
        if !reusable {
            debug!(addr = %conn.addr, "closing tainted connection");
            return;
        }

        let rejected = {
            let mut free = self.inner.free.lock();
            let idle = free.entry(conn.addr.clone()).or_default();
            if idle.len() < self.inner.config.max_idle_per_addr {
                idle.push(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(conn) = rejected {
            debug!(addr = %conn.addr, "free list full, closing connection");
        }
    }

    /// Closes every idle connection.
    pub fn close(&self) {
        let drained = mem::take(&mut *self.inner.free.lock());
        let count: usize = drained.values().map(Vec::len).sum();
        debug!(count, "closing idle connections");
    }

    /// Total idle connections across all addresses.
    pub fn idle_count(&self) -> usize {
        self.inner.free.lock().values().map(Vec::len).sum()
    }

    /// Idle connections for one address.
    #[cfg(test)]
    pub fn idle_count_for(&self, addr: &ServerAddr) -> usize {
        self.inner.free.lock().get(addr).map_or(0, Vec::len)
    }

    fn pop_idle(&self, addr: &ServerAddr) -> Option<Connection> {
        self.inner.free.lock().get_mut(addr)?.pop()
    }
}

/// RAII handle for a checked-out connection.
///
/// Dropping the handle releases the connection: back to the pool if every
/// exchange left it at a response boundary, closed otherwise.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    reusable: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            reusable: true,
        }
    }

    /// Runs one request/response exchange on the connection.
    ///
    /// The whole exchange shares one deadline, `timeout` from now. A
    /// non-resumable error, or a panic inside `f`, marks the connection as
    /// tainted so it is closed instead of pooled.
    pub fn exchange<T, F>(&mut self, f: F) -> McResult<T>
    where
        F: FnOnce(&mut Connection) -> McResult<T>,
    {
        let timeout = self.pool.inner.config.timeout;
        let Some(conn) = self.conn.as_mut() else {
            return Err(McError::protocol("connection already released"));
        };
        self.reusable = false;
        conn.set_deadline(timeout.map(|timeout| Instant::now() + timeout));
        let result = f(conn);
        conn.set_deadline(None);
        self.reusable = match &result {
            Ok(_) => true,
            Err(err) => err.is_resumable(),
        };
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release_conn(conn, self.reusable);
        }
    }
}

/// Socket to one server.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }
}

/// Byte stream to one server, bounded by an optional operation deadline.
///
/// Every read and write re-arms the socket timeout with the time left, so
/// a slow trickle of bytes cannot stretch an exchange past its deadline.
pub(crate) struct Transport {
    stream: Stream,
    deadline: Option<Instant>,
}

impl Transport {
    fn remaining(&self) -> io::Result<Option<Duration>> {
        let Some(deadline) = self.deadline else {
            return Ok(None);
        };
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "operation deadline exceeded",
            ));
        }
        Ok(Some(left))
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(left) = self.remaining()? {
            self.stream.set_read_timeout(Some(left))?;
        }
        match &mut self.stream {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(left) = self.remaining()? {
            self.stream.set_write_timeout(Some(left))?;
        }
        match &mut self.stream {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stream {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

/// Single server connection with reusable buffers.
pub struct Connection {
    addr: ServerAddr,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Transport>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
    // `noreply` bytes went out since the last reply was read; the server may
    // have queued error lines for them.
    unsynced: bool,
    // A `version` fence was sent ahead of the current requests.
    fence_owed: bool,
}

impl Connection {
    fn dial(addr: &ServerAddr, timeout: Option<Duration>) -> McResult<Self> {
        debug!(addr = %addr, "dialing memcache server");
        let stream = match addr {
            ServerAddr::Tcp(sock) => {
                let stream = match timeout {
                    Some(timeout) => TcpStream::connect_timeout(sock, timeout).map_err(|err| {
                        if err.kind() == io::ErrorKind::TimedOut {
                            McError::ConnectTimeout {
                                addr: addr.to_string(),
                            }
                        } else {
                            McError::Network(err)
                        }
                    })?,
                    None => TcpStream::connect(sock)?,
                };
                // Requests are small; Nagle would only add latency.
                stream.set_nodelay(true)?;
                Stream::Tcp(stream)
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => Stream::Unix(UnixStream::connect(path)?),
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => return Err(McError::InvalidAddress(addr.to_string())),
        };

        Ok(Connection {
            addr: addr.clone(),
            reader: BufReader::new(Transport {
                stream,
                deadline: None,
            }),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
            unsynced: false,
            fence_owed: false,
        })
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.reader.get_mut().deadline = deadline;
    }

    /// Encodes `requests` back to back and writes them in one go.
    ///
    /// A batch is either all `noreply` or all reply-expecting. When earlier
    /// `noreply` writes are unconfirmed, a `version` request is sent first so
    /// their stray error lines can be told apart from this batch's replies.
    pub fn send(&mut self, requests: &[Request<'_>]) -> McResult<()> {
        if self.write_buf.capacity() > MAX_RETAINED_WRITE_BUF {
            self.write_buf = BytesMut::with_capacity(256);
        }
        self.write_buf.clear();

        let quiet = !requests.iter().any(Request::expects_reply);
        if !quiet && self.unsynced {
            Request::Version.encode(&mut self.write_buf);
            self.fence_owed = true;
            self.unsynced = false;
        }
        for request in requests {
            request.encode(&mut self.write_buf);
        }
        trace!(addr = %self.addr, requests = requests.len(), bytes = self.write_buf.len(), "sending");

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        if quiet && !requests.is_empty() {
            self.unsynced = true;
        }
        Ok(())
    }

    /// Decodes one reply with a `protocol::read_*` function.
    pub(crate) fn read_reply<T>(&mut self, decode: Decoder<T>) -> McResult<T> {
        self.settle()?;
        decode(&mut self.reader, &mut self.line_buf)
    }

    /// Streams `VALUE` blocks until `END`.
    pub fn read_values<F: FnMut(Item)>(&mut self, on_item: F) -> McResult<()> {
        self.settle()?;
        protocol::read_values(&mut self.reader, &mut self.line_buf, on_item)
    }

    /// Consumes the `version` fence and any stray lines queued before it.
    fn settle(&mut self) -> McResult<()> {
        if !self.fence_owed {
            return Ok(());
        }
        let stale = protocol::skip_to_version(&mut self.reader, &mut self.line_buf)?;
        self.fence_owed = false;
        for line in stale {
            warn!(addr = %self.addr, reply = %line, "discarding reply to noreply request");
        }
        Ok(())
    }
}
