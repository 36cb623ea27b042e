//! # Synchronous Client API
//!
//! Purpose: Expose a blocking memcache API that routes keys across servers,
//! reuses pooled connections, and batches multi-key work per server.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides selection, pooling and framing.
//! 2. **Validate Before I/O**: Keys are checked before any server is picked.
//! 3. **Partition, Execute, Merge**: Multi-key calls group keys per server,
//!    run one pipelined exchange per group, then merge the outcomes.
//! 4. **No Hidden Retries**: A failed operation is reported, never replayed.
//!
//! ## Quiet Writes
//!
//! The `*_quietly` calls send the `noreply` form of a command and return as
//! soon as the bytes are written. Success means "accepted for transmission",
//! not "stored". memcached still answers some failures (oversized values,
//! bad data chunks) with an error line; the connection discards those when
//! it is next used for a request that expects a reply, and logs them.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use memlink_common::protocol::{self, Request, StoreVerb};
use memlink_common::{check_key, Item, McError, McResult};

use crate::pool::{Connection, ConnectionPool, Decoder, PoolConfig};
use crate::selector::{ServerAddr, ServerList, ServerSelector};

/// Default connect/read/write timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default number of idle connections kept per server.
pub const DEFAULT_MAX_IDLE_CONNS: usize = 2;

/// Configuration for the client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connect/read/write timeout applied to every socket operation.
    /// `None` disables deadlines, leaving timeouts to the caller.
    pub timeout: Option<Duration>,
    /// Maximum idle connections kept per server address.
    pub max_idle_conns_per_addr: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            timeout: Some(DEFAULT_TIMEOUT),
            max_idle_conns_per_addr: DEFAULT_MAX_IDLE_CONNS,
        }
    }
}

/// Keys or items routed to one server.
struct Partition<'a, T> {
    addr: ServerAddr,
    entries: Vec<&'a T>,
}

/// Memcache client, safe to share between threads.
///
/// Cloning is cheap; clones share the selector and the connection pool.
#[derive(Clone)]
pub struct Client {
    selector: Arc<dyn ServerSelector>,
    pool: ConnectionPool,
}

impl Client {
    /// Creates a client for the given servers with default configuration.
    ///
    /// Each server is `host:port` or a Unix-domain socket path.
    pub fn new<S: AsRef<str>>(servers: &[S]) -> McResult<Self> {
        Self::with_config(servers, ClientConfig::default())
    }

    /// Creates a client for the given servers with a custom configuration.
    pub fn with_config<S: AsRef<str>>(servers: &[S], config: ClientConfig) -> McResult<Self> {
        let selector = ServerList::new(servers)?;
        Ok(Self::with_selector(Arc::new(selector), config))
    }

    /// Creates a client around a custom server selector.
    pub fn with_selector(selector: Arc<dyn ServerSelector>, config: ClientConfig) -> Self {
        let pool = ConnectionPool::new(PoolConfig {
            // A zero timeout is rejected by the socket layer; treat it as none.
            timeout: config.timeout.filter(|timeout| !timeout.is_zero()),
            max_idle_per_addr: config.max_idle_conns_per_addr,
        });
        Client { selector, pool }
    }

    /// Fetches one item. Returns `McError::CacheMiss` when the key is absent.
    pub fn get(&self, key: &str) -> McResult<Item> {
        self.with_key_conn(key, |conn| {
            conn.send(&[Request::Gets { keys: &[key] }])?;
            let mut found = None;
            conn.read_values(|item| {
                if item.key == key {
                    found = Some(item);
                }
            })?;
            found.ok_or(McError::CacheMiss)
        })
    }

    /// Fetches many items with one request per server.
    ///
    /// Missing keys are absent from the result. If any server fails, the
    /// first failure is returned and results from other servers are dropped.
    pub fn get_multi(&self, keys: &[&str]) -> McResult<HashMap<String, Item>> {
        let partitions = self.partition(keys, |key| *key)?;
        let found = self.run_partitions(&partitions, |addr, keys| {
            let keys: Vec<&str> = keys.iter().map(|key| **key).collect();
            self.with_addr_conn(addr, |conn| {
                conn.send(&[Request::Gets { keys: &keys }])?;
                let mut items = Vec::with_capacity(keys.len());
                conn.read_values(|item| items.push(item))?;
                Ok(items)
            })
        })?;

        Ok(found
            .into_iter()
            .flatten()
            .map(|item| (item.key.clone(), item))
            .collect())
    }

    /// Stores an item unconditionally.
    pub fn set(&self, item: &Item) -> McResult<()> {
        self.store(StoreVerb::Set, item)
    }

    /// Stores an item only if its key is absent; `McError::NotStored` otherwise.
    pub fn add(&self, item: &Item) -> McResult<()> {
        self.store(StoreVerb::Add, item)
    }

    /// Stores an item only if its key is present; `McError::NotStored` otherwise.
    pub fn replace(&self, item: &Item) -> McResult<()> {
        self.store(StoreVerb::Replace, item)
    }

    /// Appends the item's value to the stored value. Flags and expiration
    /// are ignored by the server.
    pub fn append(&self, item: &Item) -> McResult<()> {
        self.store(StoreVerb::Append, item)
    }

    /// Prepends the item's value to the stored value. Flags and expiration
    /// are ignored by the server.
    pub fn prepend(&self, item: &Item) -> McResult<()> {
        self.store(StoreVerb::Prepend, item)
    }

    /// Stores an item only if it has not changed since it was fetched.
    ///
    /// The item must carry the CAS token returned by `get`/`get_multi`.
    /// Returns `McError::CasConflict` if another writer got there first and
    /// `McError::CacheMiss` if the key was evicted or deleted meanwhile.
    pub fn compare_and_swap(&self, item: &Item) -> McResult<()> {
        check_key(&item.key)?;
        let Some(cas) = item.cas else {
            return Err(McError::protocol(
                "compare-and-swap needs an item fetched with its CAS token",
            ));
        };
        self.with_key_conn(&item.key, |conn| {
            conn.send(&[Request::Cas {
                item,
                cas,
                noreply: false,
            }])?;
            conn.read_reply(protocol::read_storage_reply)
        })
    }

    /// Sends `set ... noreply` and returns once the bytes are written.
    pub fn set_quietly(&self, item: &Item) -> McResult<()> {
        self.with_key_conn(&item.key, |conn| {
            conn.send(&[Request::Store {
                verb: StoreVerb::Set,
                item,
                noreply: true,
            }])
        })
    }

    /// Stores many items, pipelined per server, and waits for every reply.
    ///
    /// Replies are drained in request order; the first failure is returned.
    pub fn set_multi(&self, items: &[Item]) -> McResult<()> {
        self.store_multi(items, false)
    }

    /// Stores many items with `noreply`, pipelined per server.
    pub fn set_multi_quietly(&self, items: &[Item]) -> McResult<()> {
        self.store_multi(items, true)
    }

    /// Deletes one item. Returns `McError::CacheMiss` when the key is absent.
    pub fn delete(&self, key: &str) -> McResult<()> {
        self.with_key_conn(key, |conn| {
            conn.send(&[Request::Delete {
                key,
                noreply: false,
            }])?;
            conn.read_reply(protocol::read_delete_reply)
        })
    }

    /// Sends `delete ... noreply` and returns once the bytes are written.
    pub fn delete_quietly(&self, key: &str) -> McResult<()> {
        self.with_key_conn(key, |conn| {
            conn.send(&[Request::Delete { key, noreply: true }])
        })
    }

    /// Deletes many keys, pipelined per server.
    ///
    /// Keys that were already absent are not an error.
    pub fn delete_multi(&self, keys: &[&str]) -> McResult<()> {
        self.delete_multi_inner(keys, false)
    }

    /// Deletes many keys with `noreply`, pipelined per server.
    pub fn delete_multi_quietly(&self, keys: &[&str]) -> McResult<()> {
        self.delete_multi_inner(keys, true)
    }

    /// Atomically adds `delta` to a numeric value and returns the result.
    ///
    /// The counter wraps at 64 bits. Returns `McError::CacheMiss` for an
    /// absent key and `McError::BadIncrDec` for a non-numeric value.
    pub fn increment(&self, key: &str, delta: u64) -> McResult<u64> {
        self.with_key_conn(key, |conn| {
            conn.send(&[Request::Incr { key, delta }])?;
            conn.read_reply(protocol::read_arith_reply)
        })
    }

    /// Atomically subtracts `delta` from a numeric value and returns the
    /// result. The counter never drops below zero.
    pub fn decrement(&self, key: &str, delta: u64) -> McResult<u64> {
        self.with_key_conn(key, |conn| {
            conn.send(&[Request::Decr { key, delta }])?;
            conn.read_reply(protocol::read_arith_reply)
        })
    }

    /// Updates an item's expiration without fetching it.
    pub fn touch(&self, key: &str, expiration: i32) -> McResult<()> {
        self.with_key_conn(key, |conn| {
            conn.send(&[Request::Touch { key, expiration }])?;
            conn.read_reply(protocol::read_touch_reply)
        })
    }

    /// Invalidates every item on every server after `delay` seconds.
    pub fn flush(&self, delay: u32) -> McResult<()> {
        self.selector.each(&mut |addr| {
            self.with_addr_conn(addr, |conn| {
                conn.send(&[Request::FlushAll {
                    delay,
                    noreply: false,
                }])?;
                conn.read_reply(protocol::read_ok_reply)
            })
        })
    }

    /// Checks that every server answers a `version` request.
    pub fn ping(&self) -> McResult<()> {
        self.selector.each(&mut |addr| {
            self.with_addr_conn(addr, |conn| {
                conn.send(&[Request::Version])?;
                conn.read_reply(protocol::read_version_reply).map(|_| ())
            })
        })
    }

    /// Closes every idle pooled connection. The client stays usable.
    pub fn close(&self) {
        self.pool.close();
    }

    /// Number of idle connections currently held by the pool.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    fn store(&self, verb: StoreVerb, item: &Item) -> McResult<()> {
        self.with_key_conn(&item.key, |conn| {
            conn.send(&[Request::Store {
                verb,
                item,
                noreply: false,
            }])?;
            conn.read_reply(protocol::read_storage_reply)
        })
    }

    fn store_multi(&self, items: &[Item], noreply: bool) -> McResult<()> {
        let partitions = self.partition(items, |item| item.key.as_str())?;
        self.run_partitions(&partitions, |addr, items| {
            self.with_addr_conn(addr, |conn| {
                let requests: Vec<Request<'_>> = items
                    .iter()
                    .map(|item| Request::Store {
                        verb: StoreVerb::Set,
                        item,
                        noreply,
                    })
                    .collect();
                conn.send(&requests)?;
                drain_replies(conn, reply_count(&requests), protocol::read_storage_reply, false)
            })
        })?;
        Ok(())
    }

    fn delete_multi_inner(&self, keys: &[&str], noreply: bool) -> McResult<()> {
        let partitions = self.partition(keys, |key| *key)?;
        self.run_partitions(&partitions, |addr, keys| {
            self.with_addr_conn(addr, |conn| {
                let requests: Vec<Request<'_>> = keys
                    .iter()
                    .map(|key| Request::Delete { key, noreply })
                    .collect();
                conn.send(&requests)?;
                drain_replies(conn, reply_count(&requests), protocol::read_delete_reply, true)
            })
        })?;
        Ok(())
    }

    /// Validates `key`, picks its server and runs one exchange there.
    fn with_key_conn<T, F>(&self, key: &str, f: F) -> McResult<T>
    where
        F: FnOnce(&mut Connection) -> McResult<T>,
    {
        check_key(key)?;
        let addr = self.selector.pick_server(key)?;
        self.with_addr_conn(&addr, f)
    }

    fn with_addr_conn<T, F>(&self, addr: &ServerAddr, f: F) -> McResult<T>
    where
        F: FnOnce(&mut Connection) -> McResult<T>,
    {
        let mut conn = self.pool.get_conn(addr)?;
        conn.exchange(f)
    }

    /// Groups entries by server, keeping caller order inside each group.
    ///
    /// Every key is validated before anything is sent.
    fn partition<'a, T>(
        &self,
        entries: &'a [T],
        key_of: impl Fn(&'a T) -> &'a str,
    ) -> McResult<Vec<Partition<'a, T>>> {
        for entry in entries {
            check_key(key_of(entry))?;
        }

        let mut partitions: Vec<Partition<'a, T>> = Vec::new();
        let mut index: HashMap<ServerAddr, usize> = HashMap::new();
        for entry in entries {
            let addr = self.selector.pick_server(key_of(entry))?;
            match index.get(&addr) {
                Some(&idx) => partitions[idx].entries.push(entry),
                None => {
                    index.insert(addr.clone(), partitions.len());
                    partitions.push(Partition {
                        addr,
                        entries: vec![entry],
                    });
                }
            }
        }
        Ok(partitions)
    }

    /// Runs one exchange per partition, in parallel when there are several.
    ///
    /// Returns results in partition order, or the first partition error.
    fn run_partitions<'a, T, R, F>(&self, partitions: &[Partition<'a, T>], run: F) -> McResult<Vec<R>>
    where
        T: Sync,
        R: Send,
        F: Fn(&ServerAddr, &[&'a T]) -> McResult<R> + Sync,
    {
        let outcomes: Vec<McResult<R>> = match partitions {
            [] => Vec::new(),
            [single] => vec![run(&single.addr, &single.entries)],
            _ => {
                let run = &run;
                thread::scope(|scope| {
                    let handles: Vec<_> = partitions
                        .iter()
                        .map(|partition| {
                            scope.spawn(move || run(&partition.addr, &partition.entries))
                        })
                        .collect();
                    handles
                        .into_iter()
                        .map(|handle| {
                            handle
                                .join()
                                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                        })
                        .collect()
                })
            }
        };

        let mut results = Vec::with_capacity(outcomes.len());
        for (partition, outcome) in partitions.iter().zip(outcomes) {
            match outcome {
                Ok(result) => results.push(result),
                Err(err) => {
                    warn!(addr = %partition.addr, keys = partition.entries.len(), error = %err, "batch partition failed");
                    return Err(err);
                }
            }
        }
        Ok(results)
    }
}

fn reply_count(requests: &[Request<'_>]) -> usize {
    requests.iter().filter(|request| request.expects_reply()).count()
}

/// Reads `count` pipelined replies in order.
///
/// Resumable errors (e.g. `NOT_STORED`) do not stop the drain, so the
/// connection ends at a response boundary; the first one is returned.
fn drain_replies(
    conn: &mut Connection,
    count: usize,
    decode: Decoder<()>,
    tolerate_miss: bool,
) -> McResult<()> {
    let mut first_err = None;
    for _ in 0..count {
        match conn.read_reply(decode) {
            Ok(()) => {}
            Err(McError::CacheMiss) if tolerate_miss => {}
            Err(err) if err.is_resumable() => {
                first_err.get_or_insert(err);
            }
            Err(err) => return Err(err),
        }
    }
    first_err.map_or(Ok(()), Err)
}
