//! # memlink Sync Client
//!
//! Purpose: Provide a blocking memcache client for the text protocol, with
//! key-based routing across servers and per-server connection pooling.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP/Unix connections between calls.
//! 2. **Strategy Pattern**: Server placement is a pluggable `ServerSelector`.
//! 3. **Pipelining**: Multi-key calls send one batch per server.
//! 4. **Protocol Clarity**: Framing lives in `memlink_common::protocol`.
//!
//! ## Example
//!
//! ```no_run
//! use memlink_client::{Client, Item};
//!
//! # fn main() -> memlink_client::McResult<()> {
//! let client = Client::new(&["127.0.0.1:11211"])?;
//! client.set(&Item::new("greeting", "hello").with_flags(7))?;
//! let item = client.get("greeting")?;
//! assert_eq!(item.value, b"hello");
//! # Ok(())
//! # }
//! ```

mod client;
mod crc32;
mod pool;
mod selector;

pub use client::{Client, ClientConfig, DEFAULT_MAX_IDLE_CONNS, DEFAULT_TIMEOUT};
pub use memlink_common::{Item, McError, McResult, MAX_KEY_LENGTH};
pub use selector::{ServerAddr, ServerList, ServerSelector};
