//! # Server Selection
//!
//! Purpose: Map a cache key to the server that owns it, and enumerate every
//! configured server for broadcast commands such as `flush_all`.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `ServerSelector` is the seam for alternative
//!    placement schemes (e.g. a ketama ring); the client never inspects it.
//! 2. **Deterministic Routing**: A fixed address set always maps a key to the
//!    same server.
//! 3. **Short Critical Sections**: Address parsing and DNS happen before the
//!    lock is taken; the lock only guards the slot vector.
//!
//! ## Membership Changes
//!
//! Removing a server leaves a vacant slot instead of shifting the others, so
//! keys owned by surviving servers keep their placement. A key that lands on
//! a vacant slot is rehashed a few times, then falls through to the next live
//! slot.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use parking_lot::RwLock;

use memlink_common::{McError, McResult};

use crate::crc32;

/// Rehash attempts before falling back to a linear probe.
const MAX_REHASH: usize = 4;

/// Address of one memcache server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    /// TCP endpoint, resolved once when the address is parsed.
    Tcp(SocketAddr),
    /// Unix-domain socket path.
    Unix(PathBuf),
}

impl ServerAddr {
    /// Parses `host:port` or a socket path.
    ///
    /// Any string containing `/` is treated as a Unix-domain socket path.
    pub fn parse(server: &str) -> McResult<Self> {
        if server.contains('/') {
            return Ok(ServerAddr::Unix(PathBuf::from(server)));
        }
        server
            .to_socket_addrs()
            .map_err(|_| McError::InvalidAddress(server.to_owned()))?
            .next()
            .map(ServerAddr::Tcp)
            .ok_or_else(|| McError::InvalidAddress(server.to_owned()))
    }
}

impl FromStr for ServerAddr {
    type Err = McError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerAddr::parse(s)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp(addr) => write!(f, "{}", addr),
            ServerAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Strategy that resolves keys to server addresses.
///
/// Implementations must be safe to call from many threads at once.
pub trait ServerSelector: Send + Sync {
    /// Returns the server that owns `key`.
    fn pick_server(&self, key: &str) -> McResult<ServerAddr>;

    /// Returns every configured server, one entry each.
    fn pick_all_servers(&self) -> McResult<Vec<ServerAddr>>;

    /// Calls `f` for every configured server, stopping at the first error.
    fn each(&self, f: &mut dyn FnMut(&ServerAddr) -> McResult<()>) -> McResult<()> {
        for addr in self.pick_all_servers()? {
            f(&addr)?;
        }
        Ok(())
    }
}

/// Default selector: CRC-32 of the key modulo the slot count.
#[derive(Debug, Default)]
pub struct ServerList {
    slots: RwLock<Vec<Option<ServerAddr>>>,
}

impl ServerList {
    /// Builds a list from server strings, in order.
    pub fn new<S: AsRef<str>>(servers: &[S]) -> McResult<Self> {
        let list = ServerList::default();
        list.set_servers(servers)?;
        Ok(list)
    }

    /// Replaces the whole address set.
    ///
    /// Either every server parses and the set is swapped, or nothing changes.
    pub fn set_servers<S: AsRef<str>>(&self, servers: &[S]) -> McResult<()> {
        let mut parsed: Vec<Option<ServerAddr>> = Vec::with_capacity(servers.len());
        for server in servers {
            let addr = ServerAddr::parse(server.as_ref())?;
            if !parsed.iter().flatten().any(|known| *known == addr) {
                parsed.push(Some(addr));
            }
        }
        *self.slots.write() = parsed;
        Ok(())
    }

    /// Adds one server, reusing the first vacant slot if any.
    ///
    /// Adding a server that is already present is a no-op.
    pub fn add_server(&self, server: &str) -> McResult<ServerAddr> {
        let addr = ServerAddr::parse(server)?;
        let mut slots = self.slots.write();
        if slots.iter().flatten().any(|known| *known == addr) {
            return Ok(addr);
        }
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(addr.clone()),
            None => slots.push(Some(addr.clone())),
        }
        Ok(addr)
    }

    /// Removes one server. Returns false when it was not configured.
    pub fn remove_server(&self, server: &str) -> McResult<bool> {
        let addr = ServerAddr::parse(server)?;
        let mut slots = self.slots.write();
        let Some(slot) = slots.iter_mut().find(|slot| slot.as_ref() == Some(&addr)) else {
            return Ok(false);
        };
        *slot = None;
        if slots.iter().all(Option::is_none) {
            slots.clear();
        }
        Ok(true)
    }

    /// Number of live servers.
    pub fn len(&self) -> usize {
        self.slots.read().iter().flatten().count()
    }

    /// Returns true when no server is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ServerSelector for ServerList {
    fn pick_server(&self, key: &str) -> McResult<ServerAddr> {
        let slots = self.slots.read();
        pick_slot(&slots, key.as_bytes())
            .cloned()
            .ok_or(McError::NoServers)
    }

    fn pick_all_servers(&self) -> McResult<Vec<ServerAddr>> {
        let servers: Vec<ServerAddr> = self.slots.read().iter().flatten().cloned().collect();
        if servers.is_empty() {
            return Err(McError::NoServers);
        }
        Ok(servers)
    }
}

fn pick_slot<'a>(slots: &'a [Option<ServerAddr>], key: &[u8]) -> Option<&'a ServerAddr> {
    if slots.is_empty() {
        return None;
    }
    if slots.len() == 1 {
        return slots[0].as_ref();
    }

    let mut hash = crc32::checksum_ieee(key);
    let mut idx = hash as usize % slots.len();
    for _ in 0..MAX_REHASH {
        if let Some(addr) = &slots[idx] {
            return Some(addr);
        }
        hash = crc32::update(hash, key);
        idx = hash as usize % slots.len();
    }

    (0..slots.len())
        .map(|offset| (idx + offset) % slots.len())
        .find_map(|probe| slots[probe].as_ref())
}
