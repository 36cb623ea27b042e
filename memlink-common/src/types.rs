//! # Item and Key Types
//!
//! Purpose: Describe one cache entry as the caller sees it and enforce the
//! key rules of the text protocol before anything reaches the wire.
//!
//! ## Design Principles
//! 1. **Caller-Owned Values**: `Item` is a plain value object; the client only
//!    borrows it for the duration of a call.
//! 2. **Validate Early**: Illegal keys are rejected locally, never sent.
//! 3. **Opaque Flags**: Flags round-trip through the server uninterpreted.

use crate::error::{McError, McResult};

/// Maximum key length accepted by memcached, in bytes.
pub const MAX_KEY_LENGTH: usize = 250;

/// A single cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// Item key, at most 250 bytes, no whitespace or control bytes.
    pub key: String,
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Opaque flags stored alongside the value.
    pub flags: u32,
    /// Expiration in seconds: 0 means never, values above 30 days are
    /// absolute Unix timestamps, negative values expire immediately.
    pub expiration: i32,
    /// CAS token, populated by retrieval and consumed by compare-and-swap.
    pub cas: Option<u64>,
}

impl Item {
    /// Creates an item with zero flags and no expiration.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            ..Item::default()
        }
    }

    /// Sets the opaque flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the expiration in seconds.
    pub fn with_expiration(mut self, expiration: i32) -> Self {
        self.expiration = expiration;
        self
    }
}

/// Returns true when `key` can be sent to the server as-is.
///
/// Empty keys are rejected since the server would answer with `ERROR`.
/// Bytes at or below ASCII space and DEL (0x7f) are rejected; multi-byte
/// UTF-8 sequences are fine since every byte is >= 0x80.
pub fn is_legal_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY_LENGTH && key.bytes().all(|b| b > b' ' && b != 0x7f)
}

/// Validates `key`, returning `McError::MalformedKey` when it is illegal.
pub fn check_key(key: &str) -> McResult<()> {
    if is_legal_key(key) {
        Ok(())
    } else {
        Err(McError::MalformedKey)
    }
}
