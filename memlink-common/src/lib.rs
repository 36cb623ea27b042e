//! # memlink-common
//!
//! Wire-level building blocks shared by the memlink client: the `Item` value
//! object, key validation, the error taxonomy, and the memcache text protocol
//! codec.

pub mod error;
pub mod protocol;
pub mod types;

pub use error::{McError, McResult};
pub use protocol::{Request, StoreVerb};
pub use types::{check_key, is_legal_key, Item, MAX_KEY_LENGTH};
