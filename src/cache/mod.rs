//! Persistent response cache, partitioned into named namespaces.
//!
//! Each namespace maps a request identity (method + URL) to the last
//! response stored for it. Entries are only ever removed together with
//! their namespace.

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::CacheKey;
