//! Core traits and types for the response cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::http::{Request, Response};

/// Identity under which a request is stored.
pub trait CacheKey {
  /// Stable, fixed-length key for storage lookups.
  fn cache_hash(&self) -> String;

  /// Human readable form, used for listing and logs.
  fn description(&self) -> String;
}

impl CacheKey for Request {
  fn cache_hash(&self) -> String {
    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(self.description().as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    // Fragments never leave the client, so they are not part of the identity
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }
}

/// A response read back out of a namespace.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}
