//! Rill IO
//!
//! A uniform read/write/exists/copy/size/hash capability over heterogeneous
//! storages. The engine never touches `std::fs` directly: every path
//! operation and every byte of data movement goes through [`PathIo`], which
//! routes by URI scheme to a per-scheme [`PathStore`] adapter.
//!
//! Adapters provided here: local filesystem, in-memory (test double with
//! recorded digests), and read-only HTTP.

mod checksum;
mod copy;
mod http;
mod local;
mod memory;
mod router;

pub use checksum::HashKind;
pub use copy::{CopyOptions, part_size_for, DEFAULT_MULTIPART_THRESHOLD, MAX_PARTS, MIN_PART_SIZE};
pub use http::HttpStore;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use router::PathIo;

use async_trait::async_trait;
use bytes::Bytes;

/// Error type for path and IO operations.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
  /// The path does not exist.
  #[error("path not found: {path}")]
  NotFound { path: String },

  /// No store is registered for the path's scheme.
  #[error("unsupported scheme '{scheme}' for path: {path}")]
  UnsupportedScheme { scheme: String, path: String },

  /// The store for this scheme does not support the operation.
  #[error("operation '{op}' not supported by the '{scheme}' store")]
  Unsupported { op: &'static str, scheme: String },

  /// An underlying filesystem error.
  #[error("io error on {path}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  /// An HTTP transfer failed.
  #[error("http error on {path}")]
  Http {
    path: String,
    #[source]
    source: reqwest::Error,
  },
}

/// Per-scheme storage adapter.
///
/// All paths are full URIs (or bare paths for the local scheme). Adapters do
/// not route: cross-scheme copies are composed by [`PathIo`] from
/// `read_range`/`read_all` on the source and `write_all` on the destination.
#[async_trait]
pub trait PathStore: Send + Sync {
  /// Scheme this store serves, e.g. `"file"` or `"http"`.
  fn scheme(&self) -> &'static str;

  async fn exists(&self, path: &str) -> Result<bool, IoError>;

  async fn size(&self, path: &str) -> Result<u64, IoError>;

  async fn read_all(&self, path: &str) -> Result<Bytes, IoError>;

  /// Read `len` bytes starting at `offset`. Used for multipart copies.
  async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes, IoError>;

  async fn write_all(&self, path: &str, data: Bytes) -> Result<(), IoError>;

  /// Append to the path, creating it if absent. Used for part-wise writes.
  async fn append(&self, path: &str, data: Bytes) -> Result<(), IoError>;

  async fn delete(&self, path: &str) -> Result<(), IoError>;

  /// Content digest, lowercase hex.
  ///
  /// O(1) where the store records a digest; streamed otherwise. Streaming
  /// implementations MAY materialize a sibling `<file>.md5` to amortize
  /// future lookups; that sidecar is not invalidated on overwrite, so
  /// callers that rewrite files in place must not rely on it.
  async fn checksum(&self, path: &str, kind: HashKind) -> Result<String, IoError>;

  /// Join a subpath onto a base path, scheme-aware.
  fn resolve(&self, base: &str, subpath: &str) -> String;

  async fn list_dir(&self, path: &str) -> Result<Vec<String>, IoError>;
}
