//! Rill Cache
//!
//! Call caching: a content fingerprint identifies "the same work", and the
//! index maps fingerprints to prior successful calls whose results can be
//! reused instead of dispatching again.
//!
//! The index itself is a contract ([`CacheIndex`]); the durable
//! implementation lives with the persistence adapter. This crate owns the
//! fingerprint computation and the hit-copy strategy types.

mod fingerprint;
mod index;

pub use fingerprint::{fingerprint, Fingerprint};
pub use index::{CacheIndex, CallRef, HitStrategy, PriorResult, PLACEHOLDER_FILE};

use rill_io::IoError;

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
  /// The index could not be read or written.
  #[error("cache index error: {message}")]
  Index { message: String },

  /// A file referenced by the fingerprint inputs could not be digested.
  #[error("failed to digest fingerprint input")]
  Digest {
    #[from]
    source: IoError,
  },
}
