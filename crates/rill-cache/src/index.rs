use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rill_core::{CallKey, Detritus, Value};

use crate::{CacheError, Fingerprint};

/// How a cache hit is materialized into the new call root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitStrategy {
  /// Do not copy. Every referenced output path is verified to still exist
  /// (any miss rejects the candidate); output values point at the original
  /// locations, and a placeholder file in the new call root explains the
  /// indirection.
  UseOriginal,
  /// Physically materialize each output and each detritus file into the new
  /// call root, renaming detritus to the new call's conventional names.
  CopyOutputs,
}

/// Reference to a completed call whose results may be reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRef {
  pub key: CallKey,
  pub call_root: String,
  pub outputs: BTreeMap<String, Value>,
  pub detritus: Detritus,
  pub created_at: DateTime<Utc>,
}

/// Candidate prior calls for one fingerprint, in preference order:
/// most-recent first, insertion order as the tie-break.
///
/// Consumers must tolerate stale candidates (source files deleted since the
/// prior run) by falling through to the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorResult {
  pub fingerprint: Fingerprint,
  pub candidates: Vec<CallRef>,
}

impl PriorResult {
  pub fn best(&self) -> Option<&CallRef> {
    self.candidates.first()
  }
}

/// The caching index contract.
///
/// `lookup` returns `None` on a genuine miss. Index read failures surface as
/// errors so the caller can log-and-treat-as-miss without conflating the two.
#[async_trait]
pub trait CacheIndex: Send + Sync {
  async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<PriorResult>, CacheError>;

  async fn record(&self, fingerprint: &Fingerprint, call: CallRef) -> Result<(), CacheError>;
}

/// Name of the marker file written into a call root satisfied by a
/// [`HitStrategy::UseOriginal`] hit.
pub const PLACEHOLDER_FILE: &str = "call_caching_placeholder.txt";

impl HitStrategy {
  /// Text of the placeholder file for a `UseOriginal` hit.
  pub fn placeholder_text(source_root: &str) -> String {
    format!(
      "This call was satisfied from the call cache. Outputs were not copied; \
       they remain at the original call root:\n{}\n",
      source_root
    )
  }
}
