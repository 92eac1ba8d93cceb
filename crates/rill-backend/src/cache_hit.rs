use std::collections::BTreeMap;
use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use rill_cache::{CallRef, HitStrategy, PriorResult, PLACEHOLDER_FILE};
use rill_core::{Detritus, DetritusKind, Value};
use rill_io::{CopyOptions, PathIo};

use crate::types::BoundCall;
use crate::BackendError;

/// Satisfy a call from the cache.
///
/// Candidates are tried in preference order; a candidate whose files have
/// gone stale is rejected and the next one is tried. When none survive the
/// caller treats the hit as a miss and dispatches normally.
pub(crate) async fn copy_cache_hit(
  io: &PathIo,
  bound: &BoundCall,
  prior: &PriorResult,
  strategy: HitStrategy,
) -> Result<(BTreeMap<String, Value>, Detritus), BackendError> {
  let mut rejections = Vec::new();
  for candidate in &prior.candidates {
    match try_candidate(io, bound, candidate, strategy).await {
      Ok(result) => return Ok(result),
      Err(e) => {
        debug!(
          call = %bound.key,
          source_root = %candidate.call_root,
          error = %e,
          "cache candidate rejected"
        );
        rejections.push(format!("{}: {}", candidate.call_root, e));
      }
    }
  }
  Err(BackendError::CacheHit {
    message: rejections.join("; "),
  })
}

async fn try_candidate(
  io: &PathIo,
  bound: &BoundCall,
  candidate: &CallRef,
  strategy: HitStrategy,
) -> Result<(BTreeMap<String, Value>, Detritus), BackendError> {
  match strategy {
    HitStrategy::UseOriginal => {
      // Every referenced output must still exist; any miss rejects the
      // candidate before anything is written.
      for value in candidate.outputs.values() {
        for path in value.file_paths() {
          io.exists_or_throw(path).await?;
        }
      }

      let placeholder = format!("{}/{}", bound.call_root, PLACEHOLDER_FILE);
      io.write_all(
        &placeholder,
        Bytes::from(HitStrategy::placeholder_text(&candidate.call_root)),
      )
      .await?;

      // Outputs keep pointing at the original locations; the recorded
      // detritus is the original call's, which remains readable.
      Ok((candidate.outputs.clone(), candidate.detritus.clone()))
    }
    HitStrategy::CopyOutputs => {
      // Materialize outputs into the new call root, keeping base names.
      let mut relocated: HashMap<String, String> = HashMap::new();
      for value in candidate.outputs.values() {
        for src in value.file_paths() {
          if relocated.contains_key(src) {
            continue;
          }
          let base = src.rsplit('/').next().unwrap_or("output");
          let dst = format!("{}/{}", bound.call_root, base);
          io.copy(src, &dst, &CopyOptions::default()).await?;
          relocated.insert(src.to_string(), dst);
        }
      }

      let outputs = candidate
        .outputs
        .iter()
        .map(|(name, value)| {
          let rewritten = value.map_files(&|p| {
            relocated.get(p).cloned().unwrap_or_else(|| p.to_string())
          });
          (name.clone(), rewritten)
        })
        .collect();

      // Detritus copies under the new call's conventional names.
      for (kind, src) in candidate.detritus.iter() {
        if kind == DetritusKind::CallRoot {
          continue;
        }
        let src = src.display().to_string();
        if !io.exists(&src).await? {
          return Err(BackendError::Io {
            source: rill_io::IoError::NotFound { path: src },
          });
        }
        let dst = format!("{}/{}", bound.call_root, kind.file_name());
        io.copy(&src, &dst, &CopyOptions::default()).await?;
      }

      Ok((outputs, bound.detritus.clone()))
    }
  }
}
