use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::checksum::HashKind;
use crate::copy::{part_size_for, CopyOptions};
use crate::http::HttpStore;
use crate::local::LocalStore;
use crate::IoError;
use crate::PathStore;

/// Scheme-routing front door for all path operations.
///
/// Holds one [`PathStore`] per scheme and dispatches by the path's scheme
/// prefix; bare paths route to the local store. Cross-scheme copies are
/// composed from reads on the source store and writes on the destination
/// store, part-wise above the multipart threshold.
#[derive(Clone)]
pub struct PathIo {
  stores: BTreeMap<String, Arc<dyn PathStore>>,
}

impl PathIo {
  /// A router with the standard adapters: local (with MD5 sidecars) and
  /// read-only HTTP(S).
  pub fn standard() -> Self {
    let mut io = Self {
      stores: BTreeMap::new(),
    };
    io.register("file", Arc::new(LocalStore::with_md5_sidecar()));
    let http = Arc::new(HttpStore::new());
    io.register("http", http.clone());
    io.register("https", http);
    io
  }

  /// An empty router; callers register the adapters they need.
  pub fn new() -> Self {
    Self {
      stores: BTreeMap::new(),
    }
  }

  pub fn register(&mut self, scheme: impl Into<String>, store: Arc<dyn PathStore>) {
    self.stores.insert(scheme.into(), store);
  }

  /// Scheme of a path; bare paths are local.
  pub fn scheme_of(path: &str) -> &str {
    match path.split_once("://") {
      Some((scheme, _)) => scheme,
      None => "file",
    }
  }

  fn store_for(&self, path: &str) -> Result<&Arc<dyn PathStore>, IoError> {
    let scheme = Self::scheme_of(path);
    self
      .stores
      .get(scheme)
      .ok_or_else(|| IoError::UnsupportedScheme {
        scheme: scheme.to_string(),
        path: path.to_string(),
      })
  }

  pub async fn exists(&self, path: &str) -> Result<bool, IoError> {
    self.store_for(path)?.exists(path).await
  }

  /// Existence probe that fails with `NotFound` instead of returning false.
  pub async fn exists_or_throw(&self, path: &str) -> Result<(), IoError> {
    if self.exists(path).await? {
      Ok(())
    } else {
      Err(IoError::NotFound {
        path: path.to_string(),
      })
    }
  }

  pub async fn size(&self, path: &str) -> Result<u64, IoError> {
    self.store_for(path)?.size(path).await
  }

  pub async fn read_all(&self, path: &str) -> Result<Bytes, IoError> {
    self.store_for(path)?.read_all(path).await
  }

  pub async fn write_all(&self, path: &str, data: Bytes) -> Result<(), IoError> {
    self.store_for(path)?.write_all(path, data).await
  }

  pub async fn delete(&self, path: &str) -> Result<(), IoError> {
    self.store_for(path)?.delete(path).await
  }

  pub async fn checksum(&self, path: &str, kind: HashKind) -> Result<String, IoError> {
    self.store_for(path)?.checksum(path, kind).await
  }

  pub fn resolve(&self, base: &str, subpath: &str) -> Result<String, IoError> {
    Ok(self.store_for(base)?.resolve(base, subpath))
  }

  pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, IoError> {
    self.store_for(path)?.list_dir(path).await
  }

  /// Copy `src` to `dst`, possibly across schemes.
  ///
  /// Below the multipart threshold this is one read and one write; at or
  /// above it the object moves part-wise, with the part size chosen so the
  /// part count stays within the store limits.
  pub async fn copy(&self, src: &str, dst: &str, options: &CopyOptions) -> Result<(), IoError> {
    let src_store = self.store_for(src)?;
    let dst_store = self.store_for(dst)?;

    let len = src_store.size(src).await?;
    if len < options.multipart_threshold {
      let data = src_store.read_all(src).await?;
      return dst_store.write_all(dst, data).await;
    }

    let part_size = part_size_for(len);
    let parts = len.div_ceil(part_size);
    debug!(src, dst, len, part_size, parts, "multipart copy");

    // Truncate any previous object, then append part-wise.
    dst_store.write_all(dst, Bytes::new()).await?;
    let mut offset = 0u64;
    while offset < len {
      let chunk = part_size.min(len - offset);
      let data = src_store.read_range(src, offset, chunk).await?;
      dst_store.append(dst, data).await?;
      offset += chunk;
    }
    Ok(())
  }
}

impl Default for PathIo {
  fn default() -> Self {
    Self::standard()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::MemoryStore;

  fn memory_io() -> PathIo {
    let mut io = PathIo::new();
    io.register("mem", Arc::new(MemoryStore::new()));
    io.register("file", Arc::new(LocalStore::new()));
    io
  }

  #[test]
  fn test_scheme_detection() {
    assert_eq!(PathIo::scheme_of("mem://bucket/key"), "mem");
    assert_eq!(PathIo::scheme_of("/plain/path"), "file");
  }

  #[tokio::test]
  async fn test_unregistered_scheme_rejected() {
    let io = memory_io();
    let err = io.read_all("gopher://x").await.unwrap_err();
    assert!(matches!(err, IoError::UnsupportedScheme { .. }));
  }

  #[tokio::test]
  async fn test_cross_scheme_copy() {
    let io = memory_io();
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("out.txt").display().to_string();

    io.write_all("mem://src/data", Bytes::from("payload"))
      .await
      .unwrap();
    io.copy("mem://src/data", &local, &CopyOptions::default())
      .await
      .unwrap();
    assert_eq!(io.read_all(&local).await.unwrap(), Bytes::from("payload"));
  }

  #[tokio::test]
  async fn test_multipart_copy_preserves_content() {
    let io = memory_io();
    // Force the multipart path with a tiny threshold.
    let options = CopyOptions {
      multipart_threshold: 4,
    };
    let body: Vec<u8> = (0..=255u8).collect();
    io.write_all("mem://big/src", Bytes::from(body.clone()))
      .await
      .unwrap();
    io.copy("mem://big/src", "mem://big/dst", &options)
      .await
      .unwrap();
    assert_eq!(io.read_all("mem://big/dst").await.unwrap(), Bytes::from(body));
  }

  #[tokio::test]
  async fn test_exists_or_throw() {
    let io = memory_io();
    io.write_all("mem://a", Bytes::from("1")).await.unwrap();
    io.exists_or_throw("mem://a").await.unwrap();
    let err = io.exists_or_throw("mem://b").await.unwrap_err();
    assert!(matches!(err, IoError::NotFound { .. }));
  }
}
