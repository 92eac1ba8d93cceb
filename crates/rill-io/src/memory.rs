use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::checksum::{digest_bytes, HashKind};
use crate::IoError;
use crate::PathStore;

/// In-memory store.
///
/// Used as a test double and as the reference for digest-recording stores:
/// every write records content digests up front, so `checksum` is O(1) and
/// never streams.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: RwLock<BTreeMap<String, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
  data: Bytes,
  md5: String,
  sha256: String,
}

impl Entry {
  fn new(data: Bytes) -> Self {
    let md5 = digest_bytes(HashKind::Md5, &data);
    let sha256 = digest_bytes(HashKind::Sha256, &data);
    Self { data, md5, sha256 }
  }
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn entry(&self, path: &str) -> Result<Entry, IoError> {
    self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .get(path)
      .cloned()
      .ok_or_else(|| IoError::NotFound {
        path: path.to_string(),
      })
  }
}

#[async_trait]
impl PathStore for MemoryStore {
  fn scheme(&self) -> &'static str {
    "mem"
  }

  async fn exists(&self, path: &str) -> Result<bool, IoError> {
    Ok(
      self
        .entries
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .contains_key(path),
    )
  }

  async fn size(&self, path: &str) -> Result<u64, IoError> {
    Ok(self.entry(path)?.data.len() as u64)
  }

  async fn read_all(&self, path: &str) -> Result<Bytes, IoError> {
    Ok(self.entry(path)?.data)
  }

  async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes, IoError> {
    let data = self.entry(path)?.data;
    let start = (offset as usize).min(data.len());
    let end = (start + len as usize).min(data.len());
    Ok(data.slice(start..end))
  }

  async fn write_all(&self, path: &str, data: Bytes) -> Result<(), IoError> {
    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .insert(path.to_string(), Entry::new(data));
    Ok(())
  }

  async fn append(&self, path: &str, data: Bytes) -> Result<(), IoError> {
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    let combined = match entries.get(path) {
      Some(existing) => {
        let mut buf = existing.data.to_vec();
        buf.extend_from_slice(&data);
        Bytes::from(buf)
      }
      None => data,
    };
    entries.insert(path.to_string(), Entry::new(combined));
    Ok(())
  }

  async fn delete(&self, path: &str) -> Result<(), IoError> {
    self
      .entries
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .remove(path)
      .map(|_| ())
      .ok_or_else(|| IoError::NotFound {
        path: path.to_string(),
      })
  }

  async fn checksum(&self, path: &str, kind: HashKind) -> Result<String, IoError> {
    let entry = self.entry(path)?;
    Ok(match kind {
      HashKind::Md5 => entry.md5,
      HashKind::Sha256 => entry.sha256,
    })
  }

  fn resolve(&self, base: &str, subpath: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), subpath)
  }

  async fn list_dir(&self, path: &str) -> Result<Vec<String>, IoError> {
    let prefix = format!("{}/", path.trim_end_matches('/'));
    let names: Vec<String> = self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .keys()
      .filter(|k| k.starts_with(&prefix))
      .cloned()
      .collect();
    Ok(names)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_digest_recorded_on_write() {
    let store = MemoryStore::new();
    store
      .write_all("mem://bucket/x", Bytes::from(""))
      .await
      .unwrap();
    assert_eq!(
      store.checksum("mem://bucket/x", HashKind::Md5).await.unwrap(),
      "d41d8cd98f00b204e9800998ecf8427e"
    );
  }

  #[tokio::test]
  async fn test_overwrite_refreshes_digest() {
    let store = MemoryStore::new();
    store.write_all("mem://x", Bytes::from("a")).await.unwrap();
    let first = store.checksum("mem://x", HashKind::Sha256).await.unwrap();
    store.write_all("mem://x", Bytes::from("b")).await.unwrap();
    let second = store.checksum("mem://x", HashKind::Sha256).await.unwrap();
    assert_ne!(first, second);
  }

  #[tokio::test]
  async fn test_list_dir_by_prefix() {
    let store = MemoryStore::new();
    store.write_all("mem://d/a", Bytes::from("1")).await.unwrap();
    store.write_all("mem://d/b", Bytes::from("2")).await.unwrap();
    store.write_all("mem://e/c", Bytes::from("3")).await.unwrap();
    assert_eq!(
      store.list_dir("mem://d").await.unwrap(),
      vec!["mem://d/a", "mem://d/b"]
    );
  }
}
