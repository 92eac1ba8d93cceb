use async_trait::async_trait;
use bytes::Bytes;

use crate::checksum::{digest_bytes, HashKind};
use crate::IoError;
use crate::PathStore;

/// Read-only HTTP(S) store.
///
/// Supports existence probes, sizes, and whole-object reads; writes and
/// deletes are unsupported by the scheme.
#[derive(Debug, Clone)]
pub struct HttpStore {
  client: reqwest::Client,
}

impl HttpStore {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }

  fn http_err(path: &str, source: reqwest::Error) -> IoError {
    IoError::Http {
      path: path.to_string(),
      source,
    }
  }

  fn unsupported(op: &'static str) -> IoError {
    IoError::Unsupported {
      op,
      scheme: "http".to_string(),
    }
  }
}

impl Default for HttpStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PathStore for HttpStore {
  fn scheme(&self) -> &'static str {
    "http"
  }

  async fn exists(&self, path: &str) -> Result<bool, IoError> {
    let response = self
      .client
      .head(path)
      .send()
      .await
      .map_err(|e| Self::http_err(path, e))?;
    Ok(response.status().is_success())
  }

  async fn size(&self, path: &str) -> Result<u64, IoError> {
    let response = self
      .client
      .head(path)
      .send()
      .await
      .map_err(|e| Self::http_err(path, e))?;
    if !response.status().is_success() {
      return Err(IoError::NotFound {
        path: path.to_string(),
      });
    }
    response
      .content_length()
      .ok_or_else(|| Self::unsupported("size"))
  }

  async fn read_all(&self, path: &str) -> Result<Bytes, IoError> {
    let response = self
      .client
      .get(path)
      .send()
      .await
      .map_err(|e| Self::http_err(path, e))?;
    if !response.status().is_success() {
      return Err(IoError::NotFound {
        path: path.to_string(),
      });
    }
    response.bytes().await.map_err(|e| Self::http_err(path, e))
  }

  async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes, IoError> {
    let response = self
      .client
      .get(path)
      .header("Range", format!("bytes={}-{}", offset, offset + len - 1))
      .send()
      .await
      .map_err(|e| Self::http_err(path, e))?;
    if !response.status().is_success() {
      return Err(IoError::NotFound {
        path: path.to_string(),
      });
    }
    response.bytes().await.map_err(|e| Self::http_err(path, e))
  }

  async fn write_all(&self, _path: &str, _data: Bytes) -> Result<(), IoError> {
    Err(Self::unsupported("write_all"))
  }

  async fn append(&self, _path: &str, _data: Bytes) -> Result<(), IoError> {
    Err(Self::unsupported("append"))
  }

  async fn delete(&self, _path: &str) -> Result<(), IoError> {
    Err(Self::unsupported("delete"))
  }

  async fn checksum(&self, path: &str, kind: HashKind) -> Result<String, IoError> {
    // No recorded digest to consult; stream the body.
    let data = self.read_all(path).await?;
    Ok(digest_bytes(kind, &data))
  }

  fn resolve(&self, base: &str, subpath: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), subpath)
  }

  async fn list_dir(&self, _path: &str) -> Result<Vec<String>, IoError> {
    Err(Self::unsupported("list_dir"))
  }
}
