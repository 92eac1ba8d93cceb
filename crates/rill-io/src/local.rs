use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::checksum::{HashKind, Hasher};
use crate::IoError;
use crate::PathStore;

const STREAM_CHUNK: usize = 1024 * 1024;

/// Local-filesystem store.
///
/// Accepts bare paths and `file://` URIs. Checksums stream the file; with
/// `md5_sidecar` enabled the computed MD5 is written next to the file as
/// `<file>.md5` so later lookups are O(1). The sidecar is not invalidated
/// when the file is overwritten in place.
#[derive(Debug, Clone)]
pub struct LocalStore {
  md5_sidecar: bool,
}

impl LocalStore {
  pub fn new() -> Self {
    Self { md5_sidecar: false }
  }

  pub fn with_md5_sidecar() -> Self {
    Self { md5_sidecar: true }
  }

  fn to_path(path: &str) -> PathBuf {
    PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
  }

  fn io_err(path: &str, source: std::io::Error) -> IoError {
    if source.kind() == std::io::ErrorKind::NotFound {
      IoError::NotFound {
        path: path.to_string(),
      }
    } else {
      IoError::Io {
        path: path.to_string(),
        source,
      }
    }
  }

  fn sidecar_path(path: &Path, kind: HashKind) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(kind.sidecar_extension());
    PathBuf::from(name)
  }

  async fn stream_checksum(&self, path: &str, kind: HashKind) -> Result<String, IoError> {
    let fs_path = Self::to_path(path);
    let mut file = tokio::fs::File::open(&fs_path)
      .await
      .map_err(|e| Self::io_err(path, e))?;

    let mut hasher = Hasher::new(kind);
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
      let n = file
        .read(&mut buf)
        .await
        .map_err(|e| Self::io_err(path, e))?;
      if n == 0 {
        break;
      }
      hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
  }
}

impl Default for LocalStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl PathStore for LocalStore {
  fn scheme(&self) -> &'static str {
    "file"
  }

  async fn exists(&self, path: &str) -> Result<bool, IoError> {
    match tokio::fs::metadata(Self::to_path(path)).await {
      Ok(_) => Ok(true),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(Self::io_err(path, e)),
    }
  }

  async fn size(&self, path: &str) -> Result<u64, IoError> {
    let meta = tokio::fs::metadata(Self::to_path(path))
      .await
      .map_err(|e| Self::io_err(path, e))?;
    Ok(meta.len())
  }

  async fn read_all(&self, path: &str) -> Result<Bytes, IoError> {
    let data = tokio::fs::read(Self::to_path(path))
      .await
      .map_err(|e| Self::io_err(path, e))?;
    Ok(Bytes::from(data))
  }

  async fn read_range(&self, path: &str, offset: u64, len: u64) -> Result<Bytes, IoError> {
    let mut file = tokio::fs::File::open(Self::to_path(path))
      .await
      .map_err(|e| Self::io_err(path, e))?;
    file
      .seek(SeekFrom::Start(offset))
      .await
      .map_err(|e| Self::io_err(path, e))?;

    let mut buf = vec![0u8; len as usize];
    let mut read = 0;
    while read < buf.len() {
      let n = file
        .read(&mut buf[read..])
        .await
        .map_err(|e| Self::io_err(path, e))?;
      if n == 0 {
        break;
      }
      read += n;
    }
    buf.truncate(read);
    Ok(Bytes::from(buf))
  }

  async fn write_all(&self, path: &str, data: Bytes) -> Result<(), IoError> {
    let fs_path = Self::to_path(path);
    if let Some(parent) = fs_path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| Self::io_err(path, e))?;
    }
    tokio::fs::write(&fs_path, &data)
      .await
      .map_err(|e| Self::io_err(path, e))
  }

  async fn append(&self, path: &str, data: Bytes) -> Result<(), IoError> {
    let fs_path = Self::to_path(path);
    if let Some(parent) = fs_path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| Self::io_err(path, e))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&fs_path)
      .await
      .map_err(|e| Self::io_err(path, e))?;
    file.write_all(&data).await.map_err(|e| Self::io_err(path, e))?;
    file.flush().await.map_err(|e| Self::io_err(path, e))
  }

  async fn delete(&self, path: &str) -> Result<(), IoError> {
    tokio::fs::remove_file(Self::to_path(path))
      .await
      .map_err(|e| Self::io_err(path, e))
  }

  async fn checksum(&self, path: &str, kind: HashKind) -> Result<String, IoError> {
    let fs_path = Self::to_path(path);
    let sidecar = Self::sidecar_path(&fs_path, kind);

    if let Ok(recorded) = tokio::fs::read_to_string(&sidecar).await {
      let recorded = recorded.trim().to_string();
      if !recorded.is_empty() {
        return Ok(recorded);
      }
    }

    let digest = self.stream_checksum(path, kind).await?;

    if self.md5_sidecar && kind == HashKind::Md5 {
      if let Err(e) = tokio::fs::write(&sidecar, &digest).await {
        debug!(path = %sidecar.display(), error = %e, "failed to write checksum sidecar");
      }
    }

    Ok(digest)
  }

  fn resolve(&self, base: &str, subpath: &str) -> String {
    Self::to_path(base).join(subpath).display().to_string()
  }

  async fn list_dir(&self, path: &str) -> Result<Vec<String>, IoError> {
    let mut entries = tokio::fs::read_dir(Self::to_path(path))
      .await
      .map_err(|e| Self::io_err(path, e))?;

    let mut names = Vec::new();
    while let Some(entry) = entries
      .next_entry()
      .await
      .map_err(|e| Self::io_err(path, e))?
    {
      names.push(entry.path().display().to_string());
    }
    names.sort();
    Ok(names)
  }
}
