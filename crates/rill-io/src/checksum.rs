use md5::Md5;
use sha2::{Digest, Sha256};

/// Supported content-digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashKind {
  Md5,
  Sha256,
}

impl HashKind {
  /// Sidecar file extension for materialized digests.
  pub fn sidecar_extension(&self) -> &'static str {
    match self {
      HashKind::Md5 => "md5",
      HashKind::Sha256 => "sha256",
    }
  }
}

/// Incremental digest over streamed chunks, lowercase hex on finish.
pub(crate) enum Hasher {
  Md5(Md5),
  Sha256(Sha256),
}

impl Hasher {
  pub fn new(kind: HashKind) -> Self {
    match kind {
      HashKind::Md5 => Hasher::Md5(Md5::new()),
      HashKind::Sha256 => Hasher::Sha256(Sha256::new()),
    }
  }

  pub fn update(&mut self, chunk: &[u8]) {
    match self {
      Hasher::Md5(h) => h.update(chunk),
      Hasher::Sha256(h) => h.update(chunk),
    }
  }

  pub fn finish(self) -> String {
    match self {
      Hasher::Md5(h) => format!("{:x}", h.finalize()),
      Hasher::Sha256(h) => format!("{:x}", h.finalize()),
    }
  }
}

/// One-shot digest of an in-memory buffer.
pub(crate) fn digest_bytes(kind: HashKind, data: &[u8]) -> String {
  let mut hasher = Hasher::new(kind);
  hasher.update(data);
  hasher.finish()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_md5_known_value() {
    // MD5 of the empty input
    assert_eq!(
      digest_bytes(HashKind::Md5, b""),
      "d41d8cd98f00b204e9800998ecf8427e"
    );
  }

  #[test]
  fn test_sha256_known_value() {
    assert_eq!(
      digest_bytes(HashKind::Sha256, b""),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }

  #[test]
  fn test_incremental_matches_one_shot() {
    let mut hasher = Hasher::new(HashKind::Sha256);
    hasher.update(b"hello ");
    hasher.update(b"world");
    assert_eq!(hasher.finish(), digest_bytes(HashKind::Sha256, b"hello world"));
  }
}
