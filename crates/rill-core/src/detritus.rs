use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The fixed auxiliary file set produced by every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetritusKind {
  Script,
  Stdout,
  Stderr,
  ReturnCode,
  CallRoot,
}

impl DetritusKind {
  pub const ALL: [DetritusKind; 5] = [
    DetritusKind::Script,
    DetritusKind::Stdout,
    DetritusKind::Stderr,
    DetritusKind::ReturnCode,
    DetritusKind::CallRoot,
  ];

  /// Conventional file name inside the call root. `CallRoot` is the root
  /// itself.
  pub fn file_name(&self) -> &'static str {
    match self {
      DetritusKind::Script => "script",
      DetritusKind::Stdout => "stdout",
      DetritusKind::Stderr => "stderr",
      DetritusKind::ReturnCode => "rc",
      DetritusKind::CallRoot => "",
    }
  }
}

/// Detritus paths for one call attempt. All five entries are present on
/// every successful call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detritus(pub BTreeMap<DetritusKind, PathBuf>);

impl Detritus {
  /// Conventional detritus rooted at `call_root`.
  pub fn conventional(call_root: &std::path::Path) -> Self {
    let mut paths = BTreeMap::new();
    for kind in DetritusKind::ALL {
      let path = match kind {
        DetritusKind::CallRoot => call_root.to_path_buf(),
        other => call_root.join(other.file_name()),
      };
      paths.insert(kind, path);
    }
    Self(paths)
  }

  pub fn get(&self, kind: DetritusKind) -> Option<&PathBuf> {
    self.0.get(&kind)
  }

  pub fn is_complete(&self) -> bool {
    DetritusKind::ALL.iter().all(|k| self.0.contains_key(k))
  }

  pub fn iter(&self) -> impl Iterator<Item = (DetritusKind, &PathBuf)> {
    self.0.iter().map(|(k, p)| (*k, p))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::path::Path;

  #[test]
  fn test_conventional_layout() {
    let detritus = Detritus::conventional(Path::new("/wf/call-t/attempt-1"));
    assert!(detritus.is_complete());
    assert_eq!(
      detritus.get(DetritusKind::ReturnCode).unwrap(),
      Path::new("/wf/call-t/attempt-1/rc")
    );
    assert_eq!(
      detritus.get(DetritusKind::CallRoot).unwrap(),
      Path::new("/wf/call-t/attempt-1")
    );
  }

  #[test]
  fn test_incomplete_detected() {
    let mut detritus = Detritus::conventional(Path::new("/root"));
    detritus.0.remove(&DetritusKind::Stderr);
    assert!(!detritus.is_complete());
  }
}
