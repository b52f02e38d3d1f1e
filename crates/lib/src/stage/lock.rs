//! Lock file for pinned dependencies.
//!
//! The lock file (`strata.lock`) lives next to the plan and records what every
//! fetched (URL, revision) pair resolved to, so a later fetch can prove it got
//! the same bytes.
//!
//! # Lock File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "dependencies": {
//!     "https://github.com/example/dep.git@0123abcd...": {
//!       "url": "https://github.com/example/dep.git",
//!       "rev": "0123abcd...",
//!       "commit": "0123abcd...",
//!       "treeHash": "5f2c...",
//!       "floating": false
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current lock file format version.
pub const LOCK_VERSION: u32 = 1;

/// Lock file name.
pub const LOCK_FILENAME: &str = "strata.lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
  pub version: u32,
  /// Locked dependencies keyed by `url@rev`.
  pub dependencies: BTreeMap<String, LockedDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedDependency {
  pub url: String,
  /// Revision as written in the plan.
  pub rev: String,
  /// Commit the revision resolved to.
  pub commit: String,
  /// Hash of the fetched tree without `.git`.
  pub tree_hash: String,
  /// The revision was a branch or tag rather than a commit id.
  #[serde(default)]
  pub floating: bool,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("failed to read lock file: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write lock file: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse lock file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize lock file: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported lock file version {0}, expected {LOCK_VERSION}")]
  UnsupportedVersion(u32),
}

impl Default for LockFile {
  fn default() -> Self {
    Self::new()
  }
}

/// Lock file belonging to the plan at `plan_path`.
pub fn lock_path_for(plan_path: &Path) -> PathBuf {
  plan_path
    .parent()
    .map(|dir| dir.join(LOCK_FILENAME))
    .unwrap_or_else(|| PathBuf::from(LOCK_FILENAME))
}

/// Lock key of a dependency.
pub fn lock_key(url: &str, rev: &str) -> String {
  format!("{url}@{rev}")
}

impl LockFile {
  pub fn new() -> Self {
    Self {
      version: LOCK_VERSION,
      dependencies: BTreeMap::new(),
    }
  }

  /// Load a lock file. A missing file is `Ok(None)`.
  pub fn load(path: &Path) -> Result<Option<Self>, LockError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(LockError::Read(e)),
    };

    let lock: LockFile = serde_json::from_str(&content).map_err(LockError::Parse)?;
    if lock.version != LOCK_VERSION {
      return Err(LockError::UnsupportedVersion(lock.version));
    }
    Ok(Some(lock))
  }

  pub fn save(&self, path: &Path) -> Result<(), LockError> {
    let content = serde_json::to_string_pretty(self).map_err(LockError::Serialize)?;
    fs::write(path, format!("{content}\n")).map_err(LockError::Write)
  }

  pub fn get(&self, url: &str, rev: &str) -> Option<&LockedDependency> {
    self.dependencies.get(&lock_key(url, rev))
  }

  /// Insert or replace an entry. Returns true if the file content changed.
  pub fn insert(&mut self, dep: LockedDependency) -> bool {
    let key = lock_key(&dep.url, &dep.rev);
    if self.dependencies.get(&key) == Some(&dep) {
      return false;
    }
    self.dependencies.insert(key, dep);
    true
  }
}
