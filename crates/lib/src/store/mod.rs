//! The stage store.
//!
//! Every executed stage is frozen into the store, keyed by its name and a
//! hash of everything it depends on.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── .lock
//! ├── stage/
//! │   ├── <name>-<key>/              # frozen, write-protected
//! │   │   ├── root/                  # the stage's image filesystem
//! │   │   ├── runtime.json           # runtime stage only
//! │   │   └── .strata-complete       # marker with output hash
//! │   └── .<name>-<key>.partial/     # in progress, never read by others
//! ├── images/<image>.json            # last successful build of an image
//! ├── logs/<stage>.log
//! └── git/                           # fetch cache
//! ```
//!
//! A stage is assembled in its `.partial` directory and renamed into place
//! only after its marker is written, so other stages either see the whole
//! frozen tree or nothing.

pub mod lock;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::consts::STAGE_COMPLETE_MARKER;
use crate::plan::StageName;
use crate::platform::immutable::{ImmutableError, make_immutable, make_mutable};
use crate::util::fs::{remove_entry, remove_if_exists};
use crate::util::hash::{DirHashError, ObjectHash, hash_directory};

pub use lock::{LockHolder, LockMode, StoreLock, StoreLockError};

const MARKER_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid marker at {path}: {message}")]
  Marker { path: PathBuf, message: String },

  #[error("invalid build record at {path}: {message}")]
  Record { path: PathBuf, message: String },

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error(transparent)]
  Immutable(#[from] ImmutableError),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
  move |source| StoreError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Completion marker written beside a frozen stage tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMarker {
  pub version: u32,
  pub stage: StageName,
  pub key: ObjectHash,
  /// Full SHA-256 of the `root/` tree.
  pub output_hash: String,
}

/// A stage whose tree is complete and write-protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenStage {
  pub name: StageName,
  pub key: ObjectHash,
  pub dir: PathBuf,
  pub output_hash: String,
}

impl FrozenStage {
  /// Host directory holding the stage's image filesystem.
  pub fn root(&self) -> PathBuf {
    self.dir.join("root")
  }
}

/// A stage being assembled. Only its owner ever looks inside.
#[derive(Debug)]
pub struct PartialStage {
  pub name: StageName,
  pub key: ObjectHash,
  pub dir: PathBuf,
}

impl PartialStage {
  pub fn root(&self) -> PathBuf {
    self.dir.join("root")
  }

  /// Private scratch directory, removed before freezing.
  pub fn tmp(&self) -> PathBuf {
    self.dir.join("tmp")
  }
}

/// Record of the last successful build of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
  pub image: String,
  pub runtime: StageName,
  /// Frozen stage directory per stage.
  pub stages: BTreeMap<StageName, PathBuf>,
}

impl BuildRecord {
  pub fn runtime_dir(&self) -> Option<&PathBuf> {
    self.stages.get(&self.runtime)
  }
}

#[derive(Debug, Clone)]
pub struct StageStore {
  root: PathBuf,
}

impl StageStore {
  pub fn new(config: &BuildConfig) -> Self {
    Self::at(&config.store)
  }

  pub fn at(root: &Path) -> Self {
    Self {
      root: root.to_path_buf(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn stages_dir(&self) -> PathBuf {
    self.root.join("stage")
  }

  pub fn stage_dir(&self, name: &StageName, key: &ObjectHash) -> PathBuf {
    self.stages_dir().join(format!("{}-{}", name, key))
  }

  fn partial_dir(&self, name: &StageName, key: &ObjectHash) -> PathBuf {
    self.stages_dir().join(format!(".{}-{}.partial", name, key))
  }

  pub fn log_path(&self, name: &StageName) -> PathBuf {
    self.root.join("logs").join(format!("{}.log", name))
  }

  pub fn git_cache(&self) -> PathBuf {
    self.root.join("git")
  }

  fn record_path(&self, image: &str) -> PathBuf {
    self.root.join("images").join(format!("{image}.json"))
  }

  /// Return the frozen stage for `(name, key)` if it exists and its tree
  /// still matches the recorded hash. Incomplete or corrupted directories are
  /// removed.
  pub fn lookup(&self, name: &StageName, key: &ObjectHash) -> Result<Option<FrozenStage>, StoreError> {
    let dir = self.stage_dir(name, key);
    if !dir.exists() {
      return Ok(None);
    }

    match read_marker(&dir) {
      Ok(Some(marker)) if verify_output_hash(&dir, &marker) => {
        debug!(stage = %name, path = ?dir, "stage already frozen (cache hit)");
        return Ok(Some(FrozenStage {
          name: name.clone(),
          key: key.clone(),
          dir,
          output_hash: marker.output_hash,
        }));
      }
      Ok(Some(_)) => debug!(stage = %name, path = ?dir, "removing corrupted stage"),
      Ok(None) => debug!(stage = %name, path = ?dir, "incomplete stage found, removing"),
      Err(e) => debug!(stage = %name, path = ?dir, error = %e, "invalid marker, removing"),
    }

    remove_entry(&dir).map_err(io_err(&dir))?;
    Ok(None)
  }

  /// True if a completed stage exists for `(name, key)`. Does not verify or
  /// remove anything.
  pub fn contains(&self, name: &StageName, key: &ObjectHash) -> bool {
    matches!(read_marker(&self.stage_dir(name, key)), Ok(Some(_)))
  }

  /// Create a fresh partial directory for `(name, key)`.
  pub fn begin(&self, name: &StageName, key: &ObjectHash) -> Result<PartialStage, StoreError> {
    let dir = self.partial_dir(name, key);
    remove_if_exists(&dir).map_err(io_err(&dir))?;

    let partial = PartialStage {
      name: name.clone(),
      key: key.clone(),
      dir,
    };
    std::fs::create_dir_all(partial.root()).map_err(io_err(&partial.dir))?;
    std::fs::create_dir_all(partial.tmp()).map_err(io_err(&partial.dir))?;
    Ok(partial)
  }

  /// Freeze a finished partial stage and move it into place.
  pub fn promote(&self, partial: PartialStage) -> Result<FrozenStage, StoreError> {
    remove_if_exists(&partial.tmp()).map_err(io_err(&partial.dir))?;

    let root = partial.root();
    let output_hash = hash_directory(&root, &[])?;
    let marker = StageMarker {
      version: MARKER_VERSION,
      stage: partial.name.clone(),
      key: partial.key.clone(),
      output_hash: output_hash.0.clone(),
    };
    let marker_path = partial.dir.join(STAGE_COMPLETE_MARKER);
    let content = serde_json::to_string(&marker).map_err(|e| StoreError::Marker {
      path: marker_path.clone(),
      message: e.to_string(),
    })?;
    std::fs::write(&marker_path, format!("{content}\n")).map_err(io_err(&marker_path))?;

    make_immutable(&root)?;

    let dest = self.stage_dir(&partial.name, &partial.key);
    if dest.exists() {
      make_mutable(&dest)?;
      remove_entry(&dest).map_err(io_err(&dest))?;
    }
    std::fs::rename(&partial.dir, &dest).map_err(io_err(&dest))?;

    info!(stage = %partial.name, key = %partial.key, path = ?dest, "stage frozen");
    Ok(FrozenStage {
      name: partial.name,
      key: partial.key,
      dir: dest,
      output_hash: output_hash.0,
    })
  }

  /// Throw away a partial stage after a failure or cancellation.
  pub fn discard(&self, partial: PartialStage) {
    if let Err(e) = remove_if_exists(&partial.dir) {
      warn!(stage = %partial.name, path = ?partial.dir, error = %e, "failed to remove partial stage");
    }
  }

  pub fn write_record(&self, record: &BuildRecord) -> Result<(), StoreError> {
    let path = self.record_path(&record.image);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let content = serde_json::to_string_pretty(record).map_err(|e| StoreError::Record {
      path: path.clone(),
      message: e.to_string(),
    })?;
    std::fs::write(&path, content).map_err(io_err(&path))
  }

  /// Load the last build record of `image`, if any.
  pub fn read_record(&self, image: &str) -> Result<Option<BuildRecord>, StoreError> {
    let path = self.record_path(image);
    let content = match std::fs::read_to_string(&path) {
      Ok(c) => c,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(StoreError::Io { path, source: e }),
    };
    serde_json::from_str(&content).map(Some).map_err(|e| StoreError::Record {
      path,
      message: e.to_string(),
    })
  }

  /// Remove the whole store, clearing write protection first.
  pub fn clear(&self) -> Result<bool, StoreError> {
    if !self.root.exists() {
      return Ok(false);
    }
    make_mutable(&self.root)?;
    remove_entry(&self.root).map_err(io_err(&self.root))?;
    Ok(true)
  }
}

/// Read the completion marker of a stage directory.
pub fn read_marker(dir: &Path) -> Result<Option<StageMarker>, StoreError> {
  let path = dir.join(STAGE_COMPLETE_MARKER);
  let content = match std::fs::read_to_string(&path) {
    Ok(c) => c,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(StoreError::Io { path, source: e }),
  };
  let marker: StageMarker = serde_json::from_str(&content).map_err(|e| StoreError::Marker {
    path: path.clone(),
    message: e.to_string(),
  })?;
  if marker.version != MARKER_VERSION {
    return Err(StoreError::Marker {
      path,
      message: format!("unsupported marker version {}", marker.version),
    });
  }
  Ok(Some(marker))
}

/// Check that a frozen tree still hashes to what its marker recorded.
fn verify_output_hash(dir: &Path, marker: &StageMarker) -> bool {
  match hash_directory(&dir.join("root"), &[]) {
    Ok(current) if current.0 == marker.output_hash => true,
    Ok(current) => {
      warn!(
        path = ?dir,
        expected = %marker.output_hash,
        actual = %current.0,
        "frozen stage corrupted, will rebuild"
      );
      false
    }
    Err(e) => {
      warn!(path = ?dir, error = %e, "failed to hash frozen stage, will rebuild");
      false
    }
  }
}
