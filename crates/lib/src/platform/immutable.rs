//! Frozen stage write protection.
//!
//! A finished stage tree is made read-only so later stages can only copy out
//! of it. Symlinks are left alone since changing their mode would change
//! whatever they point at. On Unix files become 0444 (0555 when executable)
//! and directories 0555; elsewhere only the read-only attribute of files is
//! toggled.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ImmutableError {
  #[error("failed to change permissions of {path}: {source}")]
  SetPermissions {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk frozen tree {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },
}

/// Write-protect a stage tree, contents before their directories.
pub fn make_immutable(path: &Path) -> Result<(), ImmutableError> {
  set_tree_writable(path, false)
}

/// Undo [`make_immutable`] so the tree can be replaced or removed.
pub fn make_mutable(path: &Path) -> Result<(), ImmutableError> {
  set_tree_writable(path, true)
}

fn set_tree_writable(root: &Path, writable: bool) -> Result<(), ImmutableError> {
  if !root.exists() {
    return Ok(());
  }
  debug!(path = ?root, writable, "changing stage tree protection");

  // Opening up walks parents first so their children stay reachable.
  let walker = WalkDir::new(root).contents_first(!writable);
  for entry in walker {
    let entry = entry.map_err(|e| ImmutableError::Walk {
      path: root.to_path_buf(),
      source: e,
    })?;
    if entry.path_is_symlink() {
      continue;
    }
    if let Err(e) = set_writable(entry.path(), writable) {
      warn!(path = ?entry.path(), error = %e, "skipping entry");
    }
  }
  Ok(())
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> Result<(), ImmutableError> {
  use std::os::unix::fs::PermissionsExt;

  let set_err = |source| ImmutableError::SetPermissions {
    path: path.to_path_buf(),
    source,
  };
  let meta = std::fs::symlink_metadata(path).map_err(set_err)?;
  let searchable = meta.is_dir() || meta.permissions().mode() & 0o111 != 0;
  let read = if searchable { 0o555 } else { 0o444 };
  let mode = if writable { read | 0o200 } else { read };

  std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(set_err)
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> Result<(), ImmutableError> {
  let set_err = |source| ImmutableError::SetPermissions {
    path: path.to_path_buf(),
    source,
  };
  let meta = std::fs::symlink_metadata(path).map_err(set_err)?;
  if meta.is_dir() {
    return Ok(());
  }
  let mut perms = meta.permissions();
  perms.set_readonly(!writable);
  std::fs::set_permissions(path, perms).map_err(set_err)
}
