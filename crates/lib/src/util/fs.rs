//! Filesystem helpers shared by the copying steps.
//!
//! Every copy made here is an independent copy: files are duplicated, never
//! hard-linked, so a frozen source tree can not be mutated through its copy.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::trace;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum FsError {
  #[error("path '{0}' escapes the image root")]
  EscapesRoot(String),

  #[error("path '{path}' runs through symlink '{link}' inside the image root")]
  SymlinkAncestor { path: String, link: PathBuf },

  #[error("failed to copy '{from}' to '{to}': {source}")]
  Copy {
    from: PathBuf,
    to: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk '{path}': {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },
}

/// Map an absolute image path (e.g. `/opt/pav/bin`) onto a host directory that
/// holds the image filesystem.
///
/// Relative paths are treated as relative to the image root. Parent-directory
/// components are rejected, as are existing symlinks anywhere above the final
/// component, since following one would read or write outside the root.
pub fn image_path(root: &Path, path: &str) -> Result<PathBuf, FsError> {
  let mut mapped = root.to_path_buf();
  for component in Path::new(path).components() {
    match component {
      Component::RootDir | Component::CurDir => {}
      Component::Normal(part) => {
        if mapped != root && mapped.is_symlink() {
          return Err(FsError::SymlinkAncestor {
            path: path.to_string(),
            link: mapped,
          });
        }
        mapped.push(part);
      }
      Component::ParentDir | Component::Prefix(_) => return Err(FsError::EscapesRoot(path.to_string())),
    }
  }
  Ok(mapped)
}

/// Copy `src` (file, symlink or directory) to `dest`.
///
/// Directories are merged into an existing destination. A file that already
/// exists at the destination is replaced, so the latest copy wins. The
/// destination always stays writable by its owner.
///
/// Returns the number of files and symlinks written.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<usize, FsError> {
  let copy_err = |from: &Path, to: &Path, source: io::Error| FsError::Copy {
    from: from.to_path_buf(),
    to: to.to_path_buf(),
    source,
  };

  let meta = fs::symlink_metadata(src).map_err(|e| copy_err(src, dest, e))?;
  if !meta.is_dir() {
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent).map_err(|e| copy_err(src, dest, e))?;
    }
    copy_entry(src, dest, &meta).map_err(|e| copy_err(src, dest, e))?;
    return Ok(1);
  }

  let mut written = 0;
  for entry in WalkDir::new(src).sort_by_file_name() {
    let entry = entry.map_err(|e| FsError::Walk {
      path: src.to_path_buf(),
      source: e,
    })?;
    let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
    let target = dest.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      if target.is_file() || target.is_symlink() {
        remove_entry(&target).map_err(|e| copy_err(entry.path(), &target, e))?;
      }
      fs::create_dir_all(&target).map_err(|e| copy_err(entry.path(), &target, e))?;
      make_owner_writable(&target).map_err(|e| copy_err(entry.path(), &target, e))?;
      continue;
    }

    let meta = entry.path().symlink_metadata().map_err(|e| copy_err(entry.path(), &target, e))?;
    copy_entry(entry.path(), &target, &meta).map_err(|e| copy_err(entry.path(), &target, e))?;
    written += 1;
  }

  Ok(written)
}

fn copy_entry(src: &Path, dest: &Path, meta: &fs::Metadata) -> io::Result<()> {
  if dest.symlink_metadata().is_ok() {
    remove_entry(dest)?;
  }

  if meta.file_type().is_symlink() {
    let target = fs::read_link(src)?;
    trace!(from = ?src, to = ?dest, "copying symlink");
    return symlink(&target, dest);
  }

  trace!(from = ?src, to = ?dest, "copying file");
  fs::copy(src, dest)?;
  make_owner_writable(dest)
}

/// Remove a file, symlink or directory tree, clearing write protection first.
pub fn remove_entry(path: &Path) -> io::Result<()> {
  let meta = path.symlink_metadata()?;
  if meta.is_dir() {
    make_tree_writable(path)?;
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  }
}

/// Remove a path if it exists; missing paths are fine.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
  match remove_entry(path) {
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    other => other,
  }
}

fn make_tree_writable(path: &Path) -> io::Result<()> {
  for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
    if entry.file_type().is_dir() {
      make_owner_writable(entry.path())?;
    }
  }
  Ok(())
}

#[cfg(unix)]
fn make_owner_writable(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  let mut perms = fs::metadata(path)?.permissions();
  let mode = perms.mode();
  if mode & 0o200 == 0 {
    perms.set_mode(mode | 0o200);
    fs::set_permissions(path, perms)?;
  }
  Ok(())
}

#[cfg(not(unix))]
fn make_owner_writable(path: &Path) -> io::Result<()> {
  let mut perms = fs::metadata(path)?.permissions();
  if perms.readonly() {
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(path, perms)?;
  }
  Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
  if target.is_dir() {
    std::os::windows::fs::symlink_dir(target, link)
  } else {
    std::os::windows::fs::symlink_file(target, link)
  }
}
