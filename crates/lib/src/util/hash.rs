//! Hashing utilities for stage keys and artifact verification.
//!
//! Stage keys are [`ObjectHash`]es: truncated SHA-256 digests of a serialized
//! input description. Stage outputs, fetched trees and build context entries
//! are fingerprinted with full [`ContentHash`]es.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a unique object.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized struct.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let digest = hex::encode(Sha256::digest(serde_json::to_vec(self)?));
    Ok(ObjectHash(digest[..OBJ_HASH_PREFIX_LEN].to_string()))
  }
}

/// A full 64-character SHA256 hash for content verification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// Covers relative paths, file contents, the executable bit and symlink
/// targets. Timestamps and ownership are ignored, so two copies of the same
/// tree hash equal wherever they live. `exclude` names entries skipped at any
/// depth (e.g. `.git`).
pub fn hash_directory(root: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let walker = WalkDir::new(root)
    .min_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  let mut lines = Vec::new();
  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let rel = entry.path().strip_prefix(root).unwrap_or(entry.path()).to_string_lossy().into_owned();
    if let Some(line) = entry_line(entry.path(), &rel, entry.file_type())? {
      lines.push(line);
    }
  }
  // Walk order is per directory; the digest needs one global order.
  lines.sort();

  let mut hasher = Sha256::new();
  for line in &lines {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// One manifest line per entry: kind, relative path and content digest.
fn entry_line(path: &Path, rel: &str, file_type: fs::FileType) -> Result<Option<String>, DirHashError> {
  if file_type.is_dir() {
    return Ok(Some(format!("D:{rel}")));
  }
  if file_type.is_symlink() {
    let target = fs::read_link(path).map_err(|e| DirHashError::ReadSymlink {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    let digest = hash_bytes(target.to_string_lossy().as_bytes());
    return Ok(Some(format!("L:{rel}:{digest}")));
  }
  if file_type.is_file() {
    let mode = if is_executable(path) { "x" } else { "-" };
    return Ok(Some(format!("F:{rel}:{mode}:{}", hash_file(path)?)));
  }
  // Sockets, devices and fifos are not stage content.
  Ok(None)
}

/// Hash either a single file or a directory tree, whichever `path` is.
pub fn hash_path(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  if path.is_dir() {
    hash_directory(path, exclude)
  } else {
    hash_file(path)
  }
}

/// Full SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read_err = |e: std::io::Error| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };
  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  std::io::copy(&mut file, &mut hasher).map_err(read_err)?;
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  fs::metadata(path)
    .map(|m| m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
  false
}
