//! Test utilities for strata-lib.
//!
//! Helpers for building throwaway build contexts and stores.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::BuildConfig;

/// A build context plus an isolated store, both inside one temp directory.
pub struct Sandbox {
  pub temp: TempDir,
}

impl Sandbox {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn context(&self) -> PathBuf {
    let p = self.temp.path().join("context");
    fs::create_dir_all(&p).unwrap();
    p
  }

  pub fn store(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  /// Write a file relative to the build context.
  pub fn write(&self, relative: &str, content: &str) -> PathBuf {
    let path = self.context().join(relative);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
  }

  /// Write an executable shell script relative to the build context.
  pub fn script(&self, relative: &str, body: &str) -> PathBuf {
    let path = self.write(relative, &format!("#!/bin/sh\nset -e\n{body}\n"));
    make_executable(&path);
    path
  }

  /// A config pointing at this sandbox with two workers.
  pub fn config(&self) -> BuildConfig {
    BuildConfig {
      store: self.store(),
      context: self.context(),
      parallelism: 2,
      ..BuildConfig::default()
    }
  }
}

#[cfg(unix)]
pub fn make_executable(path: &Path) {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) {}
