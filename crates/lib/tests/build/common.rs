//! Shared helpers for build integration tests.

use std::path::{Path, PathBuf};
use std::process::Command;

use strata_lib::config::BuildConfig;
use strata_lib::execute::{BuildReport, build};
use strata_lib::store::StageStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A build context and an isolated store inside one temp directory.
pub struct Workspace {
  pub temp: TempDir,
}

impl Workspace {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn context(&self) -> PathBuf {
    let p = self.temp.path().join("context");
    std::fs::create_dir_all(&p).unwrap();
    p
  }

  pub fn store(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  pub fn plan_path(&self) -> PathBuf {
    self.context().join("strata.toml")
  }

  pub fn write(&self, relative: &str, content: &str) -> PathBuf {
    let path = self.context().join(relative);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  /// Write a `set -e` shell script into the context.
  pub fn script(&self, relative: &str, body: &str) -> PathBuf {
    self.write(relative, &format!("#!/bin/sh\nset -e\n{body}\n"))
  }

  pub fn config(&self) -> BuildConfig {
    BuildConfig {
      store: self.store(),
      context: self.context(),
      parallelism: 4,
      ..BuildConfig::default()
    }
  }

  /// Write `plan` and build it with `config`.
  pub async fn build_with(&self, plan: &str, config: &BuildConfig) -> BuildReport {
    self.write("strata.toml", plan);
    build(&self.plan_path(), config, CancellationToken::new()).await.unwrap()
  }

  pub async fn build(&self, plan: &str) -> BuildReport {
    self.build_with(plan, &self.config()).await
  }
}

impl Drop for Workspace {
  fn drop(&mut self) {
    // Frozen trees are write-protected.
    let _ = StageStore::at(&self.store()).clear();
  }
}

/// `path` spelled relative to the current working directory.
pub fn relative_to_cwd(path: &Path) -> PathBuf {
  let cwd = std::env::current_dir().unwrap();
  let mut relative: PathBuf = cwd.components().skip(1).map(|_| "..").collect();
  relative.push(path.strip_prefix("/").unwrap());
  relative
}

/// Read a file from an image root.
pub fn read(root: &Path, image_path: &str) -> String {
  std::fs::read_to_string(root.join(image_path.trim_start_matches('/'))).unwrap()
}

pub fn git_available() -> bool {
  Command::new("git").arg("--version").output().is_ok_and(|o| o.status.success())
}

fn git(dir: &Path, args: &[&str]) -> String {
  let out = Command::new("git")
    .args(args)
    .current_dir(dir)
    .env("GIT_AUTHOR_NAME", "t")
    .env("GIT_AUTHOR_EMAIL", "t@example.org")
    .env("GIT_COMMITTER_NAME", "t")
    .env("GIT_COMMITTER_EMAIL", "t@example.org")
    .env("GIT_AUTHOR_DATE", "2020-01-01T00:00:00Z")
    .env("GIT_COMMITTER_DATE", "2020-01-01T00:00:00Z")
    .output()
    .unwrap();
  assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
  String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository with one commit holding `dep.py`. Returns the commit id.
pub fn dependency_repo(dir: &Path) -> String {
  std::fs::create_dir_all(dir).unwrap();
  git(dir, &["init", "--quiet", "--initial-branch=main"]);
  std::fs::write(dir.join("dep.py"), "NAME = 'dep'\n").unwrap();
  git(dir, &["add", "."]);
  git(dir, &["commit", "--quiet", "-m", "dep"]);
  git(dir, &["rev-parse", "HEAD"])
}
