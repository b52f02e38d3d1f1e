//! Build configuration threaded through every stage.
//!
//! All inputs a stage may depend on live here explicitly. The environment is
//! consulted exactly once, by [`BuildConfig::apply_env`], so stages can be
//! exercised in isolation with a hand-built config.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::consts::DEFAULT_SANDBOX_PATH;
use crate::platform::paths::cache_dir;

/// Overrides the store root.
pub const ENV_STORE: &str = "STRATA_STORE";
/// Overrides the image base directory declared by the plan.
pub const ENV_BASE_DIR: &str = "STRATA_BASE_DIR";
/// Overrides the build context directory.
pub const ENV_CONTEXT: &str = "STRATA_CONTEXT";

/// How unpinned external dependencies are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyMode {
  /// Every revision and package must be pinned; floating ones are rejected.
  Pinned,
  /// Floating dependencies are allowed but flagged at build time.
  #[default]
  Floating,
}

impl std::fmt::Display for DependencyMode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      DependencyMode::Pinned => write!(f, "pinned"),
      DependencyMode::Floating => write!(f, "floating"),
    }
  }
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Root of the stage store (frozen stage trees, logs).
  pub store: PathBuf,

  /// Directory that source paths and scripts are resolved against.
  pub context: PathBuf,

  /// Image base directory override. `None` keeps the plan's value.
  pub base_dir: Option<String>,

  /// Dependency mode override. `None` keeps the plan's value.
  pub mode: Option<DependencyMode>,

  /// PATH handed to stage commands.
  pub sandbox_path: String,

  /// Maximum number of stages executing at once.
  pub parallelism: usize,

  /// Reuse frozen stages whose key and content hash still match.
  pub use_cache: bool,

  /// Fail the build when the entry command is missing from the runtime.
  pub validate_entry: bool,

  /// Shell used for stage commands. `None` means `/bin/sh`.
  pub shell: Option<String>,
}

impl Default for BuildConfig {
  fn default() -> Self {
    Self {
      store: cache_dir().join("store"),
      context: PathBuf::from("."),
      base_dir: None,
      mode: None,
      sandbox_path: DEFAULT_SANDBOX_PATH.to_string(),
      parallelism: num_cpus(),
      use_cache: true,
      validate_entry: false,
      shell: None,
    }
  }
}

impl BuildConfig {
  /// Apply `STRATA_*` environment overrides.
  pub fn apply_env(mut self) -> Self {
    if let Ok(store) = std::env::var(ENV_STORE) {
      debug!(store = %store, "store overridden from environment");
      self.store = PathBuf::from(store);
    }
    if let Ok(base) = std::env::var(ENV_BASE_DIR) {
      debug!(base = %base, "base directory overridden from environment");
      self.base_dir = Some(base);
    }
    if let Ok(context) = std::env::var(ENV_CONTEXT) {
      self.context = PathBuf::from(context);
    }
    self
  }

  /// Anchor `store` and `context` at the current directory.
  ///
  /// Stage commands run inside the context with `out` and `TMPDIR` pointing
  /// into the store, so neither may stay relative.
  pub fn with_absolute_paths(mut self) -> io::Result<Self> {
    self.store = absolute(&self.store)?;
    self.context = absolute(&self.context)?;
    Ok(self)
  }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
  if path.is_absolute() {
    return Ok(path.to_path_buf());
  }
  std::path::absolute(path)
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
