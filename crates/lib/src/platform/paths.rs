//! Per-user directories.

use std::env;
use std::path::PathBuf;

use crate::consts::APP_NAME;

/// First non-empty environment variable among `vars`, as a path.
fn env_path(vars: &[&str]) -> Option<PathBuf> {
  vars
    .iter()
    .filter_map(|var| env::var_os(var))
    .find(|value| !value.is_empty())
    .map(PathBuf::from)
}

/// Where the default stage store lives.
///
/// `$XDG_CACHE_HOME/strata` or `~/.cache/strata` on unix, and
/// `%LOCALAPPDATA%\strata\Cache` on windows.
pub fn cache_dir() -> PathBuf {
  if cfg!(windows) {
    env_path(&["LOCALAPPDATA", "USERPROFILE"])
      .unwrap_or_else(|| PathBuf::from("."))
      .join(APP_NAME)
      .join("Cache")
  } else {
    env_path(&["XDG_CACHE_HOME"])
      .or_else(|| env_path(&["HOME"]).map(|home| home.join(".cache")))
      .unwrap_or_else(|| PathBuf::from("/tmp"))
      .join(APP_NAME)
  }
}
