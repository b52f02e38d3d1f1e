//! Entry Invoker.
//!
//! The entry command is fixed at build time in the runtime manifest and stays
//! inert until the runtime is launched. Launching fails closed: a missing
//! entry is an error, never a fallback to something else on PATH.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::manifest::{ManifestError, RuntimeManifest};
use crate::util::fs::{FsError, image_path};

#[derive(Debug, Error)]
pub enum LaunchError {
  #[error("entry command {command} not found in runtime (looked for {path})")]
  EntryNotFound { command: String, path: PathBuf },

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error(transparent)]
  Path(#[from] FsError),

  #[error("failed to launch {command}: {source}")]
  Spawn {
    command: String,
    #[source]
    source: std::io::Error,
  },
}

/// A fully resolved entry invocation against an assembled runtime root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
  pub program: PathBuf,
  pub args: Vec<String>,
  pub env: BTreeMap<String, String>,
}

/// Resolve the manifest's entry command inside `root`.
pub fn resolve_entry(manifest: &RuntimeManifest, root: &Path) -> Result<PathBuf, LaunchError> {
  let path = image_path(root, &manifest.entry.command)?;
  if !path.is_file() {
    return Err(LaunchError::EntryNotFound {
      command: manifest.entry.command.clone(),
      path,
    });
  }
  Ok(path)
}

/// Build the invocation: manifest args first, then `extra`.
///
/// PATH is the manifest's additions mapped into `root`, followed by
/// `host_path`. `STRATA_ROOT` points at the runtime root so the entry can find
/// its own image paths.
pub fn prepare_launch(
  manifest: &RuntimeManifest,
  root: &Path,
  extra: &[String],
  host_path: &str,
) -> Result<Launch, LaunchError> {
  let program = resolve_entry(manifest, root)?;

  let mut search = Vec::with_capacity(manifest.path.len() + 1);
  for dir in &manifest.path {
    search.push(image_path(root, dir)?.to_string_lossy().into_owned());
  }
  if !host_path.is_empty() {
    search.push(host_path.to_string());
  }

  let mut env = manifest.env.clone();
  env.insert("PATH".to_string(), search.join(":"));
  env.insert("STRATA_ROOT".to_string(), root.to_string_lossy().into_owned());

  Ok(Launch {
    program,
    args: manifest.entry.args.iter().chain(extra).cloned().collect(),
    env,
  })
}

/// Run the entry command with inherited stdio and wait for it.
pub async fn launch(manifest: &RuntimeManifest, root: &Path, extra: &[String]) -> Result<ExitStatus, LaunchError> {
  let host_path = std::env::var("PATH").unwrap_or_default();
  let launch = prepare_launch(manifest, root, extra, &host_path)?;

  info!(image = %manifest.image, command = %manifest.entry.command, "launching entry");
  debug!(program = ?launch.program, args = ?launch.args, "entry invocation");

  Command::new(&launch.program)
    .args(&launch.args)
    .envs(&launch.env)
    .current_dir(root)
    .stdin(Stdio::inherit())
    .stdout(Stdio::inherit())
    .stderr(Stdio::inherit())
    .status()
    .await
    .map_err(|e| LaunchError::Spawn {
      command: manifest.entry.command.clone(),
      source: e,
    })
}
