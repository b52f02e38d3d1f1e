//! Implementation of the `strata run` command.

use std::path::Path;

use anyhow::{Context, Result};

use strata_lib::stage::launch;
use strata_lib::store::{LockMode, StoreLock};

use super::{GlobalOpts, last_runtime, read_plan};

/// Launch the entry command of the last built runtime with `args` appended.
///
/// Exits with the entry command's exit code.
pub fn cmd_run(plan_path: &Path, opts: &GlobalOpts, args: &[String]) -> Result<()> {
  let config = opts.config(Some(plan_path));
  let plan = read_plan(plan_path, &config)?;

  let _lock = StoreLock::acquire(&config.store, LockMode::Shared, "run").context("Failed to acquire store lock")?;
  let (manifest, root) = last_runtime(&plan, &config)?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let status = rt
    .block_on(launch(&manifest, &root, args))
    .with_context(|| format!("Failed to launch {}", manifest.entry.command))?;

  if !status.success() {
    std::process::exit(status.code().unwrap_or(1));
  }
  Ok(())
}
