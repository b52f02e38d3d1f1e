//! Implementation of the `strata clean` command.

use anyhow::{Context, Result, bail};
use serde_json::json;

use strata_lib::store::{LockMode, StageStore, StoreLock};

use super::GlobalOpts;
use crate::output::{OutputFormat, print_info, print_json, print_success};
use crate::prompts::confirm;

/// Remove the whole stage store: frozen stages, logs, build records and the
/// git cache.
pub fn cmd_clean(opts: &GlobalOpts, force: bool, output: OutputFormat) -> Result<()> {
  let config = opts.config(None);
  let store = StageStore::new(&config);

  if !store.root().exists() {
    if output.is_json() {
      return print_json(&json!({ "store": store.root(), "removed": false }));
    }
    print_info(&format!("Nothing to clean at {}", store.root().display()));
    return Ok(());
  }

  if !confirm(&format!("Remove the store at {}?", store.root().display()), force)? {
    bail!("Aborted");
  }

  let lock = StoreLock::acquire(&config.store, LockMode::Exclusive, "clean").context("Failed to acquire store lock")?;
  let removed = store.clear().context("Failed to remove store")?;
  drop(lock);

  if output.is_json() {
    print_json(&json!({ "store": store.root(), "removed": removed }))?;
  } else {
    print_success(&format!("Removed {}", store.root().display()));
  }
  Ok(())
}
