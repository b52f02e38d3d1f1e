//! Implementation of the `strata inspect` command.

use std::path::Path;

use anyhow::{Context, Result};

use strata_lib::store::{LockMode, StoreLock};

use super::{GlobalOpts, last_runtime, read_plan};
use crate::output::{OutputFormat, print_json, print_stat, print_success};

/// Print the runtime manifest of the last successful build of the plan's image.
pub fn cmd_inspect(plan_path: &Path, opts: &GlobalOpts, output: OutputFormat) -> Result<()> {
  let config = opts.config(Some(plan_path));
  let plan = read_plan(plan_path, &config)?;

  let _lock = StoreLock::acquire(&config.store, LockMode::Shared, "inspect").context("Failed to acquire store lock")?;
  let (manifest, root) = last_runtime(&plan, &config)?;

  if output.is_json() {
    return print_json(&manifest);
  }

  print_success(&format!("{} {}", manifest.image, manifest.version));
  print_stat("Base", &manifest.base);
  print_stat("Base dir", &manifest.base_dir);
  print_stat("Root", &root.display().to_string());
  let mut entry = vec![manifest.entry.command.clone()];
  entry.extend(manifest.entry.args.iter().cloned());
  print_stat("Entry", &entry.join(" "));
  if !manifest.path.is_empty() {
    print_stat("PATH", &manifest.path.join(":"));
  }

  if !manifest.env.is_empty() {
    println!();
    println!("Environment:");
    for (key, value) in &manifest.env {
      println!("  {key}={value}");
    }
  }

  println!();
  println!("Labels:");
  for (key, value) in &manifest.labels {
    println!("  {key}: {value}");
  }

  if !manifest.packages.is_empty() {
    println!();
    println!("Packages:");
    for package in &manifest.packages {
      let flag = if package.is_pinned() { "" } else { " (floating)" };
      println!("  {package}{flag}");
    }
  }

  if !manifest.layers.is_empty() {
    println!();
    println!("Layers:");
    for layer in &manifest.layers {
      println!("  {}:{} -> {}", layer.from, layer.src, layer.dest);
    }
  }
  Ok(())
}
