//! Implementation of the `strata plan` command.
//!
//! Shows how a build would run: execution waves, stage keys, which stages are
//! already frozen, and every floating dependency.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use strata_lib::execute::{execution_waves, stage_keys};
use strata_lib::graph::StageGraph;
use strata_lib::plan::{Plan, StageName};
use strata_lib::stage::LockFile;
use strata_lib::stage::fetch::is_commit_id;
use strata_lib::stage::lock::lock_path_for;
use strata_lib::store::{LockMode, StageStore, StoreLock};

use super::{GlobalOpts, read_plan};
use crate::output::{OutputFormat, print_json, print_stat, print_warning, symbols, truncate_hash};

#[derive(Debug, Serialize)]
struct PlanSummary {
  image: String,
  version: String,
  base_dir: String,
  mode: String,
  runtime: String,
  waves: Vec<Vec<StagePlan>>,
  floating: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StagePlan {
  name: String,
  key: String,
  cached: bool,
  depends_on: Vec<String>,
}

pub fn cmd_plan(plan_path: &Path, opts: &GlobalOpts, output: OutputFormat) -> Result<()> {
  let config = opts.config(Some(plan_path));
  let plan = read_plan(plan_path, &config)?;
  let lock = LockFile::load(&lock_path_for(plan_path))
    .context("Failed to read lock file")?
    .unwrap_or_default();

  let graph = StageGraph::from_plan(&plan).context("Invalid stage graph")?;
  let waves = execution_waves(&plan, &graph).context("Invalid stage graph")?;
  let keys = stage_keys(&plan, &graph, &config, &lock).context("Failed to compute stage keys")?;

  let _lock = StoreLock::acquire(&config.store, LockMode::Shared, "plan").context("Failed to acquire store lock")?;
  let store = StageStore::new(&config);

  let summary = PlanSummary {
    image: plan.image.name.clone(),
    version: plan.image.version.clone(),
    base_dir: plan.image.base_dir.clone(),
    mode: plan.image.mode.to_string(),
    runtime: plan.runtime.to_string(),
    waves: waves
      .iter()
      .map(|wave| {
        wave
          .iter()
          .filter_map(|name| {
            let key = keys.get(name)?;
            Some(StagePlan {
              name: name.to_string(),
              key: key.0.clone(),
              cached: config.use_cache && store.contains(name, key),
              depends_on: graph.dependencies(name).iter().map(StageName::to_string).collect(),
            })
          })
          .collect()
      })
      .collect(),
    floating: floating_dependencies(&plan),
  };

  if output.is_json() {
    return print_json(&summary);
  }

  println!(
    "Image: {} {} ({})",
    summary.image, summary.version, summary.mode
  );
  print_stat("Base dir", &summary.base_dir);
  print_stat("Runtime stage", &summary.runtime);
  for (idx, wave) in summary.waves.iter().enumerate() {
    println!();
    println!("Wave {}:", idx + 1);
    for stage in wave {
      let (symbol, status) = if stage.cached {
        (symbols::SUCCESS, "cached")
      } else {
        (symbols::ADD, "build")
      };
      let after = if stage.depends_on.is_empty() {
        String::new()
      } else {
        format!(" after {}", stage.depends_on.join(", "))
      };
      println!(
        "  {} {} {} {}",
        symbol.if_supports_color(Stream::Stdout, |s| s.green()),
        stage.name,
        truncate_hash(&stage.key).if_supports_color(Stream::Stdout, |s| s.dimmed()),
        format!("({status}{after})").if_supports_color(Stream::Stdout, |s| s.dimmed()),
      );
    }
  }
  if !summary.floating.is_empty() {
    println!();
    print_warning(&format!("Floating dependencies: {}", summary.floating.join(", ")));
  }
  Ok(())
}

/// Unpinned packages and fetches whose revision is not a commit id.
fn floating_dependencies(plan: &Plan) -> Vec<String> {
  let packages = plan.floating_packages().into_iter().map(|p| p.to_string());
  let fetches = plan
    .pinned_dependencies()
    .filter(|(_, dep)| !is_commit_id(&dep.rev))
    .map(|(_, dep)| format!("{}@{}", dep.url, dep.rev));
  packages.chain(fetches).collect()
}
