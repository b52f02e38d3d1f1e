mod build;
mod clean;
mod inspect;
mod plan;
mod run;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use strata_lib::config::{BuildConfig, DependencyMode};
use strata_lib::manifest::RuntimeManifest;
use strata_lib::plan::{Plan, load_plan};
use strata_lib::store::StageStore;

pub use build::cmd_build;
pub use clean::cmd_clean;
pub use inspect::cmd_inspect;
pub use plan::cmd_plan;
pub use run::cmd_run;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOpts {
  pub store: Option<PathBuf>,
  pub context: Option<PathBuf>,
  pub jobs: Option<usize>,
  pub no_cache: bool,
  pub base_dir: Option<String>,
  pub pinned: bool,
}

impl GlobalOpts {
  /// Resolve the build configuration for `plan`.
  ///
  /// Precedence: command-line flags, then `STRATA_*` variables, then
  /// defaults. The build context defaults to the plan's directory.
  pub fn config(&self, plan: Option<&Path>) -> BuildConfig {
    let mut config = BuildConfig::default();
    if let Some(plan) = plan {
      config.context = plan_dir(plan);
    }
    let mut config = config.apply_env();

    if let Some(store) = &self.store {
      config.store = store.clone();
    }
    if let Some(context) = &self.context {
      config.context = context.clone();
    }
    if let Some(jobs) = self.jobs {
      config.parallelism = jobs.max(1);
    }
    if self.no_cache {
      config.use_cache = false;
    }
    if let Some(base) = &self.base_dir {
      config.base_dir = Some(base.clone());
    }
    if self.pinned {
      config.mode = Some(DependencyMode::Pinned);
    }
    match config.clone().with_absolute_paths() {
      Ok(absolute) => absolute,
      Err(_) => config,
    }
  }
}

fn plan_dir(plan: &Path) -> PathBuf {
  let dir = match plan.parent() {
    Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
    _ => PathBuf::from("."),
  };
  dunce::canonicalize(&dir).unwrap_or(dir)
}

fn read_plan(path: &Path, config: &BuildConfig) -> Result<Plan> {
  if !path.exists() {
    bail!("Plan file not found: {}", path.display());
  }
  load_plan(path, config).with_context(|| format!("Failed to load plan: {}", path.display()))
}

/// Runtime manifest and root directory of the last successful build of `plan`.
fn last_runtime(plan: &Plan, config: &BuildConfig) -> Result<(RuntimeManifest, PathBuf)> {
  let store = StageStore::new(config);
  let record = store
    .read_record(&plan.image.name)
    .context("Failed to read build record")?;
  let Some(dir) = record.as_ref().and_then(|r| r.runtime_dir()) else {
    bail!(
      "No build of image '{}' found in {}. Run 'strata build' first.",
      plan.image.name,
      config.store.display()
    );
  };
  let manifest = RuntimeManifest::read(dir).context("Failed to read runtime manifest")?;
  Ok((manifest, dir.join("root")))
}
