//! Plan loading, placeholder substitution and validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::placeholder::{self, Placeholder, PlaceholderError, Resolver};

use super::types::{ArtifactRef, EntrySpec, ImageSpec, Plan, PlanFile, StageDef, StageName, Step};

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to read plan {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse plan {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: Box<toml::de::Error>,
  },

  #[error("in {field}: {source}")]
  Placeholder {
    field: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("stage '{0}' is defined more than once")]
  DuplicateStage(StageName),

  #[error("stage '{0}' installs packages; only the runtime stage may")]
  InstallOutsideRuntime(StageName),

  #[error("stage '{by}' depends on the runtime stage '{runtime}'")]
  RuntimeDependedOn { by: StageName, runtime: StageName },

  #[error("runtime stage '{0}' installs packages after composing; installs must come first")]
  InstallAfterCompose(StageName),

  #[error("stage '{by}' composes {artifact}, which is not among the declared artifacts of '{}'", .artifact.stage)]
  UndeclaredArtifact { by: StageName, artifact: ArtifactRef },

  #[error("base directory must be absolute, got '{0}'")]
  RelativeBaseDir(String),

  #[error("entry command must be an absolute image path, got '{0}'")]
  RelativeEntry(String),
}

/// Configuration values substituted when a plan loads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageVars {
  pub base: String,
  pub version: String,
  pub name: String,
}

impl ImageVars {
  pub fn of(image: &ImageSpec) -> Self {
    Self {
      base: image.base_dir.trim_end_matches('/').to_string(),
      version: image.version.clone(),
      name: image.name.clone(),
    }
  }
}

impl Resolver for ImageVars {
  fn resolve(&self, placeholder: Placeholder) -> Option<&str> {
    match placeholder {
      Placeholder::Base => Some(&self.base),
      Placeholder::Version => Some(&self.version),
      Placeholder::Name => Some(&self.name),
      Placeholder::Out => None,
    }
  }
}

/// Read and load the plan at `path`.
pub fn load_plan(path: &Path, config: &BuildConfig) -> Result<Plan, PlanError> {
  let text = std::fs::read_to_string(path).map_err(|e| PlanError::Read {
    path: path.to_path_buf(),
    source: e,
  })?;
  let file: PlanFile = toml::from_str(&text).map_err(|e| PlanError::Parse {
    path: path.to_path_buf(),
    source: Box::new(e),
  })?;
  info!(path = ?path, stages = file.stages.len() + 1, "loaded plan");
  resolve_plan(file, config)
}

/// Parse plan text directly. Used where no file exists yet.
pub fn parse_plan(text: &str, config: &BuildConfig) -> Result<Plan, PlanError> {
  let file: PlanFile = toml::from_str(text).map_err(|e| PlanError::Parse {
    path: PathBuf::from("<inline>"),
    source: Box::new(e),
  })?;
  resolve_plan(file, config)
}

/// Apply config overrides, substitute placeholders and validate.
pub fn resolve_plan(file: PlanFile, config: &BuildConfig) -> Result<Plan, PlanError> {
  let PlanFile {
    mut image,
    mut stages,
    runtime,
  } = file;

  if let Some(base) = &config.base_dir {
    debug!(from = %image.base_dir, to = %base, "base directory overridden");
    image.base_dir = base.clone();
  }
  if let Some(mode) = config.mode {
    image.mode = mode;
  }
  if !image.base_dir.starts_with('/') {
    return Err(PlanError::RelativeBaseDir(image.base_dir));
  }

  let vars = ImageVars::of(&image);

  stages.push(StageDef {
    name: runtime.stage.clone(),
    steps: runtime.steps,
    artifacts: Vec::new(),
    after: runtime.after,
  });

  for stage in &mut stages {
    substitute_stage(stage, &vars)?;
  }
  let mut entry = runtime.entry;
  substitute_entry(&mut entry, &vars)?;

  for value in image.labels.values_mut() {
    substitute_field(value, &vars, "image.labels")?;
  }

  let plan = Plan {
    image,
    stages,
    runtime: runtime.stage,
    entry,
  };
  validate(&plan)?;
  Ok(plan)
}

fn validate(plan: &Plan) -> Result<(), PlanError> {
  let mut seen = HashSet::new();
  for stage in &plan.stages {
    if !seen.insert(&stage.name) {
      return Err(PlanError::DuplicateStage(stage.name.clone()));
    }
  }

  for stage in &plan.stages {
    if stage.name == plan.runtime {
      continue;
    }
    if stage.steps.iter().any(|s| matches!(s, Step::Install(_))) {
      return Err(PlanError::InstallOutsideRuntime(stage.name.clone()));
    }
    if stage.after.contains(&plan.runtime) || stage.layer_sources().any(|s| s == &plan.runtime) {
      return Err(PlanError::RuntimeDependedOn {
        by: stage.name.clone(),
        runtime: plan.runtime.clone(),
      });
    }
  }

  if let Some(runtime) = plan.runtime_stage() {
    let first_compose = runtime
      .steps
      .iter()
      .position(|s| matches!(s, Step::Compose { .. } | Step::Setup(_)));
    let last_install = runtime.steps.iter().rposition(|s| matches!(s, Step::Install(_)));
    if let (Some(compose), Some(install)) = (first_compose, last_install)
      && install > compose
    {
      return Err(PlanError::InstallAfterCompose(runtime.name.clone()));
    }
  }

  for stage in &plan.stages {
    for step in &stage.steps {
      let Step::Compose { layers } = step else {
        continue;
      };
      for layer in layers {
        if let Some(source) = plan.stage(&layer.from)
          && !declares(&source.artifacts, &layer.src)
        {
          return Err(PlanError::UndeclaredArtifact {
            by: stage.name.clone(),
            artifact: layer.artifact(),
          });
        }
      }
    }
  }

  if !plan.entry.command.starts_with('/') {
    return Err(PlanError::RelativeEntry(plan.entry.command.clone()));
  }

  Ok(())
}

/// A stage without declared artifacts exposes its whole root.
fn declares(artifacts: &[String], path: &str) -> bool {
  artifacts.is_empty() || artifacts.iter().any(|a| Path::new(path).starts_with(a))
}

fn substitute_field(value: &mut String, vars: &ImageVars, field: &str) -> Result<(), PlanError> {
  *value = placeholder::substitute_known(value, vars).map_err(|e| PlanError::Placeholder {
    field: field.to_string(),
    source: e,
  })?;
  Ok(())
}

fn substitute_all<'a>(
  values: impl IntoIterator<Item = &'a mut String>,
  vars: &ImageVars,
  field: &str,
) -> Result<(), PlanError> {
  values.into_iter().try_for_each(|v| substitute_field(v, vars, field))
}

fn substitute_stage(stage: &mut StageDef, vars: &ImageVars) -> Result<(), PlanError> {
  let name = stage.name.to_string();
  substitute_all(&mut stage.artifacts, vars, &format!("{name}.artifacts"))?;

  for (idx, step) in stage.steps.iter_mut().enumerate() {
    let field = format!("{name}.steps[{idx}]");
    match step {
      Step::Build(recipe) => {
        substitute_field(&mut recipe.script, vars, &field)?;
        substitute_all(&mut recipe.args, vars, &field)?;
        substitute_all(recipe.env.values_mut(), vars, &field)?;
        substitute_all(&mut recipe.scratch, vars, &field)?;
      }
      Step::Fetch(dep) => {
        substitute_field(&mut dep.url, vars, &field)?;
        substitute_field(&mut dep.rev, vars, &field)?;
        substitute_field(&mut dep.dest, vars, &field)?;
      }
      Step::Copy(copy) => {
        substitute_field(&mut copy.src, vars, &field)?;
        substitute_field(&mut copy.dest, vars, &field)?;
      }
      Step::Install(set) => {
        substitute_field(&mut set.installer, vars, &field)?;
        substitute_all(&mut set.inputs, vars, &field)?;
      }
      Step::Compose { layers } => {
        for layer in layers {
          substitute_field(&mut layer.src, vars, &field)?;
          if let Some(dest) = &mut layer.dest {
            substitute_field(dest, vars, &field)?;
          }
        }
      }
      Step::Setup(setup) => {
        substitute_field(&mut setup.script, vars, &field)?;
        substitute_all(&mut setup.args, vars, &field)?;
      }
    }
  }
  Ok(())
}

fn substitute_entry(entry: &mut EntrySpec, vars: &ImageVars) -> Result<(), PlanError> {
  substitute_field(&mut entry.command, vars, "runtime.entry.command")?;
  substitute_all(&mut entry.args, vars, "runtime.entry.args")?;
  substitute_all(&mut entry.path, vars, "runtime.entry.path")?;
  substitute_all(entry.env.values_mut(), vars, "runtime.entry.env")
}
