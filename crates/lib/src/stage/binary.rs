//! Binary Builder: native build recipes.
//!
//! A recipe is an opaque script run by the shell with the stage root exposed
//! as `$out`. Recipes never see other stages. Once every recipe of the stage
//! has succeeded, their declared scratch paths are deleted so the stage holds
//! only the final tree. A later recipe may still read an earlier one's scratch.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::plan::{BuildRecipe, StageDef, Step};
use crate::util::fs::{FsError, remove_if_exists};

use super::cmd::{CmdError, Invocation, execute_cmd};
use super::{Buildable, StageContext, StageError, StepOutcome};

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("build script for {name} {version} not found: {path}")]
  MissingScript {
    name: String,
    version: String,
    path: PathBuf,
  },

  #[error("recipe {name} {version} failed: {source}")]
  Recipe {
    name: String,
    version: String,
    #[source]
    source: CmdError,
  },

  #[error("failed to discard scratch {path}: {source}")]
  Scratch {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Path(#[from] FsError),
}

#[async_trait]
impl Buildable for BuildRecipe {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    let script = ctx.context_path(&self.script);
    if !script.is_file() {
      return Err(
        BuildError::MissingScript {
          name: self.name.clone(),
          version: self.version.clone(),
          path: script,
        }
        .into(),
      );
    }

    let args = ctx.expand_all(&self.args)?;
    let mut env = std::collections::BTreeMap::new();
    for (key, value) in &self.env {
      env.insert(key.clone(), ctx.expand(value)?);
    }
    env.insert("RECIPE_NAME".to_string(), self.name.clone());
    env.insert("RECIPE_VERSION".to_string(), self.version.clone());

    info!(stage = %ctx.stage, recipe = %self.name, version = %self.version, "building recipe");
    execute_cmd(ctx, &Invocation::Script { path: script, args }, &env, None)
      .await
      .map_err(|e| BuildError::Recipe {
        name: self.name.clone(),
        version: self.version.clone(),
        source: e,
      })?;

    Ok(StepOutcome::Built {
      recipe: self.name.clone(),
      version: self.version.clone(),
    })
  }
}

/// Delete the scratch paths of every recipe in `stage`.
pub fn discard_scratch(ctx: &StageContext<'_>, stage: &StageDef) -> Result<(), BuildError> {
  let scratch = stage.steps.iter().flat_map(|step| match step {
    Step::Build(recipe) => recipe.scratch.as_slice(),
    _ => &[],
  });
  for image_path in scratch {
    let path = ctx.image_path(image_path)?;
    debug!(stage = %ctx.stage, path = ?path, "discarding build scratch");
    remove_if_exists(&path).map_err(|e| BuildError::Scratch { path, source: e })?;
  }
  Ok(())
}
