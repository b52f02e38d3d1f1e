//! Layer Composer.
//!
//! Copies artifacts of frozen upstream stages into the composing stage, in
//! declared order. Later layers overwrite earlier ones where their paths
//! overlap. Composition only ever reads frozen trees: it never runs an
//! upstream step.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::plan::{ArtifactRef, LayerCopy, SetupScript, StageName};
use crate::util::fs::{FsError, copy_tree, image_path};

use super::cmd::{CmdError, Invocation, execute_cmd};
use super::{Buildable, ComposedLayer, StageContext, StageError, StepOutcome};

#[derive(Debug, Error)]
pub enum ComposeError {
  #[error("upstream stage '{0}' is not frozen")]
  UpstreamNotFrozen(StageName),

  #[error("artifact {artifact} does not exist")]
  MissingArtifact { artifact: ArtifactRef },

  #[error(transparent)]
  Copy(#[from] FsError),

  #[error("setup script not found: {0}")]
  MissingSetupScript(PathBuf),

  #[error("setup script {script} failed: {source}")]
  SetupFailed {
    script: String,
    #[source]
    source: CmdError,
  },
}

/// The layers of one compose step.
pub struct ComposeLayers<'a>(pub &'a [LayerCopy]);

#[async_trait]
impl Buildable for ComposeLayers<'_> {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    let mut composed = Vec::with_capacity(self.0.len());

    for layer in self.0 {
      ctx.check_cancelled()?;
      let artifact = layer.artifact();
      let upstream = ctx
        .upstream
        .get(&layer.from)
        .ok_or_else(|| ComposeError::UpstreamNotFrozen(layer.from.clone()))?;

      let src = image_path(&upstream.root(), &layer.src).map_err(ComposeError::from)?;
      if std::fs::symlink_metadata(&src).is_err() {
        return Err(ComposeError::MissingArtifact { artifact }.into());
      }

      let dest = ctx.image_path(layer.dest()).map_err(ComposeError::from)?;
      debug!(stage = %ctx.stage, artifact = %artifact, dest = %layer.dest(), "composing layer");
      let files = copy_tree(&src, &dest).map_err(ComposeError::from)?;
      info!(stage = %ctx.stage, artifact = %artifact, files, "composed layer");

      composed.push(ComposedLayer {
        artifact,
        dest: layer.dest().to_string(),
        files,
      });
    }

    Ok(StepOutcome::Composed { layers: composed })
  }
}

#[async_trait]
impl Buildable for SetupScript {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    let script = ctx.context_path(&self.script);
    if !script.is_file() {
      return Err(ComposeError::MissingSetupScript(script).into());
    }
    let args = ctx.expand_all(&self.args)?;

    info!(stage = %ctx.stage, script = %self.script, "running setup");
    execute_cmd(ctx, &Invocation::Script { path: script, args }, &Default::default(), None)
      .await
      .map_err(|e| ComposeError::SetupFailed {
        script: self.script.clone(),
        source: e,
      })?;

    Ok(StepOutcome::SetupRan {
      script: self.script.clone(),
    })
  }
}
