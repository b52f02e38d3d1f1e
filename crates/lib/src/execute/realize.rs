//! Single stage realization.
//!
//! Runs every step of one stage in a fresh partial directory and freezes the
//! result, or reuses a frozen stage with the same key.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BuildConfig;
use crate::manifest::RuntimeManifest;
use crate::plan::{ImageVars, Plan, StageDef, StageName};
use crate::stage::binary::discard_scratch;
use crate::stage::{Buildable, LaunchError, LockFile, StageContext, StageError, StepOutcome, resolve_entry};
use crate::store::{FrozenStage, PartialStage, StageStore};
use crate::util::hash::ObjectHash;

use super::phase::BuildPhase;
use super::types::{ExecuteError, StageResult};

/// Everything a stage task owns while it runs.
pub(crate) struct StageJob {
  pub plan: Arc<Plan>,
  pub config: Arc<BuildConfig>,
  pub lock: Arc<LockFile>,
  pub vars: Arc<ImageVars>,
  pub store: StageStore,
  pub name: StageName,
  pub key: ObjectHash,
  /// Frozen direct dependencies.
  pub upstream: BTreeMap<StageName, FrozenStage>,
  pub cancel: CancellationToken,
  pub phases: UnboundedSender<BuildPhase>,
}

pub(crate) async fn realize_stage(job: StageJob) -> Result<StageResult, ExecuteError> {
  let started = Instant::now();

  if job.config.use_cache
    && let Some(frozen) = job.store.lookup(&job.name, &job.key)?
  {
    info!(stage = %job.name, key = %job.key, "using cached stage");
    return Ok(StageResult {
      frozen,
      cached: true,
      outcomes: Vec::new(),
      started,
      finished: Instant::now(),
    });
  }

  let partial = job.store.begin(&job.name, &job.key)?;
  match run_steps(&job, &partial).await {
    Ok(outcomes) => {
      let frozen = job.store.promote(partial)?;
      Ok(StageResult {
        frozen,
        cached: false,
        outcomes,
        started,
        finished: Instant::now(),
      })
    }
    Err(e) => {
      job.store.discard(partial);
      Err(e)
    }
  }
}

async fn run_steps(job: &StageJob, partial: &PartialStage) -> Result<Vec<StepOutcome>, ExecuteError> {
  let stage = job
    .plan
    .stage(&job.name)
    .ok_or_else(|| ExecuteError::Task {
      stage: job.name.clone(),
      message: "stage missing from plan".to_string(),
    })?;
  let runtime = job.name == job.plan.runtime;

  let log = job.store.log_path(&job.name);
  reset_log(&log);

  let ctx = StageContext {
    stage: &job.name,
    root: partial.root(),
    tmp: partial.tmp(),
    config: &job.config,
    image: &job.plan.image,
    vars: &job.vars,
    upstream: &job.upstream,
    locked: &job.lock,
    cancel: job.cancel.clone(),
    log,
    git_cache: job.store.git_cache(),
  };

  info!(stage = %job.name, key = %job.key, steps = stage.steps.len(), "executing stage");
  let mut outcomes = Vec::with_capacity(stage.steps.len());
  for (idx, step) in stage.steps.iter().enumerate() {
    if let Some(phase) = BuildPhase::for_step(step, runtime) {
      let _ = job.phases.send(phase);
    }
    debug!(stage = %job.name, step = idx, op = step.kind(), "executing step");
    outcomes.push(step.execute(&ctx).await?);
  }
  ctx.check_cancelled()?;
  discard_scratch(&ctx, stage).map_err(StageError::from)?;
  check_artifacts(&ctx, stage)?;

  if runtime {
    write_manifest(job, partial)?;
  }

  Ok(outcomes)
}

/// Every declared artifact must exist before the stage is frozen.
fn check_artifacts(ctx: &StageContext<'_>, stage: &StageDef) -> Result<(), ExecuteError> {
  for artifact in &stage.artifacts {
    if ctx.image_path(artifact)?.symlink_metadata().is_err() {
      return Err(ExecuteError::MissingArtifact {
        stage: stage.name.clone(),
        artifact: artifact.clone(),
      });
    }
  }
  Ok(())
}

/// Write the runtime manifest beside the runtime stage tree.
fn write_manifest(job: &StageJob, partial: &PartialStage) -> Result<(), ExecuteError> {
  let manifest = RuntimeManifest::from_plan(&job.plan);

  match resolve_entry(&manifest, &partial.root()) {
    Ok(_) => {}
    Err(LaunchError::EntryNotFound { command, path }) if job.config.validate_entry => {
      return Err(ExecuteError::EntryNotFound { command, path });
    }
    Err(e) => {
      warn!(stage = %job.name, error = %e, "entry command is not in the runtime; launching will fail");
    }
  }

  let path = manifest.write(&partial.dir)?;
  debug!(stage = %job.name, path = ?path, "wrote runtime manifest");
  Ok(())
}

fn reset_log(path: &Path) {
  if let Some(parent) = path.parent()
    && let Err(e) = std::fs::create_dir_all(parent)
  {
    warn!(path = ?parent, error = %e, "failed to create log directory");
    return;
  }
  if let Err(e) = std::fs::write(path, b"") {
    warn!(path = ?path, error = %e, "failed to reset stage log");
  }
}
