//! Types for plan execution.
//!
//! This module defines the error types, per-stage results and the report of a
//! whole build.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::graph::GraphError;
use crate::manifest::{ManifestError, RuntimeManifest};
use crate::plan::{PlanError, StageName};
use crate::stage::{LockError, LockFile, StageError, StepOutcome};
use crate::store::{FrozenStage, StoreError};
use crate::util::fs::FsError;
use crate::util::hash::{HashError, ObjectHash};

use super::phase::BuildPhase;

#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Stage(#[from] StageError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  /// Only raised when build-time entry validation is enabled.
  #[error("entry command {command} not found in runtime stage (looked for {path})")]
  EntryNotFound { command: String, path: PathBuf },

  #[error("stage '{stage}' did not produce its declared artifact {artifact}")]
  MissingArtifact { stage: StageName, artifact: String },

  #[error(transparent)]
  Path(#[from] FsError),

  #[error("failed to compute key of stage '{stage}': {source}")]
  Key {
    stage: StageName,
    #[source]
    source: HashError,
  },

  #[error("failed to resolve relative store or context path: {0}")]
  WorkingDirectory(#[source] std::io::Error),

  #[error("stage task for '{stage}' failed: {message}")]
  Task { stage: StageName, message: String },
}

impl ExecuteError {
  pub fn is_cancelled(&self) -> bool {
    matches!(self, ExecuteError::Stage(e) if e.is_cancelled())
  }
}

/// A stage that made it into the store during this build.
#[derive(Debug, Clone)]
pub struct StageResult {
  pub frozen: FrozenStage,
  /// Reused from an earlier build without executing any step.
  pub cached: bool,
  pub outcomes: Vec<StepOutcome>,
  pub started: Instant,
  pub finished: Instant,
}

impl StageResult {
  pub fn duration(&self) -> Duration {
    self.finished.duration_since(self.started)
  }
}

/// The stage that stopped the build.
#[derive(Debug)]
pub struct StageFailure {
  pub stage: StageName,
  pub error: ExecuteError,
  /// Command output of the stage.
  pub log: PathBuf,
}

/// Why a stage never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
  /// An upstream stage failed or was cancelled.
  DependencyFailed(StageName),
  /// The build stopped before the stage's turn.
  Aborted,
}

impl fmt::Display for SkipReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SkipReason::DependencyFailed(stage) => write!(f, "dependency '{stage}' failed"),
      SkipReason::Aborted => f.write_str("build aborted"),
    }
  }
}

/// Result of executing a whole plan.
#[derive(Debug)]
pub struct BuildReport {
  pub image: String,
  pub runtime: StageName,
  pub phase: BuildPhase,
  pub history: Vec<BuildPhase>,
  pub keys: BTreeMap<StageName, ObjectHash>,
  pub waves: Vec<Vec<StageName>>,

  /// Stages frozen in the store, built or cached.
  pub stages: BTreeMap<StageName, StageResult>,
  /// First stage failure. Execution stops there.
  pub failed: Option<StageFailure>,
  /// In-flight stages stopped by cancellation.
  pub cancelled: Vec<StageName>,
  pub skipped: BTreeMap<StageName, SkipReason>,

  /// Runtime manifest, present once the runtime stage is frozen.
  pub manifest: Option<RuntimeManifest>,
  /// Lock file including every dependency fetched by this build.
  pub lock: LockFile,
  pub lock_changed: bool,
  pub duration: Duration,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.phase == BuildPhase::Ready
  }

  pub fn built(&self) -> usize {
    self.stages.values().filter(|s| !s.cached).count()
  }

  pub fn cached(&self) -> usize {
    self.stages.values().filter(|s| s.cached).count()
  }

  pub fn runtime_stage(&self) -> Option<&StageResult> {
    self.stages.get(&self.runtime)
  }
}
