//! Stage steps and the context they execute in.
//!
//! Every step kind implements [`Buildable`]: one `execute` method that takes
//! the stage context and either changes the stage filesystem or fails. The
//! executor never looks inside a step, so recipes, installers and setup
//! scripts can be swapped without touching orchestration.

pub mod binary;
pub mod cmd;
pub mod compose;
pub mod entry;
pub mod fetch;
pub mod lock;
pub mod packages;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{BuildConfig, DependencyMode};
use crate::placeholder::{self, Placeholder, PlaceholderError, Resolver};
use crate::plan::{ArtifactRef, ImageSpec, ImageVars, PackageSpec, StageName, Step};
use crate::store::{FrozenStage, StoreError};
use crate::util::fs::{FsError, image_path};

pub use binary::BuildError;
pub use cmd::{CmdError, Invocation, execute_cmd};
pub use compose::{ComposeError, ComposeLayers};
pub use entry::{Launch, LaunchError, launch, prepare_launch, resolve_entry};
pub use fetch::{FetchError, FetchedDependency};
pub use lock::{LockError, LockFile, LockedDependency};
pub use packages::InstallError;
pub use source::CopyError;

/// Errors a stage can fail with. Each step kind has its own error type.
#[derive(Debug, Error)]
pub enum StageError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Copy(#[from] CopyError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error(transparent)]
  Compose(#[from] ComposeError),

  #[error("placeholder error in stage '{stage}': {source}")]
  Placeholder {
    stage: StageName,
    #[source]
    source: PlaceholderError,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("stage '{0}' cancelled")]
  Cancelled(StageName),
}

impl StageError {
  /// True when the stage stopped because the build was cancelled rather than
  /// because a step failed on its own.
  pub fn is_cancelled(&self) -> bool {
    match self {
      StageError::Cancelled(_) => true,
      StageError::Fetch(FetchError::Cancelled { .. }) => true,
      StageError::Build(BuildError::Recipe { source, .. }) => matches!(source, CmdError::Cancelled(_)),
      StageError::Install(InstallError::Package { source, .. }) => matches!(source, CmdError::Cancelled(_)),
      StageError::Compose(ComposeError::SetupFailed { source, .. }) => matches!(source, CmdError::Cancelled(_)),
      _ => false,
    }
  }
}

/// What a successful step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
  Built { recipe: String, version: String },
  Fetched(FetchedDependency),
  Copied { src: String, dest: String, files: usize },
  Installed { packages: Vec<PackageSpec> },
  Composed { layers: Vec<ComposedLayer> },
  SetupRan { script: String },
}

/// One upstream artifact copied into the composing stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedLayer {
  pub artifact: ArtifactRef,
  pub dest: String,
  pub files: usize,
}

/// Everything a step may read or write while it executes.
///
/// Steps only write below `root` and `tmp`. Upstream stages are reachable
/// only through their frozen trees.
pub struct StageContext<'a> {
  pub stage: &'a StageName,
  /// Host directory holding this stage's image filesystem.
  pub root: PathBuf,
  /// Private scratch directory, discarded when the stage is frozen.
  pub tmp: PathBuf,
  pub config: &'a BuildConfig,
  pub image: &'a ImageSpec,
  pub vars: &'a ImageVars,
  pub upstream: &'a BTreeMap<StageName, FrozenStage>,
  /// Lock entries recorded by earlier builds.
  pub locked: &'a LockFile,
  pub cancel: CancellationToken,
  pub log: PathBuf,
  pub git_cache: PathBuf,
}

struct StageVars<'a> {
  image: &'a ImageVars,
  out: String,
}

impl Resolver for StageVars<'_> {
  fn resolve(&self, placeholder: Placeholder) -> Option<&str> {
    match placeholder {
      Placeholder::Out => Some(&self.out),
      other => self.image.resolve(other),
    }
  }
}

impl StageContext<'_> {
  pub fn mode(&self) -> DependencyMode {
    self.image.mode
  }

  /// Substitute every placeholder, including `$${out}`.
  pub fn expand(&self, value: &str) -> Result<String, StageError> {
    let vars = StageVars {
      image: self.vars,
      out: self.root.to_string_lossy().into_owned(),
    };
    placeholder::substitute(value, &vars).map_err(|e| StageError::Placeholder {
      stage: self.stage.clone(),
      source: e,
    })
  }

  pub fn expand_all(&self, values: &[String]) -> Result<Vec<String>, StageError> {
    values.iter().map(|v| self.expand(v)).collect()
  }

  /// Host path of an image path inside this stage.
  pub fn image_path(&self, path: &str) -> Result<PathBuf, FsError> {
    image_path(&self.root, path)
  }

  /// Host path of a build context entry.
  pub fn context_path(&self, relative: &str) -> PathBuf {
    self.config.context.join(relative)
  }

  pub fn check_cancelled(&self) -> Result<(), StageError> {
    if self.cancel.is_cancelled() {
      return Err(StageError::Cancelled(self.stage.clone()));
    }
    Ok(())
  }
}

/// A unit of build work with a single entry point.
#[async_trait]
pub trait Buildable: Send + Sync {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError>;
}

#[async_trait]
impl Buildable for Step {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    ctx.check_cancelled()?;
    match self {
      Step::Build(recipe) => recipe.execute(ctx).await,
      Step::Fetch(dep) => dep.execute(ctx).await,
      Step::Copy(copy) => copy.execute(ctx).await,
      Step::Install(set) => set.execute(ctx).await,
      Step::Compose { layers } => ComposeLayers(layers).execute(ctx).await,
      Step::Setup(setup) => setup.execute(ctx).await,
    }
  }
}
