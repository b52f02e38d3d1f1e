//! Package Installer.
//!
//! Packages are installed one installer invocation at a time, in declared
//! order, and the first failure stops the stage. Packages without a version
//! pin are floating: allowed and flagged in floating mode, rejected up front
//! in pinned mode.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::DependencyMode;
use crate::plan::PackageSet;

use super::cmd::{CmdError, Invocation, execute_cmd};
use super::{Buildable, StageContext, StageError, StepOutcome};

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("pinned mode requires versions for: {}", .packages.join(", "))]
  Unpinned { packages: Vec<String> },

  #[error("failed to install {package}: {source}")]
  Package {
    package: String,
    #[source]
    source: CmdError,
  },
}

#[async_trait]
impl Buildable for PackageSet {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    let floating: Vec<String> = self
      .packages
      .iter()
      .filter(|p| !p.is_pinned())
      .map(|p| p.to_string())
      .collect();

    if !floating.is_empty() {
      if ctx.mode() == DependencyMode::Pinned {
        return Err(InstallError::Unpinned { packages: floating }.into());
      }
      warn!(
        stage = %ctx.stage,
        packages = %floating.join(", "),
        "floating packages: installed versions may change between builds"
      );
    }

    let installer = ctx.expand(&self.installer)?;
    for package in &self.packages {
      ctx.check_cancelled()?;
      info!(stage = %ctx.stage, package = %package, "installing package");
      let cmd = format!("{installer} '{package}'");
      execute_cmd(ctx, &Invocation::Shell(cmd), &Default::default(), None)
        .await
        .map_err(|e| InstallError::Package {
          package: package.to_string(),
          source: e,
        })?;
    }

    Ok(StepOutcome::Installed {
      packages: self.packages.clone(),
    })
  }
}
