//! Source Stager: copy build context entries into the stage.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::plan::SourceCopy;
use crate::util::fs::{FsError, copy_tree};

use super::{Buildable, StageContext, StageError, StepOutcome};

#[derive(Debug, Error)]
pub enum CopyError {
  #[error("declared source '{src}' does not exist (looked for {path})")]
  MissingSource { src: String, path: PathBuf },

  #[error(transparent)]
  Copy(#[from] FsError),
}

#[async_trait]
impl Buildable for SourceCopy {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    let src = ctx.context_path(&self.src);
    if std::fs::symlink_metadata(&src).is_err() {
      return Err(
        CopyError::MissingSource {
          src: self.src.clone(),
          path: src,
        }
        .into(),
      );
    }

    let dest = ctx.image_path(&self.dest).map_err(CopyError::from)?;
    let files = copy_tree(&src, &dest).map_err(CopyError::from)?;
    info!(stage = %ctx.stage, src = %self.src, dest = %self.dest, files, "staged source");

    Ok(StepOutcome::Copied {
      src: self.src.clone(),
      dest: self.dest.clone(),
      files,
    })
  }
}
