//! A ready-made stage context for unit tests.

use std::collections::BTreeMap;
use std::fs;

use tokio_util::sync::CancellationToken;

use crate::config::{BuildConfig, DependencyMode};
use crate::plan::{ImageSpec, ImageVars, StageName};
use crate::store::FrozenStage;
use crate::util::testutil::Sandbox;

use super::{LockFile, StageContext};

pub struct TestStage {
  pub sandbox: Sandbox,
  pub config: BuildConfig,
  pub image: ImageSpec,
  pub vars: ImageVars,
  pub upstream: BTreeMap<StageName, FrozenStage>,
  pub locked: LockFile,
  pub name: StageName,
  pub cancel: CancellationToken,
}

impl TestStage {
  pub fn new() -> Self {
    Self::with_mode(DependencyMode::Floating)
  }

  pub fn with_mode(mode: DependencyMode) -> Self {
    let sandbox = Sandbox::new();
    let config = sandbox.config();
    let image = ImageSpec {
      name: "pav".to_string(),
      version: "2.4.0".to_string(),
      author: None,
      base: "python:3.10".to_string(),
      base_dir: "/opt/pav".to_string(),
      mode,
      labels: BTreeMap::new(),
    };
    let vars = ImageVars {
      base: "/opt/pav".to_string(),
      version: "2.4.0".to_string(),
      name: "pav".to_string(),
    };
    fs::create_dir_all(sandbox.temp.path().join("work/root")).unwrap();
    fs::create_dir_all(sandbox.temp.path().join("work/tmp")).unwrap();
    Self {
      sandbox,
      config,
      image,
      vars,
      upstream: BTreeMap::new(),
      locked: LockFile::new(),
      name: StageName::from("test"),
      cancel: CancellationToken::new(),
    }
  }

  pub fn ctx(&self) -> StageContext<'_> {
    StageContext {
      stage: &self.name,
      root: self.sandbox.temp.path().join("work/root"),
      tmp: self.sandbox.temp.path().join("work/tmp"),
      config: &self.config,
      image: &self.image,
      vars: &self.vars,
      upstream: &self.upstream,
      locked: &self.locked,
      cancel: self.cancel.clone(),
      log: self.sandbox.store().join("logs/test.log"),
      git_cache: self.sandbox.store().join("git"),
    }
  }
}
