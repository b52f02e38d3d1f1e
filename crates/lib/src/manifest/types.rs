//! Runtime manifest types.
//!
//! The manifest records how the assembled runtime is launched: the entry
//! command, PATH additions, environment, labels, and which packages and layers
//! went into it.
//!
//! # Determinism
//!
//! Every map is a [`BTreeMap`] and nothing time- or host-dependent is stored,
//! so rebuilding from unchanged inputs writes a byte-identical
//! `runtime.json`.
//!
//! # Example
//!
//! ```json
//! {
//!   "image": "pav",
//!   "version": "2.4.0",
//!   "base": "python:3.10",
//!   "baseDir": "/opt/pav",
//!   "packages": ["numpy", "pandas==2.1.0"],
//!   "floatingPackages": ["numpy"],
//!   "env": { "PAV_VERSION": "2.4.0" },
//!   "labels": { "name": "pav", "version": "2.4.0" },
//!   "entry": { "command": "/opt/pav/files/docker/run_pav", "args": [] },
//!   "path": ["/opt/pav/bin"],
//!   "layers": [{ "from": "deps", "src": "/opt/pav/bin", "dest": "/opt/pav/bin" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::RUNTIME_MANIFEST_FILENAME;
use crate::plan::{PackageSpec, Plan, StageName, Step};
use crate::util::hash::Hashable;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("runtime manifest not found at {0}")]
  Missing(PathBuf),

  #[error("failed to access runtime manifest {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("invalid runtime manifest {path}: {source}")]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeManifest {
  pub image: String,
  pub version: String,
  /// Base runtime the image is assembled on.
  pub base: String,
  pub base_dir: String,
  /// Installed packages, in install order.
  pub packages: Vec<PackageSpec>,
  /// Packages installed without a version pin.
  #[serde(default)]
  pub floating_packages: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub labels: BTreeMap<String, String>,
  pub entry: EntryCommand,
  /// Image directories prepended to PATH at launch.
  pub path: Vec<String>,
  /// Composed layers, in copy order.
  pub layers: Vec<ManifestLayer>,
}

impl Hashable for RuntimeManifest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCommand {
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLayer {
  pub from: StageName,
  pub src: String,
  pub dest: String,
}

impl RuntimeManifest {
  /// Derive the manifest of a plan's runtime stage.
  pub fn from_plan(plan: &Plan) -> Self {
    let image = &plan.image;
    let mut packages = Vec::new();
    let mut layers = Vec::new();

    for step in plan.runtime_stage().map(|s| s.steps.as_slice()).unwrap_or_default() {
      match step {
        Step::Install(set) => packages.extend(set.packages.iter().cloned()),
        Step::Compose { layers: copies } => layers.extend(copies.iter().map(|l| ManifestLayer {
          from: l.from.clone(),
          src: l.src.clone(),
          dest: l.dest().to_string(),
        })),
        _ => {}
      }
    }

    let floating_packages = packages.iter().filter(|p| !p.is_pinned()).map(|p| p.to_string()).collect();

    let mut labels = BTreeMap::from([
      ("name".to_string(), image.name.clone()),
      ("version".to_string(), image.version.clone()),
    ]);
    if let Some(author) = &image.author {
      labels.insert("author".to_string(), author.clone());
    }
    for (key, value) in &image.labels {
      labels.entry(key.clone()).or_insert_with(|| value.clone());
    }

    RuntimeManifest {
      image: image.name.clone(),
      version: image.version.clone(),
      base: image.base.clone(),
      base_dir: image.base_dir.clone(),
      packages,
      floating_packages,
      env: plan.entry.env.clone(),
      labels,
      entry: EntryCommand {
        command: plan.entry.command.clone(),
        args: plan.entry.args.clone(),
      },
      path: plan.entry.path.clone(),
      layers,
    }
  }

  /// Path of the manifest inside a runtime stage directory.
  pub fn path_in(stage_dir: &Path) -> PathBuf {
    stage_dir.join(RUNTIME_MANIFEST_FILENAME)
  }

  pub fn write(&self, stage_dir: &Path) -> Result<PathBuf, ManifestError> {
    let path = Self::path_in(stage_dir);
    let content = serde_json::to_string_pretty(self).map_err(|e| ManifestError::Json {
      path: path.clone(),
      source: e,
    })?;
    std::fs::write(&path, format!("{content}\n")).map_err(|e| ManifestError::Io {
      path: path.clone(),
      source: e,
    })?;
    Ok(path)
  }

  pub fn read(stage_dir: &Path) -> Result<Self, ManifestError> {
    let path = Self::path_in(stage_dir);
    let content = match std::fs::read_to_string(&path) {
      Ok(c) => c,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ManifestError::Missing(path)),
      Err(e) => return Err(ManifestError::Io { path, source: e }),
    };
    serde_json::from_str(&content).map_err(|e| ManifestError::Json { path, source: e })
  }
}
