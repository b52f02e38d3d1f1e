//! Plan data model.
//!
//! A plan describes the image being assembled (`[image]`), the independent
//! upstream stages (`[[stages]]`) and the runtime stage that composes them
//! (`[runtime]`). The raw TOML shape is [`PlanFile`]; [`Plan`] is the loaded,
//! validated form with placeholders for configuration values substituted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DependencyMode;

/// Unique identifier of a stage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageName(pub String);

impl StageName {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for StageName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for StageName {
  fn from(s: &str) -> Self {
    StageName(s.to_string())
  }
}

/// Image-level metadata. Becomes labels and defaults in the runtime manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub author: Option<String>,
  /// Base interpreter/runtime the image is assembled on (e.g. `python:3.10`).
  pub base: String,
  /// Directory inside the image everything is installed under.
  pub base_dir: String,
  #[serde(default)]
  pub mode: DependencyMode,
  /// Extra labels merged after name, version and author.
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
}

/// A single operation inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
  /// Run a versioned native build recipe.
  Build(BuildRecipe),
  /// Clone a repository at a pinned revision.
  Fetch(PinnedDependency),
  /// Copy a path from the build context.
  Copy(SourceCopy),
  /// Install interpreted-language packages.
  Install(PackageSet),
  /// Copy artifacts of frozen upstream stages.
  Compose { layers: Vec<LayerCopy> },
  /// Run a setup script once.
  Setup(SetupScript),
}

impl Step {
  /// Short label used in logs and phase tracking.
  pub fn kind(&self) -> &'static str {
    match self {
      Step::Build(_) => "build",
      Step::Fetch(_) => "fetch",
      Step::Copy(_) => "copy",
      Step::Install(_) => "install",
      Step::Compose { .. } => "compose",
      Step::Setup(_) => "setup",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
  pub name: String,
  pub version: String,
  /// Script path relative to the build context.
  pub script: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  /// Image paths removed after every recipe in the stage succeeded.
  #[serde(default)]
  pub scratch: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedDependency {
  pub url: String,
  pub rev: String,
  /// Image path the working tree is written to.
  pub dest: String,
  #[serde(default = "default_true")]
  pub submodules: bool,
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCopy {
  /// Path relative to the build context.
  pub src: String,
  /// Image path inside the stage.
  pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
  /// Installer command; the package argument is appended.
  pub installer: String,
  pub packages: Vec<PackageSpec>,
  /// Build context paths the installer reads, such as a requirements file or
  /// a wrapper script. Installer words naming context files count as well.
  #[serde(default)]
  pub inputs: Vec<String>,
}

/// A package requirement, `name` or `name==version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageSpec {
  pub name: String,
  pub version: Option<String>,
}

impl PackageSpec {
  pub fn is_pinned(&self) -> bool {
    self.version.is_some()
  }
}

impl TryFrom<String> for PackageSpec {
  type Error = String;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl std::str::FromStr for PackageSpec {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim();
    let (name, version) = match s.split_once("==") {
      Some((name, version)) => (name.trim(), Some(version.trim())),
      None => (s, None),
    };
    if name.is_empty() || !name.chars().all(is_package_char) {
      return Err(format!("invalid package name in '{s}'"));
    }
    match version {
      Some("") => Err(format!("empty version in '{s}'")),
      Some(v) if !v.chars().all(is_package_char) => Err(format!("invalid version in '{s}'")),
      Some(v) => Ok(PackageSpec {
        name: name.to_string(),
        version: Some(v.to_string()),
      }),
      None => Ok(PackageSpec {
        name: name.to_string(),
        version: None,
      }),
    }
  }
}

/// Characters allowed in package names and versions. Installers receive the
/// spec as one single-quoted shell word, so quotes and shell syntax are out.
fn is_package_char(c: char) -> bool {
  c.is_ascii_alphanumeric() || "-_.+![]*,~".contains(c)
}

impl From<PackageSpec> for String {
  fn from(spec: PackageSpec) -> Self {
    spec.to_string()
  }
}

impl fmt::Display for PackageSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.version {
      Some(v) => write!(f, "{}=={}", self.name, v),
      None => f.write_str(&self.name),
    }
  }
}

/// Copy of an upstream artifact into the composing stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerCopy {
  pub from: StageName,
  pub src: String,
  /// Destination image path. Defaults to `src`.
  #[serde(default)]
  pub dest: Option<String>,
}

impl LayerCopy {
  pub fn artifact(&self) -> ArtifactRef {
    ArtifactRef {
      stage: self.from.clone(),
      path: self.src.clone(),
    }
  }

  pub fn dest(&self) -> &str {
    self.dest.as_deref().unwrap_or(&self.src)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupScript {
  pub script: String,
  #[serde(default)]
  pub args: Vec<String>,
}

/// A subtree addressed by producing stage and image path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
  pub stage: StageName,
  pub path: String,
}

impl fmt::Display for ArtifactRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.stage, self.path)
  }
}

/// Entry command configuration of the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
  /// Absolute image path of the entry command.
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
  /// Image directories prepended to PATH.
  #[serde(default)]
  pub path: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDef {
  pub name: StageName,
  #[serde(default)]
  pub steps: Vec<Step>,
  /// Declared output paths. Empty means the whole stage root.
  #[serde(default)]
  pub artifacts: Vec<String>,
  /// Stages that must be frozen before this one starts, beyond those implied
  /// by compose layers.
  #[serde(default)]
  pub after: Vec<StageName>,
}

impl StageDef {
  /// Upstream stages referenced by compose steps, in declaration order.
  pub fn layer_sources(&self) -> impl Iterator<Item = &StageName> {
    self.steps.iter().flat_map(|step| match step {
      Step::Compose { layers } => layers.iter().map(|l| &l.from).collect::<Vec<_>>(),
      _ => Vec::new(),
    })
  }
}

/// The `[runtime]` table: a stage plus its entry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDef {
  #[serde(default = "default_runtime_name")]
  pub stage: StageName,
  #[serde(default)]
  pub steps: Vec<Step>,
  #[serde(default)]
  pub after: Vec<StageName>,
  pub entry: EntrySpec,
}

fn default_runtime_name() -> StageName {
  StageName("runtime".to_string())
}

/// Raw plan file as written in `strata.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
  pub image: ImageSpec,
  #[serde(default)]
  pub stages: Vec<StageDef>,
  pub runtime: RuntimeDef,
}

/// A loaded and validated plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
  pub image: ImageSpec,
  /// Every stage, runtime stage last.
  pub stages: Vec<StageDef>,
  pub runtime: StageName,
  pub entry: EntrySpec,
}

impl Plan {
  pub fn stage(&self, name: &StageName) -> Option<&StageDef> {
    self.stages.iter().find(|s| &s.name == name)
  }

  pub fn runtime_stage(&self) -> Option<&StageDef> {
    self.stage(&self.runtime)
  }

  /// Every git dependency in the plan, with its stage.
  pub fn pinned_dependencies(&self) -> impl Iterator<Item = (&StageName, &PinnedDependency)> {
    self.stages.iter().flat_map(|stage| {
      stage.steps.iter().filter_map(move |step| match step {
        Step::Fetch(dep) => Some((&stage.name, dep)),
        _ => None,
      })
    })
  }

  /// Every package without a version pin.
  pub fn floating_packages(&self) -> Vec<&PackageSpec> {
    self
      .stages
      .iter()
      .flat_map(|s| &s.steps)
      .filter_map(|step| match step {
        Step::Install(set) => Some(set.packages.iter().filter(|p| !p.is_pinned())),
        _ => None,
      })
      .flatten()
      .collect()
  }
}
