//! Stage keys.
//!
//! A stage key hashes everything a stage's output may depend on: its own
//! definition, the image values substituted into it, the keys of its upstream
//! stages, the content of every build context entry it reads, the lock
//! entries of its fetches, and the command sandbox. Equal keys mean a frozen
//! stage can be reused as is.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::trace;

use crate::config::{BuildConfig, DependencyMode};
use crate::graph::StageGraph;
use crate::plan::{EntrySpec, ImageSpec, PackageSet, Plan, StageDef, StageName, Step};
use crate::stage::fetch::is_commit_id;
use crate::stage::{LockFile, lock::lock_key};
use crate::util::hash::{Hashable, ObjectHash, hash_path};

use super::types::ExecuteError;

const KEY_VERSION: u32 = 1;

/// Fingerprint recorded for a context entry that does not exist.
const MISSING: &str = "missing";

#[derive(Serialize)]
struct StageKeyInput<'a> {
  version: u32,
  stage: &'a StageDef,
  base_dir: &'a str,
  image_version: &'a str,
  image_name: &'a str,
  mode: DependencyMode,
  upstream: BTreeMap<&'a StageName, &'a ObjectHash>,
  inputs: BTreeMap<String, String>,
  pins: BTreeMap<String, String>,
  sandbox_path: &'a str,
  shell: Option<&'a str>,
  runtime: Option<RuntimeKeyInput<'a>>,
}

/// Extra inputs of the runtime stage, which also writes the manifest.
#[derive(Serialize)]
struct RuntimeKeyInput<'a> {
  image: &'a ImageSpec,
  entry: &'a EntrySpec,
  validate_entry: bool,
}

impl Hashable for StageKeyInput<'_> {}

/// Compute the key of every stage, upstream first.
pub fn stage_keys(
  plan: &Plan,
  graph: &StageGraph,
  config: &BuildConfig,
  lock: &LockFile,
) -> Result<BTreeMap<StageName, ObjectHash>, ExecuteError> {
  let mut keys: BTreeMap<StageName, ObjectHash> = BTreeMap::new();

  for name in graph.topological_order()? {
    let Some(stage) = plan.stage(&name) else {
      continue;
    };
    let deps = graph.dependencies(&name);
    let upstream = deps
      .iter()
      .filter_map(|dep| keys.get(dep).map(|key| (dep, key)))
      .collect();

    let input = StageKeyInput {
      version: KEY_VERSION,
      stage,
      base_dir: &plan.image.base_dir,
      image_version: &plan.image.version,
      image_name: &plan.image.name,
      mode: plan.image.mode,
      upstream,
      inputs: context_fingerprints(stage, config),
      pins: pins(stage, lock),
      sandbox_path: &config.sandbox_path,
      shell: config.shell.as_deref(),
      runtime: (name == plan.runtime).then_some(RuntimeKeyInput {
        image: &plan.image,
        entry: &plan.entry,
        validate_entry: config.validate_entry,
      }),
    };

    let key = input.compute_hash().map_err(|e| ExecuteError::Key {
      stage: name.clone(),
      source: e,
    })?;
    trace!(stage = %name, key = %key, "computed stage key");
    keys.insert(name, key);
  }

  Ok(keys)
}

/// Content hashes of the build context entries a stage reads.
fn context_fingerprints(stage: &StageDef, config: &BuildConfig) -> BTreeMap<String, String> {
  let paths = stage.steps.iter().flat_map(|step| match step {
    Step::Build(recipe) => vec![recipe.script.clone()],
    Step::Copy(copy) => vec![copy.src.clone()],
    Step::Setup(setup) => vec![setup.script.clone()],
    Step::Install(set) => installer_inputs(set, config),
    _ => Vec::new(),
  });

  paths
    .map(|relative| {
      let fingerprint = hash_path(&config.context.join(&relative), &[".git"])
        .map(|h| h.0)
        .unwrap_or_else(|_| MISSING.to_string());
      (relative, fingerprint)
    })
    .collect()
}

/// Declared installer inputs plus installer words that name context entries,
/// e.g. the script in `sh scripts/pip.sh`.
fn installer_inputs(set: &PackageSet, config: &BuildConfig) -> Vec<String> {
  let named = set
    .installer
    .split_whitespace()
    .filter(|word| !word.starts_with('-') && !word.starts_with('/'))
    .filter(|word| config.context.join(word).exists())
    .map(str::to_string);
  set.inputs.iter().cloned().chain(named).collect()
}

/// Locked commit and tree of every floating fetch in the stage.
///
/// A full commit id already pins its content through the stage definition.
fn pins(stage: &StageDef, lock: &LockFile) -> BTreeMap<String, String> {
  stage
    .steps
    .iter()
    .filter_map(|step| match step {
      Step::Fetch(dep) if !is_commit_id(&dep.rev) => lock
        .get(&dep.url, &dep.rev)
        .map(|locked| (lock_key(&dep.url, &dep.rev), format!("{}:{}", locked.commit, locked.tree_hash))),
      _ => None,
    })
    .collect()
}
