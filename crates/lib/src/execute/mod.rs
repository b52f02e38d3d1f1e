//! Plan execution.
//!
//! This module provides the entry points for building a plan. It handles:
//! - Stage keys and cache reuse
//! - Wave-ordered parallel execution of independent stages
//! - Fail-fast cancellation and skip tracking
//! - Build phase tracking, lock file updates and the build record

pub mod key;
pub mod phase;
mod realize;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BuildConfig;
use crate::graph::{GraphError, StageGraph};
use crate::manifest::RuntimeManifest;
use crate::plan::{ImageVars, Plan, StageName, load_plan};
use crate::stage::lock::lock_path_for;
use crate::stage::{LockFile, StageError, StepOutcome};
use crate::store::{BuildRecord, FrozenStage, StageStore};

use phase::PhaseMachine;
use realize::{StageJob, realize_stage};

pub use key::stage_keys;
pub use phase::{BuildPhase, PhaseError};
pub use types::{BuildReport, ExecuteError, SkipReason, StageFailure, StageResult};

/// Load the plan at `plan_path`, build it and update its lock file.
///
/// The lock file sits next to the plan and is rewritten only when this build
/// fetched something new.
pub async fn build(
  plan_path: &Path,
  config: &BuildConfig,
  cancel: CancellationToken,
) -> Result<BuildReport, ExecuteError> {
  let plan = load_plan(plan_path, config)?;
  let lock_path = lock_path_for(plan_path);
  let lock = LockFile::load(&lock_path)?.unwrap_or_default();

  let report = execute_plan(&plan, config, &lock, cancel).await?;

  if report.lock_changed {
    report.lock.save(&lock_path)?;
    info!(path = ?lock_path, "lock file updated");
  }
  Ok(report)
}

/// Execute every stage of `plan`.
///
/// Stages run in waves: a stage starts only once every upstream stage is
/// frozen. Within a wave, stages run concurrently up to
/// `config.parallelism`. The first failure cancels the stages still running,
/// and every stage that has not started is skipped.
///
/// Stage failures are reported in [`BuildReport::failed`]; the `Err` variant
/// is reserved for problems that prevent execution from starting.
pub async fn execute_plan(
  plan: &Plan,
  config: &BuildConfig,
  lock: &LockFile,
  cancel: CancellationToken,
) -> Result<BuildReport, ExecuteError> {
  let started = Instant::now();
  let config = config
    .clone()
    .with_absolute_paths()
    .map_err(ExecuteError::WorkingDirectory)?;
  let config = &config;
  let graph = StageGraph::from_plan(plan)?;
  let waves = execution_waves(plan, &graph)?;
  let keys = stage_keys(plan, &graph, config, lock)?;
  let store = StageStore::new(config);

  info!(
    image = %plan.image.name,
    stages = graph.len(),
    waves = waves.len(),
    parallelism = config.parallelism,
    "starting build"
  );
  warn_floating(plan);

  let plan = Arc::new(plan.clone());
  let shared_config = Arc::new(config.clone());
  let shared_lock = Arc::new(lock.clone());
  let vars = Arc::new(ImageVars::of(&plan.image));
  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));
  // Child token: fail-fast cancels siblings without touching the caller's token.
  let cancel = cancel.child_token();
  let (phase_tx, mut phase_rx) = mpsc::unbounded_channel();

  let mut phases = PhaseMachine::new();
  let mut frozen: BTreeMap<StageName, StageResult> = BTreeMap::new();
  let mut failed = None;
  let mut cancelled: Vec<StageName> = Vec::new();
  let mut skipped: BTreeMap<StageName, SkipReason> = BTreeMap::new();

  for (wave_idx, wave) in waves.iter().enumerate() {
    if failed.is_some() || !cancelled.is_empty() || cancel.is_cancelled() {
      skip_remaining(&waves[wave_idx..], &graph, &frozen, &mut skipped);
      break;
    }

    if wave.contains(&plan.runtime) {
      advance(&mut phases, BuildPhase::AllUpstreamDone);
    }
    debug!(wave = wave_idx, stages = ?wave, "executing wave");

    let mut join_set = JoinSet::new();
    let mut pending: BTreeSet<StageName> = BTreeSet::new();
    for name in wave {
      let Some(key) = keys.get(name) else {
        continue;
      };
      let upstream: BTreeMap<StageName, FrozenStage> = graph
        .dependencies(name)
        .into_iter()
        .filter_map(|dep| frozen.get(&dep).map(|r| (dep, r.frozen.clone())))
        .collect();

      let job = StageJob {
        plan: plan.clone(),
        config: shared_config.clone(),
        lock: shared_lock.clone(),
        vars: vars.clone(),
        store: store.clone(),
        name: name.clone(),
        key: key.clone(),
        upstream,
        cancel: cancel.clone(),
        phases: phase_tx.clone(),
      };
      let semaphore = semaphore.clone();
      let task_cancel = cancel.clone();
      let stage = name.clone();

      pending.insert(name.clone());
      join_set.spawn(async move {
        let permit = tokio::select! {
          permit = semaphore.acquire_owned() => permit.map_err(|e| ExecuteError::Task {
            stage: stage.clone(),
            message: e.to_string(),
          }),
          _ = task_cancel.cancelled() => Err(StageError::Cancelled(stage.clone()).into()),
        };
        let result = match permit {
          Ok(_permit) => realize_stage(job).await,
          Err(e) => Err(e),
        };
        (stage, result)
      });
    }

    let mut panicked = None;
    loop {
      tokio::select! {
        Some(phase) = phase_rx.recv() => advance(&mut phases, phase),
        joined = join_set.join_next() => {
          let Some(joined) = joined else { break };
          let (name, result) = match joined {
            Ok(done) => done,
            Err(e) => {
              error!(error = %e, "stage task panicked");
              cancel.cancel();
              panicked = Some(e.to_string());
              continue;
            }
          };
          pending.remove(&name);

          match result {
            Ok(result) => {
              info!(stage = %name, cached = result.cached, duration = ?result.duration(), "stage frozen");
              frozen.insert(name, result);
            }
            Err(e) if e.is_cancelled() => {
              warn!(stage = %name, "stage cancelled");
              cancelled.push(name);
            }
            Err(e) => {
              error!(stage = %name, error = %e, "stage failed");
              cancel.cancel();
              record_failure(&mut failed, &store, name, e);
            }
          }
        }
      }
    }
    // Only a panicked task leaves its stage pending.
    if let Some(message) = panicked {
      for name in pending {
        let error = ExecuteError::Task {
          stage: name.clone(),
          message: message.clone(),
        };
        record_failure(&mut failed, &store, name, error);
      }
    }
    while let Ok(phase) = phase_rx.try_recv() {
      advance(&mut phases, phase);
    }
  }

  let mut manifest = None;
  let success = failed.is_none() && cancelled.is_empty() && skipped.is_empty() && frozen.len() == keys.len();
  if success {
    if let Some(runtime) = frozen.get(&plan.runtime) {
      manifest = Some(RuntimeManifest::read(&runtime.frozen.dir)?);
    }
    store.write_record(&BuildRecord {
      image: plan.image.name.clone(),
      runtime: plan.runtime.clone(),
      stages: frozen.iter().map(|(n, r)| (n.clone(), r.frozen.dir.clone())).collect(),
    })?;
    advance(&mut phases, BuildPhase::Ready);
  } else {
    phases.fail();
  }

  let (lock, lock_changed) = updated_lock(lock, &frozen);

  let report = BuildReport {
    image: plan.image.name.clone(),
    runtime: plan.runtime.clone(),
    phase: phases.current(),
    history: phases.history().to_vec(),
    keys,
    waves,
    stages: frozen,
    failed,
    cancelled,
    skipped,
    manifest,
    lock,
    lock_changed,
    duration: started.elapsed(),
  };

  info!(
    image = %report.image,
    phase = %report.phase,
    built = report.built(),
    cached = report.cached(),
    skipped = report.skipped.len(),
    duration = ?report.duration,
    "build finished"
  );
  Ok(report)
}

/// Execution waves of `plan`, with the runtime stage alone in the last wave.
///
/// The runtime stage has no dependents, so moving it after every other stage
/// never breaks an edge.
pub fn execution_waves(plan: &Plan, graph: &StageGraph) -> Result<Vec<Vec<StageName>>, GraphError> {
  let mut waves = graph.waves()?;
  for wave in &mut waves {
    wave.retain(|name| name != &plan.runtime);
  }
  waves.retain(|wave| !wave.is_empty());
  waves.push(vec![plan.runtime.clone()]);
  Ok(waves)
}

fn record_failure(failed: &mut Option<StageFailure>, store: &StageStore, stage: StageName, error: ExecuteError) {
  if failed.is_some() {
    warn!(stage = %stage, error = %error, "additional stage failure after abort");
    return;
  }
  let log = store.log_path(&stage);
  *failed = Some(StageFailure { stage, error, log });
}

fn advance(phases: &mut PhaseMachine, next: BuildPhase) {
  if let Err(e) = phases.advance(next) {
    warn!(error = %e, "ignoring phase change");
  }
}

fn warn_floating(plan: &Plan) {
  let floating: Vec<String> = plan.floating_packages().iter().map(|p| p.to_string()).collect();
  if !floating.is_empty() {
    warn!(
      mode = %plan.image.mode,
      packages = %floating.join(", "),
      "plan has unpinned packages"
    );
  }
}

/// Record every stage in `waves` as skipped, naming a failed upstream stage
/// when there is one.
fn skip_remaining(
  waves: &[Vec<StageName>],
  graph: &StageGraph,
  frozen: &BTreeMap<StageName, StageResult>,
  skipped: &mut BTreeMap<StageName, SkipReason>,
) {
  for name in waves.iter().flatten() {
    let failed_dep = graph
      .dependencies(name)
      .into_iter()
      .find(|dep| !frozen.contains_key(dep));
    let reason = match failed_dep {
      Some(dep) => SkipReason::DependencyFailed(dep),
      None => SkipReason::Aborted,
    };
    warn!(stage = %name, reason = %reason, "skipping stage");
    skipped.insert(name.clone(), reason);
  }
}

/// Merge lock entries for every dependency fetched in this build.
fn updated_lock(lock: &LockFile, frozen: &BTreeMap<StageName, StageResult>) -> (LockFile, bool) {
  let mut lock = lock.clone();
  let mut changed = false;
  for result in frozen.values() {
    for outcome in &result.outcomes {
      if let StepOutcome::Fetched(fetched) = outcome {
        changed |= lock.insert(fetched.to_locked());
      }
    }
  }
  (lock, changed)
}
