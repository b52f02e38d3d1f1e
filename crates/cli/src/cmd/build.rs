//! Implementation of the `strata build` command.
//!
//! Builds every stage of a plan, holding the store exclusively, and prints a
//! summary. Ctrl-C or `--timeout` cancels the stages still running.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use strata_lib::execute::{BuildPhase, BuildReport, build};
use strata_lib::manifest::RuntimeManifest;
use strata_lib::stage::cmd::log_tail;
use strata_lib::store::{LockMode, StoreLock};

use super::{GlobalOpts, read_plan};
use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_stat, print_success, print_warning,
  symbols, truncate_hash,
};

const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Serialize)]
struct BuildSummary {
  image: String,
  phase: BuildPhase,
  success: bool,
  duration_ms: u128,
  stages: Vec<StageSummary>,
  cancelled: Vec<String>,
  skipped: Vec<SkippedSummary>,
  failed: Option<FailureSummary>,
  manifest: Option<RuntimeManifest>,
}

#[derive(Debug, Serialize)]
struct StageSummary {
  name: String,
  key: String,
  cached: bool,
  duration_ms: u128,
  path: PathBuf,
}

#[derive(Debug, Serialize)]
struct SkippedSummary {
  name: String,
  reason: String,
}

#[derive(Debug, Serialize)]
struct FailureSummary {
  stage: String,
  error: String,
  log: PathBuf,
}

impl From<&BuildReport> for BuildSummary {
  fn from(report: &BuildReport) -> Self {
    Self {
      image: report.image.clone(),
      phase: report.phase,
      success: report.is_success(),
      duration_ms: report.duration.as_millis(),
      stages: report
        .stages
        .iter()
        .map(|(name, result)| StageSummary {
          name: name.to_string(),
          key: result.frozen.key.0.clone(),
          cached: result.cached,
          duration_ms: result.duration().as_millis(),
          path: result.frozen.dir.clone(),
        })
        .collect(),
      cancelled: report.cancelled.iter().map(|s| s.to_string()).collect(),
      skipped: report
        .skipped
        .iter()
        .map(|(name, reason)| SkippedSummary {
          name: name.to_string(),
          reason: reason.to_string(),
        })
        .collect(),
      failed: report.failed.as_ref().map(|f| FailureSummary {
        stage: f.stage.to_string(),
        error: f.error.to_string(),
        log: f.log.clone(),
      }),
      manifest: report.manifest.clone(),
    }
  }
}

/// Execute the build command.
///
/// Exits non-zero when any stage fails or the build is cancelled.
pub fn cmd_build(
  plan_path: &Path,
  opts: &GlobalOpts,
  validate_entry: bool,
  timeout: Option<Duration>,
  output: OutputFormat,
) -> Result<()> {
  let mut config = opts.config(Some(plan_path));
  config.validate_entry = validate_entry;
  // Fail on a bad plan before touching the store.
  read_plan(plan_path, &config)?;

  let _lock = StoreLock::acquire(&config.store, LockMode::Exclusive, "build").context("Failed to acquire store lock")?;

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());
    if let Some(timeout) = timeout {
      let cancel = cancel.clone();
      tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        warn!(timeout = ?timeout, "build timed out");
        cancel.cancel();
      });
    }
    build(plan_path, &config, cancel).await
  });
  let report = report.context("Build failed")?;

  if output.is_json() {
    print_json(&BuildSummary::from(&report))?;
  } else {
    print_report(&report);
  }

  if !report.is_success() {
    bail!("Build of '{}' did not complete", report.image);
  }
  Ok(())
}

fn watch_interrupt(cancel: CancellationToken) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, cancelling build");
      cancel.cancel();
    }
  });
}

fn print_report(report: &BuildReport) {
  println!();
  for (name, result) in &report.stages {
    let status = if result.cached { "cached" } else { "built" };
    println!(
      "  {} {} {} {}",
      symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
      name,
      truncate_hash(&result.frozen.key.0).if_supports_color(Stream::Stdout, |s| s.dimmed()),
      format!("({status}, {})", format_duration(result.duration())).if_supports_color(Stream::Stdout, |s| s.dimmed()),
    );
  }
  for name in &report.cancelled {
    print_warning(&format!("{name}: cancelled"));
  }
  for (name, reason) in &report.skipped {
    print_info(&format!("{name}: skipped ({reason})"));
  }

  if let Some(failure) = &report.failed {
    println!();
    print_error(&format!("Stage '{}' failed: {}", failure.stage, failure.error));
    if let Some(tail) = log_tail(&failure.log, LOG_TAIL_LINES) {
      eprintln!("{}", format!("--- {} ---", failure.log.display()).if_supports_color(Stream::Stderr, |s| s.dimmed()));
      eprintln!("{tail}");
    }
    return;
  }
  if !report.is_success() {
    print_warning("Build cancelled");
    return;
  }

  println!();
  print_success(&format!("Built {}", report.image));
  print_stat("Stages built", &report.built().to_string());
  print_stat("Stages cached", &report.cached().to_string());
  if let Some(runtime) = report.runtime_stage() {
    print_stat("Runtime", &runtime.frozen.root().display().to_string());
  }
  if report.lock_changed {
    print_stat("Lock file", "updated");
  }
  print_stat("Duration", &format_duration(report.duration));
}
