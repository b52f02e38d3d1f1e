//! Build phase state machine.
//!
//! ```text
//! Defined ─┬─> Fetching ─────────┐
//!          ├─> BuildingBinaries ─┼─> AllUpstreamDone ─> InstallingPackages ─> Composing ─> Ready
//!          └─> StagingSource ────┘
//! ```
//!
//! The three upstream phases run concurrently, so moving between them is
//! allowed. Phases may be skipped forward when a plan has no work for them
//! (e.g. no packages, or every stage cached). `Failed` is reachable from any
//! non-terminal phase. Nothing ever moves backwards and there is no retry.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::plan::Step;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
  Defined,
  Fetching,
  BuildingBinaries,
  StagingSource,
  AllUpstreamDone,
  InstallingPackages,
  Composing,
  Ready,
  Failed,
}

impl BuildPhase {
  pub fn is_terminal(self) -> bool {
    matches!(self, BuildPhase::Ready | BuildPhase::Failed)
  }

  fn is_upstream(self) -> bool {
    matches!(
      self,
      BuildPhase::Fetching | BuildPhase::BuildingBinaries | BuildPhase::StagingSource
    )
  }

  /// Whether `self -> next` is a legal transition.
  pub fn can_transition_to(self, next: BuildPhase) -> bool {
    use BuildPhase::*;

    if self.is_terminal() {
      return false;
    }
    if next == Failed {
      return true;
    }
    match self {
      Defined => next.is_upstream() || matches!(next, AllUpstreamDone),
      Fetching | BuildingBinaries | StagingSource => next.is_upstream() || next == AllUpstreamDone,
      AllUpstreamDone => matches!(next, InstallingPackages | Composing | Ready),
      InstallingPackages => matches!(next, Composing | Ready),
      Composing => next == Ready,
      Ready | Failed => false,
    }
  }

  /// Phase a step moves the build into, if any.
  ///
  /// Runtime steps drive the post-upstream phases. Upstream compose and setup
  /// steps have no phase of their own.
  pub fn for_step(step: &Step, runtime: bool) -> Option<BuildPhase> {
    match (step, runtime) {
      (Step::Install(_), true) => Some(BuildPhase::InstallingPackages),
      (_, true) => Some(BuildPhase::Composing),
      (Step::Fetch(_), false) => Some(BuildPhase::Fetching),
      (Step::Build(_), false) => Some(BuildPhase::BuildingBinaries),
      (Step::Copy(_), false) => Some(BuildPhase::StagingSource),
      _ => None,
    }
  }
}

impl fmt::Display for BuildPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BuildPhase::Defined => "defined",
      BuildPhase::Fetching => "fetching",
      BuildPhase::BuildingBinaries => "building binaries",
      BuildPhase::StagingSource => "staging source",
      BuildPhase::AllUpstreamDone => "all upstream done",
      BuildPhase::InstallingPackages => "installing packages",
      BuildPhase::Composing => "composing",
      BuildPhase::Ready => "ready",
      BuildPhase::Failed => "failed",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal phase transition: {from} -> {to}")]
pub struct PhaseError {
  pub from: BuildPhase,
  pub to: BuildPhase,
}

/// Current phase plus every phase entered so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseMachine {
  current: BuildPhase,
  history: Vec<BuildPhase>,
}

impl Default for PhaseMachine {
  fn default() -> Self {
    Self::new()
  }
}

impl PhaseMachine {
  pub fn new() -> Self {
    Self {
      current: BuildPhase::Defined,
      history: vec![BuildPhase::Defined],
    }
  }

  pub fn current(&self) -> BuildPhase {
    self.current
  }

  pub fn history(&self) -> &[BuildPhase] {
    &self.history
  }

  /// Enter `next`. Re-entering the current phase is a no-op.
  pub fn advance(&mut self, next: BuildPhase) -> Result<(), PhaseError> {
    if next == self.current {
      return Ok(());
    }
    if !self.current.can_transition_to(next) {
      return Err(PhaseError {
        from: self.current,
        to: next,
      });
    }
    self.current = next;
    self.history.push(next);
    Ok(())
  }

  /// Enter `Failed` unless already terminal.
  pub fn fail(&mut self) {
    if !self.current.is_terminal() {
      self.current = BuildPhase::Failed;
      self.history.push(BuildPhase::Failed);
    }
  }
}
