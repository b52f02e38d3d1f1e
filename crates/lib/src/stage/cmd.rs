//! Isolated command execution for stage steps.
//!
//! Commands never inherit the caller's environment:
//! - All environment variables are cleared
//! - PATH is the configured sandbox PATH
//! - HOME points at a nonexistent directory
//! - TMPDIR/TMP/TEMP/TEMPDIR point at the stage's private tmp directory
//! - `out` and `STRATA_OUT` point at the host directory of the stage filesystem
//! - Locale and SOURCE_DATE_EPOCH are fixed
//!
//! Output of every command is appended to the stage log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ENV_BASE_DIR;
use crate::consts::SOURCE_DATE_EPOCH;

use super::StageContext;

#[derive(Debug, Error)]
pub enum CmdError {
  #[error("failed to start '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("command failed with exit code {code:?}: {cmd}")]
  Failed { cmd: String, code: Option<i32> },

  #[error("command cancelled: {0}")]
  Cancelled(String),

  #[error("failed to write log {path}: {source}")]
  Log {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
  /// A command line interpreted by the shell.
  Shell(String),
  /// A script file run by the shell with positional arguments.
  Script { path: PathBuf, args: Vec<String> },
  /// A program run directly, looked up on the sandbox PATH.
  Program { program: String, args: Vec<String> },
}

impl Invocation {
  fn display(&self) -> String {
    match self {
      Invocation::Shell(cmd) => cmd.clone(),
      Invocation::Script { path, args } => join_display(&path.display().to_string(), args),
      Invocation::Program { program, args } => join_display(program, args),
    }
  }
}

fn join_display(head: &str, args: &[String]) -> String {
  std::iter::once(head.to_string())
    .chain(args.iter().cloned())
    .collect::<Vec<_>>()
    .join(" ")
}

/// Run `invocation` inside the stage sandbox.
///
/// `env` is merged over the isolated environment. Returns trimmed stdout.
pub async fn execute_cmd(
  ctx: &StageContext<'_>,
  invocation: &Invocation,
  env: &BTreeMap<String, String>,
  cwd: Option<&Path>,
) -> Result<String, CmdError> {
  let shown = invocation.display();
  info!(stage = %ctx.stage, cmd = %shown, "executing command");

  let (shell_cmd, shell_args) = get_shell(ctx.config.shell.as_deref());
  let mut command = match invocation {
    Invocation::Shell(cmd) => {
      let mut c = Command::new(&shell_cmd);
      c.args(&shell_args).arg(cmd);
      c
    }
    Invocation::Script { path, args } => {
      let mut c = Command::new(&shell_cmd);
      c.arg(path).args(args);
      c
    }
    Invocation::Program { program, args } => {
      let mut c = Command::new(program);
      c.args(args);
      c
    }
  };

  let working_dir = cwd.unwrap_or(&ctx.config.context);
  command
    .current_dir(working_dir)
    .env_clear()
    .env("PATH", &ctx.config.sandbox_path)
    .env("HOME", "/homeless-shelter")
    .env("TMPDIR", &ctx.tmp)
    .env("TMP", &ctx.tmp)
    .env("TEMP", &ctx.tmp)
    .env("TEMPDIR", &ctx.tmp)
    .env("out", &ctx.root)
    .env("STRATA_OUT", &ctx.root)
    .env(ENV_BASE_DIR, &ctx.vars.base)
    .env("STRATA_VERSION", &ctx.vars.version)
    .env("STRATA_IMAGE", &ctx.vars.name)
    .env("LANG", "C")
    .env("LC_ALL", "C")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .envs(env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  debug!(shell = %shell_cmd, working_dir = ?working_dir, "spawning process");

  let program = match invocation {
    Invocation::Program { program, .. } => program.clone(),
    _ => shell_cmd.clone(),
  };
  let child = command.spawn().map_err(|e| CmdError::Spawn { program, source: e })?;

  // Dropping the wait future on cancellation kills the child.
  let output = tokio::select! {
    output = child.wait_with_output() => output.map_err(|e| CmdError::Spawn {
      program: shell_cmd.clone(),
      source: e,
    })?,
    _ = ctx.cancel.cancelled() => {
      append_log(&ctx.log, &shown, b"", b"cancelled\n").await?;
      return Err(CmdError::Cancelled(shown));
    }
  };

  append_log(&ctx.log, &shown, &output.stdout, &output.stderr).await?;

  if !output.status.success() {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }
    return Err(CmdError::Failed {
      cmd: shown,
      code: output.status.code(),
    });
  }

  let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }
  Ok(stdout)
}

async fn append_log(path: &Path, cmd: &str, stdout: &[u8], stderr: &[u8]) -> Result<(), CmdError> {
  let log_err = |e: std::io::Error| CmdError::Log {
    path: path.to_path_buf(),
    source: e,
  };
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await.map_err(log_err)?;
  }
  let mut file = tokio::fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .await
    .map_err(log_err)?;
  file.write_all(format!("$ {cmd}\n").as_bytes()).await.map_err(log_err)?;
  file.write_all(stdout).await.map_err(log_err)?;
  file.write_all(stderr).await.map_err(log_err)?;
  file.flush().await.map_err(log_err)
}

/// Shell and the argument that introduces a command string.
///
/// Defaults to `/bin/sh`, never `$SHELL`: interactive shells may source
/// profile files that change the environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  match override_shell {
    Some(shell) => (shell.to_string(), vec!["-c".to_string()]),
    None => ("/bin/sh".to_string(), vec!["-c".to_string()]),
  }
}

/// Read the last `lines` lines of a stage log.
pub fn log_tail(path: &Path, lines: usize) -> Option<String> {
  let content = std::fs::read_to_string(path).ok()?;
  let all: Vec<&str> = content.lines().collect();
  let start = all.len().saturating_sub(lines);
  Some(all[start..].join("\n"))
}
