//! CLI smoke tests for strata.
//!
//! These tests verify that all CLI commands run without panicking and
//! return appropriate exit codes.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Get a Command for the strata binary.
fn strata_cmd() -> Command {
  cargo_bin_cmd!("strata")
}

/// Create a temp directory with a plan file.
fn temp_plan(content: &str) -> TempDir {
  let temp = TempDir::new().unwrap();
  std::fs::write(temp.path().join("strata.toml"), content).unwrap();
  temp
}

/// Runtime-only plan that copies a single script.
const MINIMAL_PLAN: &str = r#"
[image]
name = "hello"
version = "0.1.0"
base = "python:3.10"
base_dir = "/opt/hello"

[runtime]
[[runtime.steps]]
op = "copy"
src = "run.sh"
dest = "$${base}/run.sh"
[runtime.entry]
command = "$${base}/run.sh"
"#;

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  strata_cmd()
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  strata_cmd()
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("strata"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["build", "plan", "inspect", "run", "clean"] {
    strata_cmd()
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// plan
// =============================================================================

#[test]
#[serial]
fn plan_with_minimal_plan() {
  let temp = temp_plan(MINIMAL_PLAN);
  std::fs::write(temp.path().join("run.sh"), "#!/bin/sh\n").unwrap();

  strata_cmd()
    .arg("plan")
    .arg(temp.path().join("strata.toml"))
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Wave 1"))
    .stdout(predicate::str::contains("runtime"));
}

#[test]
#[serial]
fn plan_nonexistent_file_fails() {
  let temp = TempDir::new().unwrap();

  strata_cmd()
    .arg("plan")
    .arg("/nonexistent/path/strata.toml")
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Plan file not found"));
}

// =============================================================================
// build
// =============================================================================

#[test]
#[serial]
fn build_minimal_plan() {
  let temp = temp_plan(MINIMAL_PLAN);
  std::fs::write(temp.path().join("run.sh"), "#!/bin/sh\n").unwrap();

  strata_cmd()
    .arg("build")
    .arg(temp.path().join("strata.toml"))
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Built hello"));

  strata_cmd().arg("clean").arg("--force").arg("--store").arg(temp.path().join("store")).assert().success();
}

#[test]
#[serial]
fn build_nonexistent_file_fails() {
  let temp = TempDir::new().unwrap();

  strata_cmd()
    .arg("build")
    .arg("/nonexistent/path/strata.toml")
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .failure();
}

// =============================================================================
// clean
// =============================================================================

#[test]
#[serial]
fn clean_without_store_succeeds() {
  let temp = TempDir::new().unwrap();

  strata_cmd()
    .arg("clean")
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .success()
    .stdout(predicate::str::contains("Nothing to clean"));
}

// =============================================================================
// Error Handling
// =============================================================================

#[test]
#[serial]
fn invalid_toml_fails() {
  let temp = temp_plan("this is not valid toml {{{");

  strata_cmd()
    .arg("plan")
    .arg(temp.path().join("strata.toml"))
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to load plan"));
}

#[test]
#[serial]
fn missing_runtime_table_fails() {
  let temp = temp_plan(
    r#"
[image]
name = "hello"
version = "0.1.0"
base = "python:3.10"
base_dir = "/opt/hello"
"#,
  );

  strata_cmd()
    .arg("build")
    .arg(temp.path().join("strata.toml"))
    .arg("--store")
    .arg(temp.path().join("store"))
    .assert()
    .failure();
}
