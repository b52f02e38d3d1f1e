//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Plan with one upstream stage and a runtime that composes it.
pub const HELLO_PLAN: &str = r#"
[image]
name = "hello"
version = "0.1.0"
author = "hello developers"
base = "python:3.10"
base_dir = "/opt/hello"

[[stages]]
name = "tools"
[[stages.steps]]
op = "build"
name = "greeter"
version = "1"
script = "scripts/build_greeter.sh"

[runtime]
stage = "hello"
[[runtime.steps]]
op = "compose"
layers = [{ from = "tools", src = "$${base}/bin" }]
[runtime.entry]
command = "$${base}/bin/greet"
args = ["--from-manifest"]
path = ["$${base}/bin"]
env = { HELLO_VERSION = "$${version}" }
"#;

const GREETER: &str = r#"#!/bin/sh
set -e
mkdir -p "$out$STRATA_BASE_DIR/bin"
cat > "$out$STRATA_BASE_DIR/bin/greet" <<'SCRIPT'
#!/bin/sh
echo "hello $HELLO_VERSION $*"
exit "${GREET_EXIT:-0}"
SCRIPT
chmod +x "$out$STRATA_BASE_DIR/bin/greet"
"#;

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the build context and
/// the store.
pub struct TestEnv {
  pub temp: TempDir,
  pub plan_path: PathBuf,
}

impl TestEnv {
  /// Context with `HELLO_PLAN` and its build script.
  pub fn hello() -> Self {
    let env = Self::empty();
    env.write_file("strata.toml", HELLO_PLAN);
    env.write_file("scripts/build_greeter.sh", GREETER);
    env
  }

  /// Create an empty test environment.
  pub fn empty() -> Self {
    let temp = TempDir::new().unwrap();
    let plan_path = temp.path().join("strata.toml");
    Self { temp, plan_path }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  /// Store path (isolated per test).
  pub fn store_path(&self) -> PathBuf {
    self.temp.path().join("store")
  }

  /// Get a pre-configured Command for the strata binary.
  ///
  /// Points `STRATA_STORE` at the isolated store and clears the other
  /// `STRATA_*` overrides.
  pub fn strata_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("strata");
    cmd.env("STRATA_STORE", self.store_path());
    cmd.env_remove("STRATA_BASE_DIR");
    cmd.env_remove("STRATA_CONTEXT");
    cmd.env_remove("RUST_LOG");
    cmd
  }

  /// Build the plan and assert success.
  pub fn build(&self) {
    self.strata_cmd().arg("build").arg(&self.plan_path).assert().success();
  }
}

impl Drop for TestEnv {
  fn drop(&mut self) {
    // Frozen stages are write-protected; let the CLI remove them.
    if self.store_path().exists() {
      let _ = self.strata_cmd().args(["clean", "--force"]).output();
    }
  }
}
