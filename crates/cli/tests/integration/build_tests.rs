use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn build_reports_built_then_cached_stages() {
  let env = TestEnv::hello();

  env
    .strata_cmd()
    .arg("build")
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Built hello"))
    .stdout(predicate::str::contains("Stages built: 2"));

  env
    .strata_cmd()
    .arg("build")
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Stages cached: 2"));
}

#[test]
fn no_cache_rebuilds_every_stage() {
  let env = TestEnv::hello();
  env.build();

  env
    .strata_cmd()
    .args(["build", "--no-cache"])
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Stages built: 2"));
}

#[test]
fn failing_stage_exits_non_zero_with_log_tail() {
  let env = TestEnv::hello();
  env.write_file(
    "scripts/build_greeter.sh",
    "#!/bin/sh\necho compiling greeter\necho 'greeter.c: syntax error' >&2\nexit 3\n",
  );

  env
    .strata_cmd()
    .arg("build")
    .arg(&env.plan_path)
    .assert()
    .failure()
    .stdout(predicate::str::contains("hello: skipped"))
    .stderr(predicate::str::contains("Stage 'tools' failed"))
    .stderr(predicate::str::contains("greeter.c: syntax error"));
}

#[test]
fn json_output_is_valid() {
  let env = TestEnv::hello();

  let output = env
    .strata_cmd()
    .args(["build", "-o", "json"])
    .arg(&env.plan_path)
    .output()
    .unwrap();
  assert!(output.status.success());

  let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(summary["image"], "hello");
  assert_eq!(summary["phase"], "ready");
  assert_eq!(summary["success"], true);
  assert_eq!(summary["stages"].as_array().unwrap().len(), 2);
  assert_eq!(summary["manifest"]["entry"]["command"], "/opt/hello/bin/greet");
}

#[test]
fn missing_entry_fails_only_with_validation() {
  let env = TestEnv::hello();
  env.write_file("scripts/build_greeter.sh", "#!/bin/sh\nmkdir -p \"$out$STRATA_BASE_DIR/bin\"\n");

  env.build();

  env
    .strata_cmd()
    .args(["build", "--validate-entry"])
    .arg(&env.plan_path)
    .assert()
    .failure()
    .stderr(predicate::str::contains("entry command /opt/hello/bin/greet not found"));
}

#[test]
fn timeout_cancels_the_build() {
  let env = TestEnv::hello();
  env.write_file("scripts/build_greeter.sh", "#!/bin/sh\nsleep 30\n");

  env
    .strata_cmd()
    .args(["build", "--timeout", "1s"])
    .arg(&env.plan_path)
    .timeout(std::time::Duration::from_secs(20))
    .assert()
    .failure()
    .stderr(predicate::str::contains("tools: cancelled"));
}

#[test]
fn plan_shows_cache_status_and_floating_packages() {
  let env = TestEnv::hello();
  env.write_file(
    "strata.toml",
    &super::common::HELLO_PLAN.replace(
      "[[runtime.steps]]\nop = \"compose\"",
      "[[runtime.steps]]\nop = \"install\"\ninstaller = \"true\"\npackages = [\"numpy\"]\n[[runtime.steps]]\nop = \"compose\"",
    ),
  );

  env
    .strata_cmd()
    .arg("plan")
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("(build)"))
    .stderr(predicate::str::contains("Floating dependencies: numpy"));

  env.build();

  env
    .strata_cmd()
    .arg("plan")
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("(cached)"));
}

#[test]
fn pinned_flag_rejects_floating_packages() {
  let env = TestEnv::hello();
  env.write_file(
    "strata.toml",
    &super::common::HELLO_PLAN.replace(
      "[[runtime.steps]]\nop = \"compose\"",
      "[[runtime.steps]]\nop = \"install\"\ninstaller = \"true\"\npackages = [\"numpy\"]\n[[runtime.steps]]\nop = \"compose\"",
    ),
  );

  env
    .strata_cmd()
    .args(["build", "--pinned"])
    .arg(&env.plan_path)
    .assert()
    .failure()
    .stderr(predicate::str::contains("pinned mode requires versions for: numpy"));
}
