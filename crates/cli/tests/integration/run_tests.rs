use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn run_launches_entry_with_manifest_environment() {
  let env = TestEnv::hello();
  env.build();

  env
    .strata_cmd()
    .arg("run")
    .arg(&env.plan_path)
    .args(["--", "world"])
    .assert()
    .success()
    .stdout(predicate::str::contains("hello 0.1.0 --from-manifest world"));
}

#[test]
fn run_propagates_exit_code() {
  let env = TestEnv::hello();
  env.build();

  env
    .strata_cmd()
    .arg("run")
    .arg(&env.plan_path)
    .env("GREET_EXIT", "7")
    .assert()
    .code(7);
}

#[test]
fn run_with_missing_entry_fails_closed() {
  let env = TestEnv::hello();
  env.write_file("scripts/build_greeter.sh", "#!/bin/sh\nmkdir -p \"$out$STRATA_BASE_DIR/bin\"\n");
  env.build();

  env
    .strata_cmd()
    .arg("run")
    .arg(&env.plan_path)
    .assert()
    .failure()
    .stderr(predicate::str::contains("not found"));
}
