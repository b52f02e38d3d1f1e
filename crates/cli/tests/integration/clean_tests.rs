use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn clean_removes_frozen_stages() {
  let env = TestEnv::hello();
  env.build();
  assert!(env.store_path().join("stage").exists());

  env
    .strata_cmd()
    .args(["clean", "--force"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Removed"));

  assert!(!env.store_path().exists());
}

#[test]
fn clean_refuses_without_confirmation_when_not_interactive() {
  let env = TestEnv::hello();
  env.build();

  env
    .strata_cmd()
    .arg("clean")
    .assert()
    .failure()
    .stderr(predicate::str::contains("--force"));

  assert!(env.store_path().join("stage").exists());
}

#[test]
fn clean_json_output_is_valid() {
  let env = TestEnv::empty();

  env
    .strata_cmd()
    .args(["clean", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"removed\": false"));
}
