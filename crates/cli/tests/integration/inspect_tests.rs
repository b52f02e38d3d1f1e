use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn inspect_before_build_fails() {
  let env = TestEnv::hello();

  env
    .strata_cmd()
    .arg("inspect")
    .arg(&env.plan_path)
    .assert()
    .failure()
    .stderr(predicate::str::contains("No build of image 'hello' found"));
}

#[test]
fn inspect_shows_manifest() {
  let env = TestEnv::hello();
  env.build();

  env
    .strata_cmd()
    .arg("inspect")
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("hello 0.1.0"))
    .stdout(predicate::str::contains("/opt/hello/bin/greet --from-manifest"))
    .stdout(predicate::str::contains("HELLO_VERSION=0.1.0"))
    .stdout(predicate::str::contains("author: hello developers"))
    .stdout(predicate::str::contains("tools:/opt/hello/bin -> /opt/hello/bin"));
}

#[test]
fn inspect_json_is_the_manifest() {
  let env = TestEnv::hello();
  env.build();

  let output = env
    .strata_cmd()
    .args(["inspect", "-o", "json"])
    .arg(&env.plan_path)
    .output()
    .unwrap();
  assert!(output.status.success());

  let manifest: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(manifest["image"], "hello");
  assert_eq!(manifest["baseDir"], "/opt/hello");
  assert_eq!(manifest["labels"]["version"], "0.1.0");
  assert_eq!(manifest["path"][0], "/opt/hello/bin");
}

#[test]
fn base_dir_flag_relocates_the_runtime() {
  let env = TestEnv::hello();

  env
    .strata_cmd()
    .args(["build", "--base-dir", "/srv/hello"])
    .arg(&env.plan_path)
    .assert()
    .success();

  env
    .strata_cmd()
    .args(["inspect", "--base-dir", "/srv/hello"])
    .arg(&env.plan_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("/srv/hello/bin/greet"));
}
