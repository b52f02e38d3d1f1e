//! The pav image end to end: native tools, source, a pinned dependency and
//! packages assembled into one runtime under a configurable base directory.

use strata_lib::config::BuildConfig;
use strata_lib::manifest::RuntimeManifest;
use strata_lib::plan::StageName;
use strata_lib::stage::{LockFile, lock::lock_path_for, prepare_launch, resolve_entry};

use super::common::{Workspace, dependency_repo, git_available, read};

const PAV: &str = r#"
[image]
name = "pav"
version = "2.4.0"
author = "pav developers"
base = "python:3.10"
base_dir = "/opt/pav"

[[stages]]
name = "deps"
[[stages.steps]]
op = "build"
name = "samtools"
version = "1.19"
script = "files/docker/build_deps.sh"
scratch = ["$${base}/build"]

[[stages]]
name = "stage"
[[stages.steps]]
op = "copy"
src = "files"
dest = "$${base}/files"
[[stages.steps]]
op = "copy"
src = "pavlib"
dest = "$${base}/pavlib"
[[stages.steps]]
op = "fetch"
url = "@URL@"
rev = "@REV@"
dest = "$${base}/dep"

[runtime]
stage = "pav"
[[runtime.steps]]
op = "install"
installer = "sh files/docker/fake_pip.sh"
packages = ["pyyaml==6.0.1", "numpy==1.26.4"]
[[runtime.steps]]
op = "compose"
layers = [
  { from = "deps", src = "$${base}/bin" },
  { from = "stage", src = "$${base}/files" },
  { from = "stage", src = "$${base}/pavlib" },
  { from = "stage", src = "$${base}/dep" },
]
[[runtime.steps]]
op = "setup"
script = "files/docker/setup_user.sh"
[runtime.entry]
command = "$${base}/files/docker/run_pav"
path = ["$${base}/bin"]
env = { PAV_HOME = "$${base}" }
"#;

fn pav_workspace(origin: &std::path::Path) -> (Workspace, String) {
  let ws = Workspace::new();
  let rev = dependency_repo(origin);
  ws.script(
    "files/docker/build_deps.sh",
    r#"
      mkdir -p "$out$STRATA_BASE_DIR/build" "$out$STRATA_BASE_DIR/bin"
      echo object > "$out$STRATA_BASE_DIR/build/samtools.o"
      printf '#!/bin/sh\necho "%s %s"\n' "$RECIPE_NAME" "$RECIPE_VERSION" > "$out$STRATA_BASE_DIR/bin/samtools"
      chmod +x "$out$STRATA_BASE_DIR/bin/samtools"
    "#,
  );
  ws.script("files/docker/fake_pip.sh", r#"echo "$1" >> "$out/installed.txt""#);
  ws.script(
    "files/docker/setup_user.sh",
    r#"echo "pav:x:1000:1000::$STRATA_BASE_DIR:/bin/sh" > "$out$STRATA_BASE_DIR/passwd""#,
  );
  ws.script("files/docker/run_pav", r#"echo "pav $PAV_HOME""#);
  ws.write("pavlib/pav/__init__.py", "VERSION = '2.4.0'\n");
  (ws, rev)
}

fn plan(origin: &std::path::Path, rev: &str) -> String {
  PAV.replace("@URL@", &origin.to_string_lossy()).replace("@REV@", rev)
}

#[tokio::test]
async fn pav_image_assembles_under_base_dir() {
  if !git_available() {
    return;
  }
  let origin = tempfile::tempdir().unwrap();
  let (ws, rev) = pav_workspace(origin.path());

  let report = ws.build(&plan(origin.path(), &rev)).await;

  assert!(report.is_success(), "build failed: {:?}", report.failed);
  let root = report.runtime_stage().unwrap().frozen.root();
  assert!(root.join("opt/pav/bin/samtools").is_file());
  assert_eq!(read(&root, "/opt/pav/files/docker/run_pav"), read(&ws.context(), "files/docker/run_pav"));
  assert_eq!(read(&root, "/opt/pav/pavlib/pav/__init__.py"), "VERSION = '2.4.0'\n");
  assert_eq!(read(&root, "/opt/pav/dep/dep.py"), "NAME = 'dep'\n");
  assert!(!root.join("opt/pav/dep/.git").exists());
  assert!(!root.join("opt/pav/build").exists());
  assert_eq!(read(&root, "installed.txt"), "pyyaml==6.0.1\nnumpy==1.26.4\n");
  assert!(read(&root, "/opt/pav/passwd").contains(":/opt/pav:"));

  // Upstream stages hold only what they produced.
  let deps = report.stages[&StageName::from("deps")].frozen.root();
  assert!(!deps.join("opt/pav/files").exists());
  let stage = report.stages[&StageName::from("stage")].frozen.root();
  assert!(!stage.join("opt/pav/bin").exists());

  let manifest = report.manifest.as_ref().unwrap();
  assert_eq!(manifest.labels["name"], "pav");
  assert_eq!(manifest.labels["version"], "2.4.0");
  assert_eq!(manifest.labels["author"], "pav developers");
  assert_eq!(manifest.env["PAV_HOME"], "/opt/pav");
  assert!(manifest.floating_packages.is_empty());
  assert_eq!(
    resolve_entry(manifest, &root).unwrap(),
    root.join("opt/pav/files/docker/run_pav")
  );

  let launch = prepare_launch(manifest, &root, &[], "/usr/bin").unwrap();
  assert_eq!(launch.program, root.join("opt/pav/files/docker/run_pav"));
  let path = &launch.env["PATH"];
  assert!(path.starts_with(&root.join("opt/pav/bin").to_string_lossy().into_owned()));
  assert!(path.ends_with("/usr/bin"));
}

#[tokio::test]
async fn fetched_revision_is_locked_and_reused() {
  if !git_available() {
    return;
  }
  let origin = tempfile::tempdir().unwrap();
  let (ws, rev) = pav_workspace(origin.path());
  let plan = plan(origin.path(), &rev);

  let first = ws.build(&plan).await;
  assert!(first.lock_changed);
  let lock = LockFile::load(&lock_path_for(&ws.plan_path())).unwrap().unwrap();
  let locked = lock.get(&origin.path().to_string_lossy(), &rev).unwrap();
  assert_eq!(locked.commit, rev);
  assert!(!locked.floating);

  let second = ws.build(&plan).await;
  assert!(!second.lock_changed);
  assert_eq!(second.built(), 0);
  assert_eq!(first.keys, second.keys);
}

#[tokio::test]
async fn base_dir_override_relocates_every_stage() {
  if !git_available() {
    return;
  }
  let origin = tempfile::tempdir().unwrap();
  let (ws, rev) = pav_workspace(origin.path());
  let config = BuildConfig {
    base_dir: Some("/srv/pav".to_string()),
    ..ws.config()
  };

  let report = ws.build_with(&plan(origin.path(), &rev), &config).await;

  assert!(report.is_success(), "build failed: {:?}", report.failed);
  let runtime_dir = &report.runtime_stage().unwrap().frozen.dir;
  let root = runtime_dir.join("root");
  assert!(root.join("srv/pav/bin/samtools").is_file());
  assert!(root.join("srv/pav/dep/dep.py").is_file());
  assert!(!root.join("opt").exists());

  let manifest = RuntimeManifest::read(runtime_dir).unwrap();
  assert_eq!(manifest.base_dir, "/srv/pav");
  assert_eq!(manifest.entry.command, "/srv/pav/files/docker/run_pav");
  assert_eq!(manifest.path, vec!["/srv/pav/bin"]);
}
