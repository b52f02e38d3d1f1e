//! Whole-build guarantees: ordering, failure isolation, reproducibility and
//! layer precedence.

use std::time::Duration;

use strata_lib::execute::{BuildPhase, ExecuteError, SkipReason};
use strata_lib::manifest::RuntimeManifest;
use strata_lib::plan::StageName;
use strata_lib::stage::{CopyError, InstallError, StageError};

use super::common::{Workspace, read, relative_to_cwd};

const ORDERED: &str = r#"
[image]
name = "pav"
version = "2.4.0"
base = "python:3.10"
base_dir = "/opt/pav"

[[stages]]
name = "deps"
[[stages.steps]]
op = "build"
name = "tool"
version = "1"
script = "scripts/slow_tool.sh"

[[stages]]
name = "stage"
[[stages.steps]]
op = "copy"
src = "files"
dest = "$${base}/files"

[runtime]
stage = "pav"
[[runtime.steps]]
op = "compose"
layers = [
  { from = "deps", src = "$${base}/bin" },
  { from = "stage", src = "$${base}/files" },
]
[runtime.entry]
command = "$${base}/files/run_pav"
"#;

fn ordered_workspace(delay: &str) -> Workspace {
  let ws = Workspace::new();
  ws.script(
    "scripts/slow_tool.sh",
    &format!(
      r#"
        sleep {delay}
        mkdir -p "$out$STRATA_BASE_DIR/bin"
        echo tool > "$out$STRATA_BASE_DIR/bin/tool"
      "#
    ),
  );
  ws.write("files/run_pav", "#!/bin/sh\necho pav\n");
  ws
}

#[tokio::test]
async fn runtime_starts_after_every_upstream_stage_is_frozen() {
  let ws = ordered_workspace("1");

  let report = ws.build(ORDERED).await;

  assert!(report.is_success(), "build failed: {:?}", report.failed);
  let deps = &report.stages[&StageName::from("deps")];
  let stage = &report.stages[&StageName::from("stage")];
  let runtime = report.runtime_stage().unwrap();

  // Independent stages do not wait for each other.
  assert!(stage.finished < deps.finished);
  assert!(runtime.started >= deps.finished);
  assert!(runtime.started >= stage.finished);

  let root = runtime.frozen.root();
  assert_eq!(read(&root, "/opt/pav/bin/tool").trim(), "tool");
  assert_eq!(read(&root, "/opt/pav/files/run_pav"), "#!/bin/sh\necho pav\n");
}

#[tokio::test]
async fn phases_are_recorded_in_order() {
  let ws = ordered_workspace("0");

  let report = ws.build(ORDERED).await;

  assert_eq!(report.phase, BuildPhase::Ready);
  let position = |phase: BuildPhase| report.history.iter().position(|p| *p == phase).unwrap();
  assert_eq!(report.history.first(), Some(&BuildPhase::Defined));
  assert!(position(BuildPhase::AllUpstreamDone) < position(BuildPhase::Composing));
  assert!(position(BuildPhase::Composing) < position(BuildPhase::Ready));
  assert!(!report.history.contains(&BuildPhase::Failed));
}

#[tokio::test]
async fn missing_source_fails_before_dependents_start() {
  let ws = Workspace::new();
  ws.script(
    "scripts/slow_tool.sh",
    r#"
      sleep 10
      mkdir -p "$out$STRATA_BASE_DIR/bin"
    "#,
  );
  // `files` is never written.

  let report = ws.build(ORDERED).await;

  assert!(!report.is_success());
  assert_eq!(report.phase, BuildPhase::Failed);
  assert_eq!(report.history.last(), Some(&BuildPhase::Failed));

  let failure = report.failed.as_ref().unwrap();
  assert_eq!(failure.stage, StageName::from("stage"));
  assert!(matches!(
    failure.error,
    ExecuteError::Stage(StageError::Copy(CopyError::MissingSource { .. }))
  ));

  // The slow sibling is stopped rather than waited for.
  assert_eq!(report.cancelled, vec![StageName::from("deps")]);
  assert!(report.duration < Duration::from_secs(10));

  assert!(matches!(
    report.skipped.get(&StageName::from("pav")),
    Some(SkipReason::DependencyFailed(_))
  ));
  assert!(!report.stages.contains_key(&StageName::from("pav")));
  assert!(report.manifest.is_none());

  // Nothing half-built stays in the store.
  let leftovers: Vec<_> = std::fs::read_dir(ws.store().join("stage"))
    .map(|entries| entries.flatten().map(|e| e.file_name()).collect())
    .unwrap_or_default();
  assert!(leftovers.is_empty(), "store holds {leftovers:?}");
}

#[tokio::test]
async fn unchanged_inputs_rebuild_to_identical_runtime() {
  let ws = ordered_workspace("0");

  let first = ws.build(ORDERED).await;
  let first_dir = first.runtime_stage().unwrap().frozen.dir.clone();
  let first_manifest = std::fs::read(RuntimeManifest::path_in(&first_dir)).unwrap();
  assert_eq!(first.built(), 3);

  let second = ws.build(ORDERED).await;
  assert_eq!(second.cached(), 3);
  assert_eq!(second.built(), 0);
  assert_eq!(first.keys, second.keys);

  // A forced rebuild produces the same bytes in the same place.
  let config = strata_lib::config::BuildConfig {
    use_cache: false,
    ..ws.config()
  };
  let third = ws.build_with(ORDERED, &config).await;
  assert_eq!(third.built(), 3);
  let third_runtime = third.runtime_stage().unwrap();
  assert_eq!(third_runtime.frozen.dir, first_dir);
  assert_eq!(third_runtime.frozen.output_hash, first.runtime_stage().unwrap().frozen.output_hash);
  assert_eq!(std::fs::read(RuntimeManifest::path_in(&first_dir)).unwrap(), first_manifest);
  assert_eq!(third.manifest, first.manifest);
}

#[tokio::test]
async fn context_edit_rebuilds_only_affected_stages() {
  let ws = ordered_workspace("0");
  ws.build(ORDERED).await;

  ws.write("files/run_pav", "#!/bin/sh\necho changed\n");
  let report = ws.build(ORDERED).await;

  assert!(report.stages[&StageName::from("deps")].cached);
  assert!(!report.stages[&StageName::from("stage")].cached);
  assert!(!report.stages[&StageName::from("pav")].cached);
  let root = report.runtime_stage().unwrap().frozen.root();
  assert_eq!(read(&root, "/opt/pav/files/run_pav"), "#!/bin/sh\necho changed\n");
}

#[tokio::test]
async fn relative_store_and_context_resolve_from_the_working_directory() {
  let ws = ordered_workspace("0");
  let config = strata_lib::config::BuildConfig {
    store: relative_to_cwd(&ws.store()),
    context: relative_to_cwd(&ws.context()),
    ..ws.config()
  };
  assert!(config.store.is_relative());

  let report = ws.build_with(ORDERED, &config).await;

  assert!(report.is_success(), "build failed: {:?}", report.failed);
  let root = report.runtime_stage().unwrap().frozen.root();
  assert!(root.is_absolute());
  assert_eq!(read(&root, "/opt/pav/bin/tool").trim(), "tool");
  assert_eq!(read(&root, "/opt/pav/files/run_pav"), "#!/bin/sh\necho pav\n");
  assert!(root.canonicalize().unwrap().starts_with(ws.store().canonicalize().unwrap()));
}

#[tokio::test]
async fn stage_missing_a_declared_artifact_is_not_frozen() {
  let ws = ordered_workspace("0");
  let plan = ORDERED.replace(
    "name = \"deps\"\n",
    "name = \"deps\"\nartifacts = [\"$${base}/bin\", \"$${base}/share/man\"]\n",
  );

  let report = ws.build(&plan).await;

  let failure = report.failed.as_ref().unwrap();
  assert_eq!(failure.stage, StageName::from("deps"));
  assert!(
    matches!(failure.error, ExecuteError::MissingArtifact { ref artifact, .. } if artifact == "/opt/pav/share/man"),
    "{}",
    failure.error
  );
  assert!(!report.stages.contains_key(&StageName::from("deps")));
  assert!(report.manifest.is_none());
}

const OVERLAP: &str = r#"
[image]
name = "pav"
version = "1"
base = "python:3.10"
base_dir = "/opt/pav"

[[stages]]
name = "first"
[[stages.steps]]
op = "copy"
src = "first"
dest = "$${base}/etc"

[[stages]]
name = "second"
[[stages.steps]]
op = "copy"
src = "second"
dest = "$${base}/etc"

[runtime]
stage = "pav"
[[runtime.steps]]
op = "compose"
layers = [
  { from = "@A@", src = "$${base}/etc" },
  { from = "@B@", src = "$${base}/etc" },
]
[runtime.entry]
command = "/bin/sh"
"#;

#[tokio::test]
async fn later_layer_wins_on_overlapping_paths() {
  let ws = Workspace::new();
  ws.write("first/config.ini", "first");
  ws.write("first/only_first", "kept");
  ws.write("second/config.ini", "second");

  let report = ws.build(&OVERLAP.replace("@A@", "first").replace("@B@", "second")).await;
  let root = report.runtime_stage().unwrap().frozen.root();
  assert_eq!(read(&root, "/opt/pav/etc/config.ini"), "second");
  assert_eq!(read(&root, "/opt/pav/etc/only_first"), "kept");

  let report = ws.build(&OVERLAP.replace("@A@", "second").replace("@B@", "first")).await;
  let root = report.runtime_stage().unwrap().frozen.root();
  assert_eq!(read(&root, "/opt/pav/etc/config.ini"), "first");
}

const INSTALLS: &str = r#"
[image]
name = "pav"
version = "1"
base = "python:3.10"
base_dir = "/opt/pav"
mode = "@MODE@"

[runtime]
stage = "pav"
[[runtime.steps]]
op = "install"
installer = "sh scripts/fake_pip.sh"
packages = ["numpy", "pandas==2.1.0"]
[runtime.entry]
command = "$${base}/bin/pav"
"#;

#[tokio::test]
async fn pinned_mode_rejects_floating_packages() {
  let ws = Workspace::new();
  ws.script("scripts/fake_pip.sh", r#"echo "$1" >> "$out/installed.txt""#);

  let report = ws.build(&INSTALLS.replace("@MODE@", "pinned")).await;

  let failure = report.failed.as_ref().unwrap();
  assert!(matches!(
    failure.error,
    ExecuteError::Stage(StageError::Install(InstallError::Unpinned { ref packages })) if packages == &["numpy"]
  ));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn floating_mode_installs_and_flags_unpinned_packages() {
  let ws = Workspace::new();
  ws.script("scripts/fake_pip.sh", r#"echo "$1" >> "$out/installed.txt""#);

  let report = ws.build(&INSTALLS.replace("@MODE@", "floating")).await;

  assert!(report.is_success(), "build failed: {:?}", report.failed);
  let root = report.runtime_stage().unwrap().frozen.root();
  assert_eq!(read(&root, "installed.txt"), "numpy\npandas==2.1.0\n");
  let manifest = report.manifest.unwrap();
  assert_eq!(manifest.floating_packages, vec!["numpy".to_string()]);
  assert!(logs_contain("plan has unpinned packages"));
}

#[tokio::test]
async fn installer_script_edit_rebuilds_the_installing_stage() {
  let ws = Workspace::new();
  ws.script("scripts/fake_pip.sh", r#"echo "$1" >> "$out/installed.txt""#);
  let plan = INSTALLS.replace("@MODE@", "floating");
  ws.build(&plan).await;

  ws.script("scripts/fake_pip.sh", r#"echo "v2 $1" >> "$out/installed.txt""#);
  let report = ws.build(&plan).await;

  assert!(report.is_success(), "build failed: {:?}", report.failed);
  let runtime = report.runtime_stage().unwrap();
  assert!(!runtime.cached);
  assert_eq!(read(&runtime.frozen.root(), "installed.txt"), "v2 numpy\nv2 pandas==2.1.0\n");
}

#[tokio::test]
async fn entry_validation_is_opt_in() {
  let ws = Workspace::new();
  ws.script("scripts/fake_pip.sh", "true");
  let plan = INSTALLS.replace("@MODE@", "floating");

  // The entry command is never installed.
  let report = ws.build(&plan).await;
  assert!(report.is_success());

  let config = strata_lib::config::BuildConfig {
    validate_entry: true,
    ..ws.config()
  };
  let report = ws.build_with(&plan, &config).await;
  let failure = report.failed.as_ref().unwrap();
  assert_eq!(failure.stage, StageName::from("pav"));
  assert!(matches!(failure.error, ExecuteError::EntryNotFound { .. }));
}
