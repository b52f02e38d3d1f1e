//! Artifact Fetcher: git dependencies at an exact revision.
//!
//! Repositories are cloned once into the store's git cache with gix and kept
//! there with their `.git` directory so later fetches are incremental. The
//! requested revision is resolved against the cache; it is never replaced by
//! a newer one. The working tree is then materialized at that commit,
//! submodules included, stripped of git metadata, hashed, and copied into
//! the stage.
//!
//! # Cache Structure
//!
//! ```text
//! <store>/git/<url-hash>/     # full clone, shared by all stages
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gix::remote::Direction;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::DependencyMode;
use crate::plan::PinnedDependency;
use crate::util::fs::{FsError, copy_tree, remove_if_exists};
use crate::util::hash::{DirHashError, hash_bytes, hash_directory};

use super::cmd::{CmdError, Invocation, execute_cmd};
use super::lock::LockedDependency;
use super::{Buildable, StageContext, StageError, StepOutcome};

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("invalid repository url '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  #[error("revision '{rev}' of {url} is not a full commit id, which pinned mode requires")]
  Unpinned { url: String, rev: String },

  #[error("failed to clone repository '{url}': {source}")]
  Clone {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("failed to open cached repository at '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: Box<gix::open::Error>,
  },

  #[error("failed to fetch from '{url}': {source}")]
  Fetch {
    url: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("revision '{rev}' not found in {url}")]
  RevisionNotFound { url: String, rev: String },

  #[error("failed to check out {rev} of {url}: {source}")]
  Checkout {
    url: String,
    rev: String,
    #[source]
    source: CmdError,
  },

  #[error("content of {url}@{rev} drifted: locked tree {expected}, fetched {actual}")]
  ContentDrift {
    url: String,
    rev: String,
    expected: String,
    actual: String,
  },

  #[error("fetch of {url} cancelled")]
  Cancelled { url: String },

  #[error("fetch i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error(transparent)]
  Path(#[from] FsError),
}

/// A dependency as it was actually fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDependency {
  pub url: String,
  pub rev: String,
  pub commit: String,
  pub tree_hash: String,
  pub dest: String,
  pub floating: bool,
}

impl FetchedDependency {
  pub fn to_locked(&self) -> LockedDependency {
    LockedDependency {
      url: self.url.clone(),
      rev: self.rev.clone(),
      commit: self.commit.clone(),
      tree_hash: self.tree_hash.clone(),
      floating: self.floating,
    }
  }
}

/// A full SHA-1 or SHA-256 commit id.
pub fn is_commit_id(rev: &str) -> bool {
  matches!(rev.len(), 40 | 64) && rev.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl Buildable for PinnedDependency {
  async fn execute(&self, ctx: &StageContext<'_>) -> Result<StepOutcome, StageError> {
    let fetched = fetch_pinned(self, ctx).await?;
    Ok(StepOutcome::Fetched(fetched))
  }
}

/// Fetch `dep` into the stage at `dep.dest`.
pub async fn fetch_pinned(dep: &PinnedDependency, ctx: &StageContext<'_>) -> Result<FetchedDependency, FetchError> {
  let url = dep.url.clone();
  let rev = dep.rev.clone();

  gix::url::parse(gix::bstr::BStr::new(url.as_bytes())).map_err(|e| FetchError::InvalidUrl {
    url: url.clone(),
    message: e.to_string(),
  })?;

  let floating = !is_commit_id(&rev);
  if floating {
    if ctx.mode() == DependencyMode::Pinned {
      return Err(FetchError::Unpinned { url, rev });
    }
    warn!(stage = %ctx.stage, url = %url, rev = %rev, "floating revision: content may change between builds");
  }

  let cache = ctx.git_cache.clone();
  let (repo_path, commit) = {
    let (task_url, task_rev) = (url.clone(), rev.clone());
    let task = tokio::task::spawn_blocking(move || prepare_cache(&task_url, &task_rev, &cache));
    tokio::select! {
      joined = task => joined.map_err(|e| FetchError::Clone {
        url: dep.url.clone(),
        source: Box::new(e),
      })??,
      _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled { url }),
    }
  };
  debug!(url = %url, rev = %rev, commit = %commit, "resolved revision");

  let work = ctx.tmp.join(format!("fetch-{}", &commit[..12.min(commit.len())]));
  remove_if_exists(&work).map_err(|e| FetchError::Io {
    path: work.clone(),
    source: e,
  })?;
  materialize(ctx, dep, &repo_path, &commit, &work).await?;
  strip_git_metadata(&work)?;

  let tree_hash = hash_directory(&work, &[])?.0;
  verify_against_lock(ctx, dep, &commit, &tree_hash)?;

  let dest = ctx.image_path(&dep.dest)?;
  copy_tree(&work, &dest)?;
  remove_if_exists(&work).map_err(|e| FetchError::Io {
    path: work.clone(),
    source: e,
  })?;

  info!(stage = %ctx.stage, url = %url, commit = %commit, dest = %dep.dest, "fetched dependency");
  Ok(FetchedDependency {
    url,
    rev,
    commit,
    tree_hash,
    dest: dep.dest.clone(),
    floating,
  })
}

fn verify_against_lock(
  ctx: &StageContext<'_>,
  dep: &PinnedDependency,
  commit: &str,
  tree_hash: &str,
) -> Result<(), FetchError> {
  let Some(locked) = ctx.locked.get(&dep.url, &dep.rev) else {
    return Ok(());
  };
  if locked.commit != commit {
    warn!(
      url = %dep.url,
      rev = %dep.rev,
      locked = %locked.commit,
      resolved = %commit,
      "floating revision moved since it was locked"
    );
    return Ok(());
  }
  if locked.tree_hash != tree_hash {
    return Err(FetchError::ContentDrift {
      url: dep.url.clone(),
      rev: dep.rev.clone(),
      expected: locked.tree_hash.clone(),
      actual: tree_hash.to_string(),
    });
  }
  Ok(())
}

/// Clone or update the cached repository and resolve `rev` to a commit id.
fn prepare_cache(url: &str, rev: &str, cache: &Path) -> Result<(PathBuf, String), FetchError> {
  std::fs::create_dir_all(cache).map_err(|e| FetchError::Io {
    path: cache.to_path_buf(),
    source: e,
  })?;
  let repo_path = cache.join(&hash_bytes(url.as_bytes()).0[..16]);

  if repo_path.join(".git").exists() {
    debug!(url, path = ?repo_path, "opening cached repository");
    let repo = gix::open(&repo_path).map_err(|e| FetchError::Open {
      path: repo_path.clone(),
      source: Box::new(e),
    })?;

    // A commit already in the cache needs no network. Branches and tags
    // always refresh, since they may have moved.
    if is_commit_id(rev)
      && let Ok(commit) = resolve_revision(&repo, url, rev)
    {
      return Ok((repo_path, commit));
    }
    fetch_updates(&repo, url)?;
    let commit = resolve_revision(&repo, url, rev)?;
    return Ok((repo_path, commit));
  }

  info!(url, path = ?repo_path, "cloning repository");
  remove_if_exists(&repo_path).map_err(|e| FetchError::Io {
    path: repo_path.clone(),
    source: e,
  })?;
  let repo = clone_repo(url, &repo_path)?;
  let commit = resolve_revision(&repo, url, rev)?;
  Ok((repo_path, commit))
}

fn clone_repo(url: &str, dest: &Path) -> Result<gix::Repository, FetchError> {
  let clone_err = |e: Box<dyn std::error::Error + Send + Sync>| FetchError::Clone {
    url: url.to_string(),
    source: e,
  };

  let mut prepared = gix::prepare_clone(url, dest).map_err(|e| clone_err(Box::new(e)))?;
  let (mut checkout, _outcome) = prepared
    .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| clone_err(Box::new(e)))?;
  let (repo, _outcome) = checkout
    .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| clone_err(Box::new(e)))?;
  Ok(repo)
}

fn fetch_updates(repo: &gix::Repository, url: &str) -> Result<(), FetchError> {
  debug!(url, "fetching updates");
  let fetch_err = |e: Box<dyn std::error::Error + Send + Sync>| FetchError::Fetch {
    url: url.to_string(),
    source: e,
  };

  let remote = repo
    .find_default_remote(Direction::Fetch)
    .ok_or_else(|| fetch_err("no remote configured for cached repository".into()))?
    .map_err(|e| fetch_err(Box::new(e)))?;
  let connection = remote.connect(Direction::Fetch).map_err(|e| fetch_err(Box::new(e)))?;
  connection
    .prepare_fetch(gix::progress::Discard, Default::default())
    .map_err(|e| fetch_err(Box::new(e)))?
    .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
    .map_err(|e| fetch_err(Box::new(e)))?;
  Ok(())
}

/// Resolve `rev` to a commit id. Remote-tracking branches take precedence
/// over local ones, which only reflect the state at clone time.
fn resolve_revision(repo: &gix::Repository, url: &str, rev: &str) -> Result<String, FetchError> {
  let candidates = if is_commit_id(rev) {
    vec![rev.to_string()]
  } else {
    vec![format!("origin/{rev}"), rev.to_string()]
  };

  for candidate in candidates {
    let spec = format!("{candidate}^{{commit}}");
    if let Ok(parsed) = repo.rev_parse(spec.as_str())
      && let Some(id) = parsed.single()
    {
      return Ok(id.to_string());
    }
  }

  Err(FetchError::RevisionNotFound {
    url: url.to_string(),
    rev: rev.to_string(),
  })
}

/// Produce a working tree of `commit` (and its submodules) at `work`.
async fn materialize(
  ctx: &StageContext<'_>,
  dep: &PinnedDependency,
  repo_path: &Path,
  commit: &str,
  work: &Path,
) -> Result<(), FetchError> {
  let env = BTreeMap::from([
    ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
    ("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string()),
  ]);
  let git = |args: Vec<String>| Invocation::Program {
    program: "git".to_string(),
    args,
  };
  let work_str = work.to_string_lossy().into_owned();

  let mut steps = vec![
    git(vec![
      "clone".into(),
      "--quiet".into(),
      "--no-checkout".into(),
      repo_path.to_string_lossy().into_owned(),
      work_str.clone(),
    ]),
    git(vec![
      "-C".into(),
      work_str.clone(),
      "remote".into(),
      "set-url".into(),
      "origin".into(),
      dep.url.clone(),
    ]),
    git(vec![
      "-C".into(),
      work_str.clone(),
      "-c".into(),
      "advice.detachedHead=false".into(),
      "checkout".into(),
      "--quiet".into(),
      commit.to_string(),
    ]),
  ];
  if dep.submodules {
    let mut args = vec!["-C".to_string(), work_str.clone()];
    // git refuses file-transport submodules by default.
    if is_local_url(&dep.url) {
      args.extend(["-c".to_string(), "protocol.file.allow=always".to_string()]);
    }
    args.extend(["submodule", "update", "--init", "--recursive", "--quiet"].map(String::from));
    steps.push(git(args));
  }

  for step in &steps {
    execute_cmd(ctx, step, &env, Some(&ctx.tmp))
      .await
      .map_err(|e| match e {
        CmdError::Cancelled(_) => FetchError::Cancelled { url: dep.url.clone() },
        other => FetchError::Checkout {
          url: dep.url.clone(),
          rev: commit.to_string(),
          source: other,
        },
      })?;
  }
  Ok(())
}

/// Whether `url` names a repository on this machine rather than a remote.
fn is_local_url(url: &str) -> bool {
  url.starts_with('/') || url.starts_with("file://") || Path::new(url).exists()
}

/// Remove every `.git` entry (directories, and the files submodules use).
fn strip_git_metadata(work: &Path) -> Result<(), FetchError> {
  let git_entries: Vec<PathBuf> = WalkDir::new(work)
    .into_iter()
    .filter_entry(|e| e.file_name() != ".git" || e.depth() == 0)
    .filter_map(Result::ok)
    .flat_map(|e| {
      let candidate = e.path().join(".git");
      e.file_type().is_dir().then_some(candidate)
    })
    .filter(|p| p.symlink_metadata().is_ok())
    .collect();

  for path in git_entries {
    remove_if_exists(&path).map_err(|e| FetchError::Io { path, source: e })?;
  }
  Ok(())
}
