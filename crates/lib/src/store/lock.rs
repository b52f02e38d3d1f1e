//! Advisory locking of the stage store.
//!
//! `build` and `clean` hold the store exclusively. `plan`, `inspect` and `run`
//! take a shared lock so they never read a store that is being rewritten. The
//! exclusive holder records who it is in the lock file, so a blocked command
//! can say what it is waiting on.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";
const HOLDER_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Who holds the store exclusively. Written into the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
  pub store: PathBuf,
}

impl LockHolder {
  fn this_process(command: &str, store: &Path) -> Self {
    let started_at_unix = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_secs())
      .unwrap_or_default();
    Self {
      version: HOLDER_VERSION,
      pid: std::process::id(),
      started_at_unix,
      command: command.to_string(),
      store: store.to_path_buf(),
    }
  }

  fn parse(mut reader: impl Read) -> Option<Self> {
    let mut text = String::new();
    reader.read_to_string(&mut text).ok()?;
    serde_json::from_str(&text).ok()
  }
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store is in use by `strata {command}` (PID {pid}, started at unix time {started_at})\n\
     if no strata process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    command: String,
    pid: u32,
    started_at: u64,
    lock_path: PathBuf,
  },

  #[error(
    "store is in use by another strata process\n\
     if no strata process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown { lock_path: PathBuf },

  #[error("failed to create store directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to record lock holder: {0}")]
  WriteHolder(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

impl StoreLockError {
  fn contention(lock_path: &Path) -> Self {
    match File::open(lock_path).ok().and_then(LockHolder::parse) {
      Some(holder) => StoreLockError::Contention {
        command: holder.command,
        pid: holder.pid,
        started_at: holder.started_at_unix,
        lock_path: lock_path.to_path_buf(),
      },
      None => StoreLockError::ContentionUnknown {
        lock_path: lock_path.to_path_buf(),
      },
    }
  }
}

/// A held store lock. Released when dropped.
pub struct StoreLock {
  file: File,
  path: PathBuf,
}

impl StoreLock {
  /// Take the store lock without waiting. `command` names the caller in
  /// contention errors.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    std::fs::create_dir_all(store).map_err(StoreLockError::CreateDir)?;
    let path = store.join(LOCK_FILENAME);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(StoreLockError::OpenFile)?;

    match try_lock(&file, mode) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(StoreLockError::contention(&path)),
      Err(e) => return Err(StoreLockError::LockFailed(e)),
    }
    debug!(path = ?path, mode = ?mode, command, "store locked");

    let lock = StoreLock { file, path };
    if mode == LockMode::Exclusive {
      lock.record_holder(&LockHolder::this_process(command, store))?;
    }
    Ok(lock)
  }

  fn record_holder(&self, holder: &LockHolder) -> Result<(), StoreLockError> {
    let mut file = &self.file;
    file.set_len(0).map_err(StoreLockError::WriteHolder)?;
    file.seek(SeekFrom::Start(0)).map_err(StoreLockError::WriteHolder)?;
    let json = serde_json::to_vec_pretty(holder).map_err(|e| StoreLockError::WriteHolder(io::Error::other(e)))?;
    file.write_all(&json).map_err(StoreLockError::WriteHolder)?;
    file.flush().map_err(StoreLockError::WriteHolder)
  }

  /// The recorded holder, read through the held handle.
  pub fn holder(&self) -> Option<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0)).ok()?;
    LockHolder::parse(file)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file.as_fd(), operation).map_err(io::Error::from)
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
  use windows_sys::Win32::System::IO::OVERLAPPED;

  let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
  if mode == LockMode::Exclusive {
    flags |= LOCKFILE_EXCLUSIVE_LOCK;
  }

  // SAFETY: the handle stays owned by `file` and a zeroed OVERLAPPED is valid.
  let locked = unsafe {
    let mut overlapped: OVERLAPPED = std::mem::zeroed();
    LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
  };
  if locked == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
