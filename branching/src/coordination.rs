//! Coordination of parallel test worker processes through the filesystem.
//!
//! Workers of one test run share a session directory. The first worker to take the lock of a
//! key creates the shared value and caches it as JSON, the others read the cache. Signal files
//! tell followers that the creator finished a step such as running migrations.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bail;
use crate::branch_error;
use crate::error::{BranchResult, ErrorKind};
use crate::retry::{Sleeper, TokioSleeper};

/// Identifies the worker process, set by the test runner.
pub const WORKER_ID_ENV: &str = "NEON_WORKER_ID";

/// Overrides the session directory shared by the workers.
pub const COORDINATION_DIR_ENV: &str = "NEON_COORDINATION_DIR";

/// Identifies the test run when workers do not share a parent process.
pub const SESSION_ID_ENV: &str = "NEON_SESSION_ID";

/// Worker id of a process running tests on its own.
const MAIN_WORKER: &str = "main";

/// How long followers wait for a signal from the creator.
pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(300);

/// How often followers look for a signal file.
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Identity of the current test worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerId {
    /// The only process of the run, owning every branch.
    Main,
    /// One of several parallel workers.
    Worker(String),
}

impl WorkerId {
    /// Reads the worker id from [`WORKER_ID_ENV`].
    pub fn from_env() -> Self {
        Self::from_value(std::env::var(WORKER_ID_ENV).ok().as_deref())
    }

    pub fn from_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some(MAIN_WORKER) => WorkerId::Main,
            Some(worker) => WorkerId::Worker(worker.to_string()),
        }
    }

    pub fn is_main(&self) -> bool {
        matches!(self, WorkerId::Main)
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkerId::Main => MAIN_WORKER,
            WorkerId::Worker(worker) => worker,
        }
    }
}

/// Part played by a worker for a coordinated value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    /// The worker created the value and is responsible for cleaning it up.
    Creator,
    /// The worker reused the value created by another worker.
    Follower,
}

/// Returns the session directory shared by the workers of this run.
///
/// Uses [`COORDINATION_DIR_ENV`] when set, otherwise a directory in the system temp dir named
/// after [`SESSION_ID_ENV`] or, failing that, the parent process id which every worker spawned by
/// the same runner shares.
pub fn coordination_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var(COORDINATION_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    let session_id = std::env::var(SESSION_ID_ENV)
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(runner_id);

    std::env::temp_dir()
        .join("neon-branching")
        .join(format!("session-{session_id}"))
}

#[cfg(unix)]
fn runner_id() -> String {
    std::os::unix::process::parent_id().to_string()
}

#[cfg(not(unix))]
fn runner_id() -> String {
    std::process::id().to_string()
}

/// Exclusive lock on a file, released when dropped.
struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Blocks until the lock on `path` is acquired.
    fn acquire(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;

        Ok(Self { file, path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release lock");
        }
    }
}

/// Agrees with the other workers of the run on who creates shared values.
#[derive(Clone)]
pub struct WorkerCoordinator {
    worker: WorkerId,
    dir: Option<PathBuf>,
    sleeper: Arc<dyn Sleeper>,
}

impl WorkerCoordinator {
    /// Creates a coordinator for `worker` using `dir` as session directory.
    ///
    /// The directory is ignored for [`WorkerId::Main`].
    pub fn new(worker: WorkerId, dir: impl Into<PathBuf>) -> Self {
        let dir = (!worker.is_main()).then(|| dir.into());

        Self {
            worker,
            dir,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Creates a coordinator from the environment of the worker process.
    pub fn from_env() -> Self {
        Self::new(WorkerId::from_env(), coordination_dir_from_env())
    }

    /// Creates a coordinator that never touches the filesystem and always creates.
    pub fn solo() -> Self {
        Self {
            worker: WorkerId::Main,
            dir: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Returns `true` when no other worker takes part in the run.
    pub fn is_solo(&self) -> bool {
        self.dir.is_none()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Returns the value cached under `key`, creating it with `create` if no worker did yet.
    ///
    /// Workers are serialized by an exclusive lock on the key, held until the value is cached.
    /// When `create` fails nothing is cached and the next worker taking the lock tries again.
    pub async fn coordinate<T, F, Fut>(
        &self,
        key: &str,
        create: F,
    ) -> BranchResult<(T, WorkerRole)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = BranchResult<T>>,
    {
        let Some(dir) = &self.dir else {
            return Ok((create().await?, WorkerRole::Creator));
        };

        fs::create_dir_all(dir)?;
        let _lock = lock_key(dir, key).await?;

        let cache_path = dir.join(format!("neon_{key}.json"));
        if cache_path.exists() {
            let cached = fs::read_to_string(&cache_path)?;
            let value = serde_json::from_str(&cached)?;
            debug!(worker = %self.worker.as_str(), key, "reusing value cached by another worker");

            return Ok((value, WorkerRole::Follower));
        }

        let value = create().await?;
        write_atomically(dir, &cache_path, &value)?;
        info!(worker = %self.worker.as_str(), key, "created shared value");

        Ok((value, WorkerRole::Creator))
    }

    /// Removes the value cached under `key`, so that the next worker taking the lock creates it
    /// again instead of following a value from a finished run.
    pub async fn forget(&self, key: &str) -> BranchResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if !dir.exists() {
            return Ok(());
        }

        let _lock = lock_key(dir, key).await?;
        remove_if_exists(&dir.join(format!("neon_{key}.json")))?;
        debug!(worker = %self.worker.as_str(), key, "forgot shared value");

        Ok(())
    }

    /// Tells the other workers that step `name` is complete.
    pub fn send_signal(&self, name: &str) -> BranchResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("neon_{name}")), self.worker.as_str())?;
        debug!(worker = %self.worker.as_str(), signal = name, "sent signal");

        Ok(())
    }

    /// Withdraws signal `name`, sent by this or an earlier run.
    pub fn clear_signal(&self, name: &str) -> BranchResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        remove_if_exists(&dir.join(format!("neon_{name}")))?;

        Ok(())
    }

    /// Waits until another worker sent signal `name`.
    pub async fn wait_for_signal(&self, name: &str, timeout: Duration) -> BranchResult<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };

        let path = dir.join(format!("neon_{name}"));
        let mut waited = Duration::ZERO;

        loop {
            if path.exists() {
                debug!(worker = %self.worker.as_str(), signal = name, "received signal");
                return Ok(());
            }

            if waited >= timeout {
                bail!(
                    ErrorKind::SignalTimeout,
                    "Timed out waiting for another worker",
                    format!(
                        "signal {name} not received after {}s, the creating worker either failed or is still processing",
                        timeout.as_secs()
                    )
                );
            }

            self.sleeper.sleep(SIGNAL_POLL_INTERVAL).await;
            waited += SIGNAL_POLL_INTERVAL;
        }
    }
}

/// Takes the exclusive lock of `key` on a blocking thread.
async fn lock_key(dir: &Path, key: &str) -> BranchResult<LockGuard> {
    let lock_path = dir.join(format!("neon_{key}.lock"));

    Ok(tokio::task::spawn_blocking(move || LockGuard::acquire(lock_path)).await??)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// Writes `value` as JSON to `path` so that readers never see a partial file.
fn write_atomically<T: Serialize>(dir: &Path, path: &Path, value: &T) -> BranchResult<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|err| {
        branch_error!(
            ErrorKind::SerializationError,
            "Failed to serialize the shared value",
            err.to_string(),
            source: err
        )
    })?;

    let tmp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&tmp_path, json)?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }

    Ok(())
}
