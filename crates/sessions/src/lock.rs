//! Cross-process session write lock.
//!
//! Guards a session file against concurrent writers from other gateway
//! processes. The lock is a sidecar `<file>.lock` created with
//! exclusive-create semantics and a JSON payload identifying the holder
//! (`pid`, `createdAt`, `comm`). A conflicting lock is reclaimed when the
//! payload is stale, the holder pid is dead, or the pid is alive under a
//! different command name (PID reuse); otherwise acquisition retries with
//! backoff until the timeout.
//!
//! Within one process the manager reference-counts guards per resolved
//! path, so re-entrant acquisition never touches the filesystem and the
//! lock file is removed only when the last guard drops.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use swb_domain::error::{Error, Result};
use swb_domain::trace::TraceEvent;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Process liveness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Answers whether a lock holder's process still exists. Injected so
/// tests can simulate dead holders and PID reuse.
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
    /// The process's command name, when the platform exposes it.
    fn comm(&self, pid: u32) -> Option<String>;
}

/// Liveness backed by the operating system.
#[derive(Debug, Default)]
pub struct OsLiveness;

#[cfg(unix)]
impl ProcessLiveness for OsLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        // Signal 0 probes existence without delivering anything. EPERM
        // still means the process exists.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn comm(&self, pid: u32) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .ok()
            .map(|s| s.trim().to_owned())
    }
}

#[cfg(not(unix))]
impl ProcessLiveness for OsLiveness {
    fn is_alive(&self, _pid: u32) -> bool {
        // No cheap probe; treat holders as alive and rely on staleness.
        true
    }

    fn comm(&self, _pid: u32) -> Option<String> {
        None
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock payload and options
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity of the current lock holder, stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockPayload {
    pid: u32,
    created_at: DateTime<Utc>,
    comm: String,
}

impl LockPayload {
    fn for_current_process(liveness: &dyn ProcessLiveness) -> Self {
        let pid = std::process::id();
        // Char-based cap: a liveness impl may report names longer than the
        // kernel's 15-byte comm, including multibyte ones.
        let comm = liveness
            .comm(pid)
            .unwrap_or_default()
            .chars()
            .take(15)
            .collect();
        Self {
            pid,
            created_at: Utc::now(),
            comm,
        }
    }
}

/// Acquisition parameters.
#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Give up and return [`Error::LockTimeout`] after this long.
    pub timeout: Duration,
    /// Lock files older than this are reclaimed regardless of holder state.
    pub stale: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            stale: Duration::from_secs(300),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LockRegistry {
    liveness: Arc<dyn ProcessLiveness>,
    /// Refcounts keyed by resolved lock path.
    held: Mutex<HashMap<PathBuf, usize>>,
}

impl LockRegistry {
    fn release(&self, lock_path: &Path) {
        let mut held = self.held.lock();
        match held.get_mut(lock_path) {
            Some(count) if *count > 1 => {
                *count -= 1;
                return;
            }
            Some(_) => {
                held.remove(lock_path);
            }
            None => return,
        }
        drop(held);

        if let Err(e) = std::fs::remove_file(lock_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %lock_path.display(), error = %e, "failed to remove lock file");
            }
        }
    }

    /// Remove every lock file this process currently holds. Used by the
    /// signal cleanup task; in-memory refcounts are left alone because the
    /// process is about to exit.
    fn remove_held_lock_files(&self) {
        let paths: Vec<PathBuf> = self.held.lock().keys().cloned().collect();
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove lock file");
                }
            }
        }
    }
}

/// Manages session write locks for one process. Cheap to clone; clones
/// share the refcount registry.
#[derive(Clone)]
pub struct SessionLockManager {
    inner: Arc<LockRegistry>,
}

impl Default for SessionLockManager {
    fn default() -> Self {
        Self::new(Arc::new(OsLiveness))
    }
}

impl SessionLockManager {
    pub fn new(liveness: Arc<dyn ProcessLiveness>) -> Self {
        Self {
            inner: Arc::new(LockRegistry {
                liveness,
                held: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Acquire the write lock for `session_file`.
    ///
    /// The path is canonicalized first, so two spellings of the same file
    /// (symlinks included) contend on one lock. The returned guard
    /// releases on drop.
    pub async fn acquire(
        &self,
        session_file: &Path,
        opts: LockOptions,
    ) -> Result<SessionLockGuard> {
        let lock_path = lock_path_for(session_file)?;
        let start = Instant::now();
        let mut backoff = Duration::from_millis(25);
        let mut reclaimed = false;

        loop {
            // Re-entrant in-process acquisition: bump the refcount and
            // skip the filesystem entirely.
            {
                let mut held = self.inner.held.lock();
                if let Some(count) = held.get_mut(&lock_path) {
                    *count += 1;
                    return Ok(SessionLockGuard {
                        registry: self.inner.clone(),
                        lock_path,
                    });
                }
            }

            match self.try_create(&lock_path) {
                Ok(()) => {
                    self.inner.held.lock().insert(lock_path.clone(), 1);
                    TraceEvent::SessionLockAcquired {
                        path: lock_path.display().to_string(),
                        waited_ms: start.elapsed().as_millis() as u64,
                        reclaimed,
                    }
                    .emit();
                    return Ok(SessionLockGuard {
                        registry: self.inner.clone(),
                        lock_path,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.try_reclaim(&lock_path, opts.stale) {
                        reclaimed = true;
                        continue;
                    }
                    if start.elapsed() >= opts.timeout {
                        return Err(Error::LockTimeout {
                            path: lock_path.display().to_string(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(250));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_create(&self, lock_path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)?;

        let payload = LockPayload::for_current_process(self.inner.liveness.as_ref());
        let json = serde_json::to_string(&payload).unwrap_or_default();
        if let Err(e) = file.write_all(json.as_bytes()).and_then(|_| file.flush()) {
            // Don't leave a half-written lock behind.
            let _ = std::fs::remove_file(lock_path);
            return Err(e);
        }
        Ok(())
    }

    /// Returns true when the conflicting lock was removed and creation
    /// should be retried immediately.
    fn try_reclaim(&self, lock_path: &Path, stale: Duration) -> bool {
        let raw = match std::fs::read_to_string(lock_path) {
            Ok(raw) => raw,
            // Holder released between our create attempt and this read.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
            Err(_) => return false,
        };

        let payload: LockPayload = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(path = %lock_path.display(), "unreadable lock payload, reclaiming");
                let _ = std::fs::remove_file(lock_path);
                return true;
            }
        };

        if payload.pid == std::process::id() {
            // Our own file; the refcount path will pick it up.
            return false;
        }

        let age = (Utc::now() - payload.created_at).to_std().unwrap_or_default();
        let liveness = self.inner.liveness.as_ref();
        let reason = if age > stale {
            Some("stale")
        } else if !liveness.is_alive(payload.pid) {
            Some("dead-pid")
        } else if liveness
            .comm(payload.pid)
            .is_some_and(|comm| comm != payload.comm)
        {
            Some("comm-mismatch")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                tracing::warn!(
                    path = %lock_path.display(),
                    holder_pid = payload.pid,
                    reason,
                    "reclaiming session lock"
                );
                TraceEvent::SessionLockReclaimed {
                    path: lock_path.display().to_string(),
                    holder_pid: payload.pid,
                    reason: reason.to_owned(),
                }
                .emit();
                let _ = std::fs::remove_file(lock_path);
                true
            }
            None => false,
        }
    }

    /// Number of distinct locks currently held in-process.
    pub fn held_count(&self) -> usize {
        self.inner.held.lock().len()
    }
}

/// Derive `<resolved>.lock` from a session-file path. Missing files
/// resolve through their parent directory so the canonical form is
/// stable before the file first exists.
fn lock_path_for(session_file: &Path) -> Result<PathBuf> {
    let resolved = if session_file.exists() {
        session_file.canonicalize()?
    } else {
        let parent = match session_file.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let name = session_file.file_name().ok_or_else(|| {
            Error::Config(format!(
                "session path has no file name: {}",
                session_file.display()
            ))
        })?;
        parent.canonicalize()?.join(name)
    };

    let mut os = resolved.into_os_string();
    os.push(".lock");
    Ok(PathBuf::from(os))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds the session write lock; releases on drop.
pub struct SessionLockGuard {
    registry: Arc<LockRegistry>,
    lock_path: PathBuf,
}

impl SessionLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl std::fmt::Debug for SessionLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.lock_path);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signal cleanup
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Spawn a task that removes this process's lock files when a
/// terminating signal arrives. Tokio multiplexes signal streams, so any
/// handlers the host process installed keep firing; this task never
/// exits the process itself.
#[cfg(unix)]
pub fn spawn_signal_cleanup(manager: &SessionLockManager) -> tokio::task::JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let registry = manager.inner.clone();
    tokio::spawn(async move {
        let installed = (|| {
            Ok::<_, std::io::Error>((
                signal(SignalKind::interrupt())?,
                signal(SignalKind::terminate())?,
                signal(SignalKind::quit())?,
            ))
        })();
        let (mut sigint, mut sigterm, mut sigquit) = match installed {
            Ok(streams) => streams,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install signal listeners");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
                _ = sigquit.recv() => {}
            }
            tracing::info!("signal received, removing held session locks");
            registry.remove_held_lock_files();
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_signal_cleanup(_manager: &SessionLockManager) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
