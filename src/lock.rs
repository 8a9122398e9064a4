//! Cross-process GPU phase lock
//!
//! Multiple service processes share the machine's accelerators; an in-process
//! mutex cannot serialize between them. This advisory file lock guarantees at
//! most one GPU-bound phase (embedding, reranking, LLM batch) runs at a time
//! machine-wide. Not fair: arrival order is not preserved, so callers bound
//! their wait with a timeout.

use anyhow::{Context, Result};
use crate::error::ServiceError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for the phase lock (path + default timeout)
#[derive(Debug, Clone)]
pub struct PhaseLock {
    path: PathBuf,
    timeout: Duration,
}

/// RAII guard: the lock is held until drop
pub struct PhaseLockGuard {
    file: File,
    phase: String,
    acquired_at: Instant,
}

impl PhaseLock {
    pub fn new(path: &Path, timeout_secs: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Block until exclusive ownership or timeout. The guard releases the
    /// lock on every exit path, normal or panic.
    pub fn acquire(&self, phase: &str, doc_id: Option<&str>) -> Result<PhaseLockGuard> {
        self.acquire_with_timeout(phase, doc_id, self.timeout)
    }

    pub fn acquire_with_timeout(
        &self,
        phase: &str,
        doc_id: Option<&str>,
        timeout: Duration,
    ) -> Result<PhaseLockGuard> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open lock file {}", self.path.display()))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) => {
                    if start.elapsed() >= timeout {
                        return Err(ServiceError::Transient(format!(
                            "GPU lock timeout after {}s (phase={}, doc_id={})",
                            timeout.as_secs(),
                            phase,
                            doc_id.unwrap_or("")
                        ))
                        .into());
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }

        // Holder marker, best-effort
        let _ = file.set_len(0);
        let _ = writeln!(
            file,
            "pid={} phase={} doc_id={} acquired_at={}",
            std::process::id(),
            phase,
            doc_id.unwrap_or(""),
            chrono::Utc::now().timestamp()
        );
        let _ = file.flush();

        info!(phase, doc_id = doc_id.unwrap_or(""), "GPU lock acquired");
        Ok(PhaseLockGuard {
            file,
            phase: phase.to_string(),
            acquired_at: Instant::now(),
        })
    }
}

impl Drop for PhaseLockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs2::FileExt::unlock(&self.file) {
            warn!(phase = %self.phase, error = %err, "GPU lock release failed");
        } else {
            info!(
                phase = %self.phase,
                duration_secs = self.acquired_at.elapsed().as_secs_f64(),
                "GPU lock released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock = PhaseLock::new(&dir.path().join("gpu.lock"), 5);

        let guard = lock.acquire("embedding", Some("doc1")).unwrap();
        drop(guard);

        // Re-acquire after release works
        let guard = lock.acquire("reranking", None).unwrap();
        drop(guard);
    }

    #[test]
    fn test_marker_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gpu.lock");
        let lock = PhaseLock::new(&path, 5);

        let _guard = lock.acquire("embedding", Some("doc42")).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("phase=embedding"));
        assert!(content.contains("doc_id=doc42"));
    }

    #[test]
    fn test_timeout_when_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gpu.lock");
        let lock = PhaseLock::new(&path, 5);

        let _held = lock.acquire("embedding", None).unwrap();

        // A second handle on the same file cannot lock; flock is per-handle
        let other = PhaseLock::new(&path, 5);
        let result = other.acquire_with_timeout("rerank", None, Duration::from_millis(400));
        let err = result.err().expect("second acquire should time out");
        assert!(err.to_string().contains("timeout"));
        let (status, _) = crate::error::classify(&err);
        assert_eq!(status, 503);
    }

    #[test]
    fn test_release_on_drop_allows_next_acquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gpu.lock");
        let lock = PhaseLock::new(&path, 5);

        {
            let _guard = lock.acquire("phase-a", None).unwrap();
        }
        let other = PhaseLock::new(&path, 5);
        let result = other.acquire_with_timeout("phase-b", None, Duration::from_millis(400));
        assert!(result.is_ok(), "lock should be free after guard drop");
    }
}
