//! File-mediated request/response between bridge commands and the harvester.
//!
//! Every bridge command writes its textual output into a [`TempArtifact`]
//! under the scratch root. Artifacts are read exactly once:
//! [`ArtifactStore::consume`] takes the artifact by value, reads it and
//! deletes it, so one artifact can never serve two pending commands.
//!
//! # RAII Cleanup
//!
//! An artifact that is never consumed (its command timed out, or the
//! pipeline bailed early) is removed when it is dropped.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};
use crate::model::BridgeOp;

/// Ephemeral output file of one bridge command.
///
/// Not `Clone`: exactly one owner reads (and thereby deletes) it.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    consumed: bool,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.consumed && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove stale artifact");
            }
        }
    }
}

/// Allocates, reads and deletes artifacts under one scratch directory.
#[derive(Debug)]
pub struct ArtifactStore {
    scratch_root: PathBuf,
    seq: AtomicU64,
}

/// Strips surrounding whitespace from a path before use.
fn normalize(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(s.trim()),
        None => path.to_path_buf(),
    }
}

impl ArtifactStore {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: normalize(&scratch_root.into()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Creates the scratch directory if needed.
    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_root).await?;
        Ok(())
    }

    /// Reserves a fresh artifact path.
    ///
    /// `owner` is the device path segment (or `host` for run-level commands),
    /// so concurrent devices never share a namespace; the sequence number
    /// makes each call unique within the store. Path segments never contain
    /// `@`, which keeps `<owner>@<stamp>-` an unambiguous prefix.
    pub fn allocate(&self, owner: &str, stamp: u64, op: BridgeOp) -> TempArtifact {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}@{}-{}-{}.txt", owner, stamp, op, seq);
        TempArtifact {
            path: self.scratch_root.join(name),
            consumed: false,
        }
    }

    pub async fn write(&self, path: impl AsRef<Path>, content: &str) -> Result<()> {
        tokio::fs::write(normalize(path.as_ref()), content).await?;
        Ok(())
    }

    /// Reads an artifact's content.
    ///
    /// # Errors
    ///
    /// [`HarvestError::ArtifactMissing`] if the file does not exist.
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = normalize(path.as_ref());
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(HarvestError::ArtifactMissing { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal; a missing file is not an error.
    pub async fn delete(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete artifact"),
        }
    }

    /// Reads then deletes the artifact.
    pub async fn consume(&self, mut artifact: TempArtifact) -> Result<String> {
        let content = self.read(&artifact.path).await;
        self.delete(&artifact.path).await;
        artifact.consumed = true;
        content
    }

    /// Removes any artifacts still on disk for one (owner, stamp) pair and
    /// returns how many were found.
    pub async fn purge(&self, owner: &str, stamp: u64) -> usize {
        let prefix = format!("{}@{}-", owner, stamp);
        let mut removed = 0;
        let Ok(mut entries) = tokio::fs::read_dir(&self.scratch_root).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                self.delete(entry.path()).await;
                removed += 1;
            }
        }
        removed
    }

    /// Polls until `path` exists, backing off from 10ms up to 250ms.
    ///
    /// # Errors
    ///
    /// [`HarvestError::ArtifactTimeout`] if it has not appeared within `timeout`.
    pub async fn await_ready(&self, path: impl AsRef<Path>, timeout: Duration) -> Result<()> {
        let path = normalize(path.as_ref());
        let deadline = Instant::now() + timeout;
        let mut backoff = Duration::from_millis(10);

        loop {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(path = %path.display(), "Artifact never appeared");
                return Err(HarvestError::ArtifactTimeout {
                    path,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(Duration::from_millis(250));
        }
    }
}
