//! Per-attempt scratch directory.

use std::io;
use std::path::{Path, PathBuf};

use podforge_core::JobId;
use tempfile::TempDir;

/// A private directory holding every intermediate file of one attempt.
///
/// The directory is removed when the workspace is closed or dropped, whichever
/// comes first, so every exit path of an attempt (success, error, panic,
/// cancellation) cleans up.
#[derive(Debug)]
pub struct TempWorkspace {
    dir: TempDir,
}

impl TempWorkspace {
    /// Create a fresh directory under `root`, named after the job and attempt.
    pub fn create(root: &Path, job_id: JobId, attempt: u32) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{job_id}-a{attempt}-"))
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Path of a file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Create (if needed) and return a subdirectory.
    pub async fn subdir(&self, name: &str) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Remove the directory now and report failures instead of ignoring them.
    pub async fn close(self) -> io::Result<()> {
        let dir = self.dir;
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(io::Error::other)?
    }
}
