//! Process-level plumbing: detaching from the terminal and the PID file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use daemonize::Daemonize;
use fs2::FileExt;

/// Detach from the controlling terminal. Must run before the tokio runtime
/// is built.
pub fn daemonize() -> anyhow::Result<()> {
    Daemonize::new()
        .working_directory("/")
        .umask(0o007_u32)
        .start()
        .context("failed to daemonize")
}

/// Another hub holds the PID file lock. An expected refusal, not a crash.
#[derive(Debug, thiserror::Error)]
#[error("PID file {} is locked by another instance (pid {holder})", path.display())]
pub struct AlreadyRunning {
    pub path: PathBuf,
    pub holder: String,
}

impl AlreadyRunning {
    pub fn is_in(error: &anyhow::Error) -> bool {
        error.chain().any(|cause| cause.is::<AlreadyRunning>())
    }
}

/// Exclusively locked PID file, removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    // Holds the lock.
    _file: File,
}

impl PidFile {
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open PID file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let holder = fs::read_to_string(path).unwrap_or_default();
            return Err(AlreadyRunning {
                path: path.to_path_buf(),
                holder: holder.trim().to_string(),
            }
            .into());
        }

        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .and_then(|()| file.sync_all())
            .with_context(|| format!("failed to write PID file {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
        }
    }
}
