//! Per-job scratch directories and the guarantee that everything created in them
//! is removed again.
//!
//! A job only ever sees a [`Workspace`] through [`WorkspaceManager::scoped`], which
//! releases it on every return path. Dropping an unreleased workspace (for example
//! while unwinding from a panic) releases it as well.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use glob::{Pattern, glob};
use tracing::{debug, info, warn};

use crate::error::{CleanupWarning, PipelineError, PipelineResult};

const DIR_PREFIX: &str = "job-";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{DIR_PREFIX}{job_id}"))
    }

    /// Creates the isolated directory for `job_id`. Fails if it already exists.
    pub fn open(&self, job_id: &str) -> PipelineResult<Workspace> {
        if job_id.is_empty()
            || !job_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(PipelineError::Workspace {
                path: self.root.clone(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid job id '{job_id}'"),
                ),
            });
        }
        let dir = self.path_for(job_id);
        let wrap = |source: io::Error| PipelineError::Workspace {
            path: dir.clone(),
            source,
        };
        std::fs::create_dir_all(&self.root).map_err(wrap)?;
        std::fs::create_dir(&dir).map_err(wrap)?;
        debug!(job_id, dir = %dir.display(), "Workspace opened");
        Ok(Workspace {
            job_id: job_id.to_string(),
            dir,
            registered: Mutex::new(Vec::new()),
            released: false,
        })
    }

    /// Acquire a workspace, run `work` in it, release it. The release happens whether
    /// `work` succeeds or fails, and before the result is handed back.
    pub fn scoped<T, F>(&self, job_id: &str, work: F) -> ScopedRun<T>
    where
        F: FnOnce(&Workspace) -> PipelineResult<T>,
    {
        let workspace = match self.open(job_id) {
            Ok(workspace) => workspace,
            Err(err) => {
                return ScopedRun {
                    result: Err(err),
                    release: ReleaseReport::default(),
                };
            }
        };
        let result = work(&workspace);
        let release = workspace.release();
        ScopedRun { result, release }
    }

    /// Removes `job-*` directories older than `max_age` left behind by a crashed
    /// process.
    pub fn recover_stale(&self, max_age: Duration) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let pattern = format!(
            "{}/{DIR_PREFIX}*",
            Pattern::escape(&self.root.to_string_lossy())
        );
        let entries = match glob(&pattern) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(pattern, error = %err, "Invalid workspace pattern; skipping recovery");
                return report;
            }
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            if !entry.is_dir() {
                continue;
            }
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    report.warnings.push(CleanupWarning {
                        path: entry.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                report.kept += 1;
                continue;
            }
            match std::fs::remove_dir_all(&entry) {
                Ok(()) => {
                    info!(
                        dir = %entry.display(),
                        last_modified = %DateTime::<Utc>::from(modified).to_rfc3339(),
                        "Removed stale workspace"
                    );
                    report.removed.push(entry);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(dir = %entry.display(), error = %err, "Failed to remove stale workspace");
                    report.warnings.push(CleanupWarning {
                        path: entry,
                        reason: err.to_string(),
                    });
                }
            }
        }
        report
    }
}

#[derive(Debug)]
pub struct ScopedRun<T> {
    pub result: PipelineResult<T>,
    pub release: ReleaseReport,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub warnings: Vec<CleanupWarning>,
}

#[derive(Debug, Default)]
pub struct ReleaseReport {
    pub removed: usize,
    pub warnings: Vec<CleanupWarning>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// A job's private directory plus every transient path created for the job.
#[derive(Debug)]
pub struct Workspace {
    job_id: String,
    dir: PathBuf,
    registered: Mutex<Vec<PathBuf>>,
    released: bool,
}

impl Workspace {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records a transient path for deletion on release. Call it as soon as the
    /// path is chosen, before the file is written.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut guard = self
            .registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.contains(&path) {
            debug!(job_id = %self.job_id, path = %path.display(), "Registered transient file");
            guard.push(path);
        }
    }

    /// Registers and returns `<workspace>/<file_name>`.
    pub fn reserve(&self, file_name: &str) -> PipelineResult<PathBuf> {
        let valid = !file_name.is_empty()
            && file_name != "."
            && file_name != ".."
            && !file_name.contains(['/', '\\']);
        if !valid {
            return Err(PipelineError::Workspace {
                path: self.dir.clone(),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid workspace file name '{file_name}'"),
                ),
            });
        }
        let path = self.dir.join(file_name);
        self.register(path.clone());
        Ok(path)
    }

    pub fn registered(&self) -> Vec<PathBuf> {
        self.registered
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Deletes every registered path and then the directory. Individual failures
    /// are logged and reported, never raised; a missing file is not a failure.
    pub fn release(mut self) -> ReleaseReport {
        self.release_inner()
    }

    fn release_inner(&mut self) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        if self.released {
            return report;
        }
        self.released = true;

        let paths = std::mem::take(
            &mut *self
                .registered
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for path in paths.iter().rev() {
            let outcome = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            match outcome {
                Ok(()) => report.removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(job_id = %self.job_id, path = %path.display(), error = %err, "Failed to delete transient file");
                    report.warnings.push(CleanupWarning {
                        path: path.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(job_id = %self.job_id, dir = %self.dir.display(), error = %err, "Failed to delete workspace");
                report.warnings.push(CleanupWarning {
                    path: self.dir.clone(),
                    reason: err.to_string(),
                });
            }
        }

        debug!(
            job_id = %self.job_id,
            removed = report.removed,
            warnings = report.warnings.len(),
            "Workspace released"
        );
        report
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.released {
            warn!(job_id = %self.job_id, "Workspace dropped without release; releasing now");
            self.release_inner();
        }
    }
}
