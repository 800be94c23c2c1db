//! Where assets come from and where finished reels go.

use std::path::{Path, PathBuf};

use glob::{Pattern, glob};
use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::media::MediaKind;
use crate::workspace::Workspace;

/// Resolves an asset id to a local file inside the job workspace.
pub trait AssetSource: Send + Sync {
    fn acquire(&self, asset_id: &str, kind: MediaKind, workspace: &Workspace)
    -> PipelineResult<PathBuf>;
}

/// Makes a finished file reachable and returns its public location.
pub trait PublicationSink: Send + Sync {
    fn publish(&self, path: &Path, job_id: &str) -> PipelineResult<String>;
}

/// Asset ids are file names (with or without extension) in a local directory.
#[derive(Debug, Clone)]
pub struct LocalLibrarySource {
    library: PathBuf,
}

impl LocalLibrarySource {
    pub fn new(library: impl Into<PathBuf>) -> Self {
        Self {
            library: library.into(),
        }
    }

    fn locate(&self, asset_id: &str) -> PipelineResult<PathBuf> {
        if asset_id.is_empty()
            || asset_id.contains(['/', '\\'])
            || asset_id == "."
            || asset_id.contains("..")
        {
            return Err(PipelineError::acquisition(asset_id, "invalid asset id"));
        }

        let exact = self.library.join(asset_id);
        if exact.is_file() {
            return Ok(exact);
        }

        let pattern = format!(
            "{}/{}.*",
            Pattern::escape(&self.library.to_string_lossy()),
            Pattern::escape(asset_id)
        );
        let mut matches: Vec<PathBuf> = glob(&pattern)
            .map_err(|err| PipelineError::acquisition(asset_id, err.to_string()))?
            .flatten()
            .filter(|path| path.is_file())
            .collect();
        matches.sort();
        matches.into_iter().next().ok_or_else(|| {
            PipelineError::acquisition(
                asset_id,
                format!("not found in {}", self.library.display()),
            )
        })
    }
}

impl AssetSource for LocalLibrarySource {
    fn acquire(
        &self,
        asset_id: &str,
        kind: MediaKind,
        workspace: &Workspace,
    ) -> PipelineResult<PathBuf> {
        let source = self.locate(asset_id)?;
        let extension = source
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let target = workspace.reserve(&format!("{}{extension}", kind.as_str()))?;
        std::fs::copy(&source, &target)
            .map_err(|err| PipelineError::acquisition(asset_id, err.to_string()))?;
        debug!(
            asset_id,
            kind = kind.as_str(),
            source = %source.display(),
            target = %target.display(),
            "Asset acquired"
        );
        Ok(target)
    }
}

/// Copies finished reels into a served directory.
#[derive(Debug, Clone)]
pub struct DirectoryPublisher {
    output_dir: PathBuf,
    base_url: Option<String>,
}

impl DirectoryPublisher {
    pub fn new(output_dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            base_url,
        }
    }

    pub fn file_name(job_id: &str) -> String {
        format!("reel_{job_id}.mp4")
    }
}

impl PublicationSink for DirectoryPublisher {
    fn publish(&self, path: &Path, job_id: &str) -> PipelineResult<String> {
        let fail = |reason: String| PipelineError::PublicationFailed {
            path: path.to_path_buf(),
            reason,
        };
        std::fs::create_dir_all(&self.output_dir).map_err(|err| {
            fail(format!(
                "cannot create {}: {err}",
                self.output_dir.display()
            ))
        })?;
        let name = Self::file_name(job_id);
        let target = self.output_dir.join(&name);
        std::fs::copy(path, &target).map_err(|err| fail(err.to_string()))?;

        let location = match &self.base_url {
            Some(base) => format!("{}/{name}", base.trim_end_matches('/')),
            None => std::path::absolute(&target)
                .unwrap_or(target)
                .display()
                .to_string(),
        };
        info!(job_id, location = %location, "Reel published");
        Ok(location)
    }
}
