//! End-to-end job orchestration: validate, acquire, plan, encode, publish, clean up.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{Span, error, info, instrument};
use uuid::Uuid;

use crate::collaborators::{AssetSource, DirectoryPublisher, LocalLibrarySource, PublicationSink};
use crate::config::ServiceConfig;
use crate::error::{CleanupWarning, PipelineError, PipelineResult};
use crate::executor::FfmpegExecutor;
use crate::media::{MediaAsset, MediaKind};
use crate::observability::{MetricsCollector, Phase};
use crate::overlay::OverlayRenderer;
use crate::plan::{PlanBuilder, TranscodePlan};
use crate::request::{AudioPolicy, JobRequest, JobResponse, TranscodeRequest};
use crate::workspace::{Workspace, WorkspaceManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct Job {
    id: String,
    status: JobStatus,
    request: JobRequest,
    plan: Option<TranscodePlan>,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            request,
            plan: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    /// The plan the job executed, once it got that far.
    pub fn plan(&self) -> Option<&TranscodePlan> {
        self.plan.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub video_url: String,
    pub duration: f64,
    pub audio_replaced: bool,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: PipelineResult<Published>,
    pub cleanup_warnings: Vec<CleanupWarning>,
    pub elapsed: Duration,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn response(&self) -> JobResponse {
        match &self.result {
            Ok(published) => JobResponse::Success {
                video_url: published.video_url.clone(),
                duration: published.duration,
                job_id: self.job.id().to_string(),
                audio_replaced: published.audio_replaced,
            },
            Err(err) => {
                let mut details = json!({
                    "jobId": self.job.id(),
                    "kind": err.kind(),
                    "httpStatus": err.http_status(),
                });
                if let PipelineError::Validation(errors) = err {
                    details["errors"] = json!(errors);
                }
                if let Some(diagnostics) = err.diagnostics() {
                    details["diagnostics"] = json!(diagnostics);
                }
                JobResponse::Error {
                    message: err.to_string(),
                    details: Some(details),
                }
            }
        }
    }
}

/// Runs jobs against one shared, read-only configuration.
pub struct JobRunner {
    config: Arc<ServiceConfig>,
    source: Arc<dyn AssetSource>,
    sink: Arc<dyn PublicationSink>,
    executor: FfmpegExecutor,
    renderer: OverlayRenderer,
    workspaces: WorkspaceManager,
    metrics: MetricsCollector,
}

impl JobRunner {
    /// Runner backed by the configured local library and output directory.
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        let source = Arc::new(LocalLibrarySource::new(&config.paths.library_dir));
        let sink = Arc::new(DirectoryPublisher::new(
            &config.paths.output_dir,
            config.paths.public_base_url.clone(),
        ));
        Self::with_collaborators(config, source, sink)
    }

    pub fn with_collaborators(
        config: Arc<ServiceConfig>,
        source: Arc<dyn AssetSource>,
        sink: Arc<dyn PublicationSink>,
    ) -> Self {
        Self {
            executor: FfmpegExecutor::new(config.engine.clone()),
            renderer: OverlayRenderer::new(config.overlay.clone()),
            workspaces: WorkspaceManager::new(&config.paths.workspace_root),
            metrics: MetricsCollector::new(),
            config,
            source,
            sink,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn executor(&self) -> &FfmpegExecutor {
        &self.executor
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    #[instrument(skip_all, fields(job_id))]
    pub fn run(&self, request: JobRequest) -> JobOutcome {
        let started = Instant::now();
        let mut job = Job::new(request);
        Span::current().record("job_id", job.id());

        let normalized = match TranscodeRequest::from_request(job.request(), &self.config.defaults)
        {
            Ok(normalized) => normalized,
            Err(err) => return self.finish(job, Err(err), Vec::new(), started),
        };

        job.status = JobStatus::Running;
        info!(
            video_id = %normalized.video_id,
            music_id = %normalized.music_id,
            overlays = normalized.overlays.len(),
            "Job started"
        );

        let run = self
            .workspaces
            .scoped(job.id(), |workspace| self.execute(&normalized, workspace));
        let result = run.result.map(|(plan, published)| {
            job.plan = Some(plan);
            published
        });
        self.finish(job, result, run.release.warnings, started)
    }

    /// Acquires and plans without encoding. The workspace is released before the
    /// plan is returned, so its paths only describe the invocation.
    #[instrument(skip_all)]
    pub fn dry_run(&self, request: &JobRequest) -> PipelineResult<TranscodePlan> {
        let normalized = TranscodeRequest::from_request(request, &self.config.defaults)?;
        let job_id = Uuid::new_v4().to_string();
        let run = self
            .workspaces
            .scoped(&job_id, |workspace| self.prepare(&normalized, workspace));
        self.metrics.record_cleanup_warnings(run.release.warnings.len());
        run.result
    }

    /// Runs `requests` on a pool of `workers` threads. Outcomes come back in
    /// request order.
    pub fn run_batch(&self, requests: Vec<JobRequest>, workers: usize) -> Vec<JobOutcome> {
        let started = Instant::now();
        let total = requests.len();
        let workers = workers.clamp(1, total.max(1));
        let queue = Mutex::new(requests.into_iter().enumerate());
        let done = Mutex::new(Vec::with_capacity(total));

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).next();
                        let Some((index, request)) = next else {
                            break;
                        };
                        let outcome = self.run(request);
                        done.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((index, outcome));
                    }
                });
            }
        });

        self.metrics.record_total_duration(started.elapsed());
        let mut done = done.into_inner().unwrap_or_else(PoisonError::into_inner);
        done.sort_by_key(|(index, _)| *index);
        done.into_iter().map(|(_, outcome)| outcome).collect()
    }

    fn prepare(
        &self,
        request: &TranscodeRequest,
        workspace: &Workspace,
    ) -> PipelineResult<TranscodePlan> {
        let (video, audio) = {
            let _timer = self.metrics.start_phase(Phase::Acquire);
            let video = self
                .source
                .acquire(&request.video_id, MediaKind::Video, workspace)?;
            let audio = self
                .source
                .acquire(&request.music_id, MediaKind::Audio, workspace)?;
            (
                MediaAsset::new(video, MediaKind::Video),
                MediaAsset::new(audio, MediaKind::Audio),
            )
        };

        let _timer = self.metrics.start_phase(Phase::Plan);
        PlanBuilder::new(&self.renderer, &self.config.encode, &self.executor)
            .build(request, &video, &audio, workspace)
    }

    fn execute(
        &self,
        request: &TranscodeRequest,
        workspace: &Workspace,
    ) -> PipelineResult<(TranscodePlan, Published)> {
        let plan = self.prepare(request, workspace)?;

        let output = {
            let _timer = self.metrics.start_phase(Phase::Encode);
            self.executor.run(&plan)?
        };

        let video_url = {
            let _timer = self.metrics.start_phase(Phase::Publish);
            self.sink.publish(output.path(), workspace.job_id())?
        };

        let published = Published {
            video_url,
            duration: output
                .cached_duration()
                .unwrap_or(plan.effective_duration()),
            audio_replaced: plan.audio_policy() == AudioPolicy::Replace,
        };
        Ok((plan, published))
    }

    fn finish(
        &self,
        mut job: Job,
        result: PipelineResult<Published>,
        cleanup_warnings: Vec<CleanupWarning>,
        started: Instant,
    ) -> JobOutcome {
        let elapsed = started.elapsed();
        self.metrics.record_cleanup_warnings(cleanup_warnings.len());
        match &result {
            Ok(published) => {
                job.status = JobStatus::Succeeded;
                self.metrics.record_success();
                info!(
                    url = %published.video_url,
                    duration_s = published.duration,
                    elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                    "Job succeeded"
                );
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                self.metrics.record_failure(err.kind());
                error!(
                    kind = err.kind(),
                    error = %err,
                    elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                    "Job failed"
                );
            }
        }
        JobOutcome {
            job,
            result,
            cleanup_warnings,
            elapsed,
        }
    }
}

/// Paths of request files, expanded from glob patterns where needed.
pub fn expand_request_paths(patterns: &[String]) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        let mut matched = false;
        for entry in glob::glob(pattern)? {
            paths.push(entry?);
            matched = true;
        }
        if !matched {
            paths.push(PathBuf::from(pattern));
        }
    }
    Ok(paths)
}
