use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[cfg(feature = "metrics-server")]
pub mod server;

/// Pipeline phases with their own timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Acquire,
    Plan,
    Encode,
    Publish,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Acquire => "acquire",
            Phase::Plan => "plan",
            Phase::Encode => "encode",
            Phase::Publish => "publish",
        }
    }
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub phases: BTreeMap<String, PhaseMetrics>,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub cleanup_warnings: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub total_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct PhaseMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Cloneable handle; clones share one snapshot.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_phase(&self, phase: Phase) -> PhaseTimer {
        PhaseTimer {
            phase,
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_success(&self) {
        self.update(|snapshot| snapshot.jobs_succeeded += 1);
    }

    /// Counts a failed job under its error kind. Timeouts are also counted apart.
    pub fn record_failure(&self, kind: &str) {
        self.update(|snapshot| {
            snapshot.jobs_failed += 1;
            if kind == "timeout" {
                snapshot.jobs_timed_out += 1;
            }
            *snapshot.failures_by_kind.entry(kind.to_string()).or_default() += 1;
        });
    }

    pub fn record_cleanup_warnings(&self, count: usize) {
        if count > 0 {
            self.update(|snapshot| snapshot.cleanup_warnings += count as u64);
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        self.update(|snapshot| snapshot.total_duration_ms = duration.as_secs_f64() * 1_000.0);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn update(&self, apply: impl FnOnce(&mut MetricsSnapshot)) {
        if let Ok(mut guard) = self.inner.lock() {
            apply(&mut guard);
        }
    }
}

/// Records the elapsed time of one phase when dropped.
pub struct PhaseTimer {
    phase: Phase,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl PhaseTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard
                .phases
                .entry(self.phase.as_str().to_string())
                .or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            phase = self.phase.as_str(),
            duration_ms, "Phase duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        succeeded = snapshot.jobs_succeeded,
        failed = snapshot.jobs_failed,
        timed_out = snapshot.jobs_timed_out,
        cleanup_warnings = snapshot.cleanup_warnings,
        "Job metrics summary"
    );
    for (phase, metrics) in &snapshot.phases {
        info!(
            phase = phase.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Phase metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        counter(
            &mut output,
            "reel_jobs_succeeded_total",
            "Jobs that produced a published reel",
            self.jobs_succeeded,
        );
        counter(
            &mut output,
            "reel_jobs_failed_total",
            "Jobs that ended with an error",
            self.jobs_failed,
        );
        counter(
            &mut output,
            "reel_jobs_timed_out_total",
            "Jobs whose encode exceeded the time limit",
            self.jobs_timed_out,
        );
        counter(
            &mut output,
            "reel_cleanup_warnings_total",
            "Transient files that could not be removed",
            self.cleanup_warnings,
        );

        output.push_str("# HELP reel_job_failures_total Failed jobs by error kind\n");
        output.push_str("# TYPE reel_job_failures_total counter\n");
        for (kind, count) in &self.failures_by_kind {
            let _ = writeln!(output, "reel_job_failures_total{{kind=\"{kind}\"}} {count}");
        }

        output.push_str("# HELP reel_phase_calls_total Phase invocation count\n");
        output.push_str("# TYPE reel_phase_calls_total counter\n");
        output.push_str(
            "# HELP reel_phase_duration_seconds_total Accumulated phase duration in seconds\n",
        );
        output.push_str("# TYPE reel_phase_duration_seconds_total counter\n");
        output.push_str("# HELP reel_phase_duration_seconds_max Maximum phase duration in seconds\n");
        output.push_str("# TYPE reel_phase_duration_seconds_max gauge\n");
        for (phase, metrics) in &self.phases {
            let _ = writeln!(
                output,
                "reel_phase_calls_total{{phase=\"{phase}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "reel_phase_duration_seconds_total{{phase=\"{phase}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "reel_phase_duration_seconds_max{{phase=\"{phase}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }

        output.push_str("# HELP reel_run_duration_seconds Wall-clock duration of the last run\n");
        output.push_str("# TYPE reel_run_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "reel_run_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}
