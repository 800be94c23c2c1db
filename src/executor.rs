//! The only place that spawns the media engine. Lowers a [`TranscodePlan`] to one
//! filter graph and one invocation, and answers duration probes.

use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use crate::config::{EncodeSettings, EngineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::graph::{Filter, FilterGraph, Pad};
use crate::media::{MediaAsset, MediaKind, MediaProbe};
use crate::overlay::{DrawText, OverlayDirective};
use crate::plan::{PlanStage, TranscodePlan};
use crate::request::AudioPolicy;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct FfmpegExecutor {
    config: EngineConfig,
}

impl FfmpegExecutor {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs the plan's single engine invocation and returns the encoded output.
    #[instrument(skip_all, fields(job_id = plan.job_id()))]
    pub fn run(&self, plan: &TranscodePlan) -> PipelineResult<MediaAsset> {
        let output = plan.output();
        if output.path.exists() && !output.overwrite {
            return Err(PipelineError::Workspace {
                path: output.path.clone(),
                source: io::Error::new(io::ErrorKind::AlreadyExists, "output already exists"),
            });
        }

        let args = engine_args(plan);
        debug!(engine = %self.config.ffmpeg.display(), args = ?args, "Starting encode");

        let mut command = Command::new(&self.config.ffmpeg);
        command.args(&args);
        let limit = self.config.encode_timeout();
        let started = Instant::now();
        let finished = match run_bounded(command, limit) {
            Ok(finished) => finished,
            Err(RunError::Spawn(err)) => {
                return Err(PipelineError::EncodeFailed {
                    exit_code: None,
                    diagnostics: format!(
                        "failed to start {}: {err}",
                        self.config.ffmpeg.display()
                    ),
                });
            }
            Err(RunError::Wait(err)) => {
                return Err(PipelineError::EncodeFailed {
                    exit_code: None,
                    diagnostics: format!("failed to wait for encoder: {err}"),
                });
            }
            Err(RunError::TimedOut) => {
                error!(limit_s = limit.as_secs(), "Encoder timed out and was killed");
                return Err(PipelineError::Timeout { limit });
            }
        };

        if !finished.status.success() {
            let diagnostics = tail_lines(&finished.stderr, DIAGNOSTIC_LINES);
            warn!(status = ?finished.status.code(), "Encoder failed");
            return Err(PipelineError::EncodeFailed {
                exit_code: finished.status.code(),
                diagnostics,
            });
        }

        info!(
            output = %output.path.display(),
            duration_s = plan.effective_duration(),
            elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0,
            "Encode finished"
        );
        Ok(MediaAsset::with_duration(
            &output.path,
            MediaKind::Video,
            plan.effective_duration(),
        ))
    }

    fn probe(&self, path: &Path, args: &[&str]) -> PipelineResult<String> {
        let mut command = Command::new(&self.config.ffprobe);
        command.args(args).arg(path);
        let limit = self.config.probe_timeout();
        match run_bounded(command, limit) {
            Ok(finished) if finished.status.success() => Ok(finished.stdout),
            Ok(finished) => Err(PipelineError::invalid_duration(
                path,
                format!(
                    "probe exited with {:?}: {}",
                    finished.status.code(),
                    tail_lines(&finished.stderr, 3)
                ),
            )),
            Err(RunError::Spawn(err)) => Err(PipelineError::invalid_duration(
                path,
                format!("failed to start {}: {err}", self.config.ffprobe.display()),
            )),
            Err(RunError::Wait(err)) => Err(PipelineError::invalid_duration(path, err.to_string())),
            Err(RunError::TimedOut) => Err(PipelineError::invalid_duration(
                path,
                format!("probe exceeded {}s", limit.as_secs()),
            )),
        }
    }
}

impl MediaProbe for FfmpegExecutor {
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64> {
        let meta = std::fs::metadata(path)
            .map_err(|err| PipelineError::invalid_duration(path, err.to_string()))?;
        if meta.len() == 0 {
            return Err(PipelineError::invalid_duration(path, "file is empty"));
        }
        let stdout = self.probe(
            path,
            &[
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ],
        )?;
        let duration = parse_duration(&stdout)
            .ok_or_else(|| {
                PipelineError::invalid_duration(path, format!("unusable duration {:?}", stdout.trim()))
            })?;
        debug!(path = %path.display(), duration_s = duration, "Probed duration");
        Ok(duration)
    }

    fn has_audio(&self, path: &Path) -> PipelineResult<bool> {
        let stdout = self.probe(
            path,
            &[
                "-v",
                "error",
                "-select_streams",
                "a",
                "-show_entries",
                "stream=codec_type",
                "-of",
                "csv=p=0",
            ],
        )?;
        Ok(stdout.lines().any(|line| line.trim() == "audio"))
    }
}

fn parse_duration(stdout: &str) -> Option<f64> {
    let value: f64 = stdout.lines().next()?.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Lowers the plan's stages to a filter graph. Returns the graph and the pads to
/// map as the video and audio outputs.
pub fn filter_graph(plan: &TranscodePlan) -> (FilterGraph, Pad, Pad) {
    let mut graph = FilterGraph::new();
    let duration = seconds(plan.effective_duration());
    let mut video = VideoChain::new();
    let mut audio_out = Pad::new("aout");
    let mut next_input = 2;

    for stage in plan.stages() {
        match stage {
            PlanStage::Trim => {
                video.push(Filter::new("trim").opt("duration", &duration));
                video.push(Filter::new("setpts").arg("PTS-STARTPTS"));
            }
            PlanStage::ScaleCrop { resolution } => {
                video.push(
                    Filter::new("scale")
                        .opt("w", resolution.width)
                        .opt("h", resolution.height)
                        .opt("force_original_aspect_ratio", "increase"),
                );
                video.push(
                    Filter::new("crop")
                        .opt("w", resolution.width)
                        .opt("h", resolution.height),
                );
                video.push(Filter::new("setsar").arg(1));
            }
            PlanStage::Overlay(OverlayDirective::DrawText(draw)) => {
                video.push(drawtext(draw));
            }
            PlanStage::Overlay(OverlayDirective::Image { .. }) => {
                video.composite(&mut graph, Pad::input(next_input, 'v'));
                next_input += 1;
            }
            PlanStage::Audio { policy } => {
                audio_out = audio_chain(&mut graph, *policy, &duration);
            }
            PlanStage::Encode(_) => {}
        }
    }

    let video_out = video.finish(&mut graph);
    (graph, video_out, audio_out)
}

/// The complete engine argument list for `plan`, output path last.
pub fn engine_args(plan: &TranscodePlan) -> Vec<String> {
    let (graph, video_out, audio_out) = filter_graph(plan);
    let inputs = plan.inputs();
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        if plan.output().overwrite { "-y" } else { "-n" }.into(),
        "-i".into(),
        inputs.video.display().to_string(),
        "-i".into(),
        inputs.audio.display().to_string(),
    ];
    for image in plan.overlay_images() {
        args.push("-i".into());
        args.push(image.display().to_string());
    }
    args.push("-filter_complex".into());
    args.push(graph.render());
    args.extend([
        "-map".into(),
        video_out.to_string(),
        "-map".into(),
        audio_out.to_string(),
        "-t".into(),
        seconds(plan.effective_duration()),
    ]);
    if let Some(settings) = plan.encode_settings() {
        args.extend(encode_args(settings));
    }
    args.push(plan.output().path.display().to_string());
    args
}

fn encode_args(settings: &EncodeSettings) -> Vec<String> {
    let mut args = vec![
        "-c:v".to_string(),
        settings.video_codec.clone(),
        "-preset".into(),
        settings.preset.clone(),
        "-crf".into(),
        settings.crf.to_string(),
        "-pix_fmt".into(),
        settings.pixel_format.clone(),
        "-c:a".into(),
        settings.audio_codec.clone(),
        "-b:a".into(),
        settings.audio_bitrate.clone(),
        "-ac".into(),
        settings.audio_channels.to_string(),
    ];
    if settings.faststart {
        args.push("-movflags".into());
        args.push("+faststart".into());
    }
    args
}

fn drawtext(draw: &DrawText) -> Filter {
    let mut filter = Filter::new("drawtext")
        .opt("expansion", "none")
        .opt("text", &draw.text);
    if let Some(font) = &draw.font_file {
        filter = filter.opt("fontfile", font.display());
    }
    if draw.center_lines {
        filter = filter.opt("text_align", "C");
    }
    filter
        .opt("fontsize", draw.font_size)
        .opt("fontcolor", draw.fill.to_engine())
        .opt("box", 1)
        .opt("boxcolor", draw.box_color.to_engine())
        .opt("boxborderw", draw.box_padding)
        .opt("borderw", draw.stroke_width)
        .opt("bordercolor", draw.stroke_color.to_engine())
        .opt("x", &draw.x)
        .opt("y", &draw.y)
}

fn audio_chain(graph: &mut FilterGraph, policy: AudioPolicy, duration: &str) -> Pad {
    let trimmed = || {
        vec![
            Filter::new("atrim").opt("duration", duration),
            Filter::new("asetpts").arg("PTS-STARTPTS"),
        ]
    };
    let out = Pad::new("aout");
    match policy {
        AudioPolicy::Replace => {
            graph.chain(vec![Pad::input(1, 'a')], trimmed(), vec![out.clone()]);
        }
        AudioPolicy::Mix => {
            for index in [0, 1] {
                graph.chain(
                    vec![Pad::input(index, 'a')],
                    trimmed(),
                    vec![Pad::new(format!("a{index}"))],
                );
            }
            graph.chain(
                vec![Pad::new("a0"), Pad::new("a1")],
                vec![
                    Filter::new("amix")
                        .opt("inputs", 2)
                        .opt("duration", "shortest")
                        .opt("dropout_transition", 0),
                ],
                vec![out.clone()],
            );
        }
    }
    out
}

/// Accumulates the main video chain, splitting it wherever an image overlay needs
/// a second input.
struct VideoChain {
    current: Pad,
    pending: Vec<Filter>,
    labels: usize,
}

impl VideoChain {
    fn new() -> Self {
        Self {
            current: Pad::input(0, 'v'),
            pending: Vec::new(),
            labels: 0,
        }
    }

    fn push(&mut self, filter: Filter) {
        self.pending.push(filter);
    }

    fn next_label(&mut self) -> Pad {
        let pad = Pad::new(format!("v{}", self.labels));
        self.labels += 1;
        pad
    }

    fn flush(&mut self, graph: &mut FilterGraph) {
        if self.pending.is_empty() {
            return;
        }
        let out = self.next_label();
        graph.chain(
            vec![self.current.clone()],
            std::mem::take(&mut self.pending),
            vec![out.clone()],
        );
        self.current = out;
    }

    fn composite(&mut self, graph: &mut FilterGraph, image: Pad) {
        self.flush(graph);
        let out = self.next_label();
        graph.chain(
            vec![self.current.clone(), image],
            vec![Filter::new("overlay").opt("x", 0).opt("y", 0)],
            vec![out.clone()],
        );
        self.current = out;
    }

    fn finish(mut self, graph: &mut FilterGraph) -> Pad {
        self.flush(graph);
        self.current
    }
}

fn seconds(value: f64) -> String {
    format!("{value:.3}")
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

#[derive(Debug)]
enum RunError {
    Spawn(io::Error),
    Wait(io::Error),
    TimedOut,
}

struct Finished {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

/// Runs `command` to completion or until `limit` elapses, in which case the child
/// is killed and reaped. Output pipes are drained on helper threads.
fn run_bounded(mut command: Command, limit: Duration) -> Result<Finished, RunError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(RunError::Spawn)?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + limit;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill(&mut child);
                return Err(RunError::TimedOut);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                kill(&mut child);
                return Err(RunError::Wait(err));
            }
        }
    };

    Ok(Finished {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "Kill failed; child already exited");
    }
    if let Err(err) = child.wait() {
        warn!(error = %err, "Failed to reap killed child");
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_duration("12.480000\n"), Some(12.48));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration("0.000000"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("inf"), None);
    }

    #[test]
    fn tail_keeps_last_non_empty_lines() {
        let text = "a\n\nb\nc\n\n";
        assert_eq!(tail_lines(text, 2), "b\nc");
        assert_eq!(tail_lines(text, 10), "a\nb\nc");
    }

    fn caption(text: &str, center_lines: bool) -> DrawText {
        use crate::overlay::{Color, OverlaySlot};
        DrawText {
            slot: OverlaySlot::Center,
            text: text.into(),
            font_file: None,
            font_size: 44,
            fill: Color::WHITE,
            box_color: Color::shade(0.65),
            box_padding: 20,
            stroke_width: 2,
            stroke_color: Color::BLACK,
            x: "(w-text_w)/2".into(),
            y: "(h-text_h)/2".into(),
            center_lines,
        }
    }

    #[test]
    fn wrapped_drawtext_centers_each_line() {
        let filter = drawtext(&caption("first line\nsecond", true));
        assert_eq!(filter.get("text_align"), Some("C"));
        let filter = drawtext(&caption("single", false));
        assert_eq!(filter.get("text_align"), None);
    }

    #[test]
    fn zero_byte_file_fails_without_spawning() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("empty.mp4");
        std::fs::write(&path, b"").unwrap();
        let executor = FfmpegExecutor::new(EngineConfig {
            ffprobe: "/nonexistent/ffprobe".into(),
            ..EngineConfig::default()
        });
        let err = executor.probe_duration(&path).unwrap_err();
        assert_eq!(err.kind(), "invalid_duration");
        assert!(err.to_string().contains("file is empty"));
    }
}
