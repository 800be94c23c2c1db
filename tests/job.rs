#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Encoder, Fixture};
use reel_forge::PipelineError;
use reel_forge::job::{JobRunner, JobStatus};
use reel_forge::request::{JobRequest, JobResponse};
use serde_json::json;
use tempfile::tempdir;

fn request(value: serde_json::Value) -> JobRequest {
    serde_json::from_value(value).unwrap()
}

fn basic_fixture(root: &std::path::Path, encoder: Encoder) -> Fixture {
    let fixture = Fixture::new(root);
    fixture.add_asset("clip.mp4", b"video bytes");
    fixture.add_asset("song.mp3", b"music bytes");
    fixture.install_probe("10.0", "15.0", true);
    fixture.install_encoder(encoder);
    fixture
}

#[test]
fn successful_job_publishes_and_cleans_up() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let outcome = runner.run(request(json!({
        "videoId": "clip",
        "musicId": "song",
        "overlays": {"top": {"text": "It's day one: begin, now"}}
    })));

    assert_eq!(outcome.job.status(), JobStatus::Succeeded, "{:?}", outcome.result);
    let job_id = outcome.job.id().to_string();
    match outcome.response() {
        JobResponse::Success {
            video_url,
            duration,
            job_id: response_id,
            audio_replaced,
        } => {
            assert_eq!(video_url, format!("https://cdn.test/reels/reel_{job_id}.mp4"));
            assert_eq!(duration, 10.0);
            assert_eq!(response_id, job_id);
            assert!(audio_replaced);
        }
        other => panic!("unexpected response {other:?}"),
    }

    assert!(fixture.outputs.join(format!("reel_{job_id}.mp4")).is_file());
    assert!(fixture.leftover_workspaces().is_empty());
    assert!(outcome.cleanup_warnings.is_empty());

    let args = fixture.logged_args();
    let graph_at = args.iter().position(|a| a == "-filter_complex").unwrap();
    let graph = &args[graph_at + 1];
    assert!(graph.contains(r"text=It\\\'s day one\\: begin\, now"), "{graph}");
    assert!(graph.contains("trim=duration=10.000"));
    let t_at = args.iter().position(|a| a == "-t").unwrap();
    assert_eq!(args[t_at + 1], "10.000");
    assert!(args.contains(&"-n".to_string()));

    let plan = outcome.job.plan().unwrap();
    assert_eq!(plan.effective_duration(), 10.0);
    assert_eq!(plan.overlay_count(), 1);

    let snapshot = runner.metrics().snapshot();
    assert_eq!(snapshot.jobs_succeeded, 1);
    for phase in ["acquire", "plan", "encode", "publish"] {
        assert_eq!(snapshot.phases[phase].calls, 1, "phase {phase}");
    }
}

#[test]
fn zero_byte_video_fails_before_encoding() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    fixture.add_asset("clip.mp4", b"");
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let outcome = runner.run(request(json!({"videoId": "clip", "musicId": "song"})));

    assert!(matches!(
        outcome.result,
        Err(PipelineError::InvalidDuration { .. })
    ));
    assert_eq!(outcome.job.status(), JobStatus::Failed);
    assert!(!fixture.args_log().exists(), "encoder must not run");
    assert!(fixture.leftover_workspaces().is_empty());
}

#[test]
fn missing_asset_is_an_acquisition_failure() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let outcome = runner.run(request(json!({"videoId": "nope", "musicId": "song"})));
    let err = outcome.result.as_ref().unwrap_err();
    assert_eq!(err.kind(), "acquisition_failed");
    assert_eq!(err.http_status(), 502);
    assert!(!fixture.args_log().exists());
    assert!(fixture.leftover_workspaces().is_empty());
}

#[test]
fn encoder_failure_reports_diagnostics() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Fails);
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let outcome = runner.run(request(json!({"videoId": "clip", "musicId": "song"})));
    match &outcome.result {
        Err(PipelineError::EncodeFailed {
            exit_code,
            diagnostics,
        }) => {
            assert_eq!(*exit_code, Some(1));
            assert!(diagnostics.contains("Invalid data found"));
        }
        other => panic!("unexpected result {other:?}"),
    }
    match outcome.response() {
        JobResponse::Error { details, .. } => {
            let details = details.unwrap();
            assert_eq!(details["kind"], "encode_failed");
            assert!(details["diagnostics"].as_str().unwrap().contains("Invalid data"));
        }
        other => panic!("unexpected response {other:?}"),
    }
    assert!(fixture.leftover_workspaces().is_empty());
    assert!(std::fs::read_dir(&fixture.outputs).map_or(true, |mut d| d.next().is_none()));
}

#[test]
fn hung_encoder_is_killed_at_the_time_limit() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Hangs);
    let mut config = fixture.config();
    config.engine.encode_timeout_secs = 1;
    let runner = JobRunner::new(Arc::new(config));

    let outcome = runner.run(request(json!({"videoId": "clip", "musicId": "song"})));

    match outcome.result {
        Err(PipelineError::Timeout { limit }) => assert_eq!(limit, Duration::from_secs(1)),
        ref other => panic!("unexpected result {other:?}"),
    }
    assert!(outcome.elapsed < Duration::from_secs(4));
    assert!(fixture.leftover_workspaces().is_empty());
    assert_eq!(runner.metrics().snapshot().jobs_timed_out, 1);

    let pid = std::fs::read_to_string(fixture.pid_file()).unwrap();
    let pid = pid.trim();
    assert!(!pid.is_empty());
    if std::path::Path::new("/proc/self").exists() {
        let proc_dir = std::path::Path::new("/proc").join(pid);
        assert!(!proc_dir.exists(), "encoder {pid} still running");
    }
}

#[test]
fn asset_mode_composites_overlay_images() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    let mut config = fixture.config();
    config.overlay.mode = reel_forge::config::OverlayMode::Asset;
    config.defaults.resolution = "360x640".into();
    let runner = JobRunner::new(Arc::new(config));

    let outcome = runner.run(request(json!({
        "videoId": "clip",
        "musicId": "song",
        "overlays": {
            "top": {"text": "Daily reminder"},
            "bottom": {"text": "Subscribe"}
        }
    })));
    assert!(outcome.is_success(), "{:?}", outcome.result);

    let args = fixture.logged_args();
    let inputs: Vec<&String> = args
        .iter()
        .zip(args.iter().skip(1))
        .filter(|(flag, _)| *flag == "-i")
        .map(|(_, value)| value)
        .collect();
    assert_eq!(inputs.len(), 4);
    assert!(inputs[2].ends_with("overlay-top.png"));
    assert!(inputs[3].ends_with("overlay-bottom.png"));

    let graph_at = args.iter().position(|a| a == "-filter_complex").unwrap();
    let graph = &args[graph_at + 1];
    assert!(graph.contains("[v0][2:v]overlay=x=0:y=0[v1]"), "{graph}");
    assert!(graph.contains("[v1][3:v]overlay=x=0:y=0[v2]"), "{graph}");
    assert!(args.contains(&"[v2]".to_string()));
    assert!(fixture.leftover_workspaces().is_empty());
}

#[test]
fn mix_policy_uses_both_tracks_when_video_has_audio() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let outcome = runner.run(request(json!({
        "videoId": "clip",
        "musicId": "song",
        "audioPolicy": "mix"
    })));
    match outcome.response() {
        JobResponse::Success { audio_replaced, .. } => assert!(!audio_replaced),
        other => panic!("unexpected response {other:?}"),
    }
    let args = fixture.logged_args();
    assert!(args.iter().any(|a| a.contains("[a0][a1]amix=inputs=2")));
}

#[test]
fn mix_policy_degrades_for_silent_video() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    fixture.install_probe("10.0", "15.0", false);
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let outcome = runner.run(request(json!({
        "videoId": "clip",
        "musicId": "song",
        "audioPolicy": "mix"
    })));
    match outcome.response() {
        JobResponse::Success { audio_replaced, .. } => assert!(audio_replaced),
        other => panic!("unexpected response {other:?}"),
    }
    assert!(!fixture.logged_args().iter().any(|a| a.contains("amix")));
}

#[test]
fn batch_runs_every_request_in_order() {
    let temp = tempdir().unwrap();
    let fixture = basic_fixture(temp.path(), Encoder::Succeeds);
    let runner = JobRunner::new(Arc::new(fixture.config()));

    let requests = vec![
        request(json!({"videoId": "clip", "musicId": "song"})),
        request(json!({"videoId": "", "musicId": "song"})),
        request(json!({"videoId": "clip", "musicId": "song", "maxDuration": 4})),
    ];
    let outcomes = runner.run_batch(requests, 2);

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_success());
    assert_eq!(
        outcomes[1].result.as_ref().unwrap_err().kind(),
        "validation_error"
    );
    match outcomes[2].response() {
        JobResponse::Success { duration, .. } => assert_eq!(duration, 4.0),
        other => panic!("unexpected response {other:?}"),
    }
    assert_ne!(outcomes[0].job.id(), outcomes[2].job.id());
    assert!(fixture.leftover_workspaces().is_empty());

    let snapshot = runner.metrics().snapshot();
    assert_eq!(snapshot.jobs_succeeded, 2);
    assert_eq!(snapshot.jobs_failed, 1);
}
