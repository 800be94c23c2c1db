use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

#[cfg(unix)]
mod common;

fn reel_forge() -> Command {
    let mut cmd = Command::cargo_bin("reel-forge").expect("binary present");
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn validate_accepts_good_requests_and_rejects_bad_ones() {
    let temp = tempdir().unwrap();
    let good = temp.path().join("good.json");
    fs::write(
        &good,
        r#"{"videoId": "clip", "musicId": "song", "overlays": {"top": {"text": "Daily"}}}"#,
    )
    .unwrap();
    let bad = temp.path().join("bad.yaml");
    fs::write(&bad, "musicId: undefined\nmaxDuration: -3\n").unwrap();

    reel_forge()
        .args(["validate", good.to_str().unwrap()])
        .assert()
        .success();

    let output = reel_forge()
        .args(["validate", bad.to_str().unwrap()])
        .assert()
        .failure()
        .get_output()
        .clone();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("videoId is required"), "{stderr}");
    assert!(stderr.contains("placeholder"), "{stderr}");
}

#[test]
fn config_show_prints_effective_yaml() {
    let temp = tempdir().unwrap();
    let config = temp.path().join("service.yaml");
    fs::write(&config, "engine:\n  encode_timeout_secs: 42\n").unwrap();

    let output = reel_forge()
        .args(["--config", config.to_str().unwrap(), "config", "show"])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("encode_timeout_secs: 42"), "{stdout}");
    assert!(stdout.contains("video_codec: libx264"));
}

#[test]
fn completions_are_generated() {
    let output = reel_forge()
        .args(["completions", "bash"])
        .assert()
        .success()
        .get_output()
        .clone();
    assert!(String::from_utf8_lossy(&output.stdout).contains("reel-forge"));
}

#[test]
fn sweep_removes_stale_workspaces() {
    let temp = tempdir().unwrap();
    let work = temp.path().join("work");
    fs::create_dir_all(work.join("job-old")).unwrap();
    let config = temp.path().join("service.yaml");
    fs::write(
        &config,
        format!("paths:\n  workspace_root: {}\n", work.display()),
    )
    .unwrap();

    reel_forge()
        .args([
            "--config",
            config.to_str().unwrap(),
            "sweep",
            "--max-age-secs",
            "0",
        ])
        .assert()
        .success();
    assert!(!work.join("job-old").exists());
}

#[cfg(unix)]
mod with_fake_engine {
    use super::*;
    use crate::common::{Encoder, Fixture};

    fn write_config(fixture: &Fixture) -> std::path::PathBuf {
        let path = fixture.root.join("service.yaml");
        fs::write(&path, fixture.config().to_yaml().unwrap()).unwrap();
        path
    }

    #[test]
    fn render_prints_success_responses() {
        let temp = tempdir().unwrap();
        let fixture = Fixture::new(temp.path());
        fixture.add_asset("clip.mp4", b"video");
        fixture.add_asset("song.mp3", b"music");
        fixture.install_probe("10.0", "15.0", true);
        fixture.install_encoder(Encoder::Succeeds);
        let config = write_config(&fixture);
        let request = temp.path().join("request.json");
        fs::write(&request, r#"{"videoId": "clip", "musicId": "song"}"#).unwrap();
        let metrics = temp.path().join("metrics").join("reel.prom");

        let output = reel_forge()
            .args([
                "--config",
                config.to_str().unwrap(),
                "render",
                request.to_str().unwrap(),
                "--metrics-prometheus",
                metrics.to_str().unwrap(),
            ])
            .assert()
            .success()
            .get_output()
            .clone();

        let responses: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let response = &responses[0]["response"];
        assert_eq!(response["status"], "success");
        assert_eq!(response["duration"], 10.0);
        assert!(
            response["videoUrl"]
                .as_str()
                .unwrap()
                .starts_with("https://cdn.test/reels/reel_")
        );
        let prom = fs::read_to_string(&metrics).unwrap();
        assert!(prom.contains("reel_jobs_succeeded_total 1"));
    }

    #[test]
    fn render_fails_when_a_job_fails() {
        let temp = tempdir().unwrap();
        let fixture = Fixture::new(temp.path());
        fixture.add_asset("clip.mp4", b"video");
        fixture.add_asset("song.mp3", b"music");
        fixture.install_probe("10.0", "15.0", true);
        fixture.install_encoder(Encoder::Fails);
        let config = write_config(&fixture);
        let request = temp.path().join("request.yaml");
        fs::write(&request, "videoId: clip\nmusicId: song\n").unwrap();

        let output = reel_forge()
            .args(["--config", config.to_str().unwrap(), "render", request.to_str().unwrap()])
            .assert()
            .failure()
            .get_output()
            .clone();
        let responses: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(responses[0]["response"]["status"], "error");
        assert_eq!(responses[0]["response"]["details"]["kind"], "encode_failed");
    }

    #[test]
    fn plan_writes_lock_without_encoding() {
        let temp = tempdir().unwrap();
        let fixture = Fixture::new(temp.path());
        fixture.add_asset("clip.mp4", b"video");
        fixture.add_asset("song.mp3", b"music");
        fixture.install_probe("30.0", "12.5", true);
        fixture.install_encoder(Encoder::Succeeds);
        let config = write_config(&fixture);
        let request = temp.path().join("request.json");
        fs::write(&request, r#"{"videoId": "clip", "musicId": "song"}"#).unwrap();
        let lock = temp.path().join("plan.lock.yaml");

        reel_forge()
            .args([
                "--config",
                config.to_str().unwrap(),
                "plan",
                request.to_str().unwrap(),
                "--output",
                lock.to_str().unwrap(),
            ])
            .assert()
            .success();

        let content = fs::read_to_string(&lock).unwrap();
        assert!(content.contains("effective_duration: 12.5"), "{content}");
        assert!(content.contains("fingerprint:"));
        assert!(!fixture.args_log().exists());
        assert!(fixture.leftover_workspaces().is_empty());
    }
}
