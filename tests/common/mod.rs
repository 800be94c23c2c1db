#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use reel_forge::config::{FontFallback, ServiceConfig};

/// Scratch layout plus stand-in engine scripts for one test.
pub struct Fixture {
    pub root: PathBuf,
    pub library: PathBuf,
    pub work: PathBuf,
    pub outputs: PathBuf,
    pub bin: PathBuf,
}

pub enum Encoder {
    /// Writes a small file to the output path and logs its arguments.
    Succeeds,
    /// Prints a diagnostic and exits 1.
    Fails,
    /// Never finishes on its own.
    Hangs,
}

impl Fixture {
    pub fn new(root: &Path) -> Self {
        let fixture = Self {
            root: root.to_path_buf(),
            library: root.join("library"),
            work: root.join("work"),
            outputs: root.join("outputs"),
            bin: root.join("bin"),
        };
        fs::create_dir_all(&fixture.library).unwrap();
        fs::create_dir_all(&fixture.bin).unwrap();
        fixture
    }

    pub fn add_asset(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.library.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    /// Probe answering `video` seconds for the acquired video file and `music`
    /// seconds for the acquired audio file.
    pub fn install_probe(&self, video: &str, music: &str, video_has_audio: bool) -> PathBuf {
        let streams = if video_has_audio { "echo audio" } else { ":" };
        let script = format!(
            r#"#!/bin/sh
for last; do :; done
name=$(basename "$last")
case "$*" in
  *select_streams*)
    {streams}
    ;;
  *)
    case "$name" in
      video*) echo {video} ;;
      audio*) echo {music} ;;
      *) echo N/A ;;
    esac
    ;;
esac
"#
        );
        self.write_script("ffprobe", &script)
    }

    pub fn install_encoder(&self, encoder: Encoder) -> PathBuf {
        let log = self.args_log();
        let body = match encoder {
            Encoder::Succeeds => format!(
                "printf '%s\\n' \"$@\" > '{}'\nfor last; do :; done\nprintf 'fake mp4' > \"$last\"\n",
                log.display()
            ),
            Encoder::Fails => format!(
                "printf '%s\\n' \"$@\" > '{}'\necho 'frame=    0 fps=0.0' >&2\necho 'Invalid data found when processing input' >&2\nexit 1\n",
                log.display()
            ),
            Encoder::Hangs => format!(
                "echo $$ > '{}'\nexec sleep 5\n",
                self.pid_file().display()
            ),
        };
        self.write_script("ffmpeg", &format!("#!/bin/sh\n{body}"))
    }

    /// Process id written by the hanging encoder before it blocks.
    pub fn pid_file(&self) -> PathBuf {
        self.root.join("ffmpeg.pid")
    }

    /// Arguments of the last encoder invocation, one per line.
    pub fn args_log(&self) -> PathBuf {
        self.root.join("ffmpeg.args")
    }

    pub fn logged_args(&self) -> Vec<String> {
        fs::read_to_string(self.args_log())
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    pub fn config(&self) -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.paths.library_dir = self.library.clone();
        config.paths.workspace_root = self.work.clone();
        config.paths.output_dir = self.outputs.clone();
        config.paths.public_base_url = Some("https://cdn.test/reels".into());
        config.engine.ffmpeg = self.bin.join("ffmpeg");
        config.engine.ffprobe = self.bin.join("ffprobe");
        config.overlay.font_path = self.root.join("missing-font.ttf");
        config.overlay.font_fallback = FontFallback::EngineDefault;
        config
    }

    /// Job directories still present under the workspace root.
    pub fn leftover_workspaces(&self) -> Vec<PathBuf> {
        match fs::read_dir(&self.work) {
            Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn write_script(&self, name: &str, content: &str) -> PathBuf {
        let path = self.bin.join(name);
        fs::write(&path, content).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
