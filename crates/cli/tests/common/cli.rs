//! CLI command execution helpers
//!
//! Runs the `snapwatch` binary in test mode inside a throwaway sandbox with
//! its own watch directory, snapshot directory and HOME, so no config file
//! from the host leaks in.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const BINARY: &str = env!("CARGO_BIN_EXE_snapwatch");

/// Temp directory with `vol/` (watched), `snaps/` (snapshots) and a
/// config tuned for fast tests
pub struct Sandbox {
    temp: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("vol")).unwrap();
        std::fs::create_dir_all(temp.path().join("home")).unwrap();
        std::fs::write(
            temp.path().join("snapwatch.toml"),
            "debounce_seconds = 1\ncooldown_seconds = 0\nmin_free_bytes = 0\ntool_timeout_seconds = 30\n",
        )
        .unwrap();
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn watch_dir(&self) -> PathBuf {
        self.root().join("vol")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root().join("snaps")
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.watch_dir().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    /// Snapshot directory names, sorted
    pub fn snapshots(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.snapshot_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("vol_"))
            .collect();
        names.sort();
        names
    }

    /// `snapwatch --test-mode --watch-dir vol --snapshot-dir snaps <args>`
    pub fn cmd(&self, args: &[&str]) -> SnapwatchCommand {
        let home = self.root().join("home").to_string_lossy().into_owned();
        let watch = self.watch_dir().to_string_lossy().into_owned();
        let snaps = self.snapshot_dir().to_string_lossy().into_owned();
        let config = self.root().join("snapwatch.toml").to_string_lossy().into_owned();

        let mut cmd = SnapwatchCommand::new(self.root());
        cmd.env("HOME", &home)
            .env("XDG_CONFIG_HOME", &home)
            .env("RUST_LOG", "info");
        cmd.args(&["--config", &config, "--test-mode", "--watch-dir", &watch, "--snapshot-dir", &snaps])
            .args(args);
        cmd
    }
}

/// CLI command builder
pub struct SnapwatchCommand {
    working_dir: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl SnapwatchCommand {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn args(&mut self, args: &[&str]) -> &mut Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn env(&mut self, key: &str, value: &str) -> &mut Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(BINARY);
        command
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env_remove("SNAPWATCH_CONFIG")
            .envs(&self.env);
        command
    }

    pub fn execute(&self) -> CommandResult {
        let start = Instant::now();
        let output = self.command().output().expect("failed to execute snapwatch");

        CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        }
    }

    /// Start in the background (for `run`)
    pub fn spawn(&self) -> Child {
        self.command()
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn snapwatch")
    }

    pub fn assert_success(&self) -> CommandResult {
        let result = self.execute();
        assert!(
            result.success(),
            "command failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
            result.exit_code,
            self.args,
            result.stdout,
            result.stderr
        );
        result
    }

    pub fn assert_failure(&self) -> CommandResult {
        let result = self.execute();
        assert!(
            !result.success(),
            "command should have failed:\nArgs: {:?}\nStdout: {}",
            self.args,
            result.stdout
        );
        result
    }
}

/// Command execution result with timing
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn contains_stdout(&self, text: &str) -> bool {
        self.stdout.contains(text)
    }

    pub fn contains_stderr(&self, text: &str) -> bool {
        self.stderr.contains(text)
    }
}

/// Poll `condition` every 100ms until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    condition()
}
