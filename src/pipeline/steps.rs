//! Shell steps and the package-manager conventions that choose them.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::types::Repository;

/// Packaging scripts, in order of preference.
const PACKAGING_SCRIPTS: [&str; 2] = ["nexe:win", "nexe"];

/// How a shell step ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    /// Non-zero exit; `None` when killed by a signal.
    Exited(Option<i32>),
    TimedOut(Duration),
}

/// Which pipe a line of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of a step's output, forwarded as soon as it is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Result of one shell step with everything it printed, including the
/// output of a step that timed out.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub status: StepStatus,
    pub stdout: String,
    pub stderr: String,
}

impl StepOutput {
    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// One-line failure description for the build log.
    pub fn failure_summary(&self, command: &str) -> String {
        match &self.status {
            StepStatus::Succeeded => format!("`{}` succeeded", command),
            StepStatus::Exited(Some(code)) => format!("`{}` exited with status {}", command, code),
            StepStatus::Exited(None) => format!("`{}` was terminated by a signal", command),
            StepStatus::TimedOut(limit) => {
                format!("`{}` timed out after {}s", command, limit.as_secs())
            }
        }
    }
}

/// Runs `command` through `sh -c` in `dir`, capturing output.
///
/// Every line is also sent to `lines` as it arrives. The command runs in its
/// own process group; with a `timeout`, the whole group is killed once it
/// elapses. Only failures to spawn or wait on the process are errors; a
/// non-zero exit is a result.
pub async fn run_shell(
    dir: &Path,
    command: &str,
    timeout: Option<Duration>,
    lines: Option<UnboundedSender<OutputLine>>,
) -> io::Result<StepOutput> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()?;

    let stdout = tokio::spawn(forward(
        child.stdout.take(),
        OutputStream::Stdout,
        lines.clone(),
    ));
    let stderr = tokio::spawn(forward(child.stderr.take(), OutputStream::Stderr, lines));

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if status.success() {
                    StepStatus::Succeeded
                } else {
                    StepStatus::Exited(status.code())
                }
            }
            Err(_) => {
                kill_group(&mut child).await;
                StepStatus::TimedOut(limit)
            }
        },
        None => {
            let status = child.wait().await?;
            if status.success() {
                StepStatus::Succeeded
            } else {
                StepStatus::Exited(status.code())
            }
        }
    };

    // The pipes close once every process in the group is gone.
    Ok(StepOutput {
        status,
        stdout: stdout.await.map_err(io::Error::other)??,
        stderr: stderr.await.map_err(io::Error::other)??,
    })
}

/// Reads `pipe` line by line, forwarding each line and collecting all of them.
async fn forward<R>(
    pipe: Option<R>,
    stream: OutputStream,
    lines: Option<UnboundedSender<OutputLine>>,
) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(String::new());
    };
    let mut reader = BufReader::new(pipe);
    let mut collected = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&buf).trim_end().to_string();
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&text);
        if let Some(lines) = &lines {
            // A dropped receiver only stops forwarding.
            let _ = lines.send(OutputLine { stream, text });
        }
    }
    Ok(collected.trim_end().to_string())
}

/// Kills the child's whole process group, then reaps the child.
async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(pgid, Signal::SIGKILL) {
            warn!(pid, error = %e, "Could not kill step process group");
        }
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Could not kill timed out step");
    }
}

// ─── Package manager conventions ───

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pnpm,
}

impl PackageManager {
    /// pnpm when the project carries a pnpm lockfile, npm otherwise.
    pub fn detect(dir: &Path) -> Self {
        if dir.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else {
            PackageManager::Npm
        }
    }

    fn program(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
        }
    }

    pub fn run_script(self, script: &str) -> String {
        format!("{} run {}", self.program(), script)
    }
}

/// The install command: the repository override, else `<pm> install`.
///
/// Legacy peer dependency resolution only applies to npm-based commands.
pub fn install_command(repo: &Repository, pm: PackageManager) -> String {
    let command = repo
        .install_command
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| format!("{} install", pm.program()));

    if repo.use_legacy_peer_deps && command.starts_with("npm") {
        format!("{} --legacy-peer-deps", command)
    } else {
        command
    }
}

/// The build command: the repository override, else `<pm> run build`.
pub fn build_command(repo: &Repository, pm: PackageManager) -> String {
    repo.build_command
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| pm.run_script("build"))
}

/// The parts of `package.json` the pipeline reads.
#[derive(Debug, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The first declared packaging script.
    pub fn packaging_script(&self) -> Option<&'static str> {
        PACKAGING_SCRIPTS
            .into_iter()
            .find(|name| self.scripts.get(*name).is_some_and(is_declared))
    }
}

fn is_declared(script: &serde_json::Value) -> bool {
    match script {
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Null | serde_json::Value::Bool(false) => false,
        _ => true,
    }
}
