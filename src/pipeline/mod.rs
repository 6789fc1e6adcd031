//! The build pipeline: from a checked-out worktree to a promoted artifact.
//!
//! Steps, in order: check for `package.json`, remove `dist`, install, build,
//! the optional `scripts/compile.js` (under a timeout), the optional packaging
//! script, binary search, then staging and promotion. Command output is
//! appended to the build log line by line while the command runs.
//!
//! A failing step is an ordinary outcome: the build is marked FAILED and
//! [`BuildPipeline::run`] returns [`PipelineOutcome::Failed`]. Only store and
//! filesystem errors unrelated to a command's exit status come back as
//! [`PipelineError`], leaving the build for the caller to fail.

mod artifact;
mod logger;
mod steps;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::{Store, StoreError};
use crate::types::{Build, BuildStatus, Repository};

pub use artifact::{ArtifactLayout, find_binaries, sanitize_segment};
pub use logger::BuildLogger;
pub use steps::{OutputLine, OutputStream, PackageManager, StepOutput, StepStatus, run_shell};

/// How far below the worktree root the binary search looks.
const SEARCH_DEPTH: usize = 5;

const OUTPUT_DIR: &str = "dist";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Terminal result of a pipeline run; the build's status already matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Succeeded { artifact: PathBuf },
    Failed { reason: String },
}

/// Why execution stopped early.
enum Halt {
    Failed(String),
    Unexpected(PipelineError),
}

impl From<io::Error> for Halt {
    fn from(e: io::Error) -> Self {
        Halt::Unexpected(e.into())
    }
}

impl From<StoreError> for Halt {
    fn from(e: StoreError) -> Self {
        Halt::Unexpected(e.into())
    }
}

#[derive(Clone)]
pub struct BuildPipeline {
    store: Store,
    artifacts: ArtifactLayout,
    compile_timeout: Duration,
    binary_extension: String,
}

impl BuildPipeline {
    pub fn new(
        store: Store,
        artifact_root: impl Into<PathBuf>,
        compile_timeout: Duration,
        binary_extension: impl Into<String>,
    ) -> Self {
        BuildPipeline {
            store,
            artifacts: ArtifactLayout::new(artifact_root),
            compile_timeout,
            binary_extension: binary_extension.into(),
        }
    }

    pub fn artifacts(&self) -> &ArtifactLayout {
        &self.artifacts
    }

    /// Builds the running `build` of `repo` checked out at `workdir`, then
    /// marks it SUCCESS (with its artifact path) or FAILED.
    pub async fn run(
        &self,
        build: &Build,
        repo: &Repository,
        workdir: &Path,
    ) -> Result<PipelineOutcome, PipelineError> {
        let logger = BuildLogger::new(self.store.clone(), build);
        logger.log(format!(
            "Build start id={} trigger={} ref={} sha={}",
            build.id, build.trigger, build.ref_name, build.commit_sha
        ))
        .await?;

        match self.execute(&logger, build, repo, workdir).await {
            Ok(artifact) => {
                self.store
                    .complete_success(build.id, artifact.to_string_lossy().into_owned())
                    .await?;
                logger.log("Build succeeded.").await?;
                Ok(PipelineOutcome::Succeeded { artifact })
            }
            Err(Halt::Failed(reason)) => {
                logger.error(&reason).await?;
                self.store.set_status(build.id, BuildStatus::Failed).await?;
                Ok(PipelineOutcome::Failed { reason })
            }
            Err(Halt::Unexpected(e)) => Err(e),
        }
    }

    async fn execute(
        &self,
        logger: &BuildLogger,
        build: &Build,
        repo: &Repository,
        workdir: &Path,
    ) -> Result<PathBuf, Halt> {
        let manifest_path = workdir.join("package.json");
        if !manifest_path.exists() {
            return Err(Halt::Failed(format!(
                "No package.json found in {}",
                workdir.display()
            )));
        }
        let manifest = steps::Manifest::parse(&tokio::fs::read_to_string(&manifest_path).await?)
            .map_err(|e| Halt::Failed(format!("package.json is not valid JSON: {}", e)))?;
        let pm = PackageManager::detect(workdir);

        let output_dir = workdir.join(OUTPUT_DIR);
        logger
            .log(format!("Removing output directory {}", output_dir.display()))
            .await?;
        artifact::remove_dir_if_exists(&output_dir).await?;

        self.step(logger, workdir, &steps::install_command(repo, pm), None)
            .await?;
        self.step(logger, workdir, &steps::build_command(repo, pm), None)
            .await?;

        if workdir.join("scripts").join("compile.js").exists() {
            self.step(
                logger,
                workdir,
                "node scripts/compile.js",
                Some(self.compile_timeout),
            )
            .await?;
        } else {
            logger.log("No scripts/compile.js found, skipping.").await?;
        }

        match manifest.packaging_script() {
            Some(script) => {
                self.step(logger, workdir, &pm.run_script(script), None)
                    .await?
            }
            None => {
                logger
                    .log("No packaging script declared, skipping.")
                    .await?
            }
        }

        let candidates = find_binaries(workdir, &self.binary_extension, SEARCH_DEPTH).await?;
        let Some(binary) = candidates.first() else {
            return Err(Halt::Failed(format!(
                "No .{} binary found after build",
                self.binary_extension
            )));
        };
        if candidates.len() > 1 {
            let listed: Vec<_> = candidates.iter().map(|p| p.display().to_string()).collect();
            logger.log(format!(
                "Found {} candidate binaries, using the first: {}",
                candidates.len(),
                listed.join(", ")
            ))
            .await?;
        }

        let staging_dir = self.artifacts.staging_dir(&repo.name, build);
        let staged = artifact::copy_into(binary, &staging_dir).await?;
        logger
            .log(format!("Artifact staged at {}", staged.display()))
            .await?;

        let final_dir = self.artifacts.final_dir(&repo.name, build);
        let promoted = artifact::copy_into(&staged, &final_dir).await?;
        logger
            .log(format!("Artifact copied to {}", promoted.display()))
            .await?;

        artifact::remove_dir_if_exists(&staging_dir).await?;
        logger
            .log(format!("Cleaned staging folder {}", staging_dir.display()))
            .await?;

        Ok(promoted)
    }

    /// Runs one shell step, logging its output as it is printed. A failed
    /// step halts the build.
    async fn step(
        &self,
        logger: &BuildLogger,
        workdir: &Path,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<(), Halt> {
        logger.log(format!("Running: {}", command)).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let drain = async {
            while let Some(line) = rx.recv().await {
                match line.stream {
                    OutputStream::Stdout => logger.log(&line.text).await?,
                    OutputStream::Stderr => logger.log(format!("stderr: {}", line.text)).await?,
                }
            }
            Ok::<(), StoreError>(())
        };
        let (output, drained) = tokio::join!(run_shell(workdir, command, timeout, Some(tx)), drain);
        drained?;
        let output = output?;

        if output.succeeded() {
            logger.log(format!("Finished: {}", command)).await?;
            Ok(())
        } else {
            Err(Halt::Failed(output.failure_summary(command)))
        }
    }
}
