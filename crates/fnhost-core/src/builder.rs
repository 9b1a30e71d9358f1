// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Toolchain invocation: source directory in, executable out.
//!
//! The builder runs one fixed toolchain command inside the extracted source
//! tree. The command writes to a staging file next to the artifact, which is
//! renamed over the artifact only when the build succeeds, so a failed build
//! never disturbs the previous version (or the instance still running it).

use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{error, info};

/// Placeholder replaced with the staging output path.
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Placeholder replaced with the source directory.
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// Errors from the build step.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The source directory does not exist.
    #[error("source directory not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// The toolchain could not be started.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        /// Toolchain program.
        program: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The toolchain exited unsuccessfully. `output` is its combined output, verbatim.
    #[error("{program} failed ({status}):\n{output}")]
    Failed {
        /// Toolchain program.
        program: String,
        /// Exit status description.
        status: String,
        /// Combined stdout and stderr.
        output: String,
    },

    /// The toolchain succeeded but wrote nothing at the output path.
    #[error("build succeeded but no artifact was produced at {}", .0.display())]
    ArtifactMissing(PathBuf),

    /// Filesystem operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The toolchain command, with `{output}` and `{source}` placeholders in its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    program: String,
    args: Vec<String>,
}

impl Toolchain {
    /// Create a toolchain from a program and its argument template.
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a whitespace separated command line. Returns `None` for a blank string.
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    /// Default toolchain: rustc compiling `src/main.rs` into a single binary.
    pub fn rustc() -> Self {
        Self::new(
            "rustc",
            [
                "--edition=2021",
                "-C",
                "opt-level=2",
                "-o",
                OUTPUT_PLACEHOLDER,
                "src/main.rs",
            ],
        )
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Argument template.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn render_args(&self, output: &Path, source: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        let source = source.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(OUTPUT_PLACEHOLDER, &output)
                    .replace(SOURCE_PLACEHOLDER, &source)
            })
            .collect()
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::rustc()
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Final artifact location.
    pub artifact_path: PathBuf,
    /// Artifact size in bytes.
    pub size_bytes: u64,
    /// Hex SHA-256 of the artifact.
    pub checksum: String,
    /// Wall time spent in the toolchain.
    pub duration: Duration,
    /// Combined toolchain output (warnings, progress).
    pub log: String,
}

/// Runs the toolchain against extracted sources.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    toolchain: Toolchain,
}

impl Builder {
    /// Create a builder for the given toolchain.
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    /// The configured toolchain.
    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Build `source_dir` into an executable at `artifact_path`.
    pub async fn build(
        &self,
        source_dir: &Path,
        artifact_path: &Path,
    ) -> Result<BuildOutput, BuildError> {
        // the toolchain runs inside source_dir, so relative paths would resolve against it
        let source_dir = &std::path::absolute(source_dir)?;
        let artifact_path = &std::path::absolute(artifact_path)?;
        if !fs::try_exists(source_dir).await? {
            return Err(BuildError::SourceNotFound(source_dir.to_path_buf()));
        }
        if let Some(parent) = artifact_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let staging = staging_path(artifact_path);

        let mut cmd = Command::new(&self.toolchain.program);
        cmd.args(self.toolchain.render_args(&staging, source_dir))
            .current_dir(source_dir)
            // keep builds reproducible across hosts with global flags set
            .env_remove("RUSTFLAGS")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(
            source_dir = %source_dir.display(),
            artifact = %artifact_path.display(),
            command = %self.toolchain,
            "Invoking toolchain"
        );
        let started = Instant::now();
        let output = cmd.output().await.map_err(|source| BuildError::Spawn {
            program: self.toolchain.program.clone(),
            source,
        })?;
        let duration = started.elapsed();

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            let _ = fs::remove_file(&staging).await;
            error!(
                source_dir = %source_dir.display(),
                status = %output.status,
                output = %log,
                "Toolchain failed"
            );
            return Err(BuildError::Failed {
                program: self.toolchain.program.clone(),
                status: output.status.to_string(),
                output: log,
            });
        }

        if !fs::try_exists(&staging).await? {
            return Err(BuildError::ArtifactMissing(artifact_path.to_path_buf()));
        }

        let mut perms = fs::metadata(&staging).await?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(&staging, perms).await?;

        let (size_bytes, checksum) = {
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || checksum_file(&staging))
                .await
                .map_err(io::Error::other)??
        };

        fs::rename(&staging, artifact_path).await?;

        info!(
            artifact = %artifact_path.display(),
            size_bytes,
            checksum = %checksum,
            duration_ms = duration.as_millis() as u64,
            "Build completed"
        );

        Ok(BuildOutput {
            artifact_path: artifact_path.to_path_buf(),
            size_bytes,
            checksum,
            duration,
            log,
        })
    }
}

fn staging_path(artifact_path: &Path) -> PathBuf {
    let file_name = artifact_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    artifact_path.with_file_name(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn checksum_file(path: &Path) -> io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((size, format!("{:x}", hasher.finalize())))
}
