// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Functions and their on-disk layout.
//!
//! A function is identified by the file name of its compiled artifact. The
//! layout keeps one source directory and one binary directory per function:
//!
//! ```text
//! {base}/src/{name}/...            extracted sources
//! {base}/bin/{name}/{name}.out     current executable
//! ```
//!
//! The binary tree is the only persisted state; [`Layout::scan_artifacts`]
//! rebuilds the function list from it on startup.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// File extension given to compiled function artifacts.
pub const ARTIFACT_EXTENSION: &str = "out";

/// Longest accepted function name.
pub const MAX_NAME_LEN: usize = 64;

/// A deployable unit, backed by one compiled executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Function {
    name: String,
    artifact_path: PathBuf,
}

impl Function {
    /// Build a function from its artifact path. The name is the file name
    /// with its extension stripped.
    pub fn from_artifact(path: impl Into<PathBuf>) -> Self {
        let artifact_path = path.into();
        let name = artifact_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            artifact_path,
        }
    }

    /// Function name, unique key in the registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the executable for the current version.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }
}

/// Reasons a function name is refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    /// The name is empty.
    #[error("function name is empty")]
    Empty,
    /// The name is longer than [`MAX_NAME_LEN`].
    #[error("function name is {0} characters long (max {MAX_NAME_LEN})")]
    TooLong(usize),
    /// The name starts with a reserved character (`_` or `.`).
    #[error("function name '{0}' is reserved")]
    Reserved(String),
    /// The name contains a character outside `[A-Za-z0-9_.-]`.
    #[error("function name '{name}' contains invalid character {ch:?}")]
    InvalidChar {
        /// The offending name.
        name: String,
        /// First invalid character.
        ch: char,
    },
}

/// Check that `name` is usable both as a URL segment and as a directory name.
///
/// Names starting with `_` collide with the `/_admin` and `/_health` routes,
/// names starting with `.` could address hidden or parent directories.
pub fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong(name.len()));
    }
    if name.starts_with('_') || name.starts_with('.') {
        return Err(NameError::Reserved(name.to_string()));
    }
    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(NameError::InvalidChar {
            name: name.to_string(),
            ch,
        });
    }
    Ok(())
}

/// Source and binary roots of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    source_root: PathBuf,
    binary_root: PathBuf,
}

impl Layout {
    /// Create a layout from explicit roots.
    pub fn new(source_root: impl Into<PathBuf>, binary_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            binary_root: binary_root.into(),
        }
    }

    /// Standard layout below a base directory: `{base}/src` and `{base}/bin`.
    pub fn under(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref();
        Self::new(base_dir.join("src"), base_dir.join("bin"))
    }

    /// Root holding one extracted source tree per function.
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Root holding one binary directory per function.
    pub fn binary_root(&self) -> &Path {
        &self.binary_root
    }

    /// Extraction directory for `name`.
    pub fn source_dir(&self, name: &str) -> PathBuf {
        self.source_root.join(name)
    }

    /// Binary directory for `name`.
    pub fn binary_dir(&self, name: &str) -> PathBuf {
        self.binary_root.join(name)
    }

    /// Artifact path for `name`: `{binary_root}/{name}/{name}.out`.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.binary_dir(name)
            .join(format!("{name}.{ARTIFACT_EXTENSION}"))
    }

    /// Find every executable `*.out` file below the binary root.
    ///
    /// A missing binary root yields an empty list. Files without any
    /// executable bit are skipped. Results are sorted by path.
    pub fn scan_artifacts(&self) -> io::Result<Vec<Function>> {
        if !self.binary_root.exists() {
            return Ok(Vec::new());
        }
        let mut found: Vec<PathBuf> = Vec::new();
        collect_artifacts(&self.binary_root, &mut found)?;
        found.sort();
        Ok(found.into_iter().map(Function::from_artifact).collect())
    }
}

fn collect_artifacts(dir: &Path, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_artifacts(&path, found)?;
            continue;
        }
        if !file_type.is_file()
            || path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION)
        {
            continue;
        }
        let mode = entry.metadata()?.permissions().mode();
        if mode & 0o111 == 0 {
            continue;
        }
        found.push(path);
    }
    Ok(())
}
