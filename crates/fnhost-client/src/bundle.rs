// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source directory bundling.

use std::fs;
use std::io::{Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};

use ignore::WalkBuilder;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{ClientError, Result};

/// Per-directory ignore file honoured in addition to `.gitignore`.
pub const IGNORE_FILE: &str = ".fnhostignore";

/// Zip `dir` into an in-memory bundle.
///
/// Entry names are relative to `dir` and use `/` separators. Unix permission
/// bits are recorded so executables stay executable after extraction.
/// Symlinks are not followed.
pub fn bundle_dir(dir: &Path) -> Result<Vec<u8>> {
    let walker = WalkBuilder::new(dir)
        .standard_filters(true)
        .require_git(false)
        .add_custom_ignore_filename(IGNORE_FILE)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut buffer = Cursor::new(Vec::new());
    let mut zip = ZipWriter::new(&mut buffer);
    let base = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut files = 0usize;

    for entry in walker {
        let entry = entry.map_err(|source| ClientError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        let Some(name) = entry_name(dir, path) else {
            continue;
        };
        let io_err = |source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        };

        let metadata = entry.metadata().map_err(|source| ClientError::Walk {
            path: path.to_path_buf(),
            source,
        })?;
        let contents = fs::read(path).map_err(io_err)?;

        zip.start_file(
            name.as_str(),
            base.unix_permissions(metadata.permissions().mode() & 0o777),
        )?;
        zip.write_all(&contents).map_err(io_err)?;
        files += 1;
    }

    zip.finish()?;
    let bytes = buffer.into_inner();
    debug!(dir = %dir.display(), files, bytes = bytes.len(), "Bundle created");
    Ok(bytes)
}

/// Archive name for `path` under `root`: relative, `/`-separated.
fn entry_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
