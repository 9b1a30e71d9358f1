// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive extraction with zip-slip protection.
//!
//! Every entry name is resolved against the destination before anything is
//! written. One entry escaping the destination (through `..`, an absolute
//! path or a drive prefix) rejects the whole archive with
//! [`ArchiveError::PathTraversal`] and leaves the destination untouched.

use std::fs;
use std::io::{self, Cursor, Read, Seek};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

/// Errors from archive extraction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// An entry resolves outside the destination directory.
    #[error("illegal file path in archive: {entry}")]
    PathTraversal {
        /// Raw entry name as stored in the archive.
        entry: String,
    },

    /// The archive could not be read.
    #[error("invalid archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Writing the extracted tree failed.
    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        /// What was being done.
        action: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Counts of what an extraction wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Regular files written.
    pub files: usize,
    /// Directory entries created.
    pub directories: usize,
    /// Uncompressed bytes written.
    pub bytes: u64,
}

struct PlannedEntry {
    index: usize,
    target: PathBuf,
    is_dir: bool,
    mode: Option<u32>,
}

/// Extract an in-memory zip archive into `dest`.
pub fn extract_bytes(bytes: &[u8], dest: &Path) -> Result<ExtractSummary, ArchiveError> {
    extract(Cursor::new(bytes), dest)
}

/// Extract a zip archive into `dest`, creating it if needed.
///
/// Existing files are overwritten. Partial output is not rolled back on I/O
/// failure; callers extract into a fresh directory.
pub fn extract<R: Read + Seek>(reader: R, dest: &Path) -> Result<ExtractSummary, ArchiveError> {
    let mut archive = ZipArchive::new(reader)?;

    // Resolve every entry first so a traversal anywhere rejects the archive
    // before the first write.
    let mut plan = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        let name = entry.name().to_string();
        let Some(relative) = resolve_entry(&name) else {
            return Err(ArchiveError::PathTraversal { entry: name });
        };
        let is_dir = entry.is_dir();
        if relative.as_os_str().is_empty() && !is_dir {
            return Err(ArchiveError::PathTraversal { entry: name });
        }
        plan.push(PlannedEntry {
            index,
            target: dest.join(relative),
            is_dir,
            mode: entry.unix_mode(),
        });
    }

    create_dir(dest)?;
    let mut summary = ExtractSummary::default();
    for planned in plan {
        if planned.is_dir {
            create_dir(&planned.target)?;
            summary.directories += 1;
            continue;
        }
        if let Some(parent) = planned.target.parent() {
            create_dir(parent)?;
        }

        let mut entry = archive.by_index(planned.index)?;
        let mut out = fs::File::create(&planned.target).map_err(|source| ArchiveError::Io {
            action: "create file",
            path: planned.target.clone(),
            source,
        })?;
        let written = io::copy(&mut entry, &mut out).map_err(|source| ArchiveError::Io {
            action: "write file",
            path: planned.target.clone(),
            source,
        })?;

        if let Some(mode) = planned.mode {
            // keep owner read/write so a later upload can overwrite the file
            let perms = fs::Permissions::from_mode((mode & 0o777) | 0o600);
            fs::set_permissions(&planned.target, perms).map_err(|source| ArchiveError::Io {
                action: "set permissions on",
                path: planned.target.clone(),
                source,
            })?;
        }

        summary.files += 1;
        summary.bytes += written;
    }

    debug!(
        dest = %dest.display(),
        files = summary.files,
        directories = summary.directories,
        bytes = summary.bytes,
        "Archive extracted"
    );
    Ok(summary)
}

/// Lexically resolve an entry name to a path relative to the destination.
///
/// Returns `None` when the name is absolute, carries a prefix, or climbs
/// above the destination with `..`.
fn resolve_entry(name: &str) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn create_dir(path: &Path) -> Result<(), ArchiveError> {
    fs::create_dir_all(path).map_err(|source| ArchiveError::Io {
        action: "create directory",
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            for (name, content) in entries {
                if name.ends_with('/') {
                    zip.add_directory(*name, SimpleFileOptions::default())
                        .unwrap();
                } else {
                    zip.start_file(*name, SimpleFileOptions::default())
                        .unwrap();
                    zip.write_all(content.as_bytes()).unwrap();
                }
            }
            zip.finish().unwrap();
        }
        buffer.into_inner()
    }

    fn count_files(dir: &Path) -> usize {
        if !dir.exists() {
            return 0;
        }
        fs::read_dir(dir)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                if e.file_type().unwrap().is_dir() {
                    count_files(&e.path())
                } else {
                    1
                }
            })
            .sum()
    }

    #[test]
    fn test_resolve_entry() {
        assert_eq!(resolve_entry("main.rs"), Some(PathBuf::from("main.rs")));
        assert_eq!(resolve_entry("./src/main.rs"), Some(PathBuf::from("src/main.rs")));
        assert_eq!(resolve_entry("a/../b.txt"), Some(PathBuf::from("b.txt")));
        assert_eq!(resolve_entry("../evil"), None);
        assert_eq!(resolve_entry("a/../../evil"), None);
        assert_eq!(resolve_entry("/etc/passwd"), None);
    }

    #[test]
    fn test_extract_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let bytes = zip_of(&[
            ("src/", ""),
            ("src/main.rs", "fn main() {}"),
            ("assets/", ""),
            ("README.md", "hello"),
        ]);

        let summary = extract_bytes(&bytes, &dest).unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.directories, 2);
        assert_eq!(summary.bytes, 17);
        assert_eq!(
            fs::read_to_string(dest.join("src/main.rs")).unwrap(),
            "fn main() {}"
        );
        assert!(dest.join("assets").is_dir());
    }

    #[test]
    fn test_extract_creates_missing_parents() {
        let tmp = TempDir::new().unwrap();
        let bytes = zip_of(&[("deep/nested/file.txt", "x")]);
        extract_bytes(&bytes, tmp.path()).unwrap();
        assert!(tmp.path().join("deep/nested/file.txt").is_file());
    }

    #[test]
    fn test_extract_overwrites_existing_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main.rs"), "old contents that are longer").unwrap();
        let bytes = zip_of(&[("main.rs", "new")]);
        extract_bytes(&bytes, tmp.path()).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("main.rs")).unwrap(), "new");
    }

    #[test]
    fn test_traversal_rejected_without_writing() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        // the legitimate entry comes first and must not be written either
        let bytes = zip_of(&[("ok.txt", "fine"), ("../evil.txt", "pwned")]);

        let err = extract_bytes(&bytes, &dest).unwrap_err();

        assert!(
            matches!(err, ArchiveError::PathTraversal { ref entry } if entry == "../evil.txt"),
            "unexpected error: {err}"
        );
        assert!(!tmp.path().join("evil.txt").exists());
        assert_eq!(count_files(&dest), 0);
    }

    #[test]
    fn test_nested_traversal_rejected() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        let bytes = zip_of(&[("src/../../escape.txt", "x")]);
        assert!(matches!(
            extract_bytes(&bytes, &dest),
            Err(ArchiveError::PathTraversal { .. })
        ));
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_absolute_entry_rejected() {
        let tmp = TempDir::new().unwrap();
        let bytes = zip_of(&[("/tmp/fnhost-absolute.txt", "x")]);
        assert!(matches!(
            extract_bytes(&bytes, tmp.path()),
            Err(ArchiveError::PathTraversal { .. })
        ));
    }

    #[test]
    fn test_inner_parent_segments_allowed() {
        let tmp = TempDir::new().unwrap();
        let bytes = zip_of(&[("a/../b.txt", "b")]);
        extract_bytes(&bytes, tmp.path()).unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("b.txt")).unwrap(), "b");
    }

    #[test]
    fn test_invalid_archive() {
        let tmp = TempDir::new().unwrap();
        let err = extract_bytes(b"definitely not a zip", tmp.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Zip(_)));
    }

    #[test]
    fn test_unix_permissions_preserved() {
        let tmp = TempDir::new().unwrap();
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buffer);
            zip.start_file(
                "run.sh",
                SimpleFileOptions::default().unix_permissions(0o755),
            )
            .unwrap();
            zip.write_all(b"#!/bin/sh\n").unwrap();
            zip.finish().unwrap();
        }

        extract_bytes(&buffer.into_inner(), tmp.path()).unwrap();

        let mode = fs::metadata(tmp.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
