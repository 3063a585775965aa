// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversion of uploaded zip archives into tar build contexts.
//!
//! Uploads arrive as zip files but the container runtime consumes tar
//! streams, so the first step of every build converts one into the other in
//! memory. Entry names and contents are preserved as-is; path safety is
//! enforced later, when the context is extracted for validation.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use thiserror::Error;
use zip::ZipArchive;

/// Archive conversion failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    /// The archive path does not exist.
    #[error("Archive not found: {0}")]
    Missing(String),

    /// The file exists but cannot be parsed as a zip archive.
    #[error("Archive is not a valid zip: {0}")]
    Corrupt(String),

    /// The archive or its uncompressed content exceeds a configured cap.
    #[error("Archive too large: {actual} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Observed size in bytes.
        actual: u64,
        /// The cap that was exceeded.
        limit: u64,
    },

    /// Reading or re-packing failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An in-memory tar stream ready to be sent to the image build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    tar: Vec<u8>,
}

impl BuildContext {
    /// Convert the zip archive at `path` into a tar context.
    ///
    /// `max_archive_bytes` caps the zip file itself, `max_context_bytes`
    /// caps the cumulative uncompressed size. Directory entries are dropped;
    /// leading slashes are stripped from entry names, matching tar
    /// convention.
    pub fn from_zip_path(
        path: impl AsRef<Path>,
        max_archive_bytes: u64,
        max_context_bytes: u64,
    ) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArchiveError::Missing(path.display().to_string())
            } else {
                ArchiveError::Io(e)
            }
        })?;
        if metadata.len() > max_archive_bytes {
            return Err(ArchiveError::TooLarge {
                actual: metadata.len(),
                limit: max_archive_bytes,
            });
        }

        let bytes = fs::read(path)?;
        let mut zip = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;

        let mut builder = tar::Builder::new(Vec::new());
        let mut total: u64 = 0;
        for index in 0..zip.len() {
            let mut entry = zip
                .by_index(index)
                .map_err(|e| ArchiveError::Corrupt(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }

            total = total.saturating_add(entry.size());
            if total > max_context_bytes {
                return Err(ArchiveError::TooLarge {
                    actual: total,
                    limit: max_context_bytes,
                });
            }

            let name = entry.name().trim_start_matches('/').to_string();
            let mode = entry.unix_mode().unwrap_or(0o644) & 0o777;
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;

            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(mode);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice())?;
        }

        let tar = builder.into_inner()?;
        Ok(Self { tar })
    }

    /// A single-entry context holding a rendered `Dockerfile`.
    pub fn from_dockerfile(text: &str) -> Result<Self, ArchiveError> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(text.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "Dockerfile", text.as_bytes())?;
        let tar = builder.into_inner()?;
        Ok(Self { tar })
    }

    /// Concatenate contexts in argument order.
    ///
    /// Entries are not deduplicated; on a name collision the last appended
    /// entry wins at extraction time.
    pub fn merge(contexts: impl IntoIterator<Item = BuildContext>) -> Result<Self, ArchiveError> {
        let mut builder = tar::Builder::new(Vec::new());
        for context in contexts {
            let mut archive = tar::Archive::new(Cursor::new(context.tar));
            for entry in archive.entries()? {
                let mut entry = entry?;
                let path = entry.path()?.into_owned();
                let entry_type = entry.header().entry_type();
                let mode = entry.header().mode().unwrap_or(0o644);
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;

                let mut header = tar::Header::new_gnu();
                header.set_entry_type(entry_type);
                header.set_size(data.len() as u64);
                header.set_mode(mode);
                header.set_cksum();
                builder.append_data(&mut header, path, data.as_slice())?;
            }
        }
        let tar = builder.into_inner()?;
        Ok(Self { tar })
    }

    /// Wrap an existing tar stream.
    pub(crate) fn from_tar_bytes(tar: Vec<u8>) -> Self {
        Self { tar }
    }

    /// Borrow the raw tar bytes.
    pub fn tar_bytes(&self) -> &[u8] {
        &self.tar
    }

    /// Consume the context, yielding the raw tar bytes.
    pub fn into_tar_bytes(self) -> Vec<u8> {
        self.tar
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).expect("start_file");
            writer.write_all(data).expect("write entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    fn write_zip(dir: &tempfile::TempDir, entries: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.path().join("upload.zip");
        fs::write(&path, zip_bytes(entries)).expect("write zip");
        path
    }

    fn tar_entries(context: &BuildContext) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(Cursor::new(context.tar_bytes()));
        archive
            .entries()
            .expect("entries")
            .map(|entry| {
                let mut entry = entry.expect("entry");
                let path = entry.path().expect("path").display().to_string();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).expect("read");
                (path, data)
            })
            .collect()
    }

    #[test]
    fn zip_entries_become_tar_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_zip(
            &dir,
            &[
                ("app/manage.py", b"import django".as_slice()),
                ("requirements.txt", b"django==5.0".as_slice()),
            ],
        );

        let context =
            BuildContext::from_zip_path(&path, 10 * 1024 * 1024, 500 * 1024 * 1024).expect("zip");
        let entries = tar_entries(&context);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "app/manage.py");
        assert_eq!(entries[0].1, b"import django");
        assert_eq!(entries[1].0, "requirements.txt");
    }

    #[test]
    fn directory_entries_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upload.zip");
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        writer.add_directory("static/", options).expect("dir");
        writer.start_file("static/logo.svg", options).expect("file");
        writer.write_all(b"<svg/>").expect("write");
        let bytes = writer.finish().expect("finish").into_inner();
        fs::write(&path, bytes).expect("write zip");

        let context = BuildContext::from_zip_path(&path, 1024 * 1024, 1024 * 1024).expect("zip");
        let entries = tar_entries(&context);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "static/logo.svg");
    }

    #[test]
    fn missing_archive_is_distinct_from_corrupt() {
        let err = BuildContext::from_zip_path("/nonexistent/upload.zip", 1024, 1024)
            .expect_err("missing");
        assert!(matches!(err, ArchiveError::Missing(_)));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("upload.zip");
        fs::write(&path, b"definitely not a zip").expect("write");
        let err = BuildContext::from_zip_path(&path, 1024, 1024).expect_err("corrupt");
        assert!(matches!(err, ArchiveError::Corrupt(_)));
    }

    #[test]
    fn oversized_zip_is_rejected_before_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_zip(&dir, &[("a.txt", b"hello".as_slice())]);
        let err = BuildContext::from_zip_path(&path, 4, 1024 * 1024).expect_err("too large");
        assert!(matches!(err, ArchiveError::TooLarge { limit: 4, .. }));
    }

    #[test]
    fn cumulative_uncompressed_size_is_capped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_zip(
            &dir,
            &[
                ("a.txt", [0u8; 64].as_slice()),
                ("b.txt", [0u8; 64].as_slice()),
            ],
        );
        let err = BuildContext::from_zip_path(&path, 1024 * 1024, 100).expect_err("too large");
        assert!(matches!(err, ArchiveError::TooLarge { limit: 100, .. }));
    }

    #[test]
    fn merge_preserves_order_with_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_zip(&dir, &[("Dockerfile", b"FROM user".as_slice())]);
        let user = BuildContext::from_zip_path(&path, 1024 * 1024, 1024 * 1024).expect("zip");
        let generated = BuildContext::from_dockerfile("FROM python:3.12").expect("dockerfile");

        let merged = BuildContext::merge([user, generated]).expect("merge");
        let entries = tar_entries(&merged);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"FROM user");
        assert_eq!(entries[1].0, "Dockerfile");
        assert_eq!(entries[1].1, b"FROM python:3.12");
    }

    #[test]
    fn dockerfile_context_has_single_entry() {
        let context = BuildContext::from_dockerfile("FROM python:3.12\nCMD [\"app\"]\n")
            .expect("dockerfile");
        let entries = tar_entries(&context);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "Dockerfile");
    }
}
