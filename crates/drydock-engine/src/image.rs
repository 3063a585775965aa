// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image builds and image lifecycle.
//!
//! A build takes the merged tar context, extracts it into a scratch
//! directory under strict validation (no links, no devices, no path
//! escapes, bounded total size), picks the build root, re-packs the tree
//! and streams the runtime's build log. Removal is tag-aware: a tag shared
//! by several repositories needs a forced retry, and bulk cleanup walks a
//! repository newest-first so protected tags survive.

use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveError, BuildContext};
use crate::runtime::{BuildLogChunk, ContainerRuntime, RuntimeError};

/// Image build and removal failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The context contains an entry that must not be extracted.
    #[error("Unsafe archive entry: {0}")]
    UnsafeEntry(String),

    /// No Dockerfile at the context root or under `app/`.
    #[error("No Dockerfile found at the context root or under app/")]
    MissingDockerfile,

    /// The extracted context exceeds the configured cap.
    #[error("Build context exceeds the {limit} byte limit")]
    ContextTooLarge {
        /// The configured cap in bytes.
        limit: u64,
    },

    /// The runtime reported a build failure inside the log stream.
    #[error("Image build failed: {0}")]
    Failed(String),

    /// A runtime API call failed.
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// The context could not be assembled.
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Scratch directory I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome counters for a bulk image removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveStats {
    /// Images matching the repository.
    pub found: usize,
    /// Images removed.
    pub removed: usize,
    /// Images skipped because a tag is protected.
    pub skipped: usize,
    /// Images where removal failed.
    pub failed: usize,
}

/// Builds, inspects and removes service images.
#[derive(Clone)]
pub struct ImageManager {
    runtime: Arc<dyn ContainerRuntime>,
    max_context_bytes: u64,
}

impl ImageManager {
    /// Create a manager over `runtime` with a context extraction cap.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, max_context_bytes: u64) -> Self {
        Self {
            runtime,
            max_context_bytes,
        }
    }

    /// The `repository:tag` reference for a service image.
    pub fn image_ref(name: &str, tag: &str) -> String {
        format!("{name}:{tag}")
    }

    /// Build `name:tag` from `context`, injecting `dockerfile` when the
    /// platform supplies one (a user-provided `app/Dockerfile` still wins).
    ///
    /// The build log is forwarded to tracing; any error frame aborts with
    /// [`BuildError::Failed`].
    pub async fn build(
        &self,
        name: &str,
        tag: &str,
        dockerfile: Option<&str>,
        context: BuildContext,
    ) -> Result<String, BuildError> {
        let context = match dockerfile {
            Some(text) => BuildContext::merge([context, BuildContext::from_dockerfile(text)?])?,
            None => context,
        };

        let workdir = tempfile::tempdir()?;
        extract_validated(&context, workdir.path(), self.max_context_bytes)?;
        let build_root = locate_build_root(workdir.path())?;
        let tar = pack_directory(&build_root)?;

        let image_ref = Self::image_ref(name, tag);
        info!(image = %image_ref, "Starting image build");

        let mut stream = self.runtime.build_image(&image_ref, tar);
        while let Some(event) = stream.next().await {
            match event? {
                BuildLogChunk::Output(line) => {
                    let line = line.trim_end();
                    if !line.is_empty() {
                        info!(image = %image_ref, "{}", line);
                    }
                }
                BuildLogChunk::Status(status) => {
                    debug!(image = %image_ref, "{}", status);
                }
                BuildLogChunk::Error(message) => {
                    error!(image = %image_ref, "Build failed: {}", message);
                    return Err(BuildError::Failed(message));
                }
            }
        }

        info!(image = %image_ref, "Image build finished");
        Ok(image_ref)
    }

    /// Whether `name:tag` exists locally.
    pub async fn exists(&self, name: &str, tag: &str) -> Result<bool, BuildError> {
        Ok(self.runtime.image_exists(&Self::image_ref(name, tag)).await?)
    }

    /// Remove one tag. `Ok(false)` when the image was already gone.
    ///
    /// An image shared by several repositories rejects plain removal; with
    /// `force` the removal is retried forced, otherwise the conflict is
    /// surfaced.
    pub async fn remove(&self, name: &str, tag: &str, force: bool) -> Result<bool, BuildError> {
        let image_ref = Self::image_ref(name, tag);
        match self.runtime.remove_image(&image_ref, false).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) if force && err.is_conflict() => {
                warn!(image = %image_ref, "Tag conflict, retrying removal forced");
                self.runtime.remove_image(&image_ref, true).await?;
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every image in repository `name`, newest first, keeping any
    /// image that carries a tag listed in `keep_tags`.
    pub async fn remove_all(
        &self,
        name: &str,
        keep_tags: &[String],
    ) -> Result<RemoveStats, BuildError> {
        let mut images = self.runtime.list_images(name).await?;
        images.sort_by(|a, b| b.created.cmp(&a.created));

        let mut stats = RemoveStats {
            found: images.len(),
            ..Default::default()
        };

        for image in images {
            if image.repo_tags.iter().any(|tag| keep_tags.contains(tag)) {
                stats.skipped += 1;
                continue;
            }

            let mut image_failed = false;
            for tag in &image.repo_tags {
                match self.runtime.remove_image(tag, true).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        warn!(image = %tag, error = %err, "Failed to remove image tag");
                        image_failed = true;
                    }
                }
            }
            if image_failed {
                stats.failed += 1;
            } else {
                stats.removed += 1;
            }
        }

        info!(
            repository = %name,
            removed = stats.removed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Bulk image removal finished"
        );
        Ok(stats)
    }

    /// Remove dangling build layers, returning reclaimed bytes.
    pub async fn prune_dangling(&self) -> Result<u64, BuildError> {
        Ok(self.runtime.prune_dangling_images().await?)
    }
}

/// Extract `context` into `dir`, rejecting links, devices and any entry
/// whose path would escape the directory, capping the total written bytes.
fn extract_validated(
    context: &BuildContext,
    dir: &Path,
    max_bytes: u64,
) -> Result<(), BuildError> {
    let mut archive = tar::Archive::new(Cursor::new(context.tar_bytes()));
    let mut total: u64 = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        let path = entry.path()?.into_owned();
        let name = path.display().to_string();

        match entry_type {
            tar::EntryType::Regular | tar::EntryType::Directory => {}
            tar::EntryType::Symlink | tar::EntryType::Link => {
                return Err(BuildError::UnsafeEntry(format!("link entry: {name}")));
            }
            other => {
                return Err(BuildError::UnsafeEntry(format!(
                    "unsupported entry type {other:?}: {name}"
                )));
            }
        }

        let mut dest = dir.to_path_buf();
        for component in path.components() {
            match component {
                Component::Normal(part) => dest.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(BuildError::UnsafeEntry(format!("path traversal: {name}")));
                }
            }
        }
        if dest == dir {
            continue;
        }

        if entry_type == tar::EntryType::Directory {
            fs::create_dir_all(&dest)?;
            continue;
        }

        total = total.saturating_add(entry.header().size()?);
        if total > max_bytes {
            return Err(BuildError::ContextTooLarge { limit: max_bytes });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(mode) = entry.header().mode() {
                let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o777));
            }
        }
    }

    Ok(())
}

/// Pick the build root: a user-supplied `app/Dockerfile` wins, otherwise
/// the Dockerfile must sit at the extraction root.
fn locate_build_root(dir: &Path) -> Result<PathBuf, BuildError> {
    let app_dir = dir.join("app");
    if app_dir.join("Dockerfile").is_file() {
        return Ok(app_dir);
    }
    if dir.join("Dockerfile").is_file() {
        return Ok(dir.to_path_buf());
    }
    Err(BuildError::MissingDockerfile)
}

fn pack_directory(root: &Path) -> Result<Vec<u8>, BuildError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", root)?;
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn context(entries: &[(&str, &str)]) -> BuildContext {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, text) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(text.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, *name, text.as_bytes())
                .expect("append");
        }
        BuildContext::from_tar_bytes(builder.into_inner().expect("tar"))
    }

    /// A raw ustar header block, for entry names tar::Builder refuses to
    /// write (absolute paths, parent traversal).
    fn raw_tar_entry(name: &str, data: &[u8], typeflag: u8) -> Vec<u8> {
        let mut header = [0u8; 512];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[100..107].copy_from_slice(b"0000644");
        header[108..115].copy_from_slice(b"0000000");
        header[116..123].copy_from_slice(b"0000000");
        let size = format!("{:011o}", data.len());
        header[124..135].copy_from_slice(size.as_bytes());
        header[136..147].copy_from_slice(b"00000000000");
        header[156] = typeflag;
        header[257..262].copy_from_slice(b"ustar");
        header[263..265].copy_from_slice(b"00");
        for byte in &mut header[148..156] {
            *byte = b' ';
        }
        let sum: u32 = header.iter().map(|b| u32::from(*b)).sum();
        let checksum = format!("{sum:06o}\0 ");
        header[148..156].copy_from_slice(checksum.as_bytes());

        let mut out = header.to_vec();
        out.extend_from_slice(data);
        out.resize(out.len() + (512 - data.len() % 512) % 512, 0);
        out
    }

    fn manager(mock: &MockRuntime) -> ImageManager {
        ImageManager::new(Arc::new(mock.clone()), 500 * 1024 * 1024)
    }

    #[tokio::test]
    async fn build_injects_dockerfile_and_registers_image() {
        let mock = MockRuntime::new();
        let ctx = context(&[("requirements.txt", "django==5.0\n")]);

        let image_ref = manager(&mock)
            .build("tenant-web", "1.0", Some("FROM python:3.12\n"), ctx)
            .await
            .expect("build");
        assert_eq!(image_ref, "tenant-web:1.0");
        assert!(mock
            .images()
            .iter()
            .any(|i| i.repo_tags.contains(&"tenant-web:1.0".to_string())));
    }

    #[tokio::test]
    async fn build_aborts_on_error_frame() {
        let mock = MockRuntime::new();
        mock.set_build_chunks(vec![
            BuildLogChunk::Output("Step 1/3 : FROM python:3.12\n".to_string()),
            BuildLogChunk::Error("pip install exited with code 1".to_string()),
        ]);
        let ctx = context(&[("requirements.txt", "nonexistent==0.0\n")]);

        let err = manager(&mock)
            .build("tenant-web", "1.0", Some("FROM python:3.12\n"), ctx)
            .await
            .expect_err("build must fail");
        match err {
            BuildError::Failed(message) => {
                assert_eq!(message, "pip install exited with code 1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn build_without_any_dockerfile_is_rejected() {
        let mock = MockRuntime::new();
        let ctx = context(&[("index.html", "<html></html>")]);

        let err = manager(&mock)
            .build("tenant-web", "1.0", None, ctx)
            .await
            .expect_err("no dockerfile");
        assert!(matches!(err, BuildError::MissingDockerfile));
        assert!(mock.calls().iter().all(|c| !c.starts_with("build_image")));
    }

    #[test]
    fn extraction_rejects_links_and_devices() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "link.txt", "target.txt")
            .expect("append link");
        let ctx = BuildContext::from_tar_bytes(builder.into_inner().expect("tar"));
        let err = extract_validated(&ctx, dir.path(), 1024).expect_err("symlink");
        assert!(matches!(err, BuildError::UnsafeEntry(_)));

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Char);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_data(&mut header, "null", std::io::empty())
            .expect("append device");
        let ctx = BuildContext::from_tar_bytes(builder.into_inner().expect("tar"));
        let err = extract_validated(&ctx, dir.path(), 1024).expect_err("device");
        assert!(matches!(err, BuildError::UnsafeEntry(_)));
    }

    #[test]
    fn extraction_rejects_parent_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tar = raw_tar_entry("../evil.txt", b"boo", b'0');
        tar.extend_from_slice(&[0u8; 1024]);
        let ctx = BuildContext::from_tar_bytes(tar);

        let err = extract_validated(&ctx, dir.path(), 1024).expect_err("traversal");
        assert!(matches!(err, BuildError::UnsafeEntry(_)));
        assert!(!dir.path().parent().expect("parent").join("evil.txt").exists());
    }

    #[test]
    fn extraction_caps_total_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&[("a.bin", "0123456789"), ("b.bin", "0123456789")]);
        let err = extract_validated(&ctx, dir.path(), 15).expect_err("cap");
        assert!(matches!(err, BuildError::ContextTooLarge { limit: 15 }));
    }

    #[test]
    fn duplicate_entries_resolve_last_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let user = context(&[("Dockerfile", "FROM user")]);
        let generated = BuildContext::from_dockerfile("FROM python:3.12").expect("dockerfile");
        let merged = BuildContext::merge([user, generated]).expect("merge");

        extract_validated(&merged, dir.path(), 1024).expect("extract");
        let content = fs::read_to_string(dir.path().join("Dockerfile")).expect("read");
        assert_eq!(content, "FROM python:3.12");
    }

    #[test]
    fn app_dockerfile_wins_over_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = context(&[
            ("Dockerfile", "FROM generated"),
            ("app/Dockerfile", "FROM user"),
            ("app/main.py", "print('hi')"),
        ]);
        extract_validated(&ctx, dir.path(), 1024).expect("extract");

        let root = locate_build_root(dir.path()).expect("root");
        assert_eq!(root, dir.path().join("app"));

        fs::remove_file(dir.path().join("app/Dockerfile")).expect("remove");
        let root = locate_build_root(dir.path()).expect("root");
        assert_eq!(root, dir.path());
    }

    #[tokio::test]
    async fn remove_reports_absent_image() {
        let mock = MockRuntime::new();
        let removed = manager(&mock)
            .remove("tenant-web", "1.0", false)
            .await
            .expect("remove");
        assert!(!removed);
    }

    #[tokio::test]
    async fn remove_retries_conflict_when_forced() {
        let mock = MockRuntime::new();
        mock.add_image("tenant-web:1.0", 1);
        mock.fail_next(
            "remove_image",
            RuntimeError::Api("409: image is referenced in multiple repositories".to_string()),
        );

        let removed = manager(&mock)
            .remove("tenant-web", "1.0", true)
            .await
            .expect("remove");
        assert!(removed);

        let calls = mock.calls();
        let removes: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("remove_image"))
            .collect();
        assert_eq!(removes.len(), 2);
        assert!(removes[1].ends_with("force=true"));
    }

    #[tokio::test]
    async fn remove_surfaces_conflict_without_force() {
        let mock = MockRuntime::new();
        mock.add_image("tenant-web:1.0", 1);
        mock.fail_next(
            "remove_image",
            RuntimeError::Api("409: image is referenced in multiple repositories".to_string()),
        );

        let err = manager(&mock)
            .remove("tenant-web", "1.0", false)
            .await
            .expect_err("conflict");
        assert!(matches!(err, BuildError::Runtime(RuntimeError::Api(_))));
    }

    #[tokio::test]
    async fn remove_all_walks_newest_first_and_keeps_protected() {
        let mock = MockRuntime::new();
        mock.add_image("tenant-web:1.0", 1);
        mock.add_image("tenant-web:2.0", 2);
        mock.add_image("tenant-web:3.0", 3);
        mock.add_image("other:9.9", 9);

        let stats = manager(&mock)
            .remove_all("tenant-web", &["tenant-web:3.0".to_string()])
            .await
            .expect("remove_all");
        assert_eq!(stats.found, 3);
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);

        let calls = mock.calls();
        let removes: Vec<_> = calls
            .iter()
            .filter(|c| c.starts_with("remove_image"))
            .collect();
        assert_eq!(removes.len(), 2);
        assert!(removes[0].contains("tenant-web:2.0"));
        assert!(removes[1].contains("tenant-web:1.0"));
    }

    #[tokio::test]
    async fn remove_all_counts_failures_without_aborting() {
        let mock = MockRuntime::new();
        mock.add_image("tenant-web:1.0", 1);
        mock.add_image("tenant-web:2.0", 2);
        mock.fail_next(
            "remove_image",
            RuntimeError::Api("500: layer in use".to_string()),
        );

        let stats = manager(&mock)
            .remove_all("tenant-web", &[])
            .await
            .expect("remove_all");
        assert_eq!(stats.found, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn prune_reports_reclaimed_bytes() {
        let mock = MockRuntime::new();
        mock.set_dangling_bytes(4096);
        let reclaimed = manager(&mock).prune_dangling().await.expect("prune");
        assert_eq!(reclaimed, 4096);
    }
}
