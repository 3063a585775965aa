// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entrypoint detection for platforms that need a generated launch command.
//!
//! Django archives carry no Dockerfile and no process manager invocation, so
//! the engine has to find the application object itself: scan `manage.py`
//! for the settings module declaration, then scan that module for an
//! `ASGI_APPLICATION` / `WSGI_APPLICATION` path. Detection is best-effort;
//! an undetectable archive returns `Ok(None)` and the orchestrator decides
//! whether that aborts the deploy.

use std::io::{Cursor, Read};
use std::sync::OnceLock;

use drydock_core::{Entrypoint, EntrypointKind, Platform};
use regex::Regex;
use thiserror::Error;

use crate::archive::BuildContext;

/// Failures while scanning a build context.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DetectError {
    /// The tar stream could not be read.
    #[error("Failed to scan build context: {0}")]
    Io(#[from] std::io::Error),
}

static SETTINGS_RE: OnceLock<Regex> = OnceLock::new();
static ASGI_RE: OnceLock<Regex> = OnceLock::new();
static WSGI_RE: OnceLock<Regex> = OnceLock::new();

fn settings_re() -> &'static Regex {
    SETTINGS_RE.get_or_init(|| {
        Regex::new(r#"DJANGO_SETTINGS_MODULE\s*['"]\s*,\s*['"]([\w.]+)['"]"#)
            .expect("settings module pattern")
    })
}

fn asgi_re() -> &'static Regex {
    ASGI_RE.get_or_init(|| {
        Regex::new(r#"ASGI_APPLICATION\s*=\s*['"]([\w.]+)['"]"#).expect("asgi application pattern")
    })
}

fn wsgi_re() -> &'static Regex {
    WSGI_RE.get_or_init(|| {
        Regex::new(r#"WSGI_APPLICATION\s*=\s*['"]([\w.]+)['"]"#).expect("wsgi application pattern")
    })
}

/// Detect the application entrypoint for `platform` inside `context`.
///
/// Returns `Ok(None)` when the platform does not use detection or when the
/// archive is undetectable (no `manage.py`, or no settings module declared
/// in it). When the settings module is named but declares no application
/// path, the conventional `<project>.wsgi:application` target is assumed.
pub fn detect_entrypoint(
    context: &BuildContext,
    platform: Platform,
) -> Result<Option<Entrypoint>, DetectError> {
    if !platform.requires_detection() {
        return Ok(None);
    }

    let Some((prefix, settings_module)) = find_settings_module(context)? else {
        return Ok(None);
    };

    if let Some(entrypoint) = find_declared_application(context, &prefix, &settings_module)? {
        return Ok(Some(entrypoint));
    }
    Ok(Some(fallback_entrypoint(&settings_module)))
}

/// First pass: locate a `manage.py` declaring the settings module. Returns
/// the directory prefix the file was found under and the module path.
fn find_settings_module(context: &BuildContext) -> Result<Option<(String, String)>, DetectError> {
    let mut archive = tar::Archive::new(Cursor::new(context.tar_bytes()));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.display().to_string();
        if !path.ends_with("manage.py") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        if let Some(caps) = settings_re().captures(&text) {
            let module = caps[1].to_string();
            let prefix = path.strip_suffix("manage.py").unwrap_or("").to_string();
            return Ok(Some((prefix, module)));
        }
    }
    Ok(None)
}

/// Second pass: read the settings module text and pick the declared
/// application path, preferring ASGI over WSGI.
fn find_declared_application(
    context: &BuildContext,
    prefix: &str,
    settings_module: &str,
) -> Result<Option<Entrypoint>, DetectError> {
    let settings_path = format!("{prefix}{}.py", settings_module.replace('.', "/"));

    let mut archive = tar::Archive::new(Cursor::new(context.tar_bytes()));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.display().to_string();
        if path != settings_path {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);

        if let Some(caps) = asgi_re().captures(&text) {
            if let Some(entrypoint) = split_application(EntrypointKind::Asgi, &caps[1]) {
                return Ok(Some(entrypoint));
            }
        }
        if let Some(caps) = wsgi_re().captures(&text) {
            if let Some(entrypoint) = split_application(EntrypointKind::Wsgi, &caps[1]) {
                return Ok(Some(entrypoint));
            }
        }
        return Ok(None);
    }
    Ok(None)
}

/// Split `proj.wsgi.application` into module and attribute. Values without
/// a dot cannot name an attribute and are ignored.
fn split_application(kind: EntrypointKind, value: &str) -> Option<Entrypoint> {
    let (module, attribute) = value.rsplit_once('.')?;
    Some(Entrypoint {
        kind,
        module: module.to_string(),
        attribute: attribute.to_string(),
    })
}

/// The conventional target when the settings module declares nothing.
fn fallback_entrypoint(settings_module: &str) -> Entrypoint {
    let project = settings_module
        .rsplit_once('.')
        .map(|(project, _)| project)
        .unwrap_or(settings_module);
    Entrypoint {
        kind: EntrypointKind::Wsgi,
        module: format!("{project}.wsgi"),
        attribute: "application".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    const MANAGE_PY: &str = "import os\n\
        def main():\n\
            os.environ.setdefault('DJANGO_SETTINGS_MODULE', 'proj.settings')\n";

    #[test]
    fn declared_wsgi_application_is_detected() {
        let ctx = context(&[
            ("manage.py", MANAGE_PY),
            (
                "proj/settings.py",
                "DEBUG = False\nWSGI_APPLICATION = \"proj.wsgi.application\"\n",
            ),
        ]);
        let entry = detect_entrypoint(&ctx, Platform::Django)
            .expect("scan")
            .expect("detected");
        assert_eq!(entry.kind, EntrypointKind::Wsgi);
        assert_eq!(entry.module, "proj.wsgi");
        assert_eq!(entry.target(), "proj.wsgi:application");
    }

    #[test]
    fn asgi_wins_when_both_declared() {
        let ctx = context(&[
            ("manage.py", MANAGE_PY),
            (
                "proj/settings.py",
                "WSGI_APPLICATION = 'proj.wsgi.application'\n\
                 ASGI_APPLICATION = 'proj.asgi.application'\n",
            ),
        ]);
        let entry = detect_entrypoint(&ctx, Platform::Django)
            .expect("scan")
            .expect("detected");
        assert_eq!(entry.kind, EntrypointKind::Asgi);
        assert_eq!(entry.target(), "proj.asgi:application");
    }

    #[test]
    fn silent_settings_module_falls_back_to_wsgi() {
        let ctx = context(&[
            ("manage.py", MANAGE_PY),
            ("proj/settings.py", "DEBUG = False\nALLOWED_HOSTS = ['*']\n"),
        ]);
        let entry = detect_entrypoint(&ctx, Platform::Django)
            .expect("scan")
            .expect("detected");
        assert_eq!(entry.kind, EntrypointKind::Wsgi);
        assert_eq!(entry.target(), "proj.wsgi:application");
    }

    #[test]
    fn missing_settings_file_falls_back_to_wsgi() {
        let ctx = context(&[("manage.py", MANAGE_PY)]);
        let entry = detect_entrypoint(&ctx, Platform::Django)
            .expect("scan")
            .expect("detected");
        assert_eq!(entry.target(), "proj.wsgi:application");
    }

    #[test]
    fn nested_project_directory_is_supported() {
        let ctx = context(&[
            ("app/manage.py", MANAGE_PY),
            (
                "app/proj/settings.py",
                "ASGI_APPLICATION = \"proj.asgi.application\"\n",
            ),
        ]);
        let entry = detect_entrypoint(&ctx, Platform::Django)
            .expect("scan")
            .expect("detected");
        assert_eq!(entry.kind, EntrypointKind::Asgi);
    }

    #[test]
    fn undetectable_archives_return_none() {
        let no_manage = context(&[("requirements.txt", "django==5.0\n")]);
        assert!(detect_entrypoint(&no_manage, Platform::Django)
            .expect("scan")
            .is_none());

        let no_declaration = context(&[("manage.py", "print('not django')\n")]);
        assert!(detect_entrypoint(&no_declaration, Platform::Django)
            .expect("scan")
            .is_none());
    }

    #[test]
    fn detection_is_skipped_for_other_platforms() {
        let ctx = context(&[("manage.py", MANAGE_PY)]);
        assert!(detect_entrypoint(&ctx, Platform::Nodejs)
            .expect("scan")
            .is_none());
    }
}
