// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Application version resolution.
//!
//! Determine the version an application believes itself to be, by reading its
//! own metadata. Resolution is pure string and TOML parsing on purpose:
//! importing or executing the application to ask for its version would mean
//! running untrusted code, so we never do.
//!
//! The primary source is the `__version__ = "..."` assignment at the top of
//! the application's `<app>/<app>/__init__.py`. When the marker is absent,
//! fall back to the `version` field of `pyproject.toml` (either the standard
//! `[project]` table or the poetry one).

use std::{fs::read_to_string, path::Path};
use tracing::debug;

/// Resolve the current version of `app` installed under `lobe_path`.
///
/// # Errors
///
/// - Return [`VersionError::NotFound`] if neither the version marker nor the
///   packaging metadata yield a value.
pub fn current_version(app: &str, lobe_path: impl AsRef<Path>) -> Result<String> {
    let app_dir = lobe_path.as_ref().join("apps").join(app);

    if let Some(version) = version_marker(&app_dir.join(app).join("__init__.py")) {
        debug!("resolved {app} version {version} from __init__.py");
        return Ok(version);
    }

    if let Some(version) = pyproject_version(&app_dir.join("pyproject.toml")) {
        debug!("resolved {app} version {version} from pyproject.toml");
        return Ok(version);
    }

    Err(VersionError::NotFound { app: app.into() })
}

/// Scan a source file for a top-level `__version__ = "..."` assignment.
fn version_marker(path: &Path) -> Option<String> {
    let contents = read_to_string(path).ok()?;

    for line in contents.lines() {
        let Some((lhs, rhs)) = line.split_once('=') else {
            continue;
        };

        if lhs.trim() != "__version__" {
            continue;
        }

        let value = rhs.trim().trim_matches(|c| c == '"' || c == '\'');
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }

    None
}

/// Pull the `version` field out of a pyproject manifest.
fn pyproject_version(path: &Path) -> Option<String> {
    let contents = read_to_string(path).ok()?;
    let manifest: toml::Value = toml::de::from_str(&contents).ok()?;

    let project = manifest
        .get("project")
        .or_else(|| manifest.get("tool").and_then(|tool| tool.get("poetry")))?;

    project
        .get("version")
        .and_then(toml::Value::as_str)
        .map(ToString::to_string)
}

/// Version resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// No version marker and no packaging metadata field.
    #[error("no version found for application {app:?}")]
    NotFound { app: String },
}

/// Friendly result alias :3
pub type Result<T, E = VersionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn write_app(root: &Path, name: &str, init: &str, pyproject: Option<&str>) {
        let app = root.join("apps").join(name);
        fs::create_dir_all(app.join(name)).unwrap();
        fs::write(app.join(name).join("__init__.py"), init).unwrap();
        if let Some(pyproject) = pyproject {
            fs::write(app.join("pyproject.toml"), pyproject).unwrap();
        }
    }

    #[test]
    fn version_marker_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let init = indoc! {r#"
            from frobnicate import things

            __version__ = "14.2.0"
        "#};
        write_app(tmp.path(), "blog", init, None);

        let result = current_version("blog", tmp.path()).unwrap();
        assert_eq!(result, "14.2.0");
    }

    #[test]
    fn single_quotes_are_fine_too() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path(), "blog", "__version__ = '2.0.1'\n", None);

        let result = current_version("blog", tmp.path()).unwrap();
        assert_eq!(result, "2.0.1");
    }

    #[test]
    fn falls_back_to_pyproject() {
        let tmp = tempfile::tempdir().unwrap();
        let pyproject = indoc! {r#"
            [project]
            name = "blog"
            version = "3.1.4"
        "#};
        write_app(tmp.path(), "blog", "# no marker here\n", Some(pyproject));

        let result = current_version("blog", tmp.path()).unwrap();
        assert_eq!(result, "3.1.4");
    }

    #[test]
    fn poetry_layout_also_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let pyproject = indoc! {r#"
            [tool.poetry]
            name = "blog"
            version = "0.9.0"
        "#};
        write_app(tmp.path(), "blog", "", Some(pyproject));

        let result = current_version("blog", tmp.path()).unwrap();
        assert_eq!(result, "0.9.0");
    }

    #[test]
    fn nothing_found_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path(), "blog", "# nothing\n", None);

        let result = current_version("blog", tmp.path());
        assert!(matches!(result, Err(VersionError::NotFound { .. })));
    }
}
