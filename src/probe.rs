// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Filesystem probing.
//!
//! Answer "does this path look like a lobe?" and "does this path look like an
//! application?" with plain filesystem reads. Probes never fail: a missing or
//! unreadable path is simply not a lobe and not an application.

use std::path::{Path, PathBuf};

/// Check whether `path` holds an installable application.
///
/// An application directory carries a package-metadata marker (`setup.py` or
/// `pyproject.toml`) and an inner source folder named after the directory
/// itself, containing an `__init__.py`.
pub fn is_app_directory(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    let Some(name) = path.file_name() else {
        return false;
    };

    let has_metadata = path.join("setup.py").is_file() || path.join("pyproject.toml").is_file();
    let has_source = path.join(name).join("__init__.py").is_file();

    has_metadata && has_source
}

/// Check whether `path` is the root of a lobe.
///
/// A lobe carries, at minimum, an `apps` folder and a `sites` folder.
pub fn is_lobe_directory(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    path.join("apps").is_dir() && path.join("sites").is_dir()
}

/// Walk upwards from `start` until a lobe root is found.
///
/// Allows commands to be run from anywhere inside a lobe directory. Returns
/// [`None`] when no ancestor of `start` (including `start` itself) is a lobe.
pub fn find_parent_lobe(start: impl AsRef<Path>) -> Option<PathBuf> {
    let mut current = start.as_ref();
    loop {
        if is_lobe_directory(current) {
            return Some(current.to_path_buf());
        }
        current = current.parent()?;
    }
}
