// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Lifecycle management for multi-app logica instances.
//!
//! A __lobe__ is one deployed unit: a directory holding an `apps` folder of
//! installed applications, a `sites` folder of served sites, and the virtual
//! environment plus configuration that glues them together. This crate
//! initializes such directories, clones and installs applications into them,
//! keeps the installed-application bookkeeping consistent, and generates the
//! process-supervision configuration that runs the whole thing.
//!
//! # Registry Artifacts
//!
//! The heart of the crate is the application registry in [`registry`]. Three
//! artifacts describe which applications a lobe carries:
//!
//! 1. the `apps/` directory listing itself,
//! 2. the manifest `sites/apps.txt` (ordered names, one per line),
//! 3. the state file `sites/apps.json` (per-app version, commit resolution,
//!    dependency list, and a stable 1-based index).
//!
//! [`registry::AppRegistry::sync`] is the only operation that guarantees all
//! three agree, and every add or remove funnels through it.

pub mod app;
pub mod config;
pub mod generate;
pub mod lobe;
pub mod probe;
pub mod registry;
pub mod run;
pub mod vcs;
pub mod version;

pub use crate::{
    app::{App, AppSource},
    lobe::Lobe,
    registry::AppRegistry,
};

/// Name of the mandatory base application every lobe depends on.
///
/// The framework is always ordered first in the manifest and registry state,
/// no matter what order the filesystem hands back.
pub const FRAMEWORK_APP: &str = "logica";

/// Default remote organization used to resolve bare application names.
pub const DEFAULT_REMOTE: &str = "https://github.com/logica";

/// Directory skeleton of a freshly initialized lobe, relative to its root.
pub const DIRS_IN_LOBE: &[&str] = &["apps", "sites", "config", "config/pids", "logs"];
