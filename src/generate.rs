// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Process-supervision file generators.
//!
//! Each generator renders plain text from instance configuration and writes
//! it under the instance: a `Procfile` for development, a
//! `config/supervisor.conf`, or a tree of systemd units under
//! `config/systemd/`. Rendering is pure string work so it can be asserted on
//! directly; writing, and the overwrite confirmation prompt, live in the
//! `setup_*` entry points.
//!
//! Supervision itself is out of scope. These files are handed to supervisord
//! or systemd, which this tool only ever pokes through `supervisorctl` and
//! `systemctl`.

pub mod procfile;
pub mod supervisor;
pub mod systemd;

use crate::{config, lobe::Lobe};

use inquire::Confirm;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Everything a render function needs, resolved up front.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub lobe_dir: PathBuf,
    pub sites_dir: PathBuf,
    pub lobe_name: String,
    pub user: String,
    pub http_timeout: u64,
    pub webserver_port: u64,
    pub gunicorn_workers: u64,
    pub gunicorn_max_requests: u64,
    pub gunicorn_max_requests_jitter: u64,
    pub background_workers: u64,
    pub redis_server: String,
    pub node: String,
    pub lobe_cmd: String,
    pub skip_redis: bool,
}

impl RenderContext {
    /// Resolve the context for one instance.
    ///
    /// Configuration keys override the computed defaults; binaries are
    /// located on PATH and fall back to their bare names when absent, so a
    /// generated file is still readable on a machine missing them.
    pub fn new(lobe: &Lobe, user: Option<String>, skip_redis: bool) -> Result<Self> {
        let conf = lobe.conf()?;
        let key = |name: &str| conf.get(name).and_then(Value::as_u64);

        let gunicorn_workers = key("gunicorn_workers").unwrap_or_else(config::gunicorn_workers);
        let gunicorn_max_requests = key("gunicorn_max_requests")
            .unwrap_or_else(|| config::default_max_requests(gunicorn_workers));

        Ok(Self {
            lobe_dir: lobe.path().to_path_buf(),
            sites_dir: lobe.sites_dir(),
            lobe_name: lobe.name(),
            user: user
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "root".to_string()),
            http_timeout: key("http_timeout").unwrap_or(120),
            webserver_port: key("webserver_port").unwrap_or(8000),
            gunicorn_workers,
            gunicorn_max_requests,
            gunicorn_max_requests_jitter: config::max_requests_jitter(gunicorn_max_requests),
            background_workers: key("background_workers").unwrap_or(1),
            redis_server: locate("redis-server"),
            node: which::which("node")
                .or_else(|_| which::which("nodejs"))
                .map(|path| path.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "node".to_string()),
            lobe_cmd: locate("lobe"),
            skip_redis,
        })
    }
}

/// PATH lookup that degrades to the bare name.
fn locate(binary: &str) -> String {
    which::which(binary)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| binary.to_string())
}

/// Ask before clobbering an existing generated file.
///
/// Returns `false` (and logs) when the user declines; `yes` bypasses the
/// prompt entirely.
fn confirm_overwrite(path: &Path, yes: bool) -> Result<bool> {
    if yes || !path.exists() {
        return Ok(true);
    }

    let proceed = Confirm::new(&format!(
        "{:?} already exists and will be overwritten. Continue?",
        path.display()
    ))
    .with_default(false)
    .prompt()?;

    if !proceed {
        warn!("leaving {:?} untouched", path.display());
    }

    Ok(proceed)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(|err| GenerateError::Write {
        source: err,
        path: path.to_path_buf(),
    })
}

/// Generator error types.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    /// Generated file cannot be written.
    #[error("failed to write {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Output directory cannot be created.
    #[error("failed to create {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Prompt(#[from] inquire::InquireError),
}

/// Friendly result alias :3
pub type Result<T, E = GenerateError> = std::result::Result<T, E>;
