// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Instance-wide configuration store.
//!
//! A lobe keeps its settings in `sites/common_site_config.json`: a flat JSON
//! object of scalar settings (ports, worker counts, feature flags). There is
//! no schema. Unknown keys pass through untouched, and merging is a shallow
//! overwrite of the top-level keys. The file is rewritten whole on every
//! update, with sorted keys so diffs stay stable.

use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Flat key/value configuration map.
pub type Config = serde_json::Map<String, Value>;

/// Hard ceiling on requests served by one web worker before recycling.
pub const DEFAULT_MAX_REQUESTS: u64 = 5000;

/// Absolute path of the config file for the lobe at `lobe_path`.
pub fn config_path(lobe_path: impl AsRef<Path>) -> PathBuf {
    lobe_path.as_ref().join("sites").join("common_site_config.json")
}

/// Read the configuration of the lobe at `lobe_path`.
///
/// A missing config file is an empty configuration, not an error; a fresh
/// lobe has no settings yet.
///
/// # Errors
///
/// - Return [`ConfigError::Read`] if the file exists but cannot be read.
/// - Return [`ConfigError::Json`] if its contents are not a JSON object.
pub fn get_config(lobe_path: impl AsRef<Path>) -> Result<Config> {
    let path = config_path(&lobe_path);
    if !path.exists() {
        return Ok(Config::new());
    }

    let contents = read_to_string(&path).map_err(|err| ConfigError::Read {
        source: err,
        path: path.clone(),
    })?;

    let value: Value = serde_json::from_str(&contents)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ConfigError::NotAnObject { path }),
    }
}

/// Write the full configuration of the lobe at `lobe_path`.
///
/// Serialized indented with sorted keys.
///
/// # Errors
///
/// - Return [`ConfigError::Write`] if the file cannot be written.
pub fn put_config(config: &Config, lobe_path: impl AsRef<Path>) -> Result<()> {
    let path = config_path(&lobe_path);

    // Sorted keys keep the file diffable across rewrites.
    let sorted: BTreeMap<&String, &Value> = config.iter().collect();
    let contents = serde_json::to_string_pretty(&sorted)?;

    write(&path, contents).map_err(|err| ConfigError::Write { source: err, path })
}

/// Shallow-merge `new_config` into the stored configuration.
///
/// Top-level keys in `new_config` overwrite existing ones; everything else is
/// left alone.
///
/// # Errors
///
/// - Return [`ConfigError::Read`]/[`ConfigError::Write`] on file I/O failure.
pub fn update_config(new_config: Config, lobe_path: impl AsRef<Path>) -> Result<()> {
    let mut config = get_config(&lobe_path)?;
    config.extend(new_config);
    put_config(&config, lobe_path)
}

/// Baseline settings for a freshly initialized lobe.
pub fn default_config() -> Config {
    let mut config = Config::new();
    config.insert("restart_supervisor_on_update".into(), json!(false));
    config.insert("restart_systemd_on_update".into(), json!(false));
    config.insert("serve_default_site".into(), json!(true));
    config.insert("rebase_on_pull".into(), json!(false));
    config.insert("shallow_clone".into(), json!(true));
    config.insert("background_workers".into(), json!(1));
    config.insert("use_redis_auth".into(), json!(false));
    config.insert("live_reload".into(), json!(true));
    config
}

/// Maximum web workers worth starting on this machine.
pub fn gunicorn_workers() -> u64 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1);
    cpus * 2 + 1
}

/// Max requests per worker based on how many workers there are.
///
/// With a single worker a random restart causes visible response-time spikes,
/// so recycling stays off in that case.
pub fn default_max_requests(worker_count: u64) -> u64 {
    if worker_count <= 1 {
        return 0;
    }
    DEFAULT_MAX_REQUESTS
}

/// Jitter applied to max requests so workers do not all recycle at once.
pub fn max_requests_jitter(max_requests: u64) -> u64 {
    max_requests / 10
}

/// Write the initial configuration for the lobe at `lobe_path`.
///
/// Fills in the defaults, a gunicorn worker count, and a fresh port
/// allocation; keys already present in an existing config file survive where
/// the allocation would collide with them.
///
/// # Errors
///
/// - Return [`ConfigError::Read`]/[`ConfigError::Write`] on file I/O failure.
pub fn setup_config(lobe_path: impl AsRef<Path>) -> Result<()> {
    let mut config = get_config(&lobe_path)?;

    for (key, value) in default_config() {
        config.insert(key, value);
    }
    config.insert("gunicorn_workers".into(), json!(gunicorn_workers()));

    let ports = make_ports(&lobe_path);
    for key in ["redis_cache", "redis_queue", "redis_socketio"] {
        if !config.contains_key(key) {
            config.insert(key.into(), json!(format!("redis://localhost:{}", ports[key])));
        }
    }
    for key in ["webserver_port", "socketio_port", "file_watcher_port"] {
        if !config.contains_key(key) {
            config.insert(key.into(), json!(ports[key]));
        }
    }

    put_config(&config, lobe_path)
}

/// Allocate service ports for a new lobe.
///
/// Scans sibling directories of `lobe_path` for other lobes and hands out
/// max(existing) + 1 for every port-bearing key, so several lobes can live
/// next to each other without colliding.
pub fn make_ports(lobe_path: impl AsRef<Path>) -> BTreeMap<&'static str, u64> {
    let defaults: BTreeMap<&'static str, u64> = BTreeMap::from([
        ("webserver_port", 8000),
        ("socketio_port", 9000),
        ("file_watcher_port", 6787),
        ("redis_queue", 11000),
        ("redis_socketio", 12000),
        ("redis_cache", 13000),
    ]);

    let lobe_path = lobe_path.as_ref();
    let parent = lobe_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut existing: BTreeMap<&'static str, Vec<u64>> = BTreeMap::new();
    let entries = match std::fs::read_dir(&parent) {
        Ok(entries) => entries,
        Err(_) => return defaults,
    };

    for entry in entries.flatten() {
        let sibling = entry.path();
        if !sibling.is_dir() {
            continue;
        }

        let Ok(config) = get_config(&sibling) else {
            continue;
        };

        for (key, _) in defaults.iter() {
            let Some(value) = config.get(*key) else {
                continue;
            };

            // Redis settings hold a URL; pull the port back out of it.
            let port = match value {
                Value::Number(n) => n.as_u64(),
                Value::String(url) => url.rsplit(':').next().and_then(|p| p.parse().ok()),
                _ => None,
            };

            if let Some(port) = port {
                existing.entry(*key).or_default().push(port);
            }
        }
    }

    let mut ports = BTreeMap::new();
    for (key, default) in defaults {
        let value = existing
            .get(key)
            .and_then(|values| values.iter().max().copied())
            .map(|max| max + 1)
            .unwrap_or(default);
        ports.insert(key, value);
    }

    debug!("allocated ports {ports:?}");
    ports
}

/// Configuration store error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file cannot be read from.
    #[error("failed to read config at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Config file cannot be written to.
    #[error("failed to write config at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Config file holds something other than a JSON object.
    #[error("config at {:?} is not a JSON object", path.display())]
    NotAnObject { path: PathBuf },

    /// Config contents fail to parse or serialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
