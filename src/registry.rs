// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Application registry and state reconciliation.
//!
//! One lobe carries an ordered collection of installed applications, and that
//! collection is described by three persisted artifacts:
//!
//! 1. the `apps/` directory listing itself,
//! 2. the manifest `sites/apps.txt` (ordered application names),
//! 3. the state file `sites/apps.json` (per-app metadata, see [`AppState`]).
//!
//! The registry is the sole writer of record for the manifest and state file.
//! [`AppRegistry::sync`] re-scans the directory, rewrites the manifest to
//! match, prunes state entries for applications that vanished from disk, and
//! records state for newly added ones. It is the only operation that
//! guarantees all three artifacts agree, so every add and remove must be
//! followed by one.
//!
//! # Ordering
//!
//! The framework application is always first in the ordered list; everything
//! after it is sorted alphabetically. Per-entry `idx` values are assigned
//! once (1-based, in first-seen order) and stay stable across later edits, so
//! they are unique but not necessarily contiguous after removals.
//!
//! # Migration
//!
//! Older deployments tracked applications with the manifest alone. When the
//! registry finds applications on disk but no recorded state, it synthesizes
//! a state entry for every application in manifest order. This is the upgrade
//! path from manifest-only tracking, and it doubles as recovery after a
//! half-written state file.

use crate::{
    app::{App, InstallOptions},
    probe, vcs, version, FRAMEWORK_APP,
};

use serde::{
    de::{self, Deserializer},
    ser::{SerializeMap, Serializer},
    Deserialize, Serialize,
};
use serde_json::Value;
use std::{
    fs::{read_dir, read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Literal state-file marker for applications that are not git checkouts.
pub const NOT_A_REPO: &str = "not a repo";

/// Recorded commit resolution of one application at sync time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Application directory is a git checkout pinned to a commit.
    Repo { commit_hash: String, branch: String },

    /// Application directory is a plain folder.
    NotRepo,
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::NotRepo => serializer.serialize_str(NOT_A_REPO),
            Self::Repo { commit_hash, branch } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("commit_hash", commit_hash)?;
                map.serialize_entry("branch", branch)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(marker) if marker == NOT_A_REPO => Ok(Self::NotRepo),
            Value::Object(map) => {
                let field = |key: &str| {
                    map.get(key)
                        .and_then(Value::as_str)
                        .map(ToString::to_string)
                        .ok_or_else(|| de::Error::custom(format!("resolution missing {key:?}")))
                };
                Ok(Self::Repo {
                    commit_hash: field("commit_hash")?,
                    branch: field("branch")?,
                })
            }
            _ => Err(de::Error::custom("expected resolution object or marker")),
        }
    }
}

/// Persisted metadata of one installed application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    /// Commit/branch pair, or the not-a-repo marker.
    pub resolution: Resolution,

    /// Dependency application names declared by this application.
    pub required: Vec<String>,

    /// 1-based position, stable across edits.
    pub idx: usize,

    /// Version string taken from the application's own metadata.
    pub version: String,
}

/// Arguments for one [`AppRegistry::sync`] or [`AppRegistry::update_state`].
#[derive(Debug, Default, Clone)]
pub struct SyncRequest {
    /// Application to record state for, if it is new to the registry.
    pub app_name: Option<String>,

    /// Directory of that application under `apps/`; defaults to the name.
    pub app_dir: Option<String>,

    /// Branch to record; defaults to the current checkout.
    pub branch: Option<String>,

    /// Dependency names declared by the application.
    pub required: Vec<String>,
}

impl SyncRequest {
    /// Request recording state for `app`.
    pub fn for_app(app: impl Into<String>) -> Self {
        Self {
            app_name: Some(app.into()),
            ..Self::default()
        }
    }
}

/// Ordered application collection of one lobe.
///
/// Owns the manifest and state file exclusively. Not safe against a second
/// process mutating the same lobe concurrently; whole-file rewrites keep the
/// corruption window small, but locking is the caller's responsibility.
#[derive(Debug)]
pub struct AppRegistry {
    lobe_path: PathBuf,
    apps_path: PathBuf,
    apps_txt: PathBuf,
    states_path: PathBuf,
    apps: Vec<String>,
    states: serde_json::Map<String, Value>,
}

impl AppRegistry {
    /// Open the registry of the lobe at `lobe_path`.
    ///
    /// Scans the applications folder and loads the state file. A lobe without
    /// an `apps/` folder or state file simply has no applications yet.
    pub fn new(lobe_path: impl Into<PathBuf>) -> Result<Self> {
        let lobe_path = lobe_path.into();
        let mut registry = Self {
            apps_path: lobe_path.join("apps"),
            apps_txt: lobe_path.join("sites").join("apps.txt"),
            states_path: lobe_path.join("sites").join("apps.json"),
            lobe_path,
            apps: Vec::new(),
            states: serde_json::Map::new(),
        };

        registry.initialize();
        registry.load_state()?;

        Ok(registry)
    }

    /// Ordered application names currently known to the registry.
    pub fn apps(&self) -> &[String] {
        &self.apps
    }

    /// Recorded state of `app`, if any.
    pub fn state_of(&self, app: &str) -> Option<AppState> {
        self.states
            .get(app)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Check whether `app` is recorded anywhere in the registry.
    pub fn contains(&self, app: &str) -> bool {
        self.apps.iter().any(|name| name == app) || self.states.contains_key(app)
    }

    /// Rebuild the in-memory ordered list from the applications folder.
    ///
    /// Entries must pass the application probe to count. The framework, when
    /// present, is moved to position 0 regardless of scan order. A missing
    /// applications folder yields an empty list, silently; a fresh lobe has
    /// none yet.
    pub fn initialize(&mut self) {
        let entries = match read_dir(&self.apps_path) {
            Ok(entries) => entries,
            Err(_) => {
                self.apps = Vec::new();
                return;
            }
        };

        self.apps = entries
            .flatten()
            .filter(|entry| probe::is_app_directory(entry.path()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();

        self.move_framework_first();
    }

    /// Parse the state file into memory.
    ///
    /// A missing file is an empty state. Malformed contents are also treated
    /// as empty, but loudly; a half-written file should not brick recovery.
    pub fn load_state(&mut self) -> Result<()> {
        let contents = match read_to_string(&self.states_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.states = serde_json::Map::new();
                return Ok(());
            }
            Err(err) => {
                return Err(RegistryError::ReadState {
                    source: err,
                    path: self.states_path.clone(),
                })
            }
        };

        self.states = match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) if contents.trim().is_empty() => serde_json::Map::new(),
            Ok(other) => {
                warn!("state file holds {other:?} instead of an object, starting empty");
                serde_json::Map::new()
            }
            Err(err) => {
                warn!("state file is malformed ({err}), starting empty");
                serde_json::Map::new()
            }
        };

        Ok(())
    }

    /// Reconcile the state file with the current application list.
    ///
    /// Runs, in order: the migration from manifest-only tracking when no
    /// state is recorded at all,
    /// pruning of entries whose application left the disk, the targeted add
    /// for `request.app_name`, and the whole-file rewrite of the state file.
    /// Insertion order of surviving entries is preserved across all steps.
    #[instrument(skip(self, request), level = "debug")]
    pub fn update_state(&mut self, request: &SyncRequest) -> Result<()> {
        if !self.apps.is_empty() && self.states.is_empty() {
            self.migrate_states(&request.required)?;
        }

        // Prune entries for applications no longer on disk.
        let apps = self.apps.clone();
        self.states.retain(|name, _| apps.iter().any(|app| app == name));

        if let Some(app_name) = request.app_name.as_deref() {
            if !self.states.contains_key(app_name) {
                self.record_state(app_name, request)?;
            }
        }

        self.write_states()
    }

    /// One-time upgrade from manifest-only tracking.
    ///
    /// Persists the framework-first ordering back into the manifest, then
    /// synthesizes a state entry per application with `idx` following
    /// manifest order.
    fn migrate_states(&mut self, required: &[String]) -> Result<()> {
        info!("found existing apps, migrating to state tracking");
        self.move_framework_first();
        self.write_manifest()?;

        for (position, app) in self.apps.clone().iter().enumerate() {
            let state = AppState {
                resolution: resolve_dir(&self.apps_path.join(app), None)?,
                required: required.to_vec(),
                idx: position + 1,
                version: version::current_version(app, &self.lobe_path)?,
            };
            self.states
                .insert(app.clone(), serde_json::to_value(state)?);
        }

        Ok(())
    }

    /// Record state for one newly added application.
    fn record_state(&mut self, app_name: &str, request: &SyncRequest) -> Result<()> {
        let version = version::current_version(app_name, &self.lobe_path)?;
        let app_dir = self
            .apps_path
            .join(request.app_dir.as_deref().unwrap_or(app_name));

        let state = AppState {
            resolution: resolve_dir(&app_dir, request.branch.as_deref())?,
            required: request.required.clone(),
            idx: self.states.len() + 1,
            version,
        };

        debug!("recording state for {app_name}: {state:?}");
        self.states
            .insert(app_name.to_string(), serde_json::to_value(state)?);

        Ok(())
    }

    /// Re-scan the disk and force all three artifacts into agreement.
    ///
    /// The only operation that guarantees directory/manifest/state
    /// consistency; call it after every add or remove.
    #[instrument(skip(self, request), level = "debug")]
    pub fn sync(&mut self, request: &SyncRequest) -> Result<()> {
        self.initialize();
        self.write_manifest()?;
        self.update_state(request)
    }

    /// [`AppRegistry::sync`] with no targeted application.
    pub fn sync_all(&mut self) -> Result<()> {
        self.sync(&SyncRequest::default())
    }

    /// Fetch and install `app`, then append it to the ordered list.
    ///
    /// Clone and install side effects happen here on purpose; this is a verb,
    /// not a collection insert. The list is re-sorted alphabetically with the
    /// framework pinned first, and the caller is expected to follow up with
    /// [`AppRegistry::sync`] to persist everything.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::App`] if the clone or install fails.
    #[instrument(skip(self, app, opts), level = "debug")]
    pub fn add(&mut self, app: &mut App, opts: &InstallOptions) -> Result<()> {
        app.get(self.shallow_clone())?;
        app.install(opts, &self.apps)?;

        self.apps.push(app.name.clone());
        self.apps.sort();
        self.move_framework_first();

        Ok(())
    }

    /// Uninstall and delete `app`, then drop it from the ordered list.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::AppNotInstalled`] if `app` is recorded
    ///   nowhere in the registry.
    /// - Return [`RegistryError::App`] if the uninstall or removal fails.
    #[instrument(skip(self, app), level = "debug")]
    pub fn remove(
        &mut self,
        app: &App,
        no_backup: bool,
        sites_using: &[String],
    ) -> Result<()> {
        if !self.contains(&app.name) {
            return Err(RegistryError::AppNotInstalled {
                app: app.name.clone(),
            });
        }

        app.uninstall()?;
        app.remove(no_backup, sites_using)?;
        self.apps.retain(|name| name != &app.name);

        Ok(())
    }

    fn shallow_clone(&self) -> bool {
        crate::config::get_config(&self.lobe_path)
            .ok()
            .and_then(|config| {
                if config.get("release_lobe").and_then(Value::as_bool) == Some(true) {
                    return Some(false);
                }
                config.get("shallow_clone").and_then(Value::as_bool)
            })
            .unwrap_or(false)
    }

    fn move_framework_first(&mut self) {
        if let Some(position) = self.apps.iter().position(|app| app == FRAMEWORK_APP) {
            let framework = self.apps.remove(position);
            self.apps.sort();
            self.apps.insert(0, framework);
        } else {
            self.apps.sort();
        }
    }

    fn write_manifest(&self) -> Result<()> {
        write(&self.apps_txt, self.apps.join("\n")).map_err(|err| RegistryError::WriteManifest {
            source: err,
            path: self.apps_txt.clone(),
        })
    }

    fn write_states(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.states)?;
        write(&self.states_path, contents).map_err(|err| RegistryError::WriteState {
            source: err,
            path: self.states_path.clone(),
        })
    }
}

/// Build the resolution record for an application directory.
///
/// A git checkout resolves to its branch (current one unless overridden) and
/// the commit hash that branch points to; anything else is not a repo.
fn resolve_dir(app_dir: &Path, branch: Option<&str>) -> Result<Resolution> {
    if !vcs::is_repo(app_dir) {
        return Ok(Resolution::NotRepo);
    }

    let branch = match branch {
        Some(branch) => branch.to_string(),
        None => vcs::current_branch(app_dir)?,
    };
    let commit_hash = vcs::commit_hash(app_dir, &branch)?;

    Ok(Resolution::Repo {
        commit_hash,
        branch,
    })
}

/// Registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// State file exists but cannot be read.
    #[error("failed to read state file at {:?}", path.display())]
    ReadState {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// State file cannot be written to.
    #[error("failed to write state file at {:?}", path.display())]
    WriteState {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Manifest file cannot be written to.
    #[error("failed to write manifest at {:?}", path.display())]
    WriteManifest {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Removal requested for an application absent from the registry.
    #[error("no app named {app:?}")]
    AppNotInstalled { app: String },

    /// State entries fail to serialize or deserialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Commit resolution against the application checkout fails.
    #[error(transparent)]
    Vcs(#[from] crate::vcs::VcsError),

    /// Application version resolution fails.
    #[error(transparent)]
    Version(#[from] crate::version::VersionError),

    /// Application entity operation fails.
    #[error(transparent)]
    App(#[from] crate::app::AppError),
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn make_lobe(root: &Path) -> PathBuf {
        let lobe = root.join("lobe");
        fs::create_dir_all(lobe.join("apps")).unwrap();
        fs::create_dir_all(lobe.join("sites")).unwrap();
        lobe
    }

    fn make_app(lobe: &Path, name: &str, version: &str) {
        let app = lobe.join("apps").join(name);
        fs::create_dir_all(app.join(name)).unwrap();
        fs::write(app.join("setup.py"), "").unwrap();
        fs::write(
            app.join(name).join("__init__.py"),
            format!("__version__ = \"{version}\"\n"),
        )
        .unwrap();
    }

    fn make_repo_app(lobe: &Path, name: &str, version: &str) -> String {
        make_app(lobe, name, version);
        let app_dir = lobe.join("apps").join(name);

        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("develop");
        let repo = git2::Repository::init_opts(&app_dir, &opts).unwrap();

        let mut config = repo.config().unwrap();
        config.set_str("user.name", "John Doe").unwrap();
        config.set_str("user.email", "john@doe.com").unwrap();

        let commit = {
            let mut index = repo.index().unwrap();
            index
                .add_path(Path::new(&format!("{name}/__init__.py")))
                .unwrap();
            index.write().unwrap();
            let tree_oid = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_oid).unwrap();
            let signature = repo.signature().unwrap();
            repo.commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
                .unwrap()
        };

        commit.to_string()
    }

    fn manifest(lobe: &Path) -> String {
        fs::read_to_string(lobe.join("sites").join("apps.txt")).unwrap()
    }

    fn states_file(lobe: &Path) -> String {
        fs::read_to_string(lobe.join("sites").join("apps.json")).unwrap()
    }

    #[test]
    fn framework_is_always_first() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        // Alphabetically the framework lands last here.
        make_app(&lobe, "aardvark", "1.0.0");
        make_app(&lobe, "blog", "1.0.0");
        make_app(&lobe, FRAMEWORK_APP, "14.0.0");

        let registry = AppRegistry::new(&lobe).unwrap();
        assert_eq!(
            registry.apps(),
            &[FRAMEWORK_APP.to_string(), "aardvark".into(), "blog".into()]
        );
    }

    #[test]
    fn missing_apps_folder_is_an_empty_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = tmp.path().join("fresh");
        fs::create_dir_all(lobe.join("sites")).unwrap();

        let registry = AppRegistry::new(&lobe).unwrap();
        assert!(registry.apps().is_empty());
    }

    #[test]
    fn non_app_entries_are_filtered_out() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_app(&lobe, "blog", "1.0.0");
        // A stray folder with no package metadata is not an application.
        fs::create_dir_all(lobe.join("apps").join("junk")).unwrap();

        let registry = AppRegistry::new(&lobe).unwrap();
        assert_eq!(registry.apps(), &["blog".to_string()]);
    }

    #[test]
    fn migration_assigns_indices_in_manifest_order() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_app(&lobe, FRAMEWORK_APP, "14.0.0");
        make_app(&lobe, "app1", "1.1.0");
        make_app(&lobe, "app2", "2.2.0");
        fs::write(
            lobe.join("sites").join("apps.txt"),
            format!("{FRAMEWORK_APP}\napp1\napp2"),
        )
        .unwrap();

        let mut registry = AppRegistry::new(&lobe).unwrap();
        registry.update_state(&SyncRequest::default()).unwrap();

        for (app, idx, version) in [
            (FRAMEWORK_APP, 1, "14.0.0"),
            ("app1", 2, "1.1.0"),
            ("app2", 3, "2.2.0"),
        ] {
            let state = registry.state_of(app).unwrap();
            assert_eq!(state.idx, idx, "{app}");
            assert_eq!(state.version, version, "{app}");
            // Plain directories resolve to the marker.
            assert_eq!(state.resolution, Resolution::NotRepo, "{app}");
        }
    }

    #[test]
    fn migration_resolves_real_checkouts() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        let commit = make_repo_app(&lobe, FRAMEWORK_APP, "14.0.0");

        let mut registry = AppRegistry::new(&lobe).unwrap();
        registry.update_state(&SyncRequest::default()).unwrap();

        let state = registry.state_of(FRAMEWORK_APP).unwrap();
        assert_eq!(
            state.resolution,
            Resolution::Repo {
                commit_hash: commit,
                branch: "develop".into()
            }
        );
    }

    #[test]
    fn targeted_add_assigns_next_index() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_app(&lobe, FRAMEWORK_APP, "14.0.0");
        make_app(&lobe, "app1", "1.0.0");

        let mut registry = AppRegistry::new(&lobe).unwrap();
        registry.sync_all().unwrap();
        assert_eq!(registry.state_of(FRAMEWORK_APP).unwrap().idx, 1);
        assert_eq!(registry.state_of("app1").unwrap().idx, 2);

        // A later add lands at len + 1 with a repo resolution.
        let commit = make_repo_app(&lobe, "extra", "0.5.0");
        registry.sync(&SyncRequest::for_app("extra")).unwrap();

        let state = registry.state_of("extra").unwrap();
        assert_eq!(state.idx, 3);
        assert_eq!(
            state.resolution,
            Resolution::Repo {
                commit_hash: commit,
                branch: "develop".into()
            }
        );
    }

    #[test]
    fn sync_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_app(&lobe, FRAMEWORK_APP, "14.0.0");
        make_app(&lobe, "blog", "1.0.0");

        let mut registry = AppRegistry::new(&lobe).unwrap();
        registry.sync_all().unwrap();
        let manifest_first = manifest(&lobe);
        let states_first = states_file(&lobe);

        registry.sync_all().unwrap();
        assert_eq!(manifest(&lobe), manifest_first);
        assert_eq!(states_file(&lobe), states_first);
    }

    #[test]
    fn sync_prunes_vanished_apps() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_app(&lobe, "a", "1.0.0");
        make_app(&lobe, "b", "1.0.0");
        make_app(&lobe, "c", "1.0.0");

        let mut registry = AppRegistry::new(&lobe).unwrap();
        registry.sync_all().unwrap();
        assert!(registry.state_of("b").is_some());

        fs::remove_dir_all(lobe.join("apps").join("b")).unwrap();
        registry.sync_all().unwrap();

        assert_eq!(registry.apps(), &["a".to_string(), "c".into()]);
        assert!(registry.state_of("b").is_none());
        assert_eq!(manifest(&lobe), "a\nc");
    }

    #[test]
    fn state_round_trips_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_app(&lobe, FRAMEWORK_APP, "14.0.0");
        make_app(&lobe, "zebra", "1.0.0");
        make_app(&lobe, "aardvark", "1.0.0");

        let mut registry = AppRegistry::new(&lobe).unwrap();
        registry.sync_all().unwrap();
        let keys: Vec<_> = registry.states.keys().cloned().collect();

        let reloaded = AppRegistry::new(&lobe).unwrap();
        let reloaded_keys: Vec<_> = reloaded.states.keys().cloned().collect();
        assert_eq!(keys, reloaded_keys);
        assert_eq!(registry.states, reloaded.states);
    }

    #[test]
    fn absent_or_malformed_state_reads_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());

        let registry = AppRegistry::new(&lobe).unwrap();
        assert!(registry.states.is_empty());

        fs::write(lobe.join("sites").join("apps.json"), "{not json").unwrap();
        let registry = AppRegistry::new(&lobe).unwrap();
        assert!(registry.states.is_empty());

        fs::write(lobe.join("sites").join("apps.json"), "").unwrap();
        let registry = AppRegistry::new(&lobe).unwrap();
        assert!(registry.states.is_empty());
    }

    #[test]
    fn remove_of_unknown_app_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());

        let mut registry = AppRegistry::new(&lobe).unwrap();
        let app = crate::app::App::local("ghost", &lobe);
        let result = registry.remove(&app, true, &[]);
        assert!(matches!(
            result,
            Err(RegistryError::AppNotInstalled { .. })
        ));
    }
}
