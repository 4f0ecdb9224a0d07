// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Instance handling.
//!
//! A [`Lobe`] is one instance directory on disk: an `apps/` folder of
//! application checkouts, a `sites/` folder of served sites plus the shared
//! artifacts (`apps.txt`, `apps.json`, `common_site_config.json`), a virtual
//! environment under `env/`, and generated process-supervision files. This
//! module owns the instance-level verbs; the registry and entity modules do
//! the per-application work.

use crate::{
    app::{App, InstallOptions},
    config,
    probe::is_lobe_directory,
    registry::{AppRegistry, SyncRequest},
    run, DIRS_IN_LOBE, FRAMEWORK_APP,
};

use serde_json::Value;
use std::{
    fs::{read_dir, read_to_string, remove_dir_all},
    path::{Path, PathBuf},
};
use tracing::{info, instrument, warn};

/// Looks up which sites have a given application enabled.
///
/// Kept behind a trait so removal guards can be tested without laying out a
/// full site tree.
pub trait SiteLookup {
    /// Names of sites with `app` in their installed list.
    fn sites_using(&self, app: &str) -> Vec<String>;
}

/// One instance directory.
#[derive(Debug, Clone)]
pub struct Lobe {
    path: PathBuf,
}

impl Lobe {
    /// Open the instance rooted at `path`, absolutized.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let path = std::path::absolute(&path).unwrap_or(path);
        Self { path }
    }

    /// Root directory of the instance.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Instance name, taken from the directory name.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lobe".to_string())
    }

    /// Whether the directory looks like an instance at all.
    pub fn exists(&self) -> bool {
        is_lobe_directory(&self.path)
    }

    pub fn sites_dir(&self) -> PathBuf {
        self.path.join("sites")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.path.join("apps")
    }

    /// Instance configuration; a missing file reads as empty.
    pub fn conf(&self) -> config::Result<config::Config> {
        config::get_config(&self.path)
    }

    /// Open this instance's application registry.
    pub fn registry(&self) -> crate::registry::Result<AppRegistry> {
        AppRegistry::new(&self.path)
    }

    /// Sites served by this instance, sorted.
    ///
    /// A site is any folder under `sites/` carrying its own
    /// `site_config.json`; everything else in there (manifest, state file,
    /// assets) is not a site.
    pub fn sites(&self) -> Vec<String> {
        let Ok(entries) = read_dir(self.sites_dir()) else {
            return Vec::new();
        };

        let mut sites: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().join("site_config.json").exists())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        sites.sort();
        sites
    }

    /// Create a fresh instance: directory skeleton, framework checkout,
    /// virtual environment, default configuration.
    ///
    /// `framework_source` overrides where the framework is fetched from;
    /// by default it resolves like any other bare application name.
    ///
    /// # Errors
    ///
    /// - Return [`LobeError::App`] if fetching or installing the framework
    ///   fails.
    /// - Return [`LobeError::Run`] if creating the virtual environment fails.
    #[instrument(skip(self, framework_source, branch), level = "debug")]
    pub fn init(&self, framework_source: Option<&str>, branch: Option<String>) -> Result<()> {
        info!("initializing instance at {:?}", self.path.display());
        self.setup_dirs()?;
        self.setup_env()?;

        let source = framework_source.unwrap_or(FRAMEWORK_APP);
        let mut registry = self.registry()?;
        let mut app = App::new(source, branch, &self.path)?;
        registry.add(&mut app, &InstallOptions::default())?;
        registry.sync(&SyncRequest {
            branch: app.source.branch.clone(),
            required: app.required_apps(),
            ..SyncRequest::for_app(app.name.as_str())
        })?;

        config::setup_config(&self.path)?;
        Ok(())
    }

    /// Lay down the instance directory skeleton.
    pub fn setup_dirs(&self) -> Result<()> {
        for dir in DIRS_IN_LOBE {
            let path = self.path.join(dir);
            mkdirp::mkdirp(&path).map_err(|err| LobeError::CreateDir { source: err, path })?;
        }
        Ok(())
    }

    /// Create the virtual environment under `env/` and upgrade pip.
    #[instrument(skip(self), level = "debug")]
    pub fn setup_env(&self) -> Result<()> {
        run::run_captured("python3", ["-m", "venv", "env"], Some(&self.path))?;
        run::run_captured(
            crate::app::env_python(&self.path),
            ["-m", "pip", "install", "--quiet", "--upgrade", "pip"],
            Some(&self.path),
        )?;
        Ok(())
    }

    /// Fetch, install, and record a new application.
    ///
    /// Returns the resolved application name.
    ///
    /// # Errors
    ///
    /// - Return [`LobeError::App`] if the source is malformed or the fetch or
    ///   install fails.
    /// - Return [`LobeError::Registry`] if recording the application fails.
    #[instrument(skip(self, source, branch, opts), level = "debug")]
    pub fn install(
        &self,
        source: &str,
        branch: Option<String>,
        opts: &InstallOptions,
    ) -> Result<String> {
        let mut registry = self.registry()?;
        let mut app = App::new(source, branch, &self.path)?;

        registry.add(&mut app, opts)?;
        registry.sync(&SyncRequest {
            branch: app.source.branch.clone(),
            required: app.required_apps(),
            ..SyncRequest::for_app(app.name.as_str())
        })?;

        if opts.restart_lobe {
            self.reload(false, false, false)?;
        }

        Ok(app.name)
    }

    /// Uninstall and delete an application, then re-sync the registry.
    ///
    /// Unless `force`, the application must be recorded in the registry and
    /// no site may still have it enabled. With `force`, a failed package
    /// uninstall is tolerated and the folder is deleted regardless.
    ///
    /// # Errors
    ///
    /// - Return [`LobeError::AppNotInstalled`] if the registry does not know
    ///   `app_name`.
    /// - Return [`LobeError::AppInUse`] if any site still uses it.
    #[instrument(skip(self, sites), level = "debug")]
    pub fn uninstall(
        &self,
        app_name: &str,
        no_backup: bool,
        force: bool,
        sites: &dyn SiteLookup,
    ) -> Result<()> {
        let mut registry = self.registry()?;
        let app = App::local(app_name, &self.path);

        if force {
            if let Err(err) = app.uninstall() {
                warn!("ignoring failed uninstall of {app_name}: {err}");
            }
            app.remove(no_backup, &[])?;
        } else {
            if !registry.contains(app_name) {
                return Err(LobeError::AppNotInstalled {
                    app: app_name.to_string(),
                });
            }

            let sites_using = sites.sites_using(app_name);
            if !sites_using.is_empty() {
                return Err(LobeError::AppInUse {
                    app: app_name.to_string(),
                    sites: sites_using,
                });
            }

            registry.remove(&app, no_backup, &sites_using)?;
        }

        registry.sync_all()?;
        self.reload(false, false, false)?;
        Ok(())
    }

    /// Restart instance processes according to configuration.
    ///
    /// Dispatches on `developer_mode`, `restart_supervisor_on_update`, and
    /// `restart_systemd_on_update`; the `supervisor` and `systemd` arguments
    /// force the respective path, and `web` narrows the restart to the web
    /// process group.
    #[instrument(skip(self), level = "debug")]
    pub fn reload(&self, web: bool, supervisor: bool, systemd: bool) -> Result<()> {
        let conf = self.conf()?;
        let flag =
            |key: &str| conf.get(key).and_then(Value::as_bool).unwrap_or(false);

        if flag("developer_mode") {
            info!("developer mode is on, restart your process manager by hand");
            return Ok(());
        }

        if supervisor || flag("restart_supervisor_on_update") {
            let supervisorctl =
                which::which("supervisorctl").map_err(|err| LobeError::MissingBinary {
                    source: err,
                    binary: "supervisorctl",
                })?;
            let group = if web {
                format!("{}-web:", self.name())
            } else {
                format!("{}:", self.name())
            };
            run::run_interactive(supervisorctl, ["restart", &group], Some(&self.path))?;
        }

        if systemd || flag("restart_systemd_on_update") {
            let systemctl = which::which("systemctl").map_err(|err| LobeError::MissingBinary {
                source: err,
                binary: "systemctl",
            })?;
            let target = if web {
                format!("{}-web.target", self.name())
            } else {
                format!("{}.target", self.name())
            };
            run::run_interactive(systemctl, ["restart", &target], None)?;
        }

        Ok(())
    }

    /// Delete the whole instance directory.
    ///
    /// Refused while the instance still serves any site.
    ///
    /// # Errors
    ///
    /// - Return [`LobeError::NotFound`] if the directory is not an instance.
    /// - Return [`LobeError::SitesExist`] if any sites remain.
    #[instrument(skip(self), level = "debug")]
    pub fn teardown(&self) -> Result<()> {
        if !self.exists() {
            return Err(LobeError::NotFound {
                path: self.path.clone(),
            });
        }

        let sites = self.sites();
        if !sites.is_empty() {
            return Err(LobeError::SitesExist { sites });
        }

        info!("deleting instance at {:?}", self.path.display());
        remove_dir_all(&self.path).map_err(|err| LobeError::RemoveDir {
            source: err,
            path: self.path.clone(),
        })
    }
}

impl SiteLookup for Lobe {
    fn sites_using(&self, app: &str) -> Vec<String> {
        self.sites()
            .into_iter()
            .filter(|site| {
                let config = self.sites_dir().join(site).join("site_config.json");
                let Ok(contents) = read_to_string(&config) else {
                    return false;
                };
                let Ok(value) = serde_json::from_str::<Value>(&contents) else {
                    return false;
                };

                value
                    .get("installed_apps")
                    .and_then(Value::as_array)
                    .is_some_and(|apps| apps.iter().any(|entry| entry.as_str() == Some(app)))
            })
            .collect()
    }
}

/// Instance error types.
#[derive(Debug, thiserror::Error)]
pub enum LobeError {
    /// Directory does not look like an instance.
    #[error("no instance at {:?}", path.display())]
    NotFound { path: PathBuf },

    /// Teardown refused while sites remain.
    #[error("instance still serves sites: {sites:?}")]
    SitesExist { sites: Vec<String> },

    /// Removal refused while sites still use the application.
    #[error("{app:?} is still enabled on sites: {sites:?}")]
    AppInUse { app: String, sites: Vec<String> },

    /// Application is not recorded in the registry.
    #[error("no app named {app:?} in this instance")]
    AppNotInstalled { app: String },

    /// Skeleton directory cannot be created.
    #[error("failed to create {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Instance directory cannot be deleted.
    #[error("failed to remove {:?}", path.display())]
    RemoveDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Required external binary is not on PATH.
    #[error("cannot find {binary} on PATH")]
    MissingBinary {
        #[source]
        source: which::Error,
        binary: &'static str,
    },

    #[error(transparent)]
    App(#[from] crate::app::AppError),

    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Run(#[from] crate::run::RunError),
}

/// Friendly result alias :3
pub type Result<T, E = LobeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::{create_dir_all, write};

    fn make_lobe(root: &Path) -> Lobe {
        create_dir_all(root.join("apps")).unwrap();
        create_dir_all(root.join("sites")).unwrap();
        Lobe::new(root)
    }

    fn make_site(lobe: &Lobe, name: &str, installed: &[&str]) {
        let site = lobe.sites_dir().join(name);
        create_dir_all(&site).unwrap();
        let apps: Vec<Value> = installed.iter().map(|app| Value::from(*app)).collect();
        let config = serde_json::json!({ "installed_apps": apps });
        write(site.join("site_config.json"), config.to_string()).unwrap();
    }

    #[test]
    fn setup_dirs_lays_out_the_skeleton() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = Lobe::new(tmp.path().join("fresh"));

        lobe.setup_dirs().unwrap();

        for dir in DIRS_IN_LOBE {
            assert!(lobe.path().join(dir).is_dir(), "{dir} missing");
        }
        assert!(lobe.exists());
    }

    #[test]
    fn sites_lists_only_folders_with_a_site_config() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_site(&lobe, "beta.local", &[]);
        make_site(&lobe, "alpha.local", &[]);
        create_dir_all(lobe.sites_dir().join("assets")).unwrap();
        write(lobe.sites_dir().join("apps.txt"), "logica").unwrap();

        assert_eq!(lobe.sites(), vec!["alpha.local", "beta.local"]);
    }

    #[test]
    fn sites_using_checks_the_installed_list() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        make_site(&lobe, "alpha.local", &["logica", "blog"]);
        make_site(&lobe, "beta.local", &["logica"]);

        assert_eq!(lobe.sites_using("blog"), vec!["alpha.local"]);
        assert_eq!(lobe.sites_using("logica"), vec!["alpha.local", "beta.local"]);
        assert!(lobe.sites_using("payments").is_empty());
    }

    #[test]
    fn uninstall_refuses_unknown_app() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());

        let result = lobe.uninstall("ghost", true, false, &lobe);
        assert!(matches!(result, Err(LobeError::AppNotInstalled { .. })));
    }

    #[test]
    fn uninstall_refuses_app_in_use() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        create_dir_all(lobe.apps_dir().join("blog")).unwrap();
        write(lobe.sites_dir().join("apps.txt"), "blog").unwrap();
        write(lobe.sites_dir().join("apps.json"), "{\"blog\": {}}").unwrap();
        make_site(&lobe, "alpha.local", &["blog"]);

        let result = lobe.uninstall("blog", true, false, &lobe);
        match result {
            Err(LobeError::AppInUse { app, sites }) => {
                assert_eq!(app, "blog");
                assert_eq!(sites, vec!["alpha.local"]);
            }
            other => panic!("expected AppInUse, got {other:?}"),
        }
        assert!(lobe.apps_dir().join("blog").exists());
    }

    #[test]
    fn teardown_refuses_non_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = Lobe::new(tmp.path().join("nothing-here"));

        assert!(matches!(lobe.teardown(), Err(LobeError::NotFound { .. })));
    }

    #[test]
    fn teardown_refuses_while_sites_remain() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("busy");
        let lobe = make_lobe(&root);
        make_site(&lobe, "alpha.local", &[]);

        let result = lobe.teardown();
        match result {
            Err(LobeError::SitesExist { sites }) => assert_eq!(sites, vec!["alpha.local"]),
            other => panic!("expected SitesExist, got {other:?}"),
        }
        assert!(lobe.exists());
    }

    #[test]
    fn teardown_deletes_an_empty_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("empty");
        let lobe = make_lobe(&root);

        lobe.teardown().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn reload_is_a_no_op_in_developer_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());
        write(
            lobe.sites_dir().join("common_site_config.json"),
            "{\"developer_mode\": true, \"restart_supervisor_on_update\": true}",
        )
        .unwrap();

        lobe.reload(false, false, false).unwrap();
    }

    #[test]
    fn reload_with_nothing_configured_does_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let lobe = make_lobe(tmp.path());

        lobe.reload(false, false, false).unwrap();
    }
}
