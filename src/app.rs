// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Application entity.
//!
//! One [`App`] represents a single installable application: remote or local,
//! git-backed or plain directory. It mediates the clone, install, uninstall,
//! and remove operations; the registry orchestrates them and records the
//! outcome.
//!
//! # Source Forms
//!
//! An application source string takes one of four shapes:
//!
//! 1. a bare name (`blog`), resolved against the default remote organization;
//! 2. an `org/repo` shorthand, resolved against the default host;
//! 3. a full URL (`https://host/org/repo`);
//! 4. an SSH shorthand (`git@host:org/repo` or `git@host:port:org/repo`).
//!
//! A branch or tag may ride along after a trailing `@`, e.g. `blog@develop`.
//! Local filesystem paths (and `file://` URLs) are also accepted, in which
//! case the checkout can be symlinked into place instead of cloned for local
//! development.

use crate::{run, vcs, DEFAULT_REMOTE};

use indicatif::ProgressBar;
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, instrument, warn};

/// Parsed application source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSource {
    /// Resolved clone URL, or filesystem path for local sources.
    pub url: String,

    /// Remote organization the repository lives under.
    pub org: String,

    /// Repository name; doubles as the application name.
    pub repo: String,

    /// Branch or tag appended to the source string, if any.
    pub branch: Option<String>,

    /// Source was given as an explicit URL.
    pub is_url: bool,

    /// Source uses the SSH shorthand.
    pub use_ssh: bool,

    /// Source points at a local checkout.
    pub is_local: bool,
}

impl FromStr for AppSource {
    type Err = AppError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::InvalidSource {
            input: source.to_string(),
        };

        let expanded = shellexpand::full(source)
            .map_err(|_| invalid())?
            .into_owned();

        let (rest, branch) = split_branch(&expanded);
        if rest.is_empty() {
            return Err(invalid());
        }

        if let Some(path) = rest.strip_prefix("file://") {
            return Ok(Self::local(path, branch).ok_or_else(invalid)?);
        }

        if let Some((_, tail)) = rest.split_once("://") {
            // scheme://host/org/repo
            let mut segments = tail.split('/').filter(|s| !s.is_empty());
            let _host = segments.next().ok_or_else(invalid)?;
            let parts: Vec<&str> = segments.collect();
            let [org, repo] = parts.as_slice() else {
                return Err(invalid());
            };

            return Ok(Self {
                url: rest.to_string(),
                org: (*org).to_string(),
                repo: trim_git_suffix(repo).ok_or_else(invalid)?,
                branch,
                is_url: true,
                use_ssh: false,
                is_local: false,
            });
        }

        if let Some((_user, tail)) = rest.split_once('@') {
            // user@host:org/repo or user@host:port:org/repo
            let pieces: Vec<&str> = tail.split(':').collect();
            let (path, port_ok) = match pieces.as_slice() {
                [_host, path] => (path, true),
                [_host, port, path] => (path, port.chars().all(|c| c.is_ascii_digit())),
                _ => return Err(invalid()),
            };
            let Some((org, repo)) = path.split_once('/') else {
                return Err(invalid());
            };
            if !port_ok || org.is_empty() {
                return Err(invalid());
            }

            return Ok(Self {
                url: rest.to_string(),
                org: org.to_string(),
                repo: trim_git_suffix(repo).ok_or_else(invalid)?,
                branch,
                is_url: false,
                use_ssh: true,
                is_local: false,
            });
        }

        if rest.starts_with('/') || rest.starts_with('.') || Path::new(rest).is_dir() {
            return Ok(Self::local(rest, branch).ok_or_else(invalid)?);
        }

        match rest.split('/').collect::<Vec<_>>().as_slice() {
            // org/repo shorthand against the default host.
            [org, repo] if !org.is_empty() => Ok(Self {
                url: format!("https://github.com/{org}/{repo}.git"),
                org: (*org).to_string(),
                repo: trim_git_suffix(repo).ok_or_else(invalid)?,
                branch,
                is_url: false,
                use_ssh: false,
                is_local: false,
            }),
            // Bare name against the default remote organization.
            [name] if !name.is_empty() && !name.contains(':') => Ok(Self {
                url: format!("{DEFAULT_REMOTE}/{name}.git"),
                org: DEFAULT_REMOTE
                    .rsplit('/')
                    .next()
                    .unwrap_or(DEFAULT_REMOTE)
                    .to_string(),
                repo: (*name).to_string(),
                branch,
                is_url: false,
                use_ssh: false,
                is_local: false,
            }),
            _ => Err(invalid()),
        }
    }
}

impl AppSource {
    fn local(path: &str, branch: Option<String>) -> Option<Self> {
        let repo = Path::new(path).file_name()?.to_str()?.to_string();
        Some(Self {
            url: path.to_string(),
            org: repo.clone(),
            repo,
            branch,
            is_url: false,
            use_ssh: false,
            is_local: true,
        })
    }
}

/// Strip a trailing `.git` and refuse empty repository names.
fn trim_git_suffix(repo: &str) -> Option<String> {
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return None;
    }
    Some(repo.to_string())
}

/// Split a trailing `@branch` off a source string.
///
/// The suffix only counts as a branch when it holds no path or host
/// separators, so the `@` of an SSH source is left alone.
fn split_branch(source: &str) -> (&str, Option<String>) {
    if let Some((rest, candidate)) = source.rsplit_once('@') {
        if !rest.is_empty() && !candidate.is_empty() && !candidate.contains(['/', ':']) {
            return (rest, Some(candidate.to_string()));
        }
    }
    (source, None)
}

/// Options for one [`App::install`].
#[derive(Debug, Default, Clone)]
pub struct InstallOptions {
    /// Skip building web assets after the install. Asset builds run outside
    /// this tool, so the flag only rides along to site tooling.
    pub skip_assets: bool,

    /// Reload lobe processes once the install lands.
    pub restart_lobe: bool,

    /// Skip the declared-dependency check before installing.
    pub ignore_resolution: bool,

    /// Show full pip output instead of passing `--quiet`.
    pub verbose: bool,
}

/// A single installable application of one lobe.
#[derive(Debug, Clone)]
pub struct App {
    /// Logical application name.
    pub name: String,

    /// Parsed source this application came from.
    pub source: AppSource,

    /// Root of the lobe the application belongs to.
    pub lobe_path: PathBuf,

    /// Whether the application folder exists on disk yet.
    pub on_disk: bool,
}

impl App {
    /// Construct an application from a source string.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::InvalidSource`] if no org/repo can be parsed out
    ///   of `source`.
    pub fn new(
        source: &str,
        branch: Option<String>,
        lobe_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let mut parsed: AppSource = source.parse()?;
        if branch.is_some() {
            parsed.branch = branch;
        }

        let lobe_path = lobe_path.into();
        let name = parsed.repo.clone();
        let on_disk = lobe_path.join("apps").join(&name).exists();

        Ok(Self {
            name,
            source: parsed,
            lobe_path,
            on_disk,
        })
    }

    /// Construct an application already installed under `apps/`.
    ///
    /// Used for uninstall/remove flows where no clone source is needed.
    pub fn local(name: impl Into<String>, lobe_path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let lobe_path = lobe_path.into();
        let on_disk = lobe_path.join("apps").join(&name).exists();

        Self {
            source: AppSource {
                url: name.clone(),
                org: name.clone(),
                repo: name.clone(),
                branch: None,
                is_url: false,
                use_ssh: false,
                is_local: true,
            },
            name,
            lobe_path,
            on_disk,
        }
    }

    /// Directory this application occupies under the lobe's `apps/` folder.
    pub fn app_dir(&self) -> PathBuf {
        self.lobe_path.join("apps").join(&self.name)
    }

    /// Fetch the application into the lobe's `apps/` folder.
    ///
    /// Remote sources are cloned; local sources are symlinked so the working
    /// tree is shared with the development checkout. Nothing half-cloned
    /// survives a failure.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::Vcs`] if the clone or link fails.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&mut self, shallow: bool) -> Result<()> {
        let dest = self.app_dir();
        info!("fetching {} into {:?}", self.name, dest.display());

        if self.source.is_local {
            vcs::symlink_repo(&self.source.url, &dest)?;
        } else {
            vcs::clone_repo(
                &self.source.url,
                &dest,
                self.source.branch.as_deref(),
                shallow,
                ProgressBar::new(0),
            )?;
        }

        self.on_disk = true;
        Ok(())
    }

    /// Dependency application names declared by this application.
    ///
    /// Read by string-scanning the application's hooks module for the
    /// `required_apps` assignment. Executing the application to ask would
    /// mean running untrusted code, so we never do.
    pub fn required_apps(&self) -> Vec<String> {
        let hooks = self.app_dir().join(&self.name).join("hooks.py");
        let Ok(contents) = read_to_string(&hooks) else {
            return Vec::new();
        };

        for line in contents.lines() {
            let Some((lhs, rhs)) = line.split_once('=') else {
                continue;
            };
            if lhs.trim() != "required_apps" {
                continue;
            }

            return rhs
                .trim()
                .trim_matches(|c| c == '[' || c == ']')
                .split(',')
                .map(|part| part.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
                .filter(|part| !part.is_empty())
                .collect();
        }

        Vec::new()
    }

    /// Install the application into the lobe's virtual environment.
    ///
    /// An editable install, so the checkout under `apps/` stays the source of
    /// truth. Unless `opts.ignore_resolution`, every application this one
    /// declares as required must already be present in `installed`.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::MissingRequired`] if a declared dependency is not
    ///   installed.
    /// - Return [`AppError::Run`] if pip exits non-zero.
    #[instrument(skip(self, opts, installed), level = "debug")]
    pub fn install(&self, opts: &InstallOptions, installed: &[String]) -> Result<()> {
        if !opts.ignore_resolution {
            for required in self.required_apps() {
                if required != self.name && !installed.contains(&required) {
                    return Err(AppError::MissingRequired {
                        app: self.name.clone(),
                        missing: required,
                    });
                }
            }
        }

        let python = env_python(&self.lobe_path);
        let app_dir = self.app_dir();
        let mut args = vec!["-m", "pip", "install", "--upgrade", "-e"];
        let app_dir_str = app_dir.to_string_lossy().into_owned();
        args.push(app_dir_str.as_str());
        if !opts.verbose {
            args.insert(3, "--quiet");
        }

        info!("installing {} into the lobe environment", self.name);
        run::run_captured(python, args, Some(&self.lobe_path))?;

        Ok(())
    }

    /// Uninstall the application package from the virtual environment.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::NotInstalled`] if the application folder is not
    ///   on disk.
    /// - Return [`AppError::Run`] if pip exits non-zero.
    #[instrument(skip(self), level = "debug")]
    pub fn uninstall(&self) -> Result<()> {
        if !self.on_disk {
            return Err(AppError::NotInstalled {
                app: self.name.clone(),
            });
        }

        let python = env_python(&self.lobe_path);
        info!("uninstalling {} from the lobe environment", self.name);
        run::run_captured(
            python,
            ["-m", "pip", "uninstall", "--quiet", "--yes", &self.name],
            Some(&self.lobe_path),
        )?;

        Ok(())
    }

    /// Delete the application folder from the lobe.
    ///
    /// Refused while any site still has the application enabled; that check
    /// runs before anything touches the disk. Unless `no_backup`, the folder
    /// is archived under `archived/apps/` first.
    ///
    /// # Errors
    ///
    /// - Return [`AppError::InUse`] if `sites_using` is non-empty.
    /// - Return [`AppError::Run`] if archiving fails.
    /// - Return [`AppError::RemoveDir`] if deletion fails.
    #[instrument(skip(self, sites_using), level = "debug")]
    pub fn remove(&self, no_backup: bool, sites_using: &[String]) -> Result<()> {
        if !sites_using.is_empty() {
            return Err(AppError::InUse {
                app: self.name.clone(),
                sites: sites_using.to_vec(),
            });
        }

        if !no_backup {
            self.archive()?;
        }

        let app_dir = self.app_dir();
        info!("removing {:?}", app_dir.display());
        if app_dir.is_symlink() {
            std::fs::remove_file(&app_dir)
        } else {
            std::fs::remove_dir_all(&app_dir)
        }
        .map_err(|err| AppError::RemoveDir {
            source: err,
            path: app_dir,
        })?;

        Ok(())
    }

    /// Tar the application folder up under `archived/apps/`.
    fn archive(&self) -> Result<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let archive_dir = self.lobe_path.join("archived").join("apps");
        mkdirp::mkdirp(&archive_dir).map_err(|err| AppError::CreateDir {
            source: err,
            path: archive_dir.clone(),
        })?;

        let archive = archive_dir.join(format!("{}-{stamp}.tar.gz", self.name));
        debug!("archiving {} to {:?}", self.name, archive.display());
        run::run_captured(
            "tar",
            [
                "czf",
                archive.to_string_lossy().as_ref(),
                "-C",
                self.lobe_path.join("apps").to_string_lossy().as_ref(),
                &self.name,
            ],
            None,
        )?;

        Ok(())
    }
}

/// Python interpreter of the lobe's virtual environment.
pub fn env_python(lobe_path: impl AsRef<Path>) -> PathBuf {
    lobe_path.as_ref().join("env").join("bin").join("python")
}

/// Applications excluded from updates, from `sites/excluded_apps.txt`.
///
/// A missing or unreadable file is an empty exclusion list.
pub fn excluded_apps(lobe_path: impl AsRef<Path>) -> Vec<String> {
    let path = excluded_apps_txt(&lobe_path);
    match read_to_string(&path) {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Add `app` to the exclusion list, if not already present.
pub fn exclude_app(app: &str, lobe_path: impl AsRef<Path>) -> Result<()> {
    let mut excluded = excluded_apps(&lobe_path);
    if excluded.iter().any(|name| name == app) {
        warn!("{app} is already excluded");
        return Ok(());
    }

    excluded.push(app.to_string());
    write_excluded(&excluded, lobe_path)
}

/// Drop `app` from the exclusion list.
pub fn include_app(app: &str, lobe_path: impl AsRef<Path>) -> Result<()> {
    let mut excluded = excluded_apps(&lobe_path);
    excluded.retain(|name| name != app);
    write_excluded(&excluded, lobe_path)
}

fn write_excluded(excluded: &[String], lobe_path: impl AsRef<Path>) -> Result<()> {
    let path = excluded_apps_txt(&lobe_path);
    std::fs::write(&path, excluded.join("\n")).map_err(|err| AppError::WriteExcluded {
        source: err,
        path,
    })
}

fn excluded_apps_txt(lobe_path: impl AsRef<Path>) -> PathBuf {
    lobe_path.as_ref().join("sites").join("excluded_apps.txt")
}

/// Application entity error types.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Source string yields no parseable org/repo.
    #[error("invalid app source {input:?}")]
    InvalidSource { input: String },

    /// Declared dependency is not installed on the lobe.
    #[error("{app:?} requires {missing:?}, which is not installed")]
    MissingRequired { app: String, missing: String },

    /// Uninstall requested for an application that is not installed.
    #[error("no app named {app:?}")]
    NotInstalled { app: String },

    /// Removal requested while sites still use the application.
    #[error("{app:?} is still enabled on sites: {sites:?}")]
    InUse { app: String, sites: Vec<String> },

    /// Archive folder cannot be created.
    #[error("failed to create {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Application folder cannot be deleted.
    #[error("failed to remove {:?}", path.display())]
    RemoveDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Exclusion list cannot be written to.
    #[error("failed to write {:?}", path.display())]
    WriteExcluded {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// External command (pip, tar) fails.
    #[error(transparent)]
    Run(#[from] crate::run::RunError),

    /// Clone or symlink fails.
    #[error(transparent)]
    Vcs(#[from] crate::vcs::VcsError),
}

/// Friendly result alias :3
pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case(
        "git@host:22:org/repo",
        AppSource {
            url: "git@host:22:org/repo".into(),
            org: "org".into(),
            repo: "repo".into(),
            branch: None,
            is_url: false,
            use_ssh: true,
            is_local: false,
        };
        "ssh shorthand with port"
    )]
    #[test_case(
        "git@host:org/repo.git",
        AppSource {
            url: "git@host:org/repo.git".into(),
            org: "org".into(),
            repo: "repo".into(),
            branch: None,
            is_url: false,
            use_ssh: true,
            is_local: false,
        };
        "ssh shorthand without port"
    )]
    #[test_case(
        "https://host/org/repo",
        AppSource {
            url: "https://host/org/repo".into(),
            org: "org".into(),
            repo: "repo".into(),
            branch: None,
            is_url: true,
            use_ssh: false,
            is_local: false,
        };
        "https url"
    )]
    #[test_case(
        "https://host/org/repo.git@v14",
        AppSource {
            url: "https://host/org/repo.git".into(),
            org: "org".into(),
            repo: "repo".into(),
            branch: Some("v14".into()),
            is_url: true,
            use_ssh: false,
            is_local: false,
        };
        "https url with branch suffix"
    )]
    #[test_case(
        "blog",
        AppSource {
            url: format!("{DEFAULT_REMOTE}/blog.git"),
            org: "logica".into(),
            repo: "blog".into(),
            branch: None,
            is_url: false,
            use_ssh: false,
            is_local: false,
        };
        "bare name against default remote"
    )]
    #[test_case(
        "someorg/blog@develop",
        AppSource {
            url: "https://github.com/someorg/blog.git".into(),
            org: "someorg".into(),
            repo: "blog".into(),
            branch: Some("develop".into()),
            is_url: false,
            use_ssh: false,
            is_local: false,
        };
        "org slash repo shorthand with branch"
    )]
    #[test]
    fn parse_app_source(source: &str, expect: AppSource) {
        let result: AppSource = source.parse().unwrap();
        self::assert_eq!(result, expect);
    }

    #[test_case("https://host"; "url without org or repo")]
    #[test_case("git@host:abc:org/repo"; "ssh with garbage port")]
    #[test_case("git@host:/repo"; "ssh with empty org")]
    #[test_case(""; "empty source")]
    #[test_case("a/b/c"; "too many path segments")]
    #[test]
    fn parse_rejects_malformed_sources(source: &str) {
        let result = source.parse::<AppSource>();
        assert!(matches!(result, Err(AppError::InvalidSource { .. })));
    }

    #[test]
    fn file_url_is_local() {
        let result: AppSource = "file:///tmp/blog".parse().unwrap();
        assert!(result.is_local);
        assert_eq!(result.repo, "blog");
        assert_eq!(result.url, "/tmp/blog");
    }

    #[test]
    fn required_apps_come_from_hooks() {
        let tmp = tempfile::tempdir().unwrap();
        let app_dir = tmp.path().join("apps").join("blog").join("blog");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("hooks.py"),
            "app_name = \"blog\"\nrequired_apps = [\"logica\", \"payments\"]\n",
        )
        .unwrap();

        let app = App::local("blog", tmp.path());
        assert_eq!(app.required_apps(), vec!["logica", "payments"]);
    }

    #[test]
    fn install_refuses_missing_required_app() {
        let tmp = tempfile::tempdir().unwrap();
        let app_dir = tmp.path().join("apps").join("blog").join("blog");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("hooks.py"), "required_apps = [\"payments\"]\n").unwrap();

        let app = App::local("blog", tmp.path());
        let result = app.install(&InstallOptions::default(), &["logica".to_string()]);
        assert!(matches!(result, Err(AppError::MissingRequired { .. })));
    }

    #[test]
    fn ignore_resolution_skips_dependency_check() {
        let tmp = tempfile::tempdir().unwrap();
        let app_dir = tmp.path().join("apps").join("blog").join("blog");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("hooks.py"), "required_apps = [\"payments\"]\n").unwrap();

        let opts = InstallOptions {
            ignore_resolution: true,
            ..Default::default()
        };
        let app = App::local("blog", tmp.path());
        // No env python in the fixture, so install gets as far as the pip
        // spawn. The point is that the dependency refusal never fires.
        let result = app.install(&opts, &["logica".to_string()]);
        assert!(matches!(result, Err(AppError::Run(_))));
    }

    #[test]
    fn remove_is_refused_while_sites_use_the_app() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("apps").join("blog")).unwrap();

        let app = App::local("blog", tmp.path());
        let result = app.remove(true, &["site-one.local".to_string()]);
        assert!(matches!(result, Err(AppError::InUse { .. })));
        // The folder must survive the refused removal.
        assert!(tmp.path().join("apps").join("blog").exists());
    }

    #[test]
    fn remove_without_backup_deletes_the_folder() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("apps").join("blog")).unwrap();

        let app = App::local("blog", tmp.path());
        app.remove(true, &[]).unwrap();
        assert!(!tmp.path().join("apps").join("blog").exists());
    }

    #[test]
    fn exclusion_list_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sites")).unwrap();

        exclude_app("blog", tmp.path()).unwrap();
        exclude_app("payments", tmp.path()).unwrap();
        assert_eq!(excluded_apps(tmp.path()), vec!["blog", "payments"]);

        // Excluding twice does not duplicate.
        exclude_app("blog", tmp.path()).unwrap();
        assert_eq!(excluded_apps(tmp.path()), vec!["blog", "payments"]);

        include_app("blog", tmp.path()).unwrap();
        assert_eq!(excluded_apps(tmp.path()), vec!["payments"]);
    }
}
