// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Version control boundary.
//!
//! Everything the registry needs to know about an application checkout lives
//! behind these functions: whether a directory is a repository at all, which
//! branch it sits on, and which commit a ref points to. Cloning goes through
//! libgit2 with the same credential prompting and progress reporting for
//! remote fetches that the rest of the tool uses.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{build::RepoBuilder, Config, FetchOptions, RemoteCallbacks, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument};

/// Check whether `path` is the root of a git checkout.
///
/// Does not search parent directories; an application nested inside some
/// other repository is still "not a repo" on its own.
pub fn is_repo(path: impl AsRef<Path>) -> bool {
    path.as_ref().join(".git").exists()
}

/// Name of the currently checked-out branch at `path`.
///
/// # Errors
///
/// - Return [`VcsError::Git2`] if the repository cannot be opened, or HEAD is
///   unborn or detached with no shorthand.
pub fn current_branch(path: impl AsRef<Path>) -> Result<String> {
    let repo = Repository::open(path.as_ref())?;
    let head = repo.head()?;
    head.shorthand()
        .map(ToString::to_string)
        .ok_or(VcsError::UnnamedHead)
}

/// Full commit hash that `refname` points to at `path`.
///
/// # Errors
///
/// - Return [`VcsError::Git2`] if the repository cannot be opened or the ref
///   does not resolve.
pub fn commit_hash(path: impl AsRef<Path>, refname: &str) -> Result<String> {
    let repo = Repository::open(path.as_ref())?;
    let object = repo.revparse_single(refname)?;
    let hash = object.peel_to_commit()?.id().to_string();
    Ok(hash)
}

/// Clone `url` into `dest`.
///
/// Fetch progress is displayed through the given progress bar, and the user is
/// prompted for credentials when the remote demands them. A shallow clone
/// fetches only the tip commit. On any failure the partially created `dest`
/// directory is removed so no half-clone is left behind.
///
/// # Errors
///
/// - Return [`VcsError::Git2`] if libgit2 operations fail.
/// - Return [`VcsError::IndicatifStyleTemplate`] if the progress bar style
///   cannot be set.
#[instrument(skip(url, dest, bar), level = "debug")]
pub fn clone_repo(
    url: impl AsRef<str>,
    dest: impl AsRef<Path>,
    branch: Option<&str>,
    shallow: bool,
    bar: ProgressBar,
) -> Result<Repository> {
    let dest = dest.as_ref();
    let existed_before = dest.exists();

    let result = clone_repo_inner(url.as_ref(), dest, branch, shallow, bar);

    // INVARIANT: No partial clone directory survives a failure.
    if result.is_err() && !existed_before && dest.exists() {
        debug!("cleaning up partial clone at {:?}", dest.display());
        let _ = std::fs::remove_dir_all(dest);
    }

    result
}

fn clone_repo_inner(
    url: &str,
    dest: &Path,
    branch: Option<&str>,
    shallow: bool,
    bar: ProgressBar,
) -> Result<Repository> {
    info!("clone {url} into {:?}", dest.display());
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_message(url.to_string());
    bar.enable_steady_tick(time::Duration::from_millis(100));

    let prompter = BarPrompter::new(bar);
    let authenticator = GitAuthenticator::default().set_prompter(prompter.clone());
    let config = Config::open_default()?;

    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(&config));
    rc.transfer_progress(move |progress| {
        let stats = progress.to_owned();
        let bar_size = stats.total_objects() as u64;
        let bar_pos = stats.received_objects() as u64;
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            prompter.bar.set_length(bar_size);
            prompter.bar.set_position(bar_pos);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    if shallow {
        fo.depth(1);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fo);
    if let Some(branch) = branch {
        builder.branch(branch);
    }

    Ok(builder.clone(url, dest)?)
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
struct BarPrompter {
    bar: ProgressBar,
}

impl BarPrompter {
    fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for BarPrompter {
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password").without_confirmation().prompt().ok()
        })
    }

    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("password").without_confirmation().prompt().ok()
        })
    }
}

/// Symlink an existing local checkout into place instead of cloning it.
///
/// Used for local development setups where the application working tree
/// should be shared rather than duplicated.
///
/// # Errors
///
/// - Return [`VcsError::Symlink`] if the link cannot be created.
#[cfg(unix)]
pub fn symlink_repo(source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    std::os::unix::fs::symlink(source.as_ref(), dest.as_ref()).map_err(|err| VcsError::Symlink {
        source: err,
        dest: dest.as_ref().to_path_buf(),
    })
}

#[cfg(not(unix))]
pub fn symlink_repo(_source: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<()> {
    Err(VcsError::Symlink {
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "symlinked app checkouts are only supported on unix",
        ),
        dest: dest.as_ref().to_path_buf(),
    })
}

/// Version control error types.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// HEAD exists but has no branch shorthand.
    #[error("HEAD has no branch name")]
    UnnamedHead,

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Local checkout cannot be linked into the apps folder.
    #[error("failed to symlink into {:?}", dest.display())]
    Symlink {
        #[source]
        source: std::io::Error,
        dest: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = VcsError> = std::result::Result<T, E>;
