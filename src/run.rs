// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External command execution.
//!
//! Everything libgit2 cannot do for us goes through here: pip installs,
//! supervisorctl and systemctl calls, tarring up removed applications. Calls
//! block until the child exits; bounded latency is the caller's problem.

use std::{
    ffi::OsStr,
    path::Path,
    process::Command,
};
use tracing::debug;

/// Run a command wired to the current terminal.
///
/// Stdin, stdout, and stderr are inherited so the child can interact with the
/// user directly.
///
/// # Errors
///
/// - Return [`RunError::Spawn`] if the command cannot be started.
/// - Return [`RunError::CommandFailed`] on a non-zero exit status.
pub fn run_interactive(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    cwd: Option<&Path>,
) -> Result<()> {
    let mut command = Command::new(cmd.as_ref());
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    debug!("run interactive {:?}", cmd.as_ref());
    let status = command.spawn().map_err(RunError::Spawn)?.wait().map_err(RunError::Spawn)?;
    if !status.success() {
        return Err(RunError::CommandFailed {
            command: cmd.as_ref().to_string_lossy().into_owned(),
            output: String::new(),
        });
    }

    Ok(())
}

/// Run a command and capture its combined output.
///
/// Output from stdout and stderr is merged into one string with trailing
/// newlines chomped. On failure the captured output rides along in the error
/// so callers can surface what the child actually said.
///
/// # Errors
///
/// - Return [`RunError::Spawn`] if the command cannot be started.
/// - Return [`RunError::CommandFailed`] on a non-zero exit status.
pub fn run_captured(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    cwd: Option<&Path>,
) -> Result<String> {
    let mut command = Command::new(cmd.as_ref());
    command.args(args);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    debug!("run captured {:?}", cmd.as_ref());
    let output = command.output().map_err(RunError::Spawn)?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(stdout.as_str());
    }

    if !stderr.is_empty() {
        message.push_str(stderr.as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message);

    if !output.status.success() {
        return Err(RunError::CommandFailed {
            command: cmd.as_ref().to_string_lossy().into_owned(),
            output: message,
        });
    }

    Ok(message)
}

/// External command error types.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Command could not be spawned at all.
    #[error("failed to spawn command")]
    Spawn(#[source] std::io::Error),

    /// Command ran, but exited non-zero.
    #[error("command {command:?} failed:\n{output}")]
    CommandFailed { command: String, output: String },
}

/// Friendly result alias :3
pub type Result<T, E = RunError> = std::result::Result<T, E>;
