// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Running commands in the guest and moving files to and from it.

mod ssh;

pub use ssh::SshConfig;
pub use ssh::SshShell;

use crate::poll::Clock;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from talking to the guest.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// the guest could not be reached
    #[error("failed to connect to {host}: {message}")]
    Connect {
        /// The guest address.
        host: String,
        /// What the transport reported.
        message: String,
    },
    /// the guest rejected our credentials or host key
    #[error("authentication to {host} failed: {message}")]
    Auth {
        /// The guest address.
        host: String,
        /// What the transport reported.
        message: String,
    },
    /// the operation did not finish in time
    #[error("remote operation timed out after {0:?}")]
    Timeout(Duration),
    /// the command ran and reported failure
    #[error("remote command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// Its exit status, or -1 if it was killed.
        status: i32,
        /// Captured standard error.
        stderr: String,
    },
    /// a file copy failed
    #[error("failed to copy {path}: {message}")]
    Transfer {
        /// The file being copied.
        path: String,
        /// What the transport reported.
        message: String,
    },
    /// a local I/O error
    #[error("local io error")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Returns true for failures that may go away if the operation is retried
    /// (the guest is rebooting, the network blipped, sshd was slow).
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Connect { .. } | RemoteError::Timeout(_))
    }
}

/// Options for [`GuestShell::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run the command as root.
    pub sudo: bool,
    /// Kill the command if it runs longer than this.
    pub timeout: Option<Duration>,
    /// Return the output of a failed command instead of an error.
    pub allow_failure: bool,
}

impl RunOptions {
    /// Default options: unprivileged, no timeout, failure is an error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run as root.
    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    /// Kill the command after `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Do not treat a non-zero exit status as an error.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }
}

/// The output of a guest command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, or -1 if the command was killed.
    pub status: i32,
    /// Standard output with trailing whitespace removed.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// A way to run commands in the guest.
pub trait GuestShell {
    /// Runs `command` through the guest's shell.
    fn run(&self, command: &str, options: &RunOptions) -> Result<CommandOutput, RemoteError>;

    /// Copies the local file `local` into the guest directory `remote_dir`.
    fn upload(&self, local: &Path, remote_dir: &str) -> Result<(), RemoteError>;

    /// Copies the guest file `remote_path` into `local_dir`, returning the
    /// local path.
    fn download(&self, remote_path: &str, local_dir: &Path) -> Result<PathBuf, RemoteError>;

    /// Runs `command` and returns its standard output.
    fn exec(&self, command: &str) -> Result<String, RemoteError> {
        self.run(command, &RunOptions::new()).map(|o| o.stdout)
    }

    /// Runs `command` as root and returns its standard output.
    fn exec_sudo(&self, command: &str) -> Result<String, RemoteError> {
        self.run(command, &RunOptions::new().sudo()).map(|o| o.stdout)
    }

    /// Reads a guest file.
    fn read_file(&self, path: &str) -> Result<String, RemoteError> {
        self.exec(&format!("cat {}", shell_words::quote(path)))
    }
}

const BOOT_ID: &str = "cat /proc/sys/kernel/random/boot_id";

/// Waits until the guest answers a trivial command.
pub fn wait_for_guest(
    shell: &dyn GuestShell,
    timeout: Duration,
    interval: Duration,
    clock: &dyn Clock,
) -> Result<(), RemoteError> {
    wait_until(shell, timeout, interval, clock, |shell| {
        shell.run("true", &RunOptions::new().timeout(interval.max(Duration::from_secs(1))))
            .map(drop)
    })
}

/// Reboots the guest and waits for it to come back with a new boot id.
pub fn reboot(
    shell: &dyn GuestShell,
    timeout: Duration,
    interval: Duration,
    clock: &dyn Clock,
) -> Result<(), RemoteError> {
    let before = shell.exec(BOOT_ID)?;
    tracing::info!(boot_id = before, "rebooting guest");
    // The connection usually drops before `reboot` can report anything.
    match shell.run("reboot", &RunOptions::new().sudo().allow_failure()) {
        Ok(_) => {}
        Err(err) if err.is_transient() => {}
        Err(err) => return Err(err),
    }
    wait_until(shell, timeout, interval, clock, |shell| {
        let now = shell.exec(BOOT_ID)?;
        if now == before {
            Err(RemoteError::Connect {
                host: "guest".into(),
                message: "guest has not rebooted yet".into(),
            })
        } else {
            tracing::info!(boot_id = now, "guest is back");
            Ok(())
        }
    })
}

fn wait_until(
    shell: &dyn GuestShell,
    timeout: Duration,
    interval: Duration,
    clock: &dyn Clock,
    mut f: impl FnMut(&dyn GuestShell) -> Result<(), RemoteError>,
) -> Result<(), RemoteError> {
    let start = clock.now();
    loop {
        match f(shell) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_transient() => {
                tracing::debug!(error = &err as &dyn std::error::Error, "guest not ready");
            }
            Err(err) => return Err(err),
        }
        if clock.now().duration_since(start) >= timeout {
            return Err(RemoteError::Timeout(timeout));
        }
        clock.sleep(interval);
    }
}
