// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A Rust-based harness for validating Linux guests on Hyper-V and Azure.
//!
//! A test case uploads a guest-side script, runs it over SSH, polls the
//! guest `state.txt` file until the script reports a terminal state, pulls
//! back its logs, and turns parsed output into a `PASS`/`FAIL`/`ABORTED`/
//! `SKIPPED` verdict. See [`TestCase`] and [`run_test`].

pub mod cases;
pub mod hyperv;
pub mod junit;
pub mod params;
pub mod parse;
pub mod poll;
pub mod remote;
pub mod requirements;
pub mod result;
pub mod runbook;
pub mod runner;
pub mod state;
pub mod threshold;
mod tracing;

#[cfg(test)]
mod testutil;

pub use params::TestParams;
pub use result::TestOutcome;
pub use result::TestResult;
pub use result::TestSummary;
pub use state::GuestState;
pub use test::PostTestHook;
pub use test::TestCase;
pub use test::TestContext;
pub use test::run_test;
pub use tracing::GUEST_LOG_TARGET;
pub use tracing::try_init_tracing;

use std::io::Read;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// 1 kibibyte's worth of bytes.
pub const SIZE_1_KB: u64 = 1024;
/// 1 mebibyte's worth of bytes.
pub const SIZE_1_MB: u64 = 1024 * SIZE_1_KB;
/// 1 gibibyte's worth of bytes.
pub const SIZE_1_GB: u64 = 1024 * SIZE_1_MB;
/// 1 tebibyte's worth of bytes.
pub const SIZE_1_TB: u64 = 1024 * SIZE_1_GB;

/// Error running a command on the host.
#[derive(Error, Debug)]
pub enum CommandError {
    /// failed to launch command
    #[error("failed to launch command")]
    Launch(#[from] std::io::Error),
    /// command did not finish in time and was killed
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    /// command exited with non-zero status
    #[error("command exited with non-zero status ({0}): {1}")]
    Command(ExitStatus, String),
}

/// The captured result of a host command.
#[derive(Debug)]
pub struct HostOutput {
    /// Exit status of the process.
    pub status: ExitStatus,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl HostOutput {
    /// Turns a non-zero exit status into [`CommandError::Command`].
    pub fn check(self) -> Result<Self, CommandError> {
        if self.status.success() {
            Ok(self)
        } else {
            Err(CommandError::Command(self.status, self.stderr))
        }
    }
}

/// Run a command on the host, capturing its output.
///
/// When `timeout` is set the child is killed once it expires. A non-zero exit
/// status is not an error here; see [`HostOutput::check`].
pub fn run_host_cmd(
    mut cmd: Command,
    timeout: Option<Duration>,
) -> Result<HostOutput, CommandError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let cmd_debug = format!("{cmd:?}");
    ::tracing::debug!(cmd = cmd_debug, "executing command");

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match timeout {
        None => child.wait()?,
        Some(timeout) => loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() >= timeout {
                ::tracing::warn!(cmd = cmd_debug, ?timeout, "killing command");
                let _ = child.kill();
                let _ = child.wait();
                return Err(CommandError::Timeout(timeout));
            }
            std::thread::sleep(Duration::from_millis(50));
        },
    };

    let collect = |h: Option<std::thread::JoinHandle<Vec<u8>>>| {
        h.and_then(|h| h.join().ok())
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    };
    let stdout = collect(stdout);
    let stderr = collect(stderr);
    ::tracing::debug!(
        cmd = cmd_debug,
        stdout,
        stderr,
        "command exited in {:.3}s with status {}",
        start.elapsed().as_secs_f64(),
        status
    );

    Ok(HostOutput {
        status,
        stdout,
        stderr,
    })
}

fn drain(mut r: impl 'static + Read + Send) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        buf
    })
}
