// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The bundled test cases.
//!
//! Most cases drive a guest-side script through a [`ScriptJob`]: upload it
//! with `constants.sh`, start it detached, poll its state file, and pull back
//! its logs.

mod cpu_offline;
mod disk_hot_add;
mod dynamic_memory;
mod network_perf;
mod script;

pub use cpu_offline::CpuOfflineTest;
pub use disk_hot_add::DiskHotAddTest;
pub use dynamic_memory::DynamicMemoryTest;
pub use network_perf::NetworkPerfTest;
pub use script::GuestScriptTest;

use crate::TestContext;
use crate::TestResult;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::poll::StatePoller;
use crate::state::GuestState;
use crate::state::STATE_FILE;
use anyhow::Context as _;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// The log every detached script writes its output to.
const EXECUTION_LOG: &str = "TestExecution.log";

/// A guest-side script run in the background and polled to completion.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    /// The script on the host.
    pub script: PathBuf,
    /// Helper files uploaded next to the script.
    pub extra_files: Vec<PathBuf>,
    /// Guest files downloaded once the script is done.
    pub logs: Vec<String>,
    /// How to wait for the script.
    pub poller: StatePoller,
}

impl ScriptJob {
    /// Reads the job from `script`, `extra_files`, `state_file`,
    /// `timeout_secs`, `poll_secs` and `logs`. Relative host paths are
    /// resolved against `script_dir`.
    pub fn from_params(params: &TestParams, script_dir: &Path) -> Result<Self, ParamsError> {
        let resolve = |p: &str| script_dir.join(p);
        let logs = if params.contains("logs") {
            params.list("logs")
        } else {
            vec!["summary.log", EXECUTION_LOG]
        };
        Ok(Self {
            script: resolve(params.require("script")?),
            extra_files: params.list("extra_files").into_iter().map(resolve).collect(),
            logs: logs.into_iter().map(str::to_owned).collect(),
            poller: StatePoller {
                state_file: params.get("state_file").unwrap_or(STATE_FILE).to_owned(),
                interval: Duration::from_secs(params.get_or("poll_secs", 10)?),
                timeout: Duration::from_secs(params.get_or("timeout_secs", 1800)?),
                ..Default::default()
            },
        })
    }

    /// The script's file name.
    pub fn script_name(&self) -> String {
        self.script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Uploads everything, clears state left by an earlier run, and starts
    /// the script detached from the SSH session.
    pub fn start(&self, ctx: &TestContext<'_>) -> anyhow::Result<()> {
        ctx.upload_constants()?;
        for file in &self.extra_files {
            ctx.guest
                .upload(file, ".")
                .with_context(|| format!("failed to upload {}", file.display()))?;
        }
        let name = ctx.upload_script(&self.script)?;
        ctx.guest
            .exec(&format!(
                "rm -f {} summary.log {EXECUTION_LOG}",
                shell_words::quote(&self.poller.state_file)
            ))
            .context("failed to clear stale state")?;
        tracing::info!(script = name, "starting guest script");
        ctx.guest
            .exec(&format!(
                "nohup bash ./{} > {EXECUTION_LOG} 2>&1 < /dev/null &",
                shell_words::quote(&name)
            ))
            .with_context(|| format!("failed to start {name}"))?;
        Ok(())
    }

    /// Polls the state file until the script finishes.
    pub fn wait(&self, ctx: &TestContext<'_>) -> anyhow::Result<GuestState> {
        self.poller
            .poll_with_clock(ctx.guest, ctx.clock)
            .with_context(|| format!("waiting for {}", self.script_name()))
    }

    /// Starts the script and waits for it. The logs are downloaded whether or
    /// not waiting succeeded.
    pub fn run(&self, ctx: &TestContext<'_>) -> anyhow::Result<GuestState> {
        let state = self.start(ctx).and_then(|()| self.wait(ctx));
        self.collect_logs(ctx);
        state
    }

    /// Downloads the job's logs into the test log directory.
    pub fn collect_logs(&self, ctx: &TestContext<'_>) -> Vec<PathBuf> {
        let logs: Vec<&str> = self.logs.iter().map(String::as_str).collect();
        ctx.download_logs(&logs)
    }
}

/// Records the script's terminal state as a summary entry and returns its
/// verdict.
fn record_state(
    ctx: &mut TestContext<'_>,
    job: &ScriptJob,
    state: GuestState,
) -> anyhow::Result<TestResult> {
    let result = state
        .verdict()
        .with_context(|| format!("{state} is not a terminal state"))?;
    ctx.log_summary(&job.script_name(), result, format!("guest state {state}"));
    Ok(result)
}
