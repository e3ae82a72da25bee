// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Running a runbook: test selection, repeated runs and retries, and the
//! run-level reports.

use crate::TestContext;
use crate::TestOutcome;
use crate::TestResult;
use crate::TestSummary;
use crate::hyperv::Hypervisor;
use crate::junit;
use crate::poll::Clock;
use crate::poll::SystemClock;
use crate::remote::GuestShell;
use crate::requirements::Platform;
use crate::result::write_json;
use crate::run_test;
use crate::runbook::Runbook;
use crate::runbook::RunbookError;
use crate::runbook::TestKind;
use crate::runbook::TestSpec;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

/// The JSON report written next to the per-test outcomes.
pub const RESULTS_JSON: &str = "results.json";
/// The JUnit report written next to [`RESULTS_JSON`].
pub const RESULTS_JUNIT: &str = "results.junit.xml";

/// One run of one test, as reported.
#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    /// The kind of the test.
    pub kind: TestKind,
    /// What happened.
    #[serde(flatten)]
    pub outcome: TestOutcome,
}

/// Everything that ran for a runbook.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// The runbook file, when loaded from one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runbook: Option<PathBuf>,
    /// Where the guest ran.
    pub platform: Platform,
    /// The overall verdict.
    pub result: TestResult,
    /// Every attempt, in run order.
    pub tests: Vec<ReportEntry>,
}

impl RunReport {
    /// The verdict of each run that was not retried.
    pub fn final_results(&self) -> Vec<TestResult> {
        self.tests
            .iter()
            .filter(|e| !e.outcome.retried)
            .map(|e| e.outcome.result)
            .collect()
    }

    /// The name reports use for the whole run.
    pub fn name(&self) -> String {
        self.runbook
            .as_deref()
            .and_then(Path::file_stem)
            .map_or_else(|| "lisv".to_owned(), |s| s.to_string_lossy().into_owned())
    }

    /// Writes `results.json` and `results.junit.xml` into `dir`.
    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        fs_err::create_dir_all(dir)?;
        write_json(&dir.join(RESULTS_JSON), self)?;
        fs_err::write(
            dir.join(RESULTS_JUNIT),
            junit::to_junit(&self.name(), &self.tests)?,
        )?;
        Ok(())
    }
}

/// The log name of one attempt: the test name, plus `-run<N>` when the test
/// repeats and `-attempt<N>` for retries.
pub fn run_name(name: &str, iteration: u32, times: u32, attempt: u32) -> String {
    let mut run = name.to_owned();
    if times > 1 {
        run.push_str(&format!("-run{iteration}"));
    }
    if attempt > 1 {
        run.push_str(&format!("-attempt{attempt}"));
    }
    run
}

/// Runs the tests of a runbook against a guest.
pub struct Runner<'a> {
    runbook: &'a Runbook,
    guest: &'a dyn GuestShell,
    host: Option<&'a dyn Hypervisor>,
    clock: &'a dyn Clock,
}

impl<'a> Runner<'a> {
    /// A runner for `runbook` against `guest`, without host access.
    pub fn new(runbook: &'a Runbook, guest: &'a dyn GuestShell) -> Self {
        Self {
            runbook,
            guest,
            host: None,
            clock: &SystemClock,
        }
    }

    /// Gives host-side tests access to `host`.
    pub fn with_host(mut self, host: &'a dyn Hypervisor) -> Self {
        self.host = Some(host);
        self
    }

    /// Replaces the wall clock.
    pub fn with_clock(mut self, clock: &'a dyn Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Runs `spec` `times` times. A run that ends `FAIL` or `ABORTED` is
    /// tried again up to `retry` more times. Returns every attempt.
    pub fn run_spec(&self, spec: &TestSpec) -> Result<Vec<TestOutcome>, RunbookError> {
        let case = self.runbook.build_case(spec)?;
        let mut outcomes = Vec::new();
        for iteration in 1..=spec.times {
            for attempt in 1..=spec.retry.saturating_add(1) {
                let mut ctx = TestContext::new(
                    run_name(&spec.name, iteration, spec.times, attempt),
                    self.runbook.test_params(spec),
                    self.runbook.platform,
                    self.guest,
                    &self.runbook.log_dir,
                )
                .with_clock(self.clock)
                .with_attempt(iteration, attempt);
                if let Some(host) = self.host {
                    ctx = ctx.with_host(host, &self.runbook.vm_name);
                }
                let mut outcome = run_test(case.as_ref(), ctx);
                outcome.retried = !outcome.result.is_success() && attempt <= spec.retry;
                let again = outcome.retried;
                if again {
                    tracing::warn!(
                        test = spec.name,
                        iteration,
                        attempt,
                        result = %outcome.result,
                        "retrying test"
                    );
                }
                outcomes.push(outcome);
                if !again {
                    break;
                }
            }
        }
        Ok(outcomes)
    }

    /// Runs every test `select` accepts, in runbook order, calling
    /// `on_outcome` after each attempt.
    pub fn run(
        &self,
        select: impl Fn(&TestSpec) -> bool,
        mut on_outcome: impl FnMut(&TestOutcome),
    ) -> Result<RunReport, RunbookError> {
        let mut tests = Vec::new();
        let mut totals = TestSummary::new();
        for spec in self.runbook.tests.iter().filter(|s| select(s)) {
            for outcome in self.run_spec(spec)? {
                on_outcome(&outcome);
                if !outcome.retried {
                    totals.push(&outcome.test_name, outcome.result, "");
                }
                tests.push(ReportEntry {
                    kind: spec.kind,
                    outcome,
                });
            }
        }
        Ok(RunReport {
            runbook: None,
            platform: self.runbook.platform,
            result: totals.final_result(),
            tests,
        })
    }
}
