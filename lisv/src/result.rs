// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Verdicts, per-test summaries and the recorded outcome of a test run.

use jiff::Timestamp;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// The verdict of a test or of one of its sub-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestResult {
    /// All checks held.
    Pass,
    /// A check did not hold.
    Fail,
    /// The test could not be carried out.
    Aborted,
    /// The test does not apply to this target.
    Skipped,
}

impl TestResult {
    /// The upper-case token used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            TestResult::Pass => "PASS",
            TestResult::Fail => "FAIL",
            TestResult::Aborted => "ABORTED",
            TestResult::Skipped => "SKIPPED",
        }
    }

    /// Returns true for results that should not fail a run.
    pub fn is_success(self) -> bool {
        matches!(self, TestResult::Pass | TestResult::Skipped)
    }

    /// `Pass` if `ok`, else `Fail`.
    pub fn from_bool(ok: bool) -> Self {
        if ok { TestResult::Pass } else { TestResult::Fail }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unrecognized result token.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown test result {0:?}")]
pub struct UnknownResult(pub String);

impl FromStr for TestResult {
    type Err = UnknownResult;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        [
            TestResult::Pass,
            TestResult::Fail,
            TestResult::Aborted,
            TestResult::Skipped,
        ]
        .into_iter()
        .find(|r| r.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| UnknownResult(s.to_owned()))
    }
}

/// One named sub-result of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    /// What was checked.
    pub name: String,
    /// How it went.
    pub result: TestResult,
    /// Free-form detail, e.g. measured values.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// The ordered list of sub-results accumulated while a test runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestSummary {
    entries: Vec<SummaryEntry>,
}

impl TestSummary {
    /// Returns an empty summary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&mut self, name: impl Into<String>, result: TestResult, detail: impl Into<String>) {
        self.entries.push(SummaryEntry {
            name: name.into(),
            result,
            detail: detail.into(),
        });
    }

    /// The entries, in insertion order.
    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if any entry has the given result.
    pub fn contains(&self, result: TestResult) -> bool {
        self.entries.iter().any(|e| e.result == result)
    }

    /// Folds the entries into a single verdict.
    ///
    /// Any failure wins, then any abort. A summary with only skipped entries
    /// is skipped, and an empty summary carries no evidence so it counts as
    /// aborted.
    pub fn final_result(&self) -> TestResult {
        if self.entries.is_empty() {
            TestResult::Aborted
        } else if self.contains(TestResult::Fail) {
            TestResult::Fail
        } else if self.contains(TestResult::Aborted) {
            TestResult::Aborted
        } else if self.entries.iter().all(|e| e.result == TestResult::Skipped) {
            TestResult::Skipped
        } else {
            TestResult::Pass
        }
    }
}

/// The recorded outcome of running one test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    /// The test name.
    pub test_name: String,
    /// The final verdict.
    pub result: TestResult,
    /// The sub-results.
    pub summary: TestSummary,
    /// When the test started.
    pub started: Timestamp,
    /// When the test finished.
    pub finished: Timestamp,
    /// The error chain, for aborted tests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where this test's logs live.
    pub log_dir: PathBuf,
    /// Which of the test's repeated runs this was, from 1.
    #[serde(default = "first")]
    pub iteration: u32,
    /// Which try of that run this was, from 1.
    #[serde(default = "first")]
    pub attempt: u32,
    /// The attempt failed and was run again.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retried: bool,
}

fn first() -> u32 {
    1
}

impl TestOutcome {
    /// Writes the outcome as pretty JSON to `path`.
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        write_json(path, self)
    }
}

/// Writes a serializable value as pretty JSON to `path`.
pub fn write_json(path: &Path, value: &impl Serialize) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs_err::write(path, json)?;
    Ok(())
}
