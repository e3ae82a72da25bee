// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guest `state.txt` protocol.
//!
//! Guest scripts write a single token to their state file: `TestRunning`
//! while they work, then one of the terminal tokens when they are done.

use crate::result::TestResult;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The default name of the state file written by guest scripts.
pub const STATE_FILE: &str = "state.txt";

/// The state reported by a guest-side script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestState {
    /// The script is still working.
    TestRunning,
    /// The script finished and its checks passed.
    TestCompleted,
    /// The script finished and a check failed.
    TestFailed,
    /// The script could not carry out the test.
    TestAborted,
    /// The test does not apply to this guest.
    TestSkipped,
}

/// The state file held something other than a known token.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown guest state {0:?}")]
pub struct UnknownState(pub String);

impl GuestState {
    /// Returns true once the script has stopped updating the file.
    pub fn is_terminal(self) -> bool {
        !matches!(self, GuestState::TestRunning)
    }

    /// The verdict implied by a terminal state.
    pub fn verdict(self) -> Option<TestResult> {
        Some(match self {
            GuestState::TestRunning => return None,
            GuestState::TestCompleted => TestResult::Pass,
            GuestState::TestFailed => TestResult::Fail,
            GuestState::TestAborted => TestResult::Aborted,
            GuestState::TestSkipped => TestResult::Skipped,
        })
    }

    /// The token the guest writes for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            GuestState::TestRunning => "TestRunning",
            GuestState::TestCompleted => "TestCompleted",
            GuestState::TestFailed => "TestFailed",
            GuestState::TestAborted => "TestAborted",
            GuestState::TestSkipped => "TestSkipped",
        }
    }
}

impl FromStr for GuestState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "TestRunning" => GuestState::TestRunning,
            "TestCompleted" => GuestState::TestCompleted,
            "TestFailed" => GuestState::TestFailed,
            "TestAborted" => GuestState::TestAborted,
            "TestSkipped" => GuestState::TestSkipped,
            other => return Err(UnknownState(other.to_owned())),
        })
    }
}

impl fmt::Display for GuestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
