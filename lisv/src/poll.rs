// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Waiting on the guest: the state-file poller and a retry helper.

use crate::remote::GuestShell;
use crate::remote::RemoteError;
use crate::remote::RunOptions;
use crate::state::GuestState;
use crate::state::STATE_FILE;
use crate::state::UnknownState;
use std::fmt;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// A source of time, so that polling loops can be driven deterministically.
pub trait Clock {
    /// The current instant.
    fn now(&self) -> Instant;
    /// Blocks for `duration`.
    fn sleep(&self, duration: Duration);
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Errors from [`StatePoller::poll`].
#[derive(Debug, Error)]
pub enum PollError {
    /// the script did not reach a terminal state in time
    #[error("guest script did not finish within {timeout:?} (last state: {})", display_state(.last_state))]
    Timeout {
        /// The configured timeout.
        timeout: Duration,
        /// The last state read before giving up.
        last_state: Option<GuestState>,
    },
    /// the guest was unreachable too many times in a row
    #[error("giving up after {count} consecutive failures reading the state file")]
    TooManyFailures {
        /// How many reads failed in a row.
        count: u32,
        /// The last failure.
        #[source]
        source: RemoteError,
    },
    /// the state file holds garbage
    #[error("guest script wrote an invalid state")]
    UnknownState(#[from] UnknownState),
    /// a non-transient remote failure
    #[error("failed to read the state file")]
    Remote(#[source] RemoteError),
}

fn display_state(state: &Option<GuestState>) -> &'static str {
    state.map_or("none", GuestState::as_str)
}

/// Polls a guest state file until it reports a terminal state.
#[derive(Debug, Clone)]
pub struct StatePoller {
    /// Path of the state file in the guest, relative to the login directory
    /// unless absolute.
    pub state_file: String,
    /// Delay between reads.
    pub interval: Duration,
    /// Give up once this much time has passed.
    pub timeout: Duration,
    /// Give up after this many consecutive transient read failures.
    pub max_transient_failures: u32,
}

impl Default for StatePoller {
    fn default() -> Self {
        Self {
            state_file: STATE_FILE.into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30 * 60),
            max_transient_failures: 5,
        }
    }
}

impl StatePoller {
    /// Polls using the wall clock.
    pub fn poll(&self, shell: &dyn GuestShell) -> Result<GuestState, PollError> {
        self.poll_with_clock(shell, &SystemClock)
    }

    /// Polls using the given clock.
    ///
    /// A missing or empty state file means the script has not started
    /// writing yet and is polled again, like `TestRunning`.
    pub fn poll_with_clock(
        &self,
        shell: &dyn GuestShell,
        clock: &dyn Clock,
    ) -> Result<GuestState, PollError> {
        let start = clock.now();
        let command = format!("cat {}", shell_words::quote(&self.state_file));
        let read_options = RunOptions::new()
            .allow_failure()
            .timeout(self.interval.max(Duration::from_secs(30)));
        let mut last_state = None;
        let mut failures = 0;

        loop {
            match shell.run(&command, &read_options) {
                Ok(output) => {
                    failures = 0;
                    if output.success() && !output.stdout.trim().is_empty() {
                        let state: GuestState = output.stdout.parse()?;
                        if last_state != Some(state) {
                            tracing::info!(%state, file = self.state_file, "guest state");
                        }
                        last_state = Some(state);
                        if state.is_terminal() {
                            return Ok(state);
                        }
                    } else {
                        tracing::debug!(file = self.state_file, "state file not written yet");
                    }
                }
                Err(err) if err.is_transient() => {
                    failures += 1;
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        failures,
                        "failed to read guest state"
                    );
                    if failures >= self.max_transient_failures {
                        return Err(PollError::TooManyFailures {
                            count: failures,
                            source: err,
                        });
                    }
                }
                Err(err) => return Err(PollError::Remote(err)),
            }

            if clock.now().duration_since(start) >= self.timeout {
                return Err(PollError::Timeout {
                    timeout: self.timeout,
                    last_state,
                });
            }
            clock.sleep(self.interval);
        }
    }
}

/// Runs `f` up to `attempts` times, sleeping `delay` between failed attempts.
///
/// `f` receives the 1-based attempt number. Returns the last error once the
/// attempts are used up.
pub fn retry<T, E: fmt::Display>(
    attempts: u32,
    delay: Duration,
    clock: &dyn Clock,
    mut f: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match f(attempt) {
            Ok(v) => return Ok(v),
            Err(err) if attempt < attempts => {
                tracing::warn!(attempt, attempts, "attempt failed, retrying: {err}");
                clock.sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeClock;
    use crate::testutil::ScriptedShell;
    use test_with_tracing::test;

    const CAT: &str = "cat state.txt";

    fn poller() -> StatePoller {
        StatePoller {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
            max_transient_failures: 3,
            ..Default::default()
        }
    }

    #[test]
    fn completes_after_running() {
        let shell = ScriptedShell::new()
            .on(CAT, Ok("TestRunning"))
            .on(CAT, Ok("TestRunning\n"))
            .on(CAT, Ok("TestCompleted\n"));
        let clock = FakeClock::new();
        let state = poller().poll_with_clock(&shell, &clock).unwrap();
        assert_eq!(state, GuestState::TestCompleted);
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn missing_file_keeps_polling() {
        let shell = ScriptedShell::new()
            .on_status(CAT, 1, "")
            .on(CAT, Ok(""))
            .on(CAT, Ok("TestSkipped"));
        let state = poller()
            .poll_with_clock(&shell, &FakeClock::new())
            .unwrap();
        assert_eq!(state, GuestState::TestSkipped);
    }

    #[test]
    fn timeout_reports_last_state() {
        let shell = ScriptedShell::new().fallback(Ok("TestRunning"));
        let err = poller()
            .poll_with_clock(&shell, &FakeClock::new())
            .unwrap_err();
        assert!(matches!(
            err,
            PollError::Timeout {
                last_state: Some(GuestState::TestRunning),
                ..
            }
        ));
        assert!(err.to_string().contains("TestRunning"));
    }

    #[test]
    fn consecutive_transient_failures_abort() {
        let shell = ScriptedShell::new().fallback(ScriptedShell::connect_error());
        let err = poller()
            .poll_with_clock(&shell, &FakeClock::new())
            .unwrap_err();
        assert!(matches!(err, PollError::TooManyFailures { count: 3, .. }));
    }

    #[test]
    fn success_resets_failure_count() {
        let shell = ScriptedShell::new()
            .on(CAT, ScriptedShell::connect_error())
            .on(CAT, ScriptedShell::connect_error())
            .on(CAT, Ok("TestRunning"))
            .on(CAT, ScriptedShell::connect_error())
            .on(CAT, ScriptedShell::connect_error())
            .on(CAT, Ok("TestFailed"));
        let state = poller()
            .poll_with_clock(&shell, &FakeClock::new())
            .unwrap();
        assert_eq!(state, GuestState::TestFailed);
    }

    #[test]
    fn garbage_state_is_an_error() {
        let shell = ScriptedShell::new().on(CAT, Ok("Done!"));
        let err = poller()
            .poll_with_clock(&shell, &FakeClock::new())
            .unwrap_err();
        assert!(matches!(err, PollError::UnknownState(_)));
    }

    #[test]
    fn retry_returns_last_error() {
        let clock = FakeClock::new();
        let mut calls = 0;
        let r: Result<(), String> = retry(3, Duration::from_secs(2), &clock, |n| {
            calls += 1;
            Err(format!("attempt {n}"))
        });
        assert_eq!(r, Err("attempt 3".into()));
        assert_eq!(calls, 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(4));
    }

    #[test]
    fn retry_stops_on_success() {
        let r = retry(5, Duration::from_secs(1), &FakeClock::new(), |n| {
            if n == 2 { Ok(n) } else { Err("not yet") }
        });
        assert_eq!(r, Ok(2));
    }
}
