// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Crate for defining tests that have tracing output.
//!
//! Use `#[test_with_tracing::test]` (or `use test_with_tracing::test;` and a
//! plain `#[test]`) to have `tracing` events from the code under test captured
//! by the test harness, inside a `test` span named after the test. The filter
//! is read from `LISV_TEST_LOG`, falling back to `RUST_LOG`, and defaults to
//! `debug`.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

const FILTER_VARS: [&str; 2] = ["LISV_TEST_LOG", "RUST_LOG"];

fn targets() -> Targets {
    for var in FILTER_VARS {
        if let Ok(value) = std::env::var(var) {
            match value.parse() {
                Ok(targets) => return targets,
                Err(err) => eprintln!("ignoring invalid {var} filter {value:?}: {err}"),
            }
        }
    }
    Targets::new().with_default(LevelFilter::DEBUG)
}

#[doc(hidden)]
/// Initializes `tracing` for tests.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        // Another test framework may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets())
            .try_init();
    });
}

#[doc(hidden)]
/// Initializes `tracing`, then runs `body` in a `test` span named `name`.
pub fn run<T>(name: &'static str, body: impl FnOnce() -> T) -> T {
    init();
    let _span = tracing::info_span!("test", name).entered();
    body()
}
