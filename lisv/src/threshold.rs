// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Numeric pass/fail checks.

use crate::result::TestResult;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How a measured value is compared against its limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Comparison {
    /// `actual >= v`
    AtLeast(f64),
    /// `actual <= v`
    AtMost(f64),
    /// `actual > v`
    GreaterThan(f64),
    /// `actual < v`
    LessThan(f64),
    /// `actual` within `tolerance_pct` percent of `expected`.
    Within {
        /// The target value.
        expected: f64,
        /// Allowed deviation, in percent of `expected`.
        tolerance_pct: f64,
    },
}

impl Comparison {
    /// Returns true if `actual` satisfies the comparison.
    pub fn holds(&self, actual: f64) -> bool {
        match *self {
            Comparison::AtLeast(v) => actual >= v,
            Comparison::AtMost(v) => actual <= v,
            Comparison::GreaterThan(v) => actual > v,
            Comparison::LessThan(v) => actual < v,
            Comparison::Within {
                expected,
                tolerance_pct,
            } => (actual - expected).abs() <= (expected * tolerance_pct / 100.0).abs(),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Comparison::AtLeast(v) => write!(f, ">= {v}"),
            Comparison::AtMost(v) => write!(f, "<= {v}"),
            Comparison::GreaterThan(v) => write!(f, "> {v}"),
            Comparison::LessThan(v) => write!(f, "< {v}"),
            Comparison::Within {
                expected,
                tolerance_pct,
            } => write!(f, "= {expected} ±{tolerance_pct}%"),
        }
    }
}

/// A threshold string could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid threshold {0:?}")]
pub struct ThresholdError(pub String);

impl FromStr for Comparison {
    type Err = ThresholdError;

    /// Parses `>=10`, `<=5`, `>3`, `<3`, `=100±5%` (or `=100+-5%`), or a bare
    /// number meaning `>=`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ThresholdError(s.to_owned());
        let num = |v: &str| v.trim().parse::<f64>().map_err(|_| err());
        let t = s.trim();
        Ok(if let Some(v) = t.strip_prefix(">=") {
            Comparison::AtLeast(num(v)?)
        } else if let Some(v) = t.strip_prefix("<=") {
            Comparison::AtMost(num(v)?)
        } else if let Some(v) = t.strip_prefix('>') {
            Comparison::GreaterThan(num(v)?)
        } else if let Some(v) = t.strip_prefix('<') {
            Comparison::LessThan(num(v)?)
        } else if let Some(v) = t.strip_prefix('=') {
            let (expected, tolerance) = v
                .split_once('±')
                .or_else(|| v.split_once("+-"))
                .ok_or_else(err)?;
            let tolerance = tolerance.trim().strip_suffix('%').ok_or_else(err)?;
            Comparison::Within {
                expected: num(expected)?,
                tolerance_pct: num(tolerance)?,
            }
        } else {
            Comparison::AtLeast(num(t)?)
        })
    }
}

/// A named limit on a measured value.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// What is being measured, for messages.
    pub metric: String,
    /// The limit.
    pub comparison: Comparison,
}

/// The result of checking a value against a [`Threshold`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdCheck {
    /// What was measured.
    pub metric: String,
    /// The measured value.
    pub actual: f64,
    /// Whether the limit held.
    pub passed: bool,
    /// A human-readable description.
    pub message: String,
}

impl ThresholdCheck {
    /// The check as a verdict.
    pub fn result(&self) -> TestResult {
        TestResult::from_bool(self.passed)
    }
}

impl Threshold {
    /// A threshold on `metric`.
    pub fn new(metric: impl Into<String>, comparison: Comparison) -> Self {
        Self {
            metric: metric.into(),
            comparison,
        }
    }

    /// Checks `actual` against the limit.
    pub fn check(&self, actual: f64) -> ThresholdCheck {
        let passed = self.comparison.holds(actual);
        let message = format!(
            "{}: {actual} (expected {}): {}",
            self.metric,
            self.comparison,
            TestResult::from_bool(passed)
        );
        if passed {
            tracing::info!(metric = self.metric, actual, "{message}");
        } else {
            tracing::warn!(metric = self.metric, actual, "{message}");
        }
        ThresholdCheck {
            metric: self.metric.clone(),
            actual,
            passed,
            message,
        }
    }
}

/// The change from `before` to `after` in percent of `before`. `None` when
/// `before` is zero.
pub fn percent_change(before: f64, after: f64) -> Option<f64> {
    (before != 0.0).then(|| (after - before) / before * 100.0)
}

/// The arithmetic mean, or `None` for no values.
pub fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}
