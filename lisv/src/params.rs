// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The test-parameter bag.
//!
//! Parameters travel as `key=value;key=value` strings, both from runbooks to
//! the harness and from the harness to guest scripts (rendered as
//! `constants.sh`).

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors from parsing or reading test parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    /// a segment has no `=`
    #[error("parameter segment {0:?} is missing '='")]
    MissingSeparator(String),
    /// a segment has an empty key
    #[error("parameter segment {0:?} has an empty key")]
    EmptyKey(String),
    /// a required parameter is absent
    #[error("missing required parameter {0:?}")]
    Missing(String),
    /// a parameter value does not parse as the requested type
    #[error("parameter {key:?} has invalid value {value:?}: {reason}")]
    Invalid {
        /// The parameter name.
        key: String,
        /// The raw value.
        value: String,
        /// Why parsing failed.
        reason: String,
    },
    /// the key cannot be exported to a shell script
    #[error("parameter {0:?} is not a valid shell variable name")]
    NotShellIdentifier(String),
}

/// An ordered bag of string test parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestParams {
    values: BTreeMap<String, String>,
}

impl TestParams {
    /// Returns an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `key=value;key=value` string.
    ///
    /// Empty segments are ignored, whitespace around keys and values is
    /// trimmed, and only the first `=` of a segment separates key from value.
    /// Later duplicates override earlier ones.
    pub fn parse(s: &str) -> Result<Self, ParamsError> {
        let mut params = Self::new();
        for segment in s.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ParamsError::MissingSeparator(segment.to_owned()))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(ParamsError::EmptyKey(segment.to_owned()));
            }
            params.set(key, value.trim());
        }
        Ok(params)
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder form of [`Self::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Returns the raw value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns true if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns the raw value of `key`, or an error if it is absent.
    pub fn require(&self, key: &str) -> Result<&str, ParamsError> {
        self.get(key)
            .ok_or_else(|| ParamsError::Missing(key.to_owned()))
    }

    /// Parses the value of `key` as `T`, if present.
    pub fn parse_value<T>(&self, key: &str) -> Result<Option<T>, ParamsError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|err: T::Err| ParamsError::Invalid {
                    key: key.to_owned(),
                    value: value.to_owned(),
                    reason: err.to_string(),
                })
            })
            .transpose()
    }

    /// Parses the value of `key` as `T`, failing if it is absent.
    pub fn require_parsed<T>(&self, key: &str) -> Result<T, ParamsError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.parse_value(key)?
            .ok_or_else(|| ParamsError::Missing(key.to_owned()))
    }

    /// Parses the value of `key` as `T`, falling back to `default` if absent.
    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ParamsError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        Ok(self.parse_value(key)?.unwrap_or(default))
    }

    /// Splits a comma-separated value into its trimmed, non-empty items.
    pub fn list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overlays `other` on top of this bag; values in `other` win.
    pub fn merge(&mut self, other: &TestParams) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    /// Iterates over the parameters in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The number of parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Renders the bag as a `constants.sh` file to be sourced by guest
    /// scripts.
    pub fn to_constants_sh(&self) -> Result<String, ParamsError> {
        let mut out = String::new();
        for (key, value) in self.iter() {
            if !is_shell_identifier(key) {
                return Err(ParamsError::NotShellIdentifier(key.to_owned()));
            }
            out.push_str(key);
            out.push_str("=\"");
            for c in value.chars() {
                if matches!(c, '"' | '\\' | '$' | '`') {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push_str("\"\n");
        }
        Ok(out)
    }
}

fn is_shell_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

impl FromStr for TestParams {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TestParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.iter().enumerate() {
            if i != 0 {
                f.write_str(";")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TestParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Serialize for TestParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TestParams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Runbooks may give either the `a=b;c=d` form or a mapping. Mapping
        // values may be written as YAML numbers or booleans.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Scalar {
            Bool(bool),
            Int(i64),
            Float(f64),
            Str(String),
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Inline(String),
            Map(BTreeMap<String, Scalar>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Inline(s) => Self::parse(&s).map_err(serde::de::Error::custom),
            Repr::Map(map) => Ok(map
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Scalar::Bool(b) => b.to_string(),
                        Scalar::Int(i) => i.to_string(),
                        Scalar::Float(f) => f.to_string(),
                        Scalar::Str(s) => s,
                    };
                    (k, v)
                })
                .collect()),
        }
    }
}
