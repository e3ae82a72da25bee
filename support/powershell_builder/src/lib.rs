// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PowerShell Command Builder
//!
//! Provides a builder for constructing PowerShell command lines out of
//! cmdlets, typed argument values and pipelines, and for running them on the
//! host.

#![forbid(unsafe_code)]

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use thiserror::Error;

/// The PowerShell executable for this host.
#[cfg(windows)]
pub const POWERSHELL: &str = "powershell.exe";
/// The PowerShell executable for this host.
#[cfg(not(windows))]
pub const POWERSHELL: &str = "pwsh";

/// Error running a PowerShell command.
#[derive(Debug, Error)]
pub enum PowerShellError {
    /// powershell could not be started
    #[error("failed to launch {POWERSHELL}")]
    Launch(#[source] std::io::Error),
    /// the script returned a failure status
    #[error("powershell exited with {status}: {stderr}")]
    Failed {
        /// The exit status.
        status: ExitStatus,
        /// Captured standard error.
        stderr: String,
    },
    /// the script output is not utf-8
    #[error("powershell output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// A PowerShell script builder
pub struct PowerShellBuilder(Command);

impl PowerShellBuilder {
    /// Create a new PowerShell command
    pub fn new() -> Self {
        let mut cmd = Command::new(POWERSHELL);
        cmd.arg("-NoProfile").arg("-NonInteractive");
        Self(cmd)
    }

    /// Start a new Cmdlet
    pub fn cmdlet<S: AsRef<str>>(self, cmdlet: S) -> PowerShellCmdletBuilder {
        PowerShellCmdletBuilder(self.0).positional(RawVal::new(cmdlet.as_ref()))
    }

    /// Assign the output of the cmdlet to a variable
    pub fn cmdlet_to_var<S: AsRef<str>>(
        self,
        cmdlet: S,
        varname: &Variable,
    ) -> PowerShellCmdletBuilder {
        PowerShellCmdletBuilder(self.0)
            .positional(varname)
            .positional(RawVal::new("="))
            .finish()
            .cmdlet(cmdlet)
    }

    /// Use Select-Object to return a single property of the piped object
    pub fn select_object_property<S: AsRef<str>>(self, property: S) -> PowerShellCmdletBuilder {
        self.cmdlet("Select-Object")
            .arg("ExpandProperty", RawVal::new(property.as_ref()))
    }

    /// The arguments passed to PowerShell so far.
    pub fn args(&self) -> impl Iterator<Item = &OsStr> {
        self.0.get_args()
    }

    /// Finish building the powershell script and return the inner `Command`
    pub fn build(self) -> Command {
        self.0
    }

    /// Run the script, discarding its output.
    pub fn run(self) -> Result<(), PowerShellError> {
        self.output().map(drop)
    }

    /// Run the script and return its standard output, trimmed.
    pub fn output(mut self) -> Result<String, PowerShellError> {
        self.0.stdin(Stdio::null());
        let cmd_debug = format!("{:?}", self.0);
        tracing::debug!(cmd = cmd_debug, "executing powershell");

        let output = self.0.output().map_err(PowerShellError::Launch)?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(PowerShellError::Failed {
                status: output.status,
                stderr,
            });
        }
        if !stderr.is_empty() {
            tracing::debug!(cmd = cmd_debug, stderr, "powershell wrote to stderr");
        }
        Ok(String::from_utf8(output.stdout)?.trim().to_owned())
    }
}

/// A PowerShell Cmdlet builder
pub struct PowerShellCmdletBuilder(Command);

impl PowerShellCmdletBuilder {
    /// Add a flag to the cmdlet
    pub fn flag<S: AsRef<OsStr>>(mut self, flag: S) -> Self {
        let mut arg = OsString::from("-");
        arg.push(flag);
        self.0.arg(arg);
        self
    }

    /// Optionally add a flag to the cmdlet
    pub fn flag_opt<S: AsRef<OsStr>>(self, flag: Option<S>) -> Self {
        if let Some(flag) = flag {
            self.flag(flag)
        } else {
            self
        }
    }

    /// Add a positional argument to the cmdlet
    pub fn positional<S: AsVal>(mut self, positional: S) -> Self {
        self.0.arg(positional.as_val());
        self
    }

    /// Optionally add a positional argument to the cmdlet
    pub fn positional_opt<S: AsVal>(self, positional: Option<S>) -> Self {
        if let Some(positional) = positional {
            self.positional(positional)
        } else {
            self
        }
    }

    /// Add a named argument to the cmdlet
    pub fn arg<S: AsRef<OsStr>, T: AsVal>(self, name: S, value: T) -> Self {
        self.flag(name).positional(value)
    }

    /// Optionally add a named argument to the cmdlet
    pub fn arg_opt<S: AsRef<OsStr>, T: AsVal>(self, name: S, value: Option<T>) -> Self {
        if let Some(value) = value {
            self.arg(name, value)
        } else {
            self
        }
    }

    /// Finish the cmdlet
    pub fn finish(self) -> PowerShellBuilder {
        PowerShellBuilder(self.0)
    }

    /// Finish the cmdlet with a pipeline operator
    pub fn pipeline(mut self) -> PowerShellBuilder {
        self.0.arg("|");
        self.finish()
    }

    /// Finish the cmdlet with a semicolon
    pub fn next(mut self) -> PowerShellBuilder {
        self.0.arg(";");
        self.finish()
    }
}

/// Trait for converting to powershell value in raw OsStr form
pub trait AsVal {
    /// Convert to powershell value OsStr
    fn as_val(&self) -> OsString;
}

impl<T: AsVal + ?Sized> AsVal for &T {
    fn as_val(&self) -> OsString {
        (*self).as_val()
    }
}

/// Wrap a string in double quotes, escaping the characters PowerShell
/// interprets inside an expandable string.
pub fn quote_str(s: &OsStr) -> OsString {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for c in s.to_string_lossy().chars() {
        if matches!(c, '"' | '`' | '$') {
            quoted.push('`');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted.into()
}

impl AsVal for str {
    fn as_val(&self) -> OsString {
        quote_str(self.as_ref())
    }
}

impl AsVal for String {
    fn as_val(&self) -> OsString {
        quote_str(self.as_ref())
    }
}

impl AsVal for Path {
    fn as_val(&self) -> OsString {
        quote_str(self.as_os_str())
    }
}

impl AsVal for PathBuf {
    fn as_val(&self) -> OsString {
        quote_str(self.as_os_str())
    }
}

impl AsVal for jiff::Timestamp {
    fn as_val(&self) -> OsString {
        quote_str(self.to_string().as_ref())
    }
}

impl AsVal for bool {
    fn as_val(&self) -> OsString {
        OsString::from(if *self { "$true" } else { "$false" })
    }
}

macro_rules! disp {
    ($($ty:ty),* $(,)?) => {
        $(
            impl AsVal for $ty {
                fn as_val(&self) -> OsString {
                    self.to_string().into()
                }
            }
        )*
    }
}

disp!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

/// A raw powershell value, passed through without quoting
pub struct RawVal<T>(T);

impl<T: AsRef<OsStr>> RawVal<T> {
    /// Create a new raw powershell value
    pub fn new(arg: T) -> Self {
        Self(arg)
    }
}

impl<T: AsRef<OsStr>> AsVal for RawVal<T> {
    fn as_val(&self) -> OsString {
        self.0.as_ref().to_owned()
    }
}

/// A powershell variable
pub struct Variable(String);

impl Variable {
    /// Create a new powershell variable
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(format!("${}", name.as_ref()))
    }
}

impl AsVal for Variable {
    fn as_val(&self) -> OsString {
        self.0.clone().into()
    }
}

/// A powershell array
pub struct Array(OsString);

impl Array {
    /// Create a new powershell array
    pub fn new<T: AsVal>(v: impl IntoIterator<Item = T>) -> Self {
        let mut args = OsString::from("@(");
        for (i, arg) in v.into_iter().enumerate() {
            if i != 0 {
                args.push("; ");
            }
            args.push(arg.as_val());
        }
        args.push(")");
        Self(args)
    }
}

impl AsVal for Array {
    fn as_val(&self) -> OsString {
        self.0.clone()
    }
}

/// A powershell script block
pub struct Script(String);

impl Script {
    /// Create a new powershell script block
    pub fn new(script: impl AsRef<str>) -> Self {
        Self(format!("{{ {} }}", script.as_ref()))
    }
}

impl AsVal for Script {
    fn as_val(&self) -> OsString {
        self.0.clone().into()
    }
}
