// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The YAML runbook: which guest to test, and with what.

use crate::cases::CpuOfflineTest;
use crate::cases::DiskHotAddTest;
use crate::cases::DynamicMemoryTest;
use crate::cases::GuestScriptTest;
use crate::cases::NetworkPerfTest;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::remote::SshConfig;
use crate::requirements::Platform;
use crate::test::TestCase;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from loading a runbook.
#[derive(Debug, Error)]
pub enum RunbookError {
    /// the file could not be read
    #[error("failed to read runbook")]
    Read(#[from] std::io::Error),
    /// the YAML is malformed or does not match the schema
    #[error("invalid runbook")]
    Yaml(#[from] serde_yaml::Error),
    /// two tests share a name
    #[error("duplicate test name {0:?}")]
    DuplicateTest(String),
    /// a test name cannot be used as a file name
    #[error("invalid test name {0:?}")]
    InvalidName(String),
    /// a test asks to run zero times
    #[error("test {0:?} must run at least once")]
    ZeroTimes(String),
    /// host-side tests need to know which VM to drive
    #[error("test {0:?} needs host access but the runbook sets no vm_name")]
    MissingVmName(String),
    /// a test's parameters do not fit its kind
    #[error("invalid parameters for test {test:?}")]
    Params {
        /// The test name.
        test: String,
        /// What is wrong.
        #[source]
        source: ParamsError,
    },
}

/// The bundled test kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// [`GuestScriptTest`]
    GuestScript,
    /// [`DynamicMemoryTest`]
    DynamicMemory,
    /// [`DiskHotAddTest`]
    DiskHotAdd,
    /// [`NetworkPerfTest`]
    NetworkPerf,
    /// [`CpuOfflineTest`]
    CpuOffline,
}

impl TestKind {
    /// Returns true for kinds that drive the VM through the host.
    pub fn needs_host(self) -> bool {
        matches!(self, TestKind::DynamicMemory | TestKind::DiskHotAdd)
    }

    /// The runbook spelling of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::GuestScript => "guest_script",
            TestKind::DynamicMemory => "dynamic_memory",
            TestKind::DiskHotAdd => "disk_hot_add",
            TestKind::NetworkPerf => "network_perf",
            TestKind::CpuOffline => "cpu_offline",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the `tests` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    /// Unique test name; also names its log files.
    pub name: String,
    /// Which bundled case to run.
    pub kind: TestKind,
    /// Case parameters, layered over the runbook's global parameters.
    #[serde(default)]
    pub params: TestParams,
    /// How many more times to run a `FAIL`ed or `ABORTED` test.
    #[serde(default)]
    pub retry: u32,
    /// How many times to run the test.
    #[serde(default = "default_times")]
    pub times: u32,
}

fn default_times() -> u32 {
    1
}

/// A parsed runbook.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Runbook {
    /// Where the guest runs.
    pub platform: Platform,
    /// The VM name as known to the host. Needed by host-side cases.
    #[serde(default)]
    pub vm_name: String,
    /// Results and logs go here.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Guest scripts are looked up here. Defaults to the runbook's directory.
    #[serde(default)]
    pub script_dir: Option<PathBuf>,
    /// Host directory for hot-added VHDX files. Defaults to the log
    /// directory.
    #[serde(default)]
    pub vhd_dir: Option<PathBuf>,
    /// How to reach the guest.
    pub ssh: SshConfig,
    /// Parameters shared by all tests.
    #[serde(default)]
    pub params: TestParams,
    /// The tests, run in order.
    pub tests: Vec<TestSpec>,
}

fn default_log_dir() -> PathBuf {
    "lisv-logs".into()
}

/// Replaces a leading `~` with the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_owned(),
        },
        Err(_) => path.to_owned(),
    }
}

impl Runbook {
    /// Loads and validates the runbook at `path`.
    pub fn load(path: &Path) -> Result<Self, RunbookError> {
        let text = fs_err::read_to_string(path)?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::from_yaml(&text, base)
    }

    /// Parses and validates a runbook. Relative script paths resolve
    /// against `base_dir`.
    pub fn from_yaml(text: &str, base_dir: &Path) -> Result<Self, RunbookError> {
        let mut runbook: Runbook = serde_yaml::from_str(text)?;
        runbook.log_dir = expand_tilde(&runbook.log_dir);
        runbook.script_dir = Some(match &runbook.script_dir {
            Some(dir) => base_dir.join(expand_tilde(dir)),
            None => base_dir.to_owned(),
        });
        runbook.vhd_dir = runbook.vhd_dir.as_deref().map(expand_tilde);
        runbook.ssh.identity_file = runbook.ssh.identity_file.as_deref().map(expand_tilde);

        let mut names = BTreeSet::new();
        for spec in &runbook.tests {
            if spec.name.is_empty()
                || spec.name.starts_with('.')
                || spec.name.contains(['/', '\\'])
            {
                return Err(RunbookError::InvalidName(spec.name.clone()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(RunbookError::DuplicateTest(spec.name.clone()));
            }
            if spec.times == 0 {
                return Err(RunbookError::ZeroTimes(spec.name.clone()));
            }
            if runbook.platform == Platform::HyperV
                && spec.kind.needs_host()
                && runbook.vm_name.trim().is_empty()
            {
                return Err(RunbookError::MissingVmName(spec.name.clone()));
            }
        }
        // Catch parameter mistakes before anything runs.
        runbook.cases()?;
        Ok(runbook)
    }

    /// The parameters `spec` runs with: its own over the global ones.
    pub fn test_params(&self, spec: &TestSpec) -> TestParams {
        let mut params = self.params.clone();
        params.merge(&spec.params);
        params
    }

    /// Where host scripts are looked up.
    pub fn script_dir(&self) -> &Path {
        self.script_dir.as_deref().unwrap_or(Path::new("."))
    }

    /// Where hot-added disks are created on the host.
    pub fn vhd_dir(&self) -> &Path {
        self.vhd_dir.as_deref().unwrap_or(&self.log_dir)
    }

    /// Builds the test case for `spec`.
    pub fn build_case(&self, spec: &TestSpec) -> Result<Box<dyn TestCase>, RunbookError> {
        let params = self.test_params(spec);
        let name = spec.name.clone();
        let dir = self.script_dir();
        let case: Box<dyn TestCase> = match spec.kind {
            TestKind::GuestScript => {
                GuestScriptTest::from_params(name, &params, dir).map(|c| Box::new(c) as _)
            }
            TestKind::DynamicMemory => {
                DynamicMemoryTest::from_params(name, &params, dir).map(|c| Box::new(c) as _)
            }
            TestKind::DiskHotAdd => {
                DiskHotAddTest::from_params(name, &params, dir).map(|c| Box::new(c) as _)
            }
            TestKind::NetworkPerf => {
                NetworkPerfTest::from_params(name, &params, dir).map(|c| Box::new(c) as _)
            }
            TestKind::CpuOffline => {
                CpuOfflineTest::from_params(name, &params, dir).map(|c| Box::new(c) as _)
            }
        }
        .map_err(|source| RunbookError::Params {
            test: spec.name.clone(),
            source,
        })?;
        Ok(case)
    }

    /// Builds every test case, in order.
    pub fn cases(&self) -> Result<Vec<Box<dyn TestCase>>, RunbookError> {
        self.tests.iter().map(|spec| self.build_case(spec)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNBOOK: &str = r#"
platform: hyperv
vm_name: lisv-guest
log_dir: /var/log/lisv
ssh:
  host: 10.0.0.5
  user: lisa
  identity_file: ~/.ssh/id_rsa
params: "NIC=NetworkAdapter;SUPPORTED_DISTROS=ubuntu,rhel;timeout_secs=600"
tests:
  - name: verify-vss
    kind: guest_script
    params: { script: vss_backup.sh, timeout_secs: 3600 }
  - name: dm-balloon
    kind: dynamic_memory
    params: "script=dm_pressure.sh;min_decrease_pct=20"
  - name: cpu
    kind: cpu_offline
    retry: 2
"#;

    #[test]
    fn parse_and_merge() {
        let rb = Runbook::from_yaml(RUNBOOK, Path::new("/runbooks")).unwrap();
        assert_eq!(rb.platform, Platform::HyperV);
        assert_eq!(rb.vm_name, "lisv-guest");
        assert_eq!(rb.ssh.port, 22);
        assert_eq!(rb.script_dir(), Path::new("/runbooks"));
        assert_eq!(rb.vhd_dir(), Path::new("/var/log/lisv"));
        assert_eq!(rb.tests.len(), 3);
        assert_eq!(rb.tests[1].kind, TestKind::DynamicMemory);
        assert_eq!((rb.tests[0].retry, rb.tests[0].times), (0, 1));
        assert_eq!((rb.tests[2].retry, rb.tests[2].times), (2, 1));

        let vss = rb.test_params(&rb.tests[0]);
        assert_eq!(vss.get("timeout_secs"), Some("3600"));
        assert_eq!(vss.get("NIC"), Some("NetworkAdapter"));
        let dm = rb.test_params(&rb.tests[1]);
        assert_eq!(dm.get("timeout_secs"), Some("600"));
        assert_eq!(dm.get("min_decrease_pct"), Some("20"));

        let cases = rb.cases().unwrap();
        let names: Vec<_> = cases.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["verify-vss", "dm-balloon", "cpu"]);
    }

    #[test]
    fn tilde_is_expanded() {
        let rb = Runbook::from_yaml(RUNBOOK, Path::new(".")).unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(rb.ssh.identity_file, Some(home.join(".ssh/id_rsa")));
        }
        assert_eq!(expand_tilde(Path::new("/abs")), Path::new("/abs"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let yaml = RUNBOOK.replace("kind: cpu_offline", "kind: hibernate");
        assert!(matches!(
            Runbook::from_yaml(&yaml, Path::new(".")),
            Err(RunbookError::Yaml(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let yaml = RUNBOOK.replace("name: cpu", "name: verify-vss");
        assert!(matches!(
            Runbook::from_yaml(&yaml, Path::new(".")),
            Err(RunbookError::DuplicateTest(n)) if n == "verify-vss"
        ));
    }

    #[test]
    fn bad_params_are_reported_at_load() {
        let yaml = RUNBOOK.replace("params: { script: vss_backup.sh, timeout_secs: 3600 }", "");
        assert!(matches!(
            Runbook::from_yaml(&yaml, Path::new(".")),
            Err(RunbookError::Params { test, source: ParamsError::Missing(_) }) if test == "verify-vss"
        ));
    }

    #[test]
    fn malformed_min_vcpus_is_reported_at_load() {
        let yaml = RUNBOOK.replace(
            "params: \"script=dm_pressure.sh;min_decrease_pct=20\"",
            "params: \"script=dm_pressure.sh;MIN_VCPUS=four\"",
        );
        assert!(matches!(
            Runbook::from_yaml(&yaml, Path::new(".")),
            Err(RunbookError::Params { test, source: ParamsError::Invalid { key, .. } })
                if test == "dm-balloon" && key == "MIN_VCPUS"
        ));
    }

    #[test]
    fn zero_times_is_rejected() {
        let yaml = RUNBOOK.replace("retry: 2", "times: 0");
        assert!(matches!(
            Runbook::from_yaml(&yaml, Path::new(".")),
            Err(RunbookError::ZeroTimes(n)) if n == "cpu"
        ));
    }

    #[test]
    fn host_tests_need_a_vm_name() {
        let yaml = RUNBOOK.replace("vm_name: lisv-guest\n", "");
        assert!(matches!(
            Runbook::from_yaml(&yaml, Path::new(".")),
            Err(RunbookError::MissingVmName(n)) if n == "dm-balloon"
        ));
        let yaml = RUNBOOK.replace("vm_name: lisv-guest", "vm_name: \"  \"");
        assert!(Runbook::from_yaml(&yaml, Path::new(".")).is_err());

        // Guest-only runbooks do not need one.
        let guest_only = RUNBOOK
            .replace("vm_name: lisv-guest\n", "")
            .replace("kind: dynamic_memory", "kind: guest_script");
        assert!(Runbook::from_yaml(&guest_only, Path::new(".")).is_ok());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{RUNBOOK}extra: 1\n");
        assert!(Runbook::from_yaml(&yaml, Path::new(".")).is_err());
    }
}
