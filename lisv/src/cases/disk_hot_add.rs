// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::SIZE_1_GB;
use crate::TestContext;
use crate::TestResult;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::parse::parse_size;
use crate::poll::retry;
use crate::remote::GuestShell;
use crate::requirements::Platform;
use crate::requirements::TestCaseRequirements;
use crate::requirements::TestRequirement;
use crate::test::TestCase;
use anyhow::Context as _;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

const LIST_DISKS: &str = "lsblk -b -d -n -o NAME,SIZE,TYPE";
const RESCAN_SCSI: &str =
    "for scan in /sys/class/scsi_host/host*/scan; do echo '- - -' > \"$scan\"; done";

/// Hot-adds a SCSI disk through the host and checks that the guest sees it
/// with the requested size. The disk is removed again after the test.
pub struct DiskHotAddTest {
    name: String,
    disk_size: u64,
    attempts: u32,
    requirements: TestCaseRequirements,
}

impl DiskHotAddTest {
    /// Builds the test from `disk_size` (default `1GB`) and `rescan_attempts`
    /// (default 10, three seconds apart).
    pub fn from_params(
        name: impl Into<String>,
        params: &TestParams,
        _script_dir: &Path,
    ) -> Result<Self, ParamsError> {
        let disk_size = match params.get("disk_size") {
            Some(size) => parse_size(size).map_err(|err| ParamsError::Invalid {
                key: "disk_size".into(),
                value: size.into(),
                reason: err.to_string(),
            })?,
            None => SIZE_1_GB,
        };
        let hyperv = TestRequirement::Platform(Platform::HyperV);
        Ok(Self {
            name: name.into(),
            disk_size,
            attempts: params.get_or("rescan_attempts", 10)?,
            requirements: match TestCaseRequirements::from_params(params)? {
                Some(reqs) => reqs.and(hyperv),
                None => TestCaseRequirements::new(hyperv),
            },
        })
    }
}

/// Whole disks in the guest, by kernel name, with their size in bytes.
fn list_disks(guest: &dyn GuestShell) -> anyhow::Result<BTreeMap<String, u64>> {
    let out = guest.exec(LIST_DISKS).context("failed to list block devices")?;
    parse_lsblk(&out)
}

fn parse_lsblk(text: &str) -> anyhow::Result<BTreeMap<String, u64>> {
    let mut disks = BTreeMap::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(size), Some(kind)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if kind == "disk" {
            let size = size
                .parse()
                .with_context(|| format!("bad lsblk size in {line:?}"))?;
            disks.insert(name.to_owned(), size);
        }
    }
    Ok(disks)
}

impl TestCase for DiskHotAddTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Option<&TestCaseRequirements> {
        Some(&self.requirements)
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> anyhow::Result<TestResult> {
        let host = ctx.host()?;
        let vm = ctx.vm_name.clone();
        let before = list_disks(ctx.guest)?;
        tracing::info!(disks = ?before.keys().collect::<Vec<_>>(), "guest disks before hot add");

        let disk = host.add_scsi_disk(&vm, self.disk_size)?;
        {
            let vm = vm.clone();
            let disk = disk.clone();
            ctx.add_post_test_hook("remove hot-added disk", move |_| {
                host.remove_scsi_disk(&vm, &disk)
            });
        }

        let guest = ctx.guest;
        let rescan = |_: u32| -> anyhow::Result<(String, u64)> {
            guest.exec_sudo(RESCAN_SCSI)?;
            let mut added = list_disks(guest)?
                .into_iter()
                .filter(|(name, _)| !before.contains_key(name));
            match (added.next(), added.next()) {
                (Some(dev), None) => Ok(dev),
                (None, _) => anyhow::bail!("no new disk in the guest yet"),
                (Some(_), Some(_)) => anyhow::bail!("more than one new disk in the guest"),
            }
        };
        let (dev, size) = retry(self.attempts, Duration::from_secs(3), ctx.clock, rescan)?;
        tracing::info!(dev, size, "guest sees hot-added disk");

        ctx.log_summary(
            "hot-added disk size",
            TestResult::from_bool(size == self.disk_size),
            format!("/dev/{dev}: expected {} bytes, got {size}", self.disk_size),
        );
        Ok(ctx.summary.final_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_test;
    use crate::testutil::FakeClock;
    use crate::testutil::FakeHost;
    use crate::testutil::ScriptedShell;
    use test_with_tracing::test;

    const BEFORE: &str = "sda 42949672960 disk\nsr0 1073741312 rom\n";

    fn run(shell: &ScriptedShell, host: &FakeHost, params: &str) -> crate::TestOutcome {
        let dir = tempfile::tempdir().unwrap();
        let params: TestParams = params.parse().unwrap();
        let test = DiskHotAddTest::from_params("hot_add", &params, dir.path()).unwrap();
        let clock = FakeClock::new();
        let ctx = TestContext::new("hot_add", params, Platform::HyperV, shell, dir.path())
            .with_host(host, "guest-1")
            .with_clock(&clock);
        run_test(&test, ctx)
    }

    #[test]
    fn lsblk_output() {
        let disks = parse_lsblk("sda 42949672960 disk\nsda1 1048576 part\nsr0 1024 rom\n\n")
            .unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks["sda"], 42949672960);
        assert!(parse_lsblk("sdb big disk").is_err());
    }

    #[test]
    fn new_disk_with_matching_size_passes() {
        let host = FakeHost::new();
        let shell = ScriptedShell::new()
            .on("lsblk", Ok(BEFORE))
            .on("lsblk", Ok(BEFORE))
            .on("lsblk", Ok("sda 42949672960 disk\nsdb 2147483648 disk\n"));
        let outcome = run(&shell, &host, "disk_size=2GB");
        assert_eq!(outcome.result, TestResult::Pass);
        assert!(outcome.summary.entries()[0].detail.starts_with("/dev/sdb"));
        assert!(shell.ran("scsi_host"));
        assert_eq!(host.added_disks().len(), 1);
        assert_eq!(host.removed_disks(), host.added_disks());
    }

    #[test]
    fn size_mismatch_fails_and_still_removes_disk() {
        let host = FakeHost::new();
        let shell = ScriptedShell::new()
            .on("lsblk", Ok(BEFORE))
            .on("lsblk", Ok("sda 42949672960 disk\nsdb 1073741824 disk\n"));
        let outcome = run(&shell, &host, "disk_size=2GB");
        assert_eq!(outcome.result, TestResult::Fail);
        assert_eq!(host.removed_disks().len(), 1);
    }

    #[test]
    fn disk_never_appears_aborts() {
        let host = FakeHost::new();
        let shell = ScriptedShell::new().always("lsblk", Ok(BEFORE));
        let outcome = run(&shell, &host, "rescan_attempts=3");
        assert_eq!(outcome.result, TestResult::Aborted);
        assert!(outcome.error.unwrap().contains("no new disk"));
        assert_eq!(host.removed_disks().len(), 1);
    }

    #[test]
    fn host_failure_aborts_without_cleanup() {
        let host = FakeHost::new().failing_disk_add();
        let shell = ScriptedShell::new().always("lsblk", Ok(BEFORE));
        let outcome = run(&shell, &host, "");
        assert_eq!(outcome.result, TestResult::Aborted);
        assert!(host.removed_disks().is_empty());
    }

    #[test]
    fn bad_size_is_a_param_error() {
        let params: TestParams = "disk_size=lots".parse().unwrap();
        assert!(DiskHotAddTest::from_params("x", &params, Path::new(".")).is_err());
    }
}
