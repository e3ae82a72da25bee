// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::TestContext;
use crate::TestResult;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::parse::parse_cpu_list;
use crate::remote::GuestShell;
use crate::remote::RunOptions;
use crate::requirements::TestCaseRequirements;
use crate::requirements::TestRequirement;
use crate::test::TestCase;
use anyhow::Context as _;
use std::collections::BTreeSet;
use std::path::Path;

const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

/// Takes every CPU but the boot CPU offline through sysfs, then brings them
/// back and checks the original set is online again.
pub struct CpuOfflineTest {
    name: String,
    requirements: TestCaseRequirements,
}

impl CpuOfflineTest {
    /// Builds the test. It needs a guest with at least two vCPUs.
    pub fn from_params(
        name: impl Into<String>,
        params: &TestParams,
        _script_dir: &Path,
    ) -> Result<Self, ParamsError> {
        let two_cpus = TestRequirement::MinVcpus(2);
        Ok(Self {
            name: name.into(),
            requirements: match TestCaseRequirements::from_params(params)? {
                Some(reqs) => reqs.and(two_cpus),
                None => TestCaseRequirements::new(two_cpus),
            },
        })
    }
}

fn online_cpus(guest: &dyn GuestShell) -> anyhow::Result<BTreeSet<u32>> {
    let list = guest.read_file(ONLINE_CPUS)?;
    Ok(parse_cpu_list(&list)?)
}

fn set_online(guest: &dyn GuestShell, cpu: u32, online: bool) -> anyhow::Result<bool> {
    let out = guest.run(
        &format!(
            "echo {} > /sys/devices/system/cpu/cpu{cpu}/online",
            u8::from(online)
        ),
        &RunOptions::new().sudo().allow_failure(),
    )?;
    if !out.success() {
        tracing::warn!(cpu, online, stderr = out.stderr, "cpu state change refused");
    }
    Ok(out.success())
}

fn format_cpus(cpus: &BTreeSet<u32>) -> String {
    cpus.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl TestCase for CpuOfflineTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Option<&TestCaseRequirements> {
        Some(&self.requirements)
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> anyhow::Result<TestResult> {
        let guest = ctx.guest;
        let original = online_cpus(guest).context("failed to read online cpus")?;
        tracing::info!(cpus = format_cpus(&original), "online cpus");
        let secondary: Vec<u32> = original.iter().copied().filter(|&c| c != 0).collect();

        {
            let secondary = secondary.clone();
            ctx.add_post_test_hook("bring cpus back online", move |passed| {
                if !passed {
                    for &cpu in &secondary {
                        set_online(guest, cpu, true)?;
                    }
                }
                Ok(())
            });
        }

        for &cpu in &secondary {
            set_online(guest, cpu, false)?;
        }
        let offline = online_cpus(guest)?;
        ctx.log_summary(
            "only cpu0 online",
            TestResult::from_bool(offline == BTreeSet::from([0])),
            format!("online: {}", format_cpus(&offline)),
        );

        for &cpu in &secondary {
            set_online(guest, cpu, true)?;
        }
        let restored = online_cpus(guest)?;
        ctx.log_summary(
            "all cpus back online",
            TestResult::from_bool(restored == original),
            format!(
                "expected {}, online: {}",
                format_cpus(&original),
                format_cpus(&restored)
            ),
        );

        Ok(ctx.summary.final_result())
    }
}
