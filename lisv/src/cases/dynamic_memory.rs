// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::ScriptJob;
use super::record_state;
use crate::SIZE_1_MB;
use crate::TestContext;
use crate::TestResult;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::requirements::Platform;
use crate::requirements::TestCaseRequirements;
use crate::requirements::TestRequirement;
use crate::state::GuestState;
use crate::test::TestCase;
use crate::threshold::Comparison;
use crate::threshold::Threshold;
use crate::threshold::percent_change;
use anyhow::Context as _;
use std::path::Path;
use std::time::Duration;

/// Checks that Hyper-V dynamic memory follows guest demand.
///
/// A guest script allocates memory for a while and then releases it. The
/// host must assign more memory while the pressure lasts, and reclaim at
/// least `min_decrease_pct` percent of it once the script has finished.
pub struct DynamicMemoryTest {
    name: String,
    job: ScriptJob,
    pressure: Duration,
    settle: Duration,
    min_decrease_pct: f64,
    requirements: TestCaseRequirements,
}

impl DynamicMemoryTest {
    /// Builds the test. On top of the [`ScriptJob`] parameters it reads
    /// `pressure_secs` (default 60), `settle_secs` (default 60) and
    /// `min_decrease_pct` (default 10).
    pub fn from_params(
        name: impl Into<String>,
        params: &TestParams,
        script_dir: &Path,
    ) -> Result<Self, ParamsError> {
        let hyperv = TestRequirement::Platform(Platform::HyperV);
        let requirements = match TestCaseRequirements::from_params(params)? {
            Some(reqs) => reqs.and(hyperv),
            None => TestCaseRequirements::new(hyperv),
        };
        Ok(Self {
            name: name.into(),
            job: ScriptJob::from_params(params, script_dir)?,
            pressure: Duration::from_secs(params.get_or("pressure_secs", 60)?),
            settle: Duration::from_secs(params.get_or("settle_secs", 60)?),
            min_decrease_pct: params.get_or("min_decrease_pct", 10.0)?,
            requirements,
        })
    }
}

fn mb(bytes: u64) -> u64 {
    bytes / SIZE_1_MB
}

impl TestCase for DynamicMemoryTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Option<&TestCaseRequirements> {
        Some(&self.requirements)
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> anyhow::Result<TestResult> {
        let host = ctx.host()?;
        let vm = ctx.vm_name.clone();

        let before = host.memory_assigned(&vm).context("baseline memory")?;
        tracing::info!(vm, assigned_mb = mb(before), "memory before pressure");

        let under = self.job.start(ctx).and_then(|()| {
            ctx.clock.sleep(self.pressure);
            let assigned = host.memory_assigned(&vm).context("memory under pressure")?;
            let demand = host.memory_demand(&vm).context("memory demand")?;
            tracing::info!(
                vm,
                assigned_mb = mb(assigned),
                demand_mb = mb(demand),
                "memory under pressure"
            );
            Ok(assigned)
        });
        let state = match &under {
            Ok(_) => self.job.wait(ctx),
            Err(_) => Err(anyhow::anyhow!("pressure script was not started")),
        };
        self.job.collect_logs(ctx);
        let under = under?;
        let state = state?;

        if state != GuestState::TestCompleted {
            return record_state(ctx, &self.job, state);
        }

        ctx.log_summary(
            "memory grows under pressure",
            TestResult::from_bool(under > before),
            format!("{} MB -> {} MB", mb(before), mb(under)),
        );

        ctx.clock.sleep(self.settle);
        let after = host.memory_assigned(&vm).context("memory after release")?;
        let decrease = percent_change(under as f64, after as f64)
            .map(|change| -change)
            .context("no memory assigned under pressure")?;
        let check = Threshold::new(
            "memory_decrease_pct",
            Comparison::AtLeast(self.min_decrease_pct),
        )
        .check(decrease);
        ctx.log_summary(
            "memory reclaimed after release",
            check.result(),
            format!("{} MB -> {} MB ({})", mb(under), mb(after), check.message),
        );

        Ok(ctx.summary.final_result())
    }
}
