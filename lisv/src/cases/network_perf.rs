// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::ScriptJob;
use super::record_state;
use crate::TestContext;
use crate::TestResult;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::parse::parse_csv;
use crate::requirements::TestCaseRequirements;
use crate::state::GuestState;
use crate::test::TestCase;
use crate::threshold::Comparison;
use crate::threshold::Threshold;
use crate::threshold::mean;
use anyhow::Context as _;
use std::path::Path;

const THROUGHPUT_COLUMN: &str = "throughput_gbps";

/// Runs a throughput script and checks the mean of the `throughput_gbps`
/// column of its CSV report.
pub struct NetworkPerfTest {
    name: String,
    job: ScriptJob,
    report: String,
    threshold: Threshold,
    requirements: Option<TestCaseRequirements>,
}

impl NetworkPerfTest {
    /// Builds the test. On top of the [`ScriptJob`] parameters it reads
    /// `report` (default `report.csv`) and the required
    /// `min_throughput_gbps` threshold (`9.5`, `>=9.5`, `=10±5%`, ...).
    pub fn from_params(
        name: impl Into<String>,
        params: &TestParams,
        script_dir: &Path,
    ) -> Result<Self, ParamsError> {
        let comparison: Comparison = params.require_parsed("min_throughput_gbps")?;
        Ok(Self {
            name: name.into(),
            job: ScriptJob::from_params(params, script_dir)?,
            report: params.get("report").unwrap_or("report.csv").to_owned(),
            threshold: Threshold::new(THROUGHPUT_COLUMN, comparison),
            requirements: TestCaseRequirements::from_params(params)?,
        })
    }
}

impl TestCase for NetworkPerfTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Option<&TestCaseRequirements> {
        self.requirements.as_ref()
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> anyhow::Result<TestResult> {
        let state = self.job.run(ctx)?;
        if state != GuestState::TestCompleted {
            return record_state(ctx, &self.job, state);
        }

        let report = ctx
            .guest
            .download(&self.report, &ctx.test_log_dir())
            .with_context(|| format!("failed to download {}", self.report))?;
        let table = parse_csv(&fs_err::read_to_string(&report)?)
            .with_context(|| format!("failed to parse {}", report.display()))?;
        let values = table.numeric_column(THROUGHPUT_COLUMN)?;

        // Label rows by the first column, typically the connection count.
        let label_column = table
            .headers()
            .first()
            .filter(|h| *h != THROUGHPUT_COLUMN)
            .cloned();
        for (i, (row, value)) in table.rows().iter().zip(&values).enumerate() {
            let name = match &label_column {
                Some(column) => format!("{column}={}", row[0].trim()),
                None => format!("row {}", i + 1),
            };
            ctx.log_summary(&name, TestResult::Pass, format!("{value} Gbps"));
        }

        let average = mean(&values).context("throughput report has no rows")?;
        let check = self.threshold.check(average);
        ctx.log_summary("mean throughput", check.result(), check.message);
        Ok(ctx.summary.final_result())
    }
}
