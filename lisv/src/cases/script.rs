// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::ScriptJob;
use super::record_state;
use crate::TestContext;
use crate::TestResult;
use crate::params::ParamsError;
use crate::params::TestParams;
use crate::requirements::TestCaseRequirements;
use crate::test::TestCase;
use std::path::Path;

/// Runs one guest-side script and takes its verdict from the state file.
pub struct GuestScriptTest {
    name: String,
    job: ScriptJob,
    requirements: Option<TestCaseRequirements>,
}

impl GuestScriptTest {
    /// Builds the test from its parameters. See [`ScriptJob::from_params`].
    pub fn from_params(
        name: impl Into<String>,
        params: &TestParams,
        script_dir: &Path,
    ) -> Result<Self, ParamsError> {
        Ok(Self {
            name: name.into(),
            job: ScriptJob::from_params(params, script_dir)?,
            requirements: TestCaseRequirements::from_params(params)?,
        })
    }
}

impl TestCase for GuestScriptTest {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> Option<&TestCaseRequirements> {
        self.requirements.as_ref()
    }

    fn run(&self, ctx: &mut TestContext<'_>) -> anyhow::Result<TestResult> {
        let state = self.job.run(ctx)?;
        record_state(ctx, &self.job, state)
    }
}
