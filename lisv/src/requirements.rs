// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test requirements framework for run-time skip decisions.

use crate::params::ParamsError;
use crate::params::TestParams;
use crate::parse::Distro;
use crate::parse::parse_os_release;
use crate::remote::GuestShell;
use serde::Deserialize;
use serde::Serialize;
use std::cell::OnceCell;
use std::fmt;

/// The platform hosting the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// A local Hyper-V host.
    HyperV,
    /// An Azure VM.
    Azure,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::HyperV => "hyperv",
            Platform::Azure => "azure",
        })
    }
}

/// What a test needs to find before it can run.
///
/// Guest facts (distro, vCPU count) are queried at most once, and only if a
/// requirement actually asks for them.
pub struct RequirementContext<'a> {
    /// The platform hosting the guest.
    pub platform: Platform,
    /// The test's parameters.
    pub params: &'a TestParams,
    guest: Option<&'a dyn GuestShell>,
    distro: OnceCell<Option<Distro>>,
    vcpus: OnceCell<Option<u32>>,
}

impl<'a> RequirementContext<'a> {
    /// A context that queries `guest` on demand.
    pub fn new(
        platform: Platform,
        params: &'a TestParams,
        guest: Option<&'a dyn GuestShell>,
    ) -> Self {
        Self {
            platform,
            params,
            guest,
            distro: OnceCell::new(),
            vcpus: OnceCell::new(),
        }
    }

    /// A context with known guest facts and no guest to query.
    pub fn with_facts(
        platform: Platform,
        params: &'a TestParams,
        distro: Option<Distro>,
        vcpus: Option<u32>,
    ) -> Self {
        Self {
            platform,
            params,
            guest: None,
            distro: OnceCell::from(distro),
            vcpus: OnceCell::from(vcpus),
        }
    }

    /// The guest distribution, if it could be determined.
    pub fn distro(&self) -> Option<&Distro> {
        self.distro
            .get_or_init(|| {
                let guest = self.guest?;
                match guest.exec("cat /etc/os-release 2>/dev/null || cat /etc/*-release") {
                    Ok(text) => {
                        let distro = parse_os_release(&text);
                        tracing::info!(id = distro.id, version = distro.version, "guest distro");
                        Some(distro)
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = &err as &dyn std::error::Error,
                            "failed to query guest distro"
                        );
                        None
                    }
                }
            })
            .as_ref()
    }

    /// The guest's online vCPU count, if it could be determined.
    pub fn vcpus(&self) -> Option<u32> {
        *self.vcpus.get_or_init(|| {
            let guest = self.guest?;
            match guest.exec("nproc") {
                Ok(out) => out.trim().parse().ok(),
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to query guest vcpu count"
                    );
                    None
                }
            }
        })
    }
}

/// A single requirement for a test to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRequirement {
    /// The guest runs on the given platform.
    Platform(Platform),
    /// The named parameter is set.
    Param(String),
    /// The guest distro id matches, ignoring case.
    Distro(String),
    /// The guest has at least this many online vCPUs.
    MinVcpus(u32),
    /// Logical AND of two requirements.
    And(Box<TestRequirement>, Box<TestRequirement>),
    /// Logical OR of two requirements.
    Or(Box<TestRequirement>, Box<TestRequirement>),
    /// Logical NOT of a requirement.
    Not(Box<TestRequirement>),
}

impl TestRequirement {
    /// Evaluate if this requirement is satisfied in the given context.
    pub fn is_satisfied(&self, context: &RequirementContext<'_>) -> bool {
        match self {
            TestRequirement::Platform(platform) => context.platform == *platform,
            TestRequirement::Param(key) => context.params.contains(key),
            TestRequirement::Distro(id) => context
                .distro()
                .is_some_and(|d| d.is_any(&[id.as_str()])),
            TestRequirement::MinVcpus(n) => context.vcpus().is_some_and(|v| v >= *n),
            TestRequirement::And(req1, req2) => {
                req1.is_satisfied(context) && req2.is_satisfied(context)
            }
            TestRequirement::Or(req1, req2) => {
                req1.is_satisfied(context) || req2.is_satisfied(context)
            }
            TestRequirement::Not(req) => !req.is_satisfied(context),
        }
    }

    /// Combines two requirements with AND.
    pub fn and(self, other: TestRequirement) -> Self {
        TestRequirement::And(Box::new(self), Box::new(other))
    }

    /// Combines two requirements with OR.
    pub fn or(self, other: TestRequirement) -> Self {
        TestRequirement::Or(Box::new(self), Box::new(other))
    }

    /// Folds `reqs` with OR. `None` if there are none.
    pub fn any_of(reqs: impl IntoIterator<Item = TestRequirement>) -> Option<Self> {
        reqs.into_iter().reduce(TestRequirement::or)
    }

    /// Folds `reqs` with AND. `None` if there are none.
    pub fn all_of(reqs: impl IntoIterator<Item = TestRequirement>) -> Option<Self> {
        reqs.into_iter().reduce(TestRequirement::and)
    }
}

impl fmt::Display for TestRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestRequirement::Platform(p) => write!(f, "platform={p}"),
            TestRequirement::Param(key) => write!(f, "param {key}"),
            TestRequirement::Distro(id) => write!(f, "distro={id}"),
            TestRequirement::MinVcpus(n) => write!(f, "vcpus>={n}"),
            TestRequirement::And(a, b) => write!(f, "({a} and {b})"),
            TestRequirement::Or(a, b) => write!(f, "({a} or {b})"),
            TestRequirement::Not(r) => write!(f, "not {r}"),
        }
    }
}

/// Container for test requirements that can be evaluated.
#[derive(Debug, Clone)]
pub struct TestCaseRequirements {
    requirements: TestRequirement,
}

impl TestCaseRequirements {
    /// Create a new TestCaseRequirements from a TestRequirement
    pub fn new(requirements: TestRequirement) -> Self {
        Self { requirements }
    }

    /// Builds requirements from the conventional parameters, if any are set:
    /// `SUPPORTED_DISTROS` (comma list) and `MIN_VCPUS`. A `MIN_VCPUS` that
    /// is not a number is an error.
    pub fn from_params(params: &TestParams) -> Result<Option<Self>, ParamsError> {
        let distros = TestRequirement::any_of(
            params
                .list("SUPPORTED_DISTROS")
                .into_iter()
                .map(|d| TestRequirement::Distro(d.to_owned())),
        );
        let vcpus = params
            .parse_value::<u32>("MIN_VCPUS")?
            .map(TestRequirement::MinVcpus);
        Ok(TestRequirement::all_of(distros.into_iter().chain(vcpus)).map(Self::new))
    }

    /// Adds `req` with AND.
    pub fn and(self, req: TestRequirement) -> Self {
        Self::new(self.requirements.and(req))
    }

    /// The requirement tree.
    pub fn requirement(&self) -> &TestRequirement {
        &self.requirements
    }
}

/// Evaluates if a test case can be run in the given context.
pub fn can_run_test_with_context(
    config: Option<&TestCaseRequirements>,
    context: &RequirementContext<'_>,
) -> bool {
    if let Some(config) = config {
        config.requirements.is_satisfied(context)
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedShell;
    use test_with_tracing::test;

    fn ubuntu() -> Option<Distro> {
        Some(Distro {
            id: "ubuntu".into(),
            version: "22.04".into(),
        })
    }

    #[test]
    fn combinators() {
        let params = TestParams::new().with("NIC", "eth1");
        let ctx = RequirementContext::with_facts(Platform::HyperV, &params, ubuntu(), Some(4));
        let platform = TestRequirement::Platform;
        let distro = |id: &str| TestRequirement::Distro(id.into());
        let vcpus = TestRequirement::MinVcpus;
        assert!(platform(Platform::HyperV).is_satisfied(&ctx));
        assert!(!platform(Platform::Azure).is_satisfied(&ctx));
        assert!(TestRequirement::Param("NIC".into()).is_satisfied(&ctx));
        assert!(distro("Ubuntu").is_satisfied(&ctx));
        assert!(vcpus(4).is_satisfied(&ctx));
        assert!(!vcpus(8).is_satisfied(&ctx));
        assert!(distro("rhel").or(vcpus(2)).is_satisfied(&ctx));
        assert!(!distro("rhel").and(vcpus(2)).is_satisfied(&ctx));
        let no_vf = TestRequirement::Not(Box::new(TestRequirement::Param("VF".into())));
        assert!(no_vf.is_satisfied(&ctx));
    }

    #[test]
    fn unknown_facts_are_unsatisfied() {
        let params = TestParams::new();
        let ctx = RequirementContext::with_facts(Platform::Azure, &params, None, None);
        assert!(!TestRequirement::Distro("ubuntu".into()).is_satisfied(&ctx));
        assert!(!TestRequirement::MinVcpus(1).is_satisfied(&ctx));
        assert!(can_run_test_with_context(None, &ctx));
    }

    #[test]
    fn queries_guest_once_and_only_when_needed() {
        let shell = ScriptedShell::new()
            .on("os-release", Ok("NAME=\"Ubuntu\"\nID=ubuntu\nVERSION_ID=\"20.04\"\n"))
            .on("nproc", Ok("2"));
        let params = TestParams::new();
        let ctx = RequirementContext::new(Platform::HyperV, &params, Some(&shell));

        assert!(TestRequirement::Platform(Platform::HyperV).is_satisfied(&ctx));
        assert!(shell.commands().is_empty());

        let req = TestRequirement::Distro("ubuntu".into()).and(TestRequirement::MinVcpus(2));
        assert!(req.is_satisfied(&ctx));
        assert!(req.is_satisfied(&ctx));
        assert_eq!(shell.commands().len(), 2);
    }

    #[test]
    fn query_failure_leaves_fact_unknown() {
        let shell = ScriptedShell::new().fallback(ScriptedShell::connect_error());
        let params = TestParams::new();
        let ctx = RequirementContext::new(Platform::HyperV, &params, Some(&shell));
        assert!(ctx.distro().is_none());
        assert!(ctx.vcpus().is_none());
    }

    #[test]
    fn from_params() {
        assert!(
            TestCaseRequirements::from_params(&TestParams::new())
                .unwrap()
                .is_none()
        );
        let params: TestParams = "SUPPORTED_DISTROS=ubuntu, rhel;MIN_VCPUS=2".parse().unwrap();
        let reqs = TestCaseRequirements::from_params(&params).unwrap().unwrap();
        assert_eq!(
            reqs.requirement().to_string(),
            "((distro=ubuntu or distro=rhel) and vcpus>=2)"
        );
        let ctx = RequirementContext::with_facts(Platform::HyperV, &params, ubuntu(), Some(2));
        assert!(can_run_test_with_context(Some(&reqs), &ctx));
    }

    #[test]
    fn malformed_min_vcpus_is_an_error() {
        let params = TestParams::new().with("MIN_VCPUS", "four");
        assert!(matches!(
            TestCaseRequirements::from_params(&params),
            Err(ParamsError::Invalid { key, .. }) if key == "MIN_VCPUS"
        ));
    }
}
