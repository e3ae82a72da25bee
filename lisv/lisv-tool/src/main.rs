// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-line front end for running lisv runbooks.

use anyhow::Context as _;
use clap::Parser;
use clap::Subcommand;
use lisv::TestParams;
use lisv::TestResult;
use lisv::hyperv::HyperVHost;
use lisv::remote::SshShell;
use lisv::requirements::Platform;
use lisv::runbook::Runbook;
use lisv::runbook::TestSpec;
use lisv::runner::Runner;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "lisv", about = "Linux guest validation for Hyper-V and Azure")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tests in a runbook
    Run {
        /// The runbook YAML file
        runbook: PathBuf,
        /// Only run tests whose name contains this string
        #[arg(long)]
        filter: Option<String>,
        /// Override the runbook's log directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// List the tests in a runbook
    List {
        /// The runbook YAML file
        runbook: PathBuf,
    },
    /// Parse a `key=value;...` parameter string and print it as JSON
    Params {
        /// The parameter string
        params: String,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    match Cli::parse().command {
        Command::Run {
            runbook,
            filter,
            log_dir,
        } => run(runbook, filter, log_dir),
        Command::List { runbook } => {
            let rb = Runbook::load(&runbook)
                .with_context(|| format!("failed to load {}", runbook.display()))?;
            for spec in &rb.tests {
                println!("{}\t{}", spec.name, spec.kind);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Params { params } => {
            let params: TestParams = params.parse()?;
            println!("{}", serde_json::to_string_pretty(&params)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Returns true if `spec` passes the `--filter` option.
fn selected(spec: &TestSpec, filter: Option<&str>) -> bool {
    filter.is_none_or(|f| spec.name.contains(f))
}

/// 0 if at least one test ran and every final verdict is `PASS` or
/// `SKIPPED`, else 1.
fn exit_code(results: &[TestResult]) -> u8 {
    if !results.is_empty() && results.iter().all(|r| r.is_success()) {
        0
    } else {
        1
    }
}

/// Loads the runbook, applying the `--log-dir` override.
fn load(path: &Path, log_dir: Option<PathBuf>) -> anyhow::Result<Runbook> {
    let mut runbook =
        Runbook::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    if let Some(log_dir) = log_dir {
        runbook.log_dir = log_dir;
    }
    Ok(runbook)
}

fn run(
    path: PathBuf,
    filter: Option<String>,
    log_dir: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let runbook = load(&path, log_dir)?;
    fs_err::create_dir_all(&runbook.log_dir)?;
    let (log_file, _) = fs_err::File::create(runbook.log_dir.join("lisv.log"))?.into_parts();
    lisv::try_init_tracing(log_file).context("failed to initialize tracing")?;

    let guest = SshShell::new(runbook.ssh.clone());
    let hyperv = match runbook.platform {
        Platform::HyperV => Some(HyperVHost::new(runbook.vhd_dir())),
        Platform::Azure => None,
    };
    let mut runner = Runner::new(&runbook, &guest);
    if let Some(host) = &hyperv {
        runner = runner.with_host(host);
    }

    let mut report = runner.run(
        |spec| selected(spec, filter.as_deref()),
        |outcome| println!("{} ... {}", outcome.test_name, outcome.result),
    )?;
    if report.tests.is_empty() {
        tracing::warn!(?filter, "no tests selected");
    }
    report.runbook = Some(path);
    report.write(&runbook.log_dir)?;
    println!("final result: {}", report.result);

    Ok(ExitCode::from(exit_code(&report.final_results())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    const RUNBOOK: &str = r#"
platform: azure
ssh: { host: 10.0.0.5, user: lisa }
tests:
  - name: verify-vss
    kind: cpu_offline
  - name: verify-kvp
    kind: cpu_offline
  - name: cpu
    kind: cpu_offline
"#;

    #[test]
    fn exit_codes() {
        use TestResult::*;
        assert_eq!(exit_code(&[]), 1);
        assert_eq!(exit_code(&[Skipped, Skipped]), 0);
        assert_eq!(exit_code(&[Pass, Skipped]), 0);
        assert_eq!(exit_code(&[Pass, Aborted]), 1);
        assert_eq!(exit_code(&[Fail]), 1);
    }

    #[test]
    fn filter_selects_by_substring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runbook.yml");
        fs_err::write(&path, RUNBOOK).unwrap();
        let rb = load(&path, None).unwrap();

        let names = |filter| {
            rb.tests
                .iter()
                .filter(|s| selected(s, filter))
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(None), ["verify-vss", "verify-kvp", "cpu"]);
        assert_eq!(names(Some("verify")), ["verify-vss", "verify-kvp"]);
        assert!(names(Some("hibernate")).is_empty());
    }

    #[test]
    fn log_dir_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runbook.yml");
        fs_err::write(&path, RUNBOOK).unwrap();
        assert_eq!(load(&path, None).unwrap().log_dir, Path::new("lisv-logs"));
        let custom = dir.path().join("out");
        assert_eq!(load(&path, Some(custom.clone())).unwrap().log_dir, custom);
        assert!(load(&dir.path().join("missing.yml"), None).is_err());
    }
}
