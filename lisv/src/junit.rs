// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! JUnit XML rendering of a run, for CI systems that display test results.
//!
//! Each test kind becomes a `<testsuite>`. Every attempt of a test is a
//! `<testcase>` whose `classname` is the kind, and each of its summary
//! entries is a further `<testcase>` with classname `<kind>.<test>`.

use crate::TestOutcome;
use crate::TestResult;
use crate::runner::ReportEntry;
use crate::runbook::TestKind;
use quick_xml::Writer;
use quick_xml::events::BytesDecl;
use quick_xml::events::BytesEnd;
use quick_xml::events::BytesStart;
use quick_xml::events::BytesText;
use quick_xml::events::Event;

struct Case {
    name: String,
    classname: String,
    seconds: f64,
    result: TestResult,
    message: String,
}

struct Suite {
    kind: TestKind,
    timestamp: String,
    cases: Vec<Case>,
}

#[derive(Default)]
struct Counts {
    tests: usize,
    failures: usize,
    errors: usize,
    skipped: usize,
    seconds: f64,
}

impl Counts {
    fn of<'a>(cases: impl IntoIterator<Item = &'a Case>) -> Self {
        let mut counts = Counts::default();
        for case in cases {
            counts.tests += 1;
            counts.seconds += case.seconds;
            match case.result {
                TestResult::Pass => {}
                TestResult::Fail => counts.failures += 1,
                TestResult::Aborted => counts.errors += 1,
                TestResult::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    fn push_attributes(&self, elem: &mut BytesStart<'_>) {
        elem.push_attribute(("tests", self.tests.to_string().as_str()));
        elem.push_attribute(("failures", self.failures.to_string().as_str()));
        elem.push_attribute(("errors", self.errors.to_string().as_str()));
        elem.push_attribute(("skipped", self.skipped.to_string().as_str()));
        elem.push_attribute(("time", format!("{:.3}", self.seconds).as_str()));
    }
}

fn outcome_message(outcome: &TestOutcome) -> String {
    let failed: Vec<_> = outcome
        .summary
        .entries()
        .iter()
        .filter(|e| e.result == outcome.result && !e.detail.is_empty())
        .map(|e| format!("{}: {}", e.name, e.detail))
        .collect();
    match (&outcome.error, failed.is_empty()) {
        (Some(error), _) => error.clone(),
        (None, false) => failed.join("; "),
        (None, true) => outcome.result.to_string(),
    }
}

fn suites(entries: &[ReportEntry]) -> Vec<Suite> {
    let mut suites: Vec<Suite> = Vec::new();
    for entry in entries {
        let outcome = &entry.outcome;
        let index = match suites.iter().position(|s| s.kind == entry.kind) {
            Some(i) => i,
            None => {
                suites.push(Suite {
                    kind: entry.kind,
                    timestamp: outcome.started.strftime("%Y-%m-%dT%H:%M:%S").to_string(),
                    cases: Vec::new(),
                });
                suites.len() - 1
            }
        };
        let suite = &mut suites[index];
        let seconds = outcome
            .finished
            .duration_since(outcome.started)
            .as_secs_f64()
            .max(0.0);
        suite.cases.push(Case {
            name: outcome.test_name.clone(),
            classname: entry.kind.to_string(),
            seconds,
            result: outcome.result,
            message: outcome_message(outcome),
        });
        for check in outcome.summary.entries() {
            suite.cases.push(Case {
                name: check.name.clone(),
                classname: format!("{}.{}", entry.kind, outcome.test_name),
                seconds: 0.0,
                result: check.result,
                message: check.detail.clone(),
            });
        }
    }
    suites
}

fn write_case(writer: &mut Writer<Vec<u8>>, case: &Case) -> anyhow::Result<()> {
    let mut elem = BytesStart::new("testcase");
    elem.push_attribute(("name", case.name.as_str()));
    elem.push_attribute(("classname", case.classname.as_str()));
    elem.push_attribute(("time", format!("{:.3}", case.seconds).as_str()));
    let child = match case.result {
        TestResult::Pass => {
            writer.write_event(Event::Empty(elem))?;
            return Ok(());
        }
        TestResult::Fail => "failure",
        TestResult::Aborted => "error",
        TestResult::Skipped => "skipped",
    };
    writer.write_event(Event::Start(elem))?;
    let mut detail = BytesStart::new(child);
    detail.push_attribute(("message", case.message.as_str()));
    if case.result == TestResult::Skipped || case.message.is_empty() {
        writer.write_event(Event::Empty(detail))?;
    } else {
        writer.write_event(Event::Start(detail))?;
        writer.write_event(Event::Text(BytesText::new(&case.message)))?;
        writer.write_event(Event::End(BytesEnd::new(child)))?;
    }
    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Renders `entries` as a JUnit XML document named `name`.
pub fn to_junit(name: &str, entries: &[ReportEntry]) -> anyhow::Result<String> {
    let suites = suites(entries);
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("testsuites");
    root.push_attribute(("name", name));
    Counts::of(suites.iter().flat_map(|s| &s.cases)).push_attributes(&mut root);
    writer.write_event(Event::Start(root))?;
    for suite in &suites {
        let mut elem = BytesStart::new("testsuite");
        elem.push_attribute(("name", suite.kind.as_str()));
        elem.push_attribute(("timestamp", suite.timestamp.as_str()));
        Counts::of(&suite.cases).push_attributes(&mut elem);
        writer.write_event(Event::Start(elem))?;
        for case in &suite.cases {
            write_case(&mut writer, case)?;
        }
        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
    }
    writer.write_event(Event::End(BytesEnd::new("testsuites")))?;
    Ok(String::from_utf8(writer.into_inner())?)
}
