//! Test cases and hook-injected dynamic tests.

use crate::error::RunError;
use crate::report::{TestReport, TestStatus};
use log::{error, info};
use std::path::{Path, PathBuf};
use testrig_fixture::{Fixture, Process};

/// Environment variable carrying the fixture connection string to test
/// programs.
pub const CONNECTION_STRING_ENV: &str = "TESTRIG_CONNECTION_STRING";

/// A black-box test adapter.
pub trait TestCase: Send {
    fn name(&self) -> &str;

    /// Name without directories, used in dynamic test names and logs.
    fn short_name(&self) -> String {
        Path::new(self.name())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name().to_string())
    }

    /// Run against `fixture`.  `Err(TestFailure)` means the test failed.
    fn run(&mut self, fixture: &mut dyn Fixture) -> Result<(), RunError>;
}

/// What hooks get to know about the test around which they run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInfo {
    pub name: String,
    pub short_name: String,
}

impl TestInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let short_name = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        Self { name, short_name }
    }

    pub fn of(test: &dyn TestCase) -> Self {
        Self {
            name: test.name().to_string(),
            short_name: test.short_name(),
        }
    }
}

/// Runs an executable; exit code 0 passes.
///
/// The fixture's connection string is passed in [`CONNECTION_STRING_ENV`].
#[derive(Debug, Clone)]
pub struct ProgramTestCase {
    name: String,
    program: PathBuf,
    args: Vec<String>,
}

impl ProgramTestCase {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: program.to_string_lossy().into_owned(),
            program,
            args,
        }
    }
}

impl TestCase for ProgramTestCase {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, fixture: &mut dyn Fixture) -> Result<(), RunError> {
        let mut argv = vec![self.program.to_string_lossy().into_owned()];
        argv.extend(self.args.iter().cloned());
        let mut process = Process::new(self.short_name(), argv)
            .with_env(CONNECTION_STRING_ENV, fixture.connection_string());
        process.start()?;
        let code = process.wait()?;
        if code == 0 {
            Ok(())
        } else {
            Err(RunError::TestFailure(format!(
                "{} exited with code {}",
                self.name, code
            )))
        }
    }
}

/// Outcome of a dynamic test body that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DynamicOutcome {
    Passed,
    Skipped(String),
}

/// Name of the dynamic test `hook` injects after `base`.
pub fn dynamic_test_name(base: &str, hook: &str) -> String {
    format!("{}:{}", base, hook)
}

/// Run `body` as a dynamic test recorded in `report`.
///
/// The outcome is recorded first; an error is then returned unchanged so
/// the caller can apply its continue/stop policy.
pub fn run_dynamic_test<F>(
    report: &mut TestReport,
    base: &str,
    hook: &str,
    body: F,
) -> Result<(), RunError>
where
    F: FnOnce(&mut TestReport) -> Result<DynamicOutcome, RunError>,
{
    let name = dynamic_test_name(base, hook);
    info!("Starting dynamic test {}", name);
    let test_id = report.start_test(name.clone(), true);

    match body(report) {
        Ok(DynamicOutcome::Passed) => {
            report.stop_test(test_id, TestStatus::Pass, None);
            Ok(())
        }
        Ok(DynamicOutcome::Skipped(reason)) => {
            info!("Skipped {}: {}", name, reason);
            report.stop_test(test_id, TestStatus::Skip, Some(reason));
            Ok(())
        }
        Err(err) => {
            error!("{} failed: {}", name, err);
            let status = if err.is_fatal() {
                TestStatus::Error
            } else {
                TestStatus::Fail
            };
            report.stop_test(test_id, status, Some(err.to_string()));
            Err(err)
        }
    }
}
