//! Data-consistency checks driven by validation scripts.
//!
//! Each check runs a script with the shell against the fixture's primary
//! member, as a dynamic test after every suite test.  A non-zero exit code
//! is a test failure.

use crate::error::RunError;
use crate::hook::Hook;
use crate::registry::{parse_options, HookContext};
use crate::report::TestReport;
use crate::testcase::{run_dynamic_test, DynamicOutcome, TestInfo};
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use testrig_fixture::process::build_args;
use testrig_fixture::{Fixture, OptionMap, Process};

/// The built-in consistency checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCheck {
    /// Validate every collection on every node.
    ValidateCollections,
    /// Compare database hashes between the primary and the secondaries.
    CheckReplDBHash,
    /// Compare the replication logs of the primary and the secondaries.
    CheckReplOplogs,
}

impl ScriptCheck {
    pub fn name(self) -> &'static str {
        match self {
            ScriptCheck::ValidateCollections => "ValidateCollections",
            ScriptCheck::CheckReplDBHash => "CheckReplDBHash",
            ScriptCheck::CheckReplOplogs => "CheckReplOplogs",
        }
    }

    pub fn default_script(self) -> &'static str {
        match self {
            ScriptCheck::ValidateCollections => "jstests/hooks/run_validate_collections.js",
            ScriptCheck::CheckReplDBHash => "jstests/hooks/run_check_repl_dbhash.js",
            ScriptCheck::CheckReplOplogs => "jstests/hooks/run_check_repl_oplogs.js",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptHookOptions {
    /// Script to run instead of the check's default.
    pub script: Option<PathBuf>,
    /// Extra shell options.
    pub shell_options: OptionMap,
}

/// Runs one script with the shell and maps its exit code.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    shell: PathBuf,
    script: PathBuf,
    shell_options: OptionMap,
}

impl ScriptRunner {
    pub fn new(shell: impl Into<PathBuf>, script: impl Into<PathBuf>, shell_options: OptionMap) -> Self {
        Self {
            shell: shell.into(),
            script: script.into(),
            shell_options,
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    /// Run the script against `host`.
    pub fn run(&self, label: &str, host: &str) -> Result<(), RunError> {
        let positional = vec![host.to_string(), self.script.to_string_lossy().into_owned()];
        let args = build_args(&self.shell, &self.shell_options, &positional);
        let mut process = Process::new(label, args);
        process.start()?;
        let code = process.wait()?;
        if code != 0 {
            return Err(RunError::TestFailure(format!(
                "{} failed against {} with exit code {}",
                self.script.display(),
                host,
                code
            )));
        }
        Ok(())
    }
}

/// A consistency check run as a dynamic test after every test.
#[derive(Debug, Clone)]
pub struct ScriptHook {
    check: ScriptCheck,
    runner: ScriptRunner,
}

impl ScriptHook {
    pub fn new(check: ScriptCheck, runner: ScriptRunner) -> Self {
        Self { check, runner }
    }

    pub fn from_options(
        check: ScriptCheck,
        ctx: &HookContext,
        options: &serde_json::Value,
    ) -> Result<Self, RunError> {
        let options: ScriptHookOptions = parse_options(check.name(), options)?;
        let script = options
            .script
            .unwrap_or_else(|| PathBuf::from(check.default_script()));
        let runner = ScriptRunner::new(&ctx.config.shell_executable, script, options.shell_options);
        Ok(Self::new(check, runner))
    }

    pub fn check(&self) -> ScriptCheck {
        self.check
    }

    /// Run the check as a dynamic test after `test`.
    pub fn run_check(
        &self,
        test: &str,
        fixture: &mut dyn Fixture,
        report: &mut TestReport,
    ) -> Result<(), RunError> {
        let host = fixture.get_primary()?.host();
        run_dynamic_test(report, test, self.check.name(), |_| {
            info!("Running {} against {}", self.check.name(), host);
            self.runner.run(self.check.name(), &host)?;
            Ok(DynamicOutcome::Passed)
        })
    }
}

impl Hook for ScriptHook {
    fn name(&self) -> &str {
        self.check.name()
    }

    fn after_test(
        &mut self,
        test: &TestInfo,
        fixture: &mut dyn Fixture,
        report: &mut TestReport,
    ) -> Result<(), RunError> {
        self.run_check(&test.name, fixture, report)
    }
}
