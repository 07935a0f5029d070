//! Restart the fixture every n tests to give each batch clean data files.

use crate::error::RunError;
use crate::hook::Hook;
use crate::registry::{parse_options, HookContext};
use crate::report::TestReport;
use crate::testcase::{run_dynamic_test, DynamicOutcome, TestInfo};
use log::{info, warn};
use serde::Deserialize;
use testrig_fixture::Fixture;

const HOOK_NAME: &str = "CleanEveryN";

pub const DEFAULT_N: usize = 20;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CleanEveryNOptions {
    /// Tests between restarts.  Defaults to [`DEFAULT_N`].
    pub n: Option<usize>,
}

#[derive(Debug)]
pub struct CleanEveryN {
    n: usize,
    tests_run: usize,
}

impl CleanEveryN {
    pub fn new(n: usize) -> Self {
        Self {
            n: n.max(1),
            tests_run: 0,
        }
    }

    /// Leak detection only attributes a leak to one test when the fixture
    /// restarts after every test, so it forces `n = 1`.
    pub fn from_options(ctx: &HookContext, options: &serde_json::Value) -> Result<Self, RunError> {
        let options: CleanEveryNOptions = parse_options(HOOK_NAME, options)?;
        let mut n = options.n.unwrap_or(DEFAULT_N);
        if ctx.config.leak_detection && n != 1 {
            info!("{}: leak detection is on, restarting after every test", HOOK_NAME);
            n = 1;
        }
        Ok(Self::new(n))
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Tests since the last restart.
    pub fn tests_run(&self) -> usize {
        self.tests_run
    }
}

impl Hook for CleanEveryN {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    fn after_test(
        &mut self,
        test: &TestInfo,
        fixture: &mut dyn Fixture,
        report: &mut TestReport,
    ) -> Result<(), RunError> {
        self.tests_run += 1;
        if self.tests_run < self.n {
            return Ok(());
        }
        self.tests_run = 0;

        run_dynamic_test(report, &test.name, HOOK_NAME, |_| {
            info!("{} tests have been run against {}, restarting it", self.n, fixture.name());
            let teardown = fixture.teardown();
            fixture.setup()?;
            fixture.await_ready()?;

            // Report a bad shutdown only once the fixture is usable again.
            match teardown {
                Ok(true) => Ok(DynamicOutcome::Passed),
                Ok(false) => Err(RunError::TestFailure(format!(
                    "{} did not exit cleanly",
                    fixture.name()
                ))),
                Err(err) => {
                    warn!("{}: teardown of {} failed: {}", HOOK_NAME, fixture.name(), err);
                    Err(RunError::TestFailure(format!(
                        "teardown of {} failed: {}",
                        fixture.name(),
                        err
                    )))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TestStatus;
    use crate::testutil::FakeFixture;
    use serde_json::json;
    use std::sync::Arc;
    use testrig_fixture::testing::ScriptedClient;
    use testrig_fixture::RunConfig;

    fn context(leak_detection: bool) -> HookContext {
        let config = RunConfig {
            leak_detection,
            ..RunConfig::default()
        };
        HookContext::new(Arc::new(config), Arc::new(ScriptedClient::ok()))
    }

    #[test]
    fn restarts_after_every_third_test() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = FakeFixture::new(dir.path());
        let mut report = TestReport::new();
        let mut hook = CleanEveryN::new(3);

        for name in ["a.js", "b.js"] {
            hook.after_test(&TestInfo::new(name), &mut fixture, &mut report).unwrap();
        }
        assert_eq!(fixture.teardowns, 0);
        assert_eq!(hook.tests_run(), 2);

        hook.after_test(&TestInfo::new("c.js"), &mut fixture, &mut report).unwrap();
        assert_eq!(fixture.teardowns, 1);
        assert_eq!(fixture.setups, 1);
        assert_eq!(fixture.events, vec!["teardown", "setup", "await_ready"]);
        assert_eq!(hook.tests_run(), 0);

        let record = &report.records()[0];
        assert_eq!(record.name, "c.js:CleanEveryN");
        assert_eq!(record.status, TestStatus::Pass);
    }

    #[test]
    fn unclean_shutdown_fails_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut fixture = FakeFixture::new(dir.path());
        fixture.clean_shutdown = false;
        let mut report = TestReport::new();
        let mut hook = CleanEveryN::new(1);

        let err = hook
            .after_test(&TestInfo::new("a.js"), &mut fixture, &mut report)
            .unwrap_err();
        assert!(matches!(err, RunError::TestFailure(_)));
        assert_eq!(fixture.events, vec!["teardown", "setup", "await_ready"]);
        assert!(fixture.running);
        assert_eq!(report.records()[0].status, TestStatus::Fail);
    }

    #[test]
    fn leak_detection_forces_n_to_one() {
        let hook = CleanEveryN::from_options(&context(true), &json!({"n": 10})).unwrap();
        assert_eq!(hook.n(), 1);

        let hook = CleanEveryN::from_options(&context(false), &serde_json::Value::Null).unwrap();
        assert_eq!(hook.n(), DEFAULT_N);
        assert_eq!(CleanEveryN::new(0).n(), 1);
    }
}
