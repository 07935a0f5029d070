//! Runs one job's tests against its fixture with hooks around them.

use crate::error::RunError;
use crate::hook::Hook;
use crate::report::{format_summary, ReportSummary, TestReport, TestStatus};
use crate::testcase::{TestCase, TestInfo};
use log::{error, info, warn};
use serde::Deserialize;
use testrig_fixture::Fixture;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// Stop at the first test failure instead of running the rest.
    pub fail_fast: bool,
}

/// One fixture, its hooks and the report they all write to.
pub struct Job {
    job_num: usize,
    fixture: Box<dyn Fixture>,
    hooks: Vec<Box<dyn Hook>>,
    config: JobConfig,
    report: TestReport,
}

/// Apply the continue/stop policy to a callback result.
///
/// `Ok(true)` means the run goes on, `Ok(false)` that it stops quietly.
fn check(result: Result<(), RunError>, fail_fast: bool) -> Result<bool, RunError> {
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!("{}", err);
            Ok(!fail_fast)
        }
    }
}

impl Job {
    pub fn new(
        job_num: usize,
        fixture: Box<dyn Fixture>,
        hooks: Vec<Box<dyn Hook>>,
        config: JobConfig,
    ) -> Self {
        Self {
            job_num,
            fixture,
            hooks,
            config,
            report: TestReport::new(),
        }
    }

    pub fn job_num(&self) -> usize {
        self.job_num
    }

    pub fn report(&self) -> &TestReport {
        &self.report
    }

    pub fn fixture(&self) -> &dyn Fixture {
        self.fixture.as_ref()
    }

    /// Run `tests` in order and return the summary.
    ///
    /// The fixture is always torn down.  A failed teardown is recorded as
    /// an errored dynamic test; it becomes the returned error only if
    /// nothing failed before it.
    pub fn run(&mut self, tests: &mut [Box<dyn TestCase>]) -> Result<ReportSummary, RunError> {
        info!("Job {}: starting {} test(s) on {}", self.job_num, tests.len(), self.fixture.name());
        let result = self.run_suite(tests);
        let teardown = self.teardown_fixture();
        let summary = self.report.summary();
        match (result, teardown) {
            (Err(err), _) | (Ok(()), Err(err)) => {
                error!("Job {}: {}\n{}", self.job_num, err, format_summary(&summary));
                Err(err)
            }
            (Ok(()), Ok(())) => {
                info!("Job {}: {}", self.job_num, format_summary(&summary));
                Ok(summary)
            }
        }
    }

    fn run_suite(&mut self, tests: &mut [Box<dyn TestCase>]) -> Result<(), RunError> {
        self.fixture.setup()?;
        self.fixture.await_ready()?;

        let fail_fast = self.config.fail_fast;
        for hook in &mut self.hooks {
            if !check(hook.before_suite(self.fixture.as_mut(), &mut self.report), fail_fast)? {
                return Ok(());
            }
        }

        for test in tests.iter_mut() {
            if !self.run_test(test.as_mut())? {
                break;
            }
        }

        for hook in &mut self.hooks {
            if !check(hook.after_suite(self.fixture.as_mut(), &mut self.report), fail_fast)? {
                break;
            }
        }
        Ok(())
    }

    /// Returns whether the run continues.
    fn run_test(&mut self, test: &mut dyn TestCase) -> Result<bool, RunError> {
        let fail_fast = self.config.fail_fast;
        let info = TestInfo::of(test);

        for hook in &mut self.hooks {
            if !check(hook.before_test(&info, self.fixture.as_mut(), &mut self.report), fail_fast)? {
                return Ok(false);
            }
        }

        info!("Running {}", info.name);
        let test_id = self.report.start_test(info.name.clone(), false);
        let outcome = test.run(self.fixture.as_mut());
        match &outcome {
            Ok(()) => self.report.stop_test(test_id, TestStatus::Pass, None),
            Err(err) if err.is_fatal() => {
                self.report
                    .stop_test(test_id, TestStatus::Error, Some(err.to_string()))
            }
            Err(err) => self
                .report
                .stop_test(test_id, TestStatus::Fail, Some(err.to_string())),
        }
        let test_go_on = check(outcome, fail_fast)?;

        if !self.fixture.is_running() {
            return Err(RunError::ServerFailure(format!(
                "{} is no longer running after {}",
                self.fixture.name(),
                info.name
            )));
        }

        // Every hook sees the end of the test; the stop decision comes after.
        let mut go_on = test_go_on;
        for hook in &mut self.hooks {
            go_on &= check(hook.after_test(&info, self.fixture.as_mut(), &mut self.report), fail_fast)?;
        }
        Ok(go_on)
    }

    fn teardown_fixture(&mut self) -> Result<(), RunError> {
        let name = format!("job{}_fixture_teardown", self.job_num);
        let test_id = self.report.start_test(name, true);
        let failure = match self.fixture.teardown() {
            Ok(true) => None,
            Ok(false) => Some(RunError::ServerFailure(format!(
                "{} did not exit cleanly",
                self.fixture.name()
            ))),
            Err(err) => Some(err.into()),
        };
        match failure {
            None => {
                self.report.stop_test(test_id, TestStatus::Pass, None);
                Ok(())
            }
            Some(err) => {
                self.report
                    .stop_test(test_id, TestStatus::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanEveryN;
    use crate::testutil::FakeFixture;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Passes unless `failing`; a failure is fatal when `fatal`.
    struct NamedTest {
        name: String,
        fatal: bool,
        failing: bool,
    }

    impl NamedTest {
        fn boxed(name: &str, failing: bool) -> Box<dyn TestCase> {
            Box::new(Self {
                name: name.to_string(),
                fatal: false,
                failing,
            })
        }
    }

    impl TestCase for NamedTest {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&mut self, _fixture: &mut dyn Fixture) -> Result<(), RunError> {
            match (self.failing, self.fatal) {
                (false, _) => Ok(()),
                (true, false) => Err(RunError::TestFailure(format!("{} failed", self.name))),
                (true, true) => Err(RunError::ServerFailure(format!("{} crashed", self.name))),
            }
        }
    }

    /// Records every callback into a shared log.
    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Hook for Recorder {
        fn name(&self) -> &str {
            self.tag
        }

        fn before_suite(&mut self, _: &mut dyn Fixture, _: &mut TestReport) -> Result<(), RunError> {
            self.log.lock().push(format!("{}:before_suite", self.tag));
            Ok(())
        }

        fn after_suite(&mut self, _: &mut dyn Fixture, _: &mut TestReport) -> Result<(), RunError> {
            self.log.lock().push(format!("{}:after_suite", self.tag));
            Ok(())
        }

        fn before_test(
            &mut self,
            test: &TestInfo,
            _: &mut dyn Fixture,
            _: &mut TestReport,
        ) -> Result<(), RunError> {
            self.log.lock().push(format!("{}:before:{}", self.tag, test.name));
            Ok(())
        }

        fn after_test(
            &mut self,
            test: &TestInfo,
            _: &mut dyn Fixture,
            _: &mut TestReport,
        ) -> Result<(), RunError> {
            self.log.lock().push(format!("{}:after:{}", self.tag, test.name));
            Ok(())
        }
    }

    fn recorders(log: &Arc<Mutex<Vec<String>>>) -> Vec<Box<dyn Hook>> {
        ["h1", "h2"]
            .into_iter()
            .map(|tag| {
                Box::new(Recorder {
                    tag,
                    log: Arc::clone(log),
                }) as Box<dyn Hook>
            })
            .collect()
    }

    #[test]
    fn hooks_run_in_registration_order_around_each_test() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut job = Job::new(
            0,
            Box::new(FakeFixture::new(dir.path())),
            recorders(&log),
            JobConfig::default(),
        );
        let mut tests = vec![NamedTest::boxed("a.js", false)];

        let summary = job.run(&mut tests).unwrap();
        assert!(summary.was_successful());
        assert_eq!(
            *log.lock(),
            vec![
                "h1:before_suite",
                "h2:before_suite",
                "h1:before:a.js",
                "h2:before:a.js",
                "h1:after:a.js",
                "h2:after:a.js",
                "h1:after_suite",
                "h2:after_suite",
            ]
        );
    }

    #[test]
    fn failures_continue_unless_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut tests = vec![
            NamedTest::boxed("a.js", true),
            NamedTest::boxed("b.js", false),
        ];

        let mut job = Job::new(
            0,
            Box::new(FakeFixture::new(dir.path())),
            Vec::new(),
            JobConfig::default(),
        );
        let summary = job.run(&mut tests).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.passed, 2);
        assert!(!summary.was_successful());

        let mut job = Job::new(
            0,
            Box::new(FakeFixture::new(dir.path())),
            Vec::new(),
            JobConfig { fail_fast: true },
        );
        let summary = job.run(&mut tests).unwrap();
        let names: Vec<&str> = job.report().records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a.js", "job0_fixture_teardown"]);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn fail_fast_still_runs_every_after_test_hook() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut job = Job::new(
            0,
            Box::new(FakeFixture::new(dir.path())),
            recorders(&log),
            JobConfig { fail_fast: true },
        );
        let mut tests = vec![
            NamedTest::boxed("a.js", true),
            NamedTest::boxed("b.js", false),
        ];

        job.run(&mut tests).unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "h1:before_suite",
                "h2:before_suite",
                "h1:before:a.js",
                "h2:before:a.js",
                "h1:after:a.js",
                "h2:after:a.js",
                "h1:after_suite",
                "h2:after_suite",
            ]
        );
    }

    #[test]
    fn fatal_error_aborts_but_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut tests: Vec<Box<dyn TestCase>> = vec![
            Box::new(NamedTest {
                name: "a.js".into(),
                fatal: true,
                failing: true,
            }),
            NamedTest::boxed("b.js", false),
        ];
        let mut fixture = FakeFixture::new(dir.path());
        fixture.clean_shutdown = false;
        let mut job = Job::new(0, Box::new(fixture), Vec::new(), JobConfig::default());

        let err = job.run(&mut tests).unwrap_err();
        assert!(matches!(err, RunError::ServerFailure(msg) if msg.contains("crashed")));

        let statuses: Vec<(&str, TestStatus)> = job
            .report()
            .records()
            .iter()
            .map(|r| (r.name.as_str(), r.status))
            .collect();
        assert_eq!(
            statuses,
            vec![("a.js", TestStatus::Error), ("job0_fixture_teardown", TestStatus::Error)]
        );
        let summary = job.report().summary();
        assert_eq!((summary.num_run, summary.errored, summary.dynamic), (2, 2, 1));
        assert!(format_summary(&summary).contains("2 errored"));
    }

    #[test]
    fn hook_dynamic_tests_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut tests = vec![
            NamedTest::boxed("a.js", false),
            NamedTest::boxed("b.js", false),
        ];
        let mut job = Job::new(
            1,
            Box::new(FakeFixture::new(dir.path())),
            vec![Box::new(CleanEveryN::new(2))],
            JobConfig::default(),
        );

        let summary = job.run(&mut tests).unwrap();
        assert_eq!(summary.num_run, 4);
        assert_eq!(summary.dynamic, 2);
        assert!(summary.was_successful());
    }
}
