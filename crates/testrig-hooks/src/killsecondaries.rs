//! Unclean shutdown of secondaries in the middle of oplog application.
//!
//! While a period of tests runs, every secondary has oplog application
//! paused by the `rsSyncApplyStop` failpoint, so it falls behind.  When the
//! period ends a dynamic test resumes application, SIGKILLs the
//! secondaries partway into a batch, and checks that each one recovers to
//! SECONDARY from its own data files before validating the whole set.

use crate::consistency::{ScriptCheck, ScriptHook, ScriptRunner};
use crate::error::RunError;
use crate::hook::Hook;
use crate::policy::StopPolicy;
use crate::registry::{parse_options, HookContext};
use crate::report::TestReport;
use crate::testcase::{dynamic_test_name, run_dynamic_test, DynamicOutcome, TestInfo};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use testrig_fixture::fixture::replicaset::STATE_SECONDARY;
use testrig_fixture::fixture::{AWAIT_REPL_TIMEOUT, POLL_INTERVAL};
use testrig_fixture::{
    Clock, Fixture, MongodFixture, NodeInfo, OptionMap, ReplicaSetFixture, ReplicaSetView,
};

const HOOK_NAME: &str = "PeriodicKillSecondaries";

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

const FAILPOINT: &str = "rsSyncApplyStop";

/// Lets a resumed secondary get partway into a batch before it is killed.
const APPLY_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeriodicKillSecondariesOptions {
    /// Length of a period in seconds.
    pub period_secs: Option<u64>,
    /// Length of a period in tests.  Ignored when `period_secs` is set.
    pub period_tests: Option<u64>,
    /// Extra shell options of the consistency checks.
    pub shell_options: OptionMap,
}

impl PeriodicKillSecondariesOptions {
    pub fn stop_policy(&self) -> StopPolicy {
        match (self.period_secs, self.period_tests) {
            (None, None) => StopPolicy::after_duration(DEFAULT_PERIOD),
            (secs, tests) => StopPolicy {
                duration: secs.map(Duration::from_secs),
                samples: tests,
            },
        }
    }
}

/// An open period of paused oplog application.
#[derive(Debug, Clone, Copy)]
struct Period {
    started: Instant,
    tests: u64,
}

pub struct PeriodicKillSecondaries {
    policy: StopPolicy,
    checks: Vec<ScriptHook>,
    clock: Arc<dyn Clock>,
    period: Option<Period>,
    last_test: Option<String>,
}

impl PeriodicKillSecondaries {
    /// `checks` run in order after the secondaries recovered.
    pub fn new(policy: StopPolicy, checks: Vec<ScriptHook>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            checks,
            clock,
            period: None,
            last_test: None,
        }
    }

    pub fn from_options(ctx: &HookContext, options: &serde_json::Value) -> Result<Self, RunError> {
        let options: PeriodicKillSecondariesOptions = parse_options(HOOK_NAME, options)?;
        let checks = [
            ScriptCheck::CheckReplOplogs,
            ScriptCheck::CheckReplDBHash,
            ScriptCheck::ValidateCollections,
        ]
        .into_iter()
        .map(|check| {
            let runner = ScriptRunner::new(
                &ctx.config.shell_executable,
                check.default_script(),
                options.shell_options.clone(),
            );
            ScriptHook::new(check, runner)
        })
        .collect();
        Ok(Self::new(options.stop_policy(), checks, Arc::clone(&ctx.clock)))
    }

    /// Whether oplog application is currently paused.
    pub fn period_open(&self) -> bool {
        self.period.is_some()
    }

    fn replica_set<'a>(fixture: &'a mut dyn Fixture) -> Result<&'a mut ReplicaSetFixture, RunError> {
        let name = fixture.name().to_string();
        fixture
            .as_replica_set_mut()
            .ok_or_else(|| RunError::IncompatibleFixture {
                hook: HOOK_NAME,
                reason: format!("{} is not a replica set", name),
            })
    }

    fn run(&mut self, fixture: &mut dyn Fixture, report: &mut TestReport) -> Result<(), RunError> {
        let base = self.last_test.clone().unwrap_or_else(|| HOOK_NAME.to_string());
        let result = match Self::replica_set(fixture) {
            Ok(rs) => {
                let dynamic_name = dynamic_test_name(&base, HOOK_NAME);
                run_dynamic_test(report, &base, HOOK_NAME, |report| {
                    let secondaries = self.kill_secondaries(rs)?;
                    self.check_secondaries_and_restart(rs, &secondaries)?;
                    for check in &self.checks {
                        check.run_check(&dynamic_name, &mut *rs, report)?;
                    }
                    restart_and_clear(rs)?;
                    Ok(DynamicOutcome::Passed)
                })
            }
            Err(err) => Err(err),
        };
        // Pause application again at the start of the next test, even
        // after a failure.
        self.period = None;
        result
    }

    /// Returns the members that were killed.
    fn kill_secondaries(&self, rs: &mut ReplicaSetFixture) -> Result<Vec<NodeInfo>, RunError> {
        let view = rs.view();
        let secondaries = rs.get_secondaries()?;
        for secondary in &secondaries {
            set_failpoint(&view, secondary, "off")?;
            self.clock.sleep(APPLY_GRACE);

            let node = member_mut(rs, secondary)?;
            if !node.is_running() {
                return Err(RunError::ServerFailure(format!(
                    "{} was expected to be running in {}, but wasn't",
                    secondary, HOOK_NAME
                )));
            }
            info!("Killing the secondary {}", secondary);
            node.kill()?;
        }
        // Killed members make this report an unclean shutdown; only a
        // teardown that could not finish is an error.
        if !rs.teardown()? {
            info!("{} reported the unclean shutdown of its killed members", rs.name());
        }
        Ok(secondaries)
    }

    fn check_secondaries_and_restart(
        &self,
        rs: &mut ReplicaSetFixture,
        secondaries: &[NodeInfo],
    ) -> Result<(), RunError> {
        let view = rs.view();
        let preserved: Vec<bool> = rs.nodes().iter().map(|node| node.preserve_dbpath()).collect();
        for node in rs.nodes_mut() {
            node.set_preserve_dbpath(true);
        }

        let result = self.restart_with_data_files(rs, &view, secondaries);

        for (node, preserve) in rs.nodes_mut().iter_mut().zip(preserved) {
            node.set_preserve_dbpath(preserve);
        }
        result
    }

    fn restart_with_data_files(
        &self,
        rs: &mut ReplicaSetFixture,
        view: &ReplicaSetView,
        secondaries: &[NodeInfo],
    ) -> Result<(), RunError> {
        for secondary in secondaries {
            info!("Restarting the secondary {} with its data files intact", secondary);
            let node = member_mut(rs, secondary)?;
            node.setup()?;
            node.await_ready()?;
            self.await_secondary_state(view, secondary)?;
            if !node.teardown()? {
                return Err(RunError::ServerFailure(format!(
                    "{} did not exit cleanly after reconciling the end of its oplog",
                    secondary
                )));
            }
        }

        info!("Starting the replica set back up with its data files intact for validation");
        rs.setup()?;
        rs.await_ready()?;
        Ok(())
    }

    fn await_secondary_state(&self, view: &ReplicaSetView, node: &NodeInfo) -> Result<(), RunError> {
        let deadline = self.clock.deadline(AWAIT_REPL_TIMEOUT);
        loop {
            if matches!(view.member_state(node), Ok(STATE_SECONDARY)) {
                return Ok(());
            }
            if self.clock.remaining(deadline).is_zero() {
                return Err(RunError::ServerFailure(format!(
                    "{} failed to reach state SECONDARY after {} seconds",
                    node,
                    AWAIT_REPL_TIMEOUT.as_secs()
                )));
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }
}

fn member_mut<'a>(
    rs: &'a mut ReplicaSetFixture,
    node: &NodeInfo,
) -> Result<&'a mut MongodFixture, RunError> {
    rs.nodes_mut()
        .iter_mut()
        .find(|member| member.port() == node.port)
        .ok_or_else(|| RunError::ServerFailure(format!("{} is not a member of the replica set", node)))
}

fn set_failpoint(view: &ReplicaSetView, node: &NodeInfo, mode: &str) -> Result<(), RunError> {
    let command = json!({"configureFailPoint": FAILPOINT, "mode": mode});
    view.client()
        .run_command(node.port, "admin", &command)
        .map(drop)
        .map_err(|err| {
            RunError::ServerFailure(format!(
                "unable to set {} to {} on {}: {}",
                FAILPOINT, mode, node, err
            ))
        })
}

/// Restart the set with empty data files.
fn restart_and_clear(rs: &mut ReplicaSetFixture) -> Result<(), RunError> {
    info!("Finished verifying data consistency, stopping {}", rs.name());
    if !rs.teardown()? {
        return Err(RunError::ServerFailure(format!(
            "{} did not exit cleanly after verifying data consistency",
            rs.name()
        )));
    }
    info!("Starting {} back up again with no data", rs.name());
    rs.setup()?;
    rs.await_ready()?;
    Ok(())
}

impl Hook for PeriodicKillSecondaries {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    fn before_suite(
        &mut self,
        fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        let rs = Self::replica_set(fixture)?;
        if rs.nodes().len() < 2 {
            return Err(RunError::IncompatibleFixture {
                hook: HOOK_NAME,
                reason: format!("{} has no secondary", rs.name()),
            });
        }
        Ok(())
    }

    fn after_suite(
        &mut self,
        fixture: &mut dyn Fixture,
        report: &mut TestReport,
    ) -> Result<(), RunError> {
        // Kill the secondaries at least once per suite.
        if self.period.is_some() {
            self.run(fixture, report)?;
        }
        Ok(())
    }

    fn before_test(
        &mut self,
        _test: &TestInfo,
        fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        if self.period.is_some() {
            return Ok(());
        }
        let rs = Self::replica_set(fixture)?;
        let view = rs.view();
        for secondary in rs.get_secondaries()? {
            set_failpoint(&view, &secondary, "alwaysOn")?;
        }
        self.period = Some(Period {
            started: self.clock.now(),
            tests: 0,
        });
        Ok(())
    }

    fn after_test(
        &mut self,
        test: &TestInfo,
        fixture: &mut dyn Fixture,
        report: &mut TestReport,
    ) -> Result<(), RunError> {
        self.last_test = Some(test.name.clone());
        let Some(period) = self.period.as_mut() else {
            return Ok(());
        };
        period.tests += 1;
        let elapsed = self.clock.now().saturating_duration_since(period.started);
        if !self.policy.is_due(elapsed, period.tests) {
            return Ok(());
        }
        self.run(fixture, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TestStatus;
    use std::path::Path;
    use testrig_fixture::testing::{fake_server, reap_behind_handle, write_script, ScriptedClient};
    use testrig_fixture::{
        FixtureContext, FixtureError, FixtureState, ManualClock, ReplicaSetOptions, RunConfig,
    };

    fn replica_set(dir: &Path, client: Arc<ScriptedClient>) -> ReplicaSetFixture {
        let config = RunConfig {
            dbpath_prefix: dir.join("db"),
            mongod_executable: fake_server(dir, "mongod").unwrap(),
            ..RunConfig::default()
        };
        let ctx = FixtureContext::new(config, client).with_clock(Arc::new(ManualClock::new()));
        let mut rs =
            ReplicaSetFixture::new(ctx, 0, dir.join("rs"), ReplicaSetOptions::default()).unwrap();
        rs.setup().unwrap();
        rs.await_ready().unwrap();
        rs
    }

    fn hook(dir: &Path, policy: StopPolicy) -> PeriodicKillSecondaries {
        let shell = write_script(dir, "shell", "exit 0").unwrap();
        let checks = [ScriptCheck::CheckReplOplogs, ScriptCheck::CheckReplDBHash]
            .into_iter()
            .map(|check| {
                ScriptHook::new(check, ScriptRunner::new(&shell, "check.js", OptionMap::new()))
            })
            .collect();
        PeriodicKillSecondaries::new(policy, checks, Arc::new(ManualClock::new()))
    }

    fn failpoint_modes(client: &ScriptedClient) -> Vec<(u16, String)> {
        client
            .calls_named("configureFailPoint")
            .into_iter()
            .map(|call| (call.port, call.body["mode"].as_str().unwrap_or("").to_string()))
            .collect()
    }

    #[test]
    fn kills_and_recovers_secondaries_when_the_period_ends() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::healthy_replica_set(20000));
        let mut rs = replica_set(dir.path(), Arc::clone(&client));
        let mut report = TestReport::new();
        let mut hook = hook(dir.path(), StopPolicy::after_samples(2));
        let (a, b) = (TestInfo::new("a.js"), TestInfo::new("b.js"));

        hook.before_suite(&mut rs, &mut report).unwrap();
        hook.before_test(&a, &mut rs, &mut report).unwrap();
        hook.after_test(&a, &mut rs, &mut report).unwrap();
        assert!(hook.period_open());
        assert!(report.records().is_empty());

        hook.before_test(&b, &mut rs, &mut report).unwrap();
        hook.after_test(&b, &mut rs, &mut report).unwrap();
        assert!(!hook.period_open());

        assert_eq!(
            failpoint_modes(&client),
            vec![(20001, "alwaysOn".to_string()), (20001, "off".to_string())]
        );
        let names: Vec<&str> = report.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "b.js:PeriodicKillSecondaries",
                "b.js:PeriodicKillSecondaries:CheckReplOplogs",
                "b.js:PeriodicKillSecondaries:CheckReplDBHash",
            ]
        );
        assert!(report.records().iter().all(|r| r.status == TestStatus::Pass));
        assert!(rs.is_running());
        assert!(rs.nodes().iter().all(|node| !node.preserve_dbpath()));
        rs.teardown().unwrap();
    }

    #[test]
    fn open_period_runs_after_the_suite() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::healthy_replica_set(20000));
        let mut rs = replica_set(dir.path(), Arc::clone(&client));
        let mut report = TestReport::new();
        let mut hook = hook(dir.path(), StopPolicy::after_duration(DEFAULT_PERIOD));
        let a = TestInfo::new("a.js");

        hook.before_test(&a, &mut rs, &mut report).unwrap();
        hook.after_test(&a, &mut rs, &mut report).unwrap();
        assert!(report.records().is_empty());

        hook.after_suite(&mut rs, &mut report).unwrap();
        assert_eq!(report.records()[0].name, "a.js:PeriodicKillSecondaries");
        assert_eq!(report.records()[0].status, TestStatus::Pass);
        rs.teardown().unwrap();
    }

    #[test]
    fn failpoint_errors_are_server_failures() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::healthy_replica_set(20000));
        let mut rs = replica_set(dir.path(), Arc::clone(&client));
        let mut report = TestReport::new();
        let mut hook = hook(dir.path(), StopPolicy::after_samples(1));

        client.set_unreachable(20001, true);
        let err = hook
            .before_test(&TestInfo::new("a.js"), &mut rs, &mut report)
            .unwrap_err();
        assert!(matches!(err, RunError::ServerFailure(_)));
        client.set_unreachable(20001, false);
        rs.teardown().unwrap();
    }

    #[test]
    fn teardown_errors_after_the_kill_are_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::healthy_replica_set(20000));
        let mut rs = replica_set(dir.path(), Arc::clone(&client));
        let mut report = TestReport::new();
        let mut hook = hook(dir.path(), StopPolicy::after_samples(1));
        let a = TestInfo::new("a.js");

        hook.before_test(&a, &mut rs, &mut report).unwrap();
        reap_behind_handle(rs.nodes()[0].pid().unwrap());
        let err = hook.after_test(&a, &mut rs, &mut report).unwrap_err();

        assert!(matches!(err, RunError::Fixture(FixtureError::Process(_))));
        assert!(!hook.period_open());
        assert_eq!(report.records().len(), 1);
        assert_eq!(report.records()[0].status, TestStatus::Error);
        assert!(rs.nodes().iter().all(|node| node.state() == FixtureState::Stopped));
    }

    #[test]
    fn default_period_is_thirty_seconds() {
        let policy = PeriodicKillSecondariesOptions::default().stop_policy();
        assert_eq!(policy, StopPolicy::after_duration(DEFAULT_PERIOD));
        let policy = PeriodicKillSecondariesOptions {
            period_secs: Some(5),
            period_tests: Some(3),
            ..Default::default()
        }
        .stop_policy();
        assert!(!policy.is_due(Duration::from_secs(1), 3));
    }
}
