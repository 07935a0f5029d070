//! Continuous initial sync of a hidden replica set member.
//!
//! The replica set carries a member that does nothing but initial sync.
//! After every test the hook checks it: once it reaches SECONDARY its data
//! is validated and it is restarted with empty data files, which starts
//! the next sync.  Every `n` tests the hook insists, waiting up to
//! [`SYNC_TIMEOUT`] for the sync to finish.

use crate::consistency::ScriptRunner;
use crate::error::RunError;
use crate::hook::Hook;
use crate::registry::{parse_options, HookContext};
use crate::report::TestReport;
use crate::testcase::{run_dynamic_test, DynamicOutcome, TestInfo};
use log::{info, warn};
use rand::{Rng, RngCore};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use testrig_fixture::fixture::replicaset::STATE_SECONDARY;
use testrig_fixture::fixture::POLL_INTERVAL;
use testrig_fixture::{
    ClientError, Clock, Fixture, NodeInfo, OptionMap, ReplicaSetFixture, ReplicaSetView,
};

const HOOK_NAME: &str = "BackgroundInitialSync";

/// Bound on the wait for a sync to finish.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Chance of an extra restart while a sync is still running.
const RESTART_PROBABILITY: f64 = 0.2;

const RNG_SALT: u64 = 0x494e_4954;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundInitialSyncOptions {
    /// Tests between insisting checks.
    pub n: usize,
    pub shell_options: OptionMap,
    /// Validation script run against the synced member.
    pub script: PathBuf,
}

impl Default for BackgroundInitialSyncOptions {
    fn default() -> Self {
        Self {
            n: 20,
            shell_options: OptionMap::new(),
            script: PathBuf::from("jstests/hooks/run_initial_sync_node_validation.js"),
        }
    }
}

pub struct BackgroundInitialSync {
    n: usize,
    tests_run: usize,
    random_restarts: usize,
    validator: ScriptRunner,
    clock: Arc<dyn Clock>,
    rng: Box<dyn RngCore + Send>,
}

impl BackgroundInitialSync {
    pub fn new(
        n: usize,
        validator: ScriptRunner,
        clock: Arc<dyn Clock>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            n: n.max(1),
            tests_run: 0,
            random_restarts: 0,
            validator,
            clock,
            rng,
        }
    }

    pub fn from_options(ctx: &HookContext, options: &serde_json::Value) -> Result<Self, RunError> {
        let options: BackgroundInitialSyncOptions = parse_options(HOOK_NAME, options)?;
        let validator = ScriptRunner::new(
            &ctx.config.shell_executable,
            options.script,
            options.shell_options,
        );
        Ok(Self::new(
            options.n,
            validator,
            Arc::clone(&ctx.clock),
            ctx.rng(RNG_SALT),
        ))
    }

    /// Replace the randomness source deciding extra restarts.
    pub fn with_rng(mut self, rng: Box<dyn RngCore + Send>) -> Self {
        self.rng = rng;
        self
    }

    pub fn tests_run(&self) -> usize {
        self.tests_run
    }

    /// Extra restarts during the current sync.
    pub fn random_restarts(&self) -> usize {
        self.random_restarts
    }

    fn wait_for_secondary(&self, view: &ReplicaSetView, node: &NodeInfo) {
        let deadline = self.clock.deadline(SYNC_TIMEOUT);
        loop {
            if matches!(view.member_state(node), Ok(STATE_SECONDARY)) {
                return;
            }
            if self.clock.remaining(deadline).is_zero() {
                return;
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    fn check_sync_node(
        &mut self,
        rs: &mut ReplicaSetFixture,
        node: &NodeInfo,
    ) -> Result<DynamicOutcome, RunError> {
        let view = rs.view();
        let insist = self.tests_run >= self.n;
        if insist {
            self.tests_run = 0;
            info!("{}: waiting for {} to finish initial sync", HOOK_NAME, node);
            self.wait_for_secondary(&view, node);
        }

        match view.member_state(node) {
            Ok(STATE_SECONDARY) => {
                info!("{}: {} finished initial sync, validating it", HOOK_NAME, node);
                self.validator.run(HOOK_NAME, &node.host())?;
                restart_sync_node(rs)?;
                self.random_restarts = 0;
                Ok(DynamicOutcome::Passed)
            }
            Ok(state) if insist => Err(RunError::TestFailure(format!(
                "{} did not finish initial sync within {} minutes (state {})",
                node,
                SYNC_TIMEOUT.as_secs() / 60,
                state
            ))),
            Ok(state) => {
                if self.random_restarts < 1 && self.rng.gen_bool(RESTART_PROBABILITY) {
                    info!("{}: restarting {} in the middle of initial sync", HOOK_NAME, node);
                    restart_sync_node(rs)?;
                    self.random_restarts += 1;
                }
                Ok(DynamicOutcome::Skipped(format!(
                    "{} is still in initial sync (state {})",
                    node, state
                )))
            }
            Err(err @ ClientError::CommandFailed { .. }) if insist => {
                Err(RunError::TestFailure(format!(
                    "{} did not finish initial sync within {} minutes: {}",
                    node,
                    SYNC_TIMEOUT.as_secs() / 60,
                    err
                )))
            }
            // A member early in initial sync refuses status requests.
            Err(err @ ClientError::CommandFailed { .. }) => Ok(DynamicOutcome::Skipped(format!(
                "{} is not ready: {}",
                node, err
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

/// Restart the sync member with empty data files.
fn restart_sync_node(rs: &mut ReplicaSetFixture) -> Result<(), RunError> {
    let name = rs.replset_name().to_string();
    let node = rs.initial_sync_node_mut().ok_or(RunError::IncompatibleFixture {
        hook: HOOK_NAME,
        reason: format!("replica set {} has no initial sync member", name),
    })?;
    if !node.teardown()? {
        warn!("{}: {} did not exit cleanly", HOOK_NAME, node.name());
    }
    node.set_preserve_dbpath(false);
    node.setup()?;
    node.await_ready()?;
    Ok(())
}

impl Hook for BackgroundInitialSync {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    fn before_suite(
        &mut self,
        fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        let name = fixture.name().to_string();
        match fixture.as_replica_set_mut() {
            Some(rs) if rs.initial_sync_node().is_some() => Ok(()),
            _ => Err(RunError::IncompatibleFixture {
                hook: HOOK_NAME,
                reason: format!("{} is not a replica set with an initial sync member", name),
            }),
        }
    }

    fn after_test(
        &mut self,
        test: &TestInfo,
        fixture: &mut dyn Fixture,
        report: &mut TestReport,
    ) -> Result<(), RunError> {
        self.tests_run += 1;
        let name = fixture.name().to_string();
        let incompatible = || RunError::IncompatibleFixture {
            hook: HOOK_NAME,
            reason: format!("{} is not a replica set with an initial sync member", name),
        };
        let rs = fixture.as_replica_set_mut().ok_or_else(incompatible)?;
        let node = rs.initial_sync_node().ok_or_else(incompatible)?;

        run_dynamic_test(report, &test.name, HOOK_NAME, |_| {
            self.check_sync_node(rs, &node)
        })
    }
}
