//! Continuous primary stepdown while tests run.
//!
//! A background actor steps down the primary of every targeted replica set
//! at a fixed interval.  The test thread gates it through a
//! [`StepdownLifecycle`]: the actor only acts while a test is running and
//! goes idle (then reports so) between tests.
//!
//! ```text
//!   before_test: pause, resume ─┐      ┌─ actor ──────────────────────┐
//!   test runs                   ├────▶ │ wait permitted -> step down  │
//!   after_test:  pause          ┘      │ all -> await primaries -> ...│
//!   after_suite: stop, join            └──────────────────────────────┘
//! ```

use crate::error::RunError;
use crate::hook::Hook;
use crate::lifecycle::{FileLifecycle, FlagLifecycle, StepdownFiles, StepdownLifecycle};
use crate::registry::{parse_options, HookContext};
use crate::report::TestReport;
use crate::testcase::TestInfo;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use rand::{Rng, RngCore};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use testrig_fixture::fixture::AWAIT_REPL_TIMEOUT;
use testrig_fixture::{ClientError, Fixture, NodeInfo, ReplicaSetRole, ReplicaSetView};

const HOOK_NAME: &str = "ContinuousStepdown";

/// How long a stepped-down primary stays ineligible.
const STEPDOWN_SECS: u64 = 24 * 60 * 60;

/// Pause between step-up attempts on the old primary.
const STEP_UP_RETRY: Duration = Duration::from_millis(200);

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Salt separating this hook's random stream from other hooks'.
const RNG_SALT: u64 = 0x5354_4550;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContinuousStepdownOptions {
    /// Step down config server replica sets.
    pub config_stepdown: bool,
    /// Step down shard replica sets.
    pub shard_stepdown: bool,
    pub stepdown_interval_ms: u64,
    /// Gate the actor with sentinel files written by the test itself.
    pub use_stepdown_permitted_file: bool,
}

impl Default for ContinuousStepdownOptions {
    fn default() -> Self {
        Self {
            config_stepdown: true,
            shard_stepdown: true,
            stepdown_interval_ms: 8000,
            use_stepdown_permitted_file: false,
        }
    }
}

/// Per-member count of successful step-ups, keyed `"<set>/<host>"`.
pub type StepUpStats = BTreeMap<String, u64>;

/// State shared between the hook and its actor thread.
#[derive(Default)]
struct Shared {
    idle: Mutex<bool>,
    idle_cond: Condvar,
    stopped: AtomicBool,
    error: Mutex<Option<String>>,
    stats: Mutex<StepUpStats>,
}

impl Shared {
    fn set_idle(&self, idle: bool) {
        *self.idle.lock() = idle;
        self.idle_cond.notify_all();
    }
}

struct StepdownActor {
    views: Vec<ReplicaSetView>,
    lifecycle: Arc<dyn StepdownLifecycle>,
    shared: Arc<Shared>,
    interval: Duration,
    rng: Box<dyn RngCore + Send>,
    last_exec: Option<Instant>,
}

impl StepdownActor {
    fn run(mut self) {
        loop {
            self.shared.set_idle(true);
            if !self.lifecycle.wait_for_stepdown_permitted() {
                break;
            }
            self.shared.set_idle(false);

            let due = self
                .last_exec
                .map_or(true, |last| last.elapsed() >= self.interval);
            if due {
                let started = Instant::now();
                info!("Starting stepdown of all primaries");
                if let Err(err) = self.step_down_all() {
                    error!("Stepdown actor failed: {}", err);
                    *self.shared.error.lock() = Some(err.to_string());
                    break;
                }
                self.last_exec = Some(Instant::now());
                info!(
                    "Completed stepdown of all primaries in {} ms",
                    started.elapsed().as_millis()
                );
            }

            if self.lifecycle.poll_for_idle_request() {
                if let Err(err) = self.lifecycle.send_idle_acknowledgement() {
                    *self.shared.error.lock() = Some(format!("idle acknowledgement: {}", err));
                    break;
                }
                continue;
            }

            let since = self.last_exec.map_or(Duration::ZERO, |last| last.elapsed());
            self.lifecycle
                .wait_for_stepdown_interval(self.interval.saturating_sub(since));
        }
        self.shared.set_idle(true);
    }

    fn step_down_all(&mut self) -> Result<(), RunError> {
        let views = self.views.clone();
        for view in &views {
            self.step_down(view)?;
        }
        await_primaries(&views)
    }

    fn step_down(&mut self, view: &ReplicaSetView) -> Result<(), RunError> {
        let primary = match view.find_primary(self.interval) {
            Ok(primary) => primary,
            Err(err) => {
                debug!("{}: no primary to step down yet: {}", view.name(), err);
                return Ok(());
            }
        };
        let mut secondaries = view.secondaries(&primary);
        let client = view.client();

        client.ping(primary.port).map_err(|err| {
            RunError::ServerFailure(format!(
                "primary {} of replica set {} is not running: {}",
                primary,
                view.name(),
                err
            ))
        })?;

        info!("Stepping down the primary {} of replica set {}", primary, view.name());
        let stepdown = json!({"replSetStepDown": STEPDOWN_SECS, "force": true});
        match client.run_command(primary.port, "admin", &stepdown) {
            Ok(_) => {}
            // Stepping down closes every connection, ours included.
            Err(ClientError::Unreachable { .. }) => {}
            Err(err) => {
                error!("Error while stepping down {} of {}: {}", primary, view.name(), err);
                return Err(err.into());
            }
        }

        let mut chosen: Option<NodeInfo> = None;
        while !secondaries.is_empty() {
            let index = self.rng.gen_range(0..secondaries.len());
            let candidate = &secondaries[index];
            info!("Attempting to step up {} of replica set {}", candidate, view.name());
            match client.run_command(candidate.port, "admin", &json!({"replSetStepUp": 1})) {
                Ok(_) => {
                    chosen = Some(candidate.clone());
                    break;
                }
                Err(ClientError::CommandFailed { .. }) => {
                    info!("Failed to step up {} of replica set {}", candidate, view.name());
                    secondaries.swap_remove(index);
                }
                Err(err) => return Err(err.into()),
            }
        }

        client.run_command(primary.port, "admin", &json!({"replSetFreeze": 0}))?;

        if chosen.is_none() {
            self.step_up_old_primary(view, &primary)?;
        }

        let host = chosen.as_ref().map_or_else(|| "none".to_string(), NodeInfo::host);
        *self
            .shared
            .stats
            .lock()
            .entry(format!("{}/{}", view.name(), host))
            .or_insert(0) += 1;
        Ok(())
    }

    /// No secondary could be elected; put the old primary back.
    fn step_up_old_primary(&self, view: &ReplicaSetView, primary: &NodeInfo) -> Result<(), RunError> {
        let clock = view.clock();
        let deadline = clock.deadline(AWAIT_REPL_TIMEOUT);
        loop {
            match view
                .client()
                .run_command(primary.port, "admin", &json!({"replSetStepUp": 1}))
            {
                Ok(_) => return Ok(()),
                Err(ClientError::CommandFailed { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            if clock.remaining(deadline).is_zero() {
                return Err(RunError::ServerFailure(format!(
                    "the old primary {} of replica set {} did not step up in {} seconds",
                    primary,
                    view.name(),
                    AWAIT_REPL_TIMEOUT.as_secs()
                )));
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            clock.sleep(STEP_UP_RETRY);
        }
    }
}

fn await_primaries(views: &[ReplicaSetView]) -> Result<(), RunError> {
    for view in views {
        view.find_primary(AWAIT_REPL_TIMEOUT)?;
    }
    Ok(())
}

/// Handle on a running actor.
struct StepdownThread {
    handle: Option<JoinHandle<()>>,
    lifecycle: Arc<dyn StepdownLifecycle>,
    views: Vec<ReplicaSetView>,
}

impl StepdownThread {
    fn is_alive(&self) -> bool {
        self.handle.as_ref().map_or(false, |handle| !handle.is_finished())
    }
}

/// Steps down replica set primaries in the background while tests run.
pub struct ContinuousStepdown {
    options: ContinuousStepdownOptions,
    rng: Option<Box<dyn RngCore + Send>>,
    shared: Arc<Shared>,
    thread: Option<StepdownThread>,
}

impl ContinuousStepdown {
    pub fn new(options: ContinuousStepdownOptions, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            options,
            rng: Some(rng),
            shared: Arc::new(Shared::default()),
            thread: None,
        }
    }

    pub fn from_options(ctx: &HookContext, options: &serde_json::Value) -> Result<Self, RunError> {
        let options = parse_options(HOOK_NAME, options)?;
        Ok(Self::new(options, ctx.rng(RNG_SALT)))
    }

    /// Successful step-ups so far.
    pub fn step_up_stats(&self) -> StepUpStats {
        self.shared.stats.lock().clone()
    }

    fn targets(&self, fixture: &dyn Fixture) -> Result<Vec<ReplicaSetView>, RunError> {
        let views: Vec<ReplicaSetView> = fixture
            .replica_sets()
            .into_iter()
            .filter(|view| match view.role() {
                ReplicaSetRole::ReplicaSet => true,
                ReplicaSetRole::Shard => self.options.shard_stepdown,
                ReplicaSetRole::ConfigServer => self.options.config_stepdown,
            })
            .collect();
        if views.is_empty() {
            return Err(RunError::IncompatibleFixture {
                hook: HOOK_NAME,
                reason: format!("{} has no replica set to step down", fixture.name()),
            });
        }
        if let Some(view) = views.iter().find(|view| !view.all_nodes_electable()) {
            return Err(RunError::IncompatibleFixture {
                hook: HOOK_NAME,
                reason: format!("replica set {} must have all_nodes_electable set", view.name()),
            });
        }
        Ok(views)
    }

    fn check_thread(&self) -> Result<(), RunError> {
        let alive = self.thread.as_ref().map_or(false, StepdownThread::is_alive);
        if alive {
            return Ok(());
        }
        let mut msg = "the stepdown thread is not running".to_string();
        if let Some(err) = self.shared.error.lock().as_ref() {
            msg = format!("{}: {}", msg, err);
        }
        error!("{}", msg);
        Err(RunError::ServerFailure(msg))
    }

    /// Make the actor idle and wait until every set has a primary.
    fn pause(&self) -> Result<(), RunError> {
        let Some(thread) = self.thread.as_ref() else {
            return Ok(());
        };
        thread.lifecycle.mark_test_finished()?;
        {
            let mut idle = self.shared.idle.lock();
            while !*idle && thread.is_alive() {
                self.shared.idle_cond.wait_for(&mut idle, IDLE_POLL);
            }
        }
        await_primaries(&thread.views)
    }

    fn resume(&self) {
        if let Some(thread) = self.thread.as_ref() {
            thread.lifecycle.mark_test_started();
            info!(
                "Current statistics about which nodes have been successfully stepped up: {:?}",
                self.step_up_stats()
            );
        }
    }

    fn stop(&mut self) -> Result<(), RunError> {
        let Some(mut thread) = self.thread.take() else {
            return Ok(());
        };
        self.shared.stopped.store(true, Ordering::SeqCst);
        thread.lifecycle.stop();
        if let Some(handle) = thread.handle.take() {
            if handle.join().is_err() {
                return Err(RunError::ServerFailure("the stepdown thread panicked".into()));
            }
        }
        match self.shared.error.lock().take() {
            Some(err) => Err(RunError::ServerFailure(err)),
            None => Ok(()),
        }
    }
}

impl Hook for ContinuousStepdown {
    fn name(&self) -> &str {
        HOOK_NAME
    }

    fn before_suite(
        &mut self,
        fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        let views = self.targets(fixture)?;
        let lifecycle: Arc<dyn StepdownLifecycle> = if self.options.use_stepdown_permitted_file {
            Arc::new(FileLifecycle::new(StepdownFiles::in_dir(fixture.dbpath_prefix())))
        } else {
            Arc::new(FlagLifecycle::new())
        };
        let rng = self.rng.take().ok_or_else(|| {
            RunError::ServerFailure("the stepdown thread was already started".into())
        })?;

        let actor = StepdownActor {
            views: views.clone(),
            lifecycle: Arc::clone(&lifecycle),
            shared: Arc::clone(&self.shared),
            interval: Duration::from_millis(self.options.stepdown_interval_ms),
            rng,
            last_exec: None,
        };
        *self.shared.idle.lock() = true;
        let handle = thread::Builder::new()
            .name("stepdown".into())
            .spawn(move || actor.run())?;
        info!("Started the stepdown thread for {} replica set(s)", views.len());
        self.thread = Some(StepdownThread {
            handle: Some(handle),
            lifecycle,
            views,
        });
        Ok(())
    }

    fn after_suite(
        &mut self,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        info!("Stopping the stepdown thread");
        self.stop()
    }

    fn before_test(
        &mut self,
        _test: &TestInfo,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        self.check_thread()?;
        info!("Resuming the stepdown thread");
        self.pause()?;
        self.resume();
        Ok(())
    }

    fn after_test(
        &mut self,
        _test: &TestInfo,
        _fixture: &mut dyn Fixture,
        _report: &mut TestReport,
    ) -> Result<(), RunError> {
        self.check_thread()?;
        info!("Pausing the stepdown thread");
        self.pause()?;
        info!("Paused the stepdown thread");
        Ok(())
    }
}

impl Drop for ContinuousStepdown {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("Stepdown thread stopped with an error: {}", err);
        }
    }
}
