//! Shared test doubles for this crate's unit tests.

use std::path::{Path, PathBuf};
use testrig_fixture::{Fixture, FixtureError, FixtureState, NodeInfo, ReplicaSetView};

/// A fixture without processes that counts lifecycle calls.
pub struct FakeFixture {
    pub setups: usize,
    pub ready_waits: usize,
    pub teardowns: usize,
    /// Lifecycle calls in order.
    pub events: Vec<&'static str>,
    /// What the next teardown reports.
    pub clean_shutdown: bool,
    pub running: bool,
    pub views: Vec<ReplicaSetView>,
    dbpath: PathBuf,
    state: FixtureState,
}

impl FakeFixture {
    pub fn new(dbpath: &Path) -> Self {
        Self {
            setups: 0,
            ready_waits: 0,
            teardowns: 0,
            events: Vec::new(),
            clean_shutdown: true,
            running: true,
            views: Vec::new(),
            dbpath: dbpath.to_path_buf(),
            state: FixtureState::Ready,
        }
    }

    pub fn with_views(mut self, views: Vec<ReplicaSetView>) -> Self {
        self.views = views;
        self
    }
}

impl Fixture for FakeFixture {
    fn name(&self) -> &str {
        "fake"
    }

    fn job_num(&self) -> usize {
        0
    }

    fn state(&self) -> FixtureState {
        self.state
    }

    fn setup(&mut self) -> Result<(), FixtureError> {
        self.setups += 1;
        self.events.push("setup");
        self.running = true;
        self.state = FixtureState::Configured;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), FixtureError> {
        self.ready_waits += 1;
        self.events.push("await_ready");
        self.state = FixtureState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> Result<bool, FixtureError> {
        self.teardowns += 1;
        self.events.push("teardown");
        self.running = false;
        self.state = FixtureState::Stopped;
        Ok(self.clean_shutdown)
    }

    fn is_running(&mut self) -> bool {
        self.running
    }

    fn get_primary(&self) -> Result<NodeInfo, FixtureError> {
        Ok(NodeInfo::new("fake", 20000))
    }

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError> {
        Ok(Vec::new())
    }

    fn connection_string(&self) -> String {
        "localhost:20000".to_string()
    }

    fn dbpath_prefix(&self) -> &Path {
        &self.dbpath
    }

    fn replica_sets(&self) -> Vec<ReplicaSetView> {
        self.views.clone()
    }
}
