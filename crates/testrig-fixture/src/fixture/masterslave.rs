//! Primary/secondary pair using legacy master/slave replication.

use super::standalone::MongodFixture;
use super::{await_replicated_write, expect_state, Fixture, FixtureContext, FixtureState};
use super::{NodeInfo, TeardownTally, AWAIT_REPL_TIMEOUT};
use crate::error::FixtureError;
use crate::process::{OptionMap, OptionValue};
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterSlaveOptions {
    /// Options of both servers.
    pub mongod_options: OptionMap,
    pub master_options: OptionMap,
    pub slave_options: OptionMap,
}

/// A master and one slave replicating from it.
#[derive(Debug)]
pub struct MasterSlaveFixture {
    ctx: FixtureContext,
    job_num: usize,
    dbpath_prefix: PathBuf,
    master: MongodFixture,
    slave: MongodFixture,
    state: FixtureState,
}

impl MasterSlaveFixture {
    pub fn new(
        ctx: FixtureContext,
        job_num: usize,
        dbpath_prefix: PathBuf,
        options: MasterSlaveOptions,
    ) -> Result<Self, FixtureError> {
        let mut master_options = options.mongod_options.clone();
        master_options.extend(options.master_options);
        master_options.insert("master".into(), OptionValue::flag());
        let master = MongodFixture::new(
            ctx.clone(),
            job_num,
            "master",
            dbpath_prefix.join("master"),
            master_options,
        )?;

        let mut slave_options = options.mongod_options;
        slave_options.extend(options.slave_options);
        slave_options.insert("slave".into(), OptionValue::flag());
        slave_options.insert("source".into(), OptionValue::from(master.node().host()));
        let slave = MongodFixture::new(
            ctx.clone(),
            job_num,
            "slave",
            dbpath_prefix.join("slave"),
            slave_options,
        )?;

        Ok(Self {
            ctx,
            job_num,
            dbpath_prefix,
            master,
            slave,
            state: FixtureState::Created,
        })
    }

    pub fn master(&self) -> &MongodFixture {
        &self.master
    }

    pub fn slave(&self) -> &MongodFixture {
        &self.slave
    }
}

impl Fixture for MasterSlaveFixture {
    fn name(&self) -> &str {
        "master-slave"
    }

    fn job_num(&self) -> usize {
        self.job_num
    }

    fn state(&self) -> FixtureState {
        self.state
    }

    fn setup(&mut self) -> Result<(), FixtureError> {
        expect_state(
            self.name(),
            self.state,
            &[FixtureState::Created, FixtureState::Stopped],
            "created or stopped",
        )?;
        self.master.setup()?;
        self.slave.setup()?;
        self.state = FixtureState::Configured;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), FixtureError> {
        if self.state == FixtureState::Ready {
            return Ok(());
        }
        expect_state(self.name(), self.state, &[FixtureState::Configured], "configured")?;
        self.master.await_ready()?;
        self.slave.await_ready()?;
        await_replicated_write(&self.ctx, "master-slave", self.master.port(), AWAIT_REPL_TIMEOUT)?;
        info!("Master/slave pair is ready");
        self.state = FixtureState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> Result<bool, FixtureError> {
        let mut tally = TeardownTally::new("master-slave");
        let result = self.slave.teardown();
        tally.record("slave", result);
        let result = self.master.teardown();
        tally.record("master", result);
        self.state = FixtureState::Stopped;
        tally.finish()
    }

    fn is_running(&mut self) -> bool {
        self.master.is_running() && self.slave.is_running()
    }

    fn get_primary(&self) -> Result<NodeInfo, FixtureError> {
        Ok(self.master.node())
    }

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError> {
        Ok(vec![self.slave.node()])
    }

    fn connection_string(&self) -> String {
        self.master.node().host()
    }

    fn dbpath_prefix(&self) -> &Path {
        &self.dbpath_prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::testing::{fake_server, ScriptedClient};
    use std::sync::Arc;

    #[test]
    fn slave_replicates_from_master_and_stops_first() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            mongod_executable: fake_server(dir.path(), "mongod").unwrap(),
            ..RunConfig::default()
        };
        let client = Arc::new(ScriptedClient::ok());
        let ctx = FixtureContext::new(config, client.clone());
        let mut pair =
            MasterSlaveFixture::new(ctx, 2, dir.path().join("ms"), MasterSlaveOptions::default()).unwrap();

        let slave_args = pair.slave().command_line();
        assert!(slave_args.contains(&"--slave".to_string()));
        assert!(slave_args.contains(&"--source=localhost:20500".to_string()));
        assert!(pair.master().command_line().contains(&"--master".to_string()));

        pair.setup().unwrap();
        pair.await_ready().unwrap();
        assert_eq!(pair.get_primary().unwrap().port, 20500);
        assert_eq!(pair.get_secondaries().unwrap()[0].port, 20501);

        let writes = client.calls_named("insert");
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].port, 20500);

        assert!(pair.teardown().unwrap());
        assert_eq!(pair.state(), FixtureState::Stopped);
    }
}
