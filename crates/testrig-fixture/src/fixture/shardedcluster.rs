//! Sharded cluster: a config server replica set, shards and routers.
//!
//! ```text
//!           tests
//!             │
//!   mongos0 … mongosN          routers, started once the config servers are up
//!      │          │
//!   shard0 … shardN            standalone servers or replica sets
//!      └────┬─────┘
//!        config                 replica set with the config server role
//! ```

use super::replicaset::{ReplicaSetFixture, ReplicaSetOptions, ReplicaSetRole, ReplicaSetView};
use super::standalone::MongodFixture;
use super::{expect_state, Fixture, FixtureContext, FixtureState, NodeInfo, TeardownTally};
use super::{AWAIT_READY_TIMEOUT, POLL_INTERVAL};
use crate::error::FixtureError;
use crate::process::{build_args, OptionMap, OptionValue, Process, ProcessState, StopSignal};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShardedClusterOptions {
    pub num_shards: usize,
    pub num_mongos: usize,
    /// Members per shard replica set.  Shards are standalone servers when
    /// unset.
    pub num_rs_nodes_per_shard: Option<usize>,
    /// `all_nodes_electable` of every shard replica set.
    pub all_nodes_electable: bool,
    pub configsvr_options: ReplicaSetOptions,
    /// Options of every shard server.
    pub shard_options: OptionMap,
    /// Options of every router, on top of the run-wide router options.
    pub mongos_options: OptionMap,
    pub enable_balancer: bool,
}

impl Default for ShardedClusterOptions {
    fn default() -> Self {
        Self {
            num_shards: 1,
            num_mongos: 1,
            num_rs_nodes_per_shard: None,
            all_nodes_electable: false,
            configsvr_options: ReplicaSetOptions {
                replset_name: "config".to_string(),
                num_nodes: 1,
                all_nodes_electable: true,
                ..ReplicaSetOptions::default()
            },
            shard_options: OptionMap::new(),
            mongos_options: OptionMap::new(),
            enable_balancer: true,
        }
    }
}

/// One `mongos` router.
#[derive(Debug)]
pub struct MongosFixture {
    ctx: FixtureContext,
    job_num: usize,
    name: String,
    port: u16,
    configdb: String,
    options: OptionMap,
    process: Option<Process>,
    state: FixtureState,
}

impl MongosFixture {
    pub fn new(
        ctx: FixtureContext,
        job_num: usize,
        name: impl Into<String>,
        configdb: String,
        options: OptionMap,
    ) -> Result<Self, FixtureError> {
        let port = ctx.ports.next_fixture_port(job_num)?;
        Ok(Self {
            ctx,
            job_num,
            name: name.into(),
            port,
            configdb,
            options,
            process: None,
            state: FixtureState::Created,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn node(&self) -> NodeInfo {
        NodeInfo::new(self.name.clone(), self.port)
    }

    pub fn command_line(&self) -> Vec<String> {
        let mut options = self.ctx.config.mongos_options.clone();
        options.extend(self.options.clone());
        options.insert("port".into(), OptionValue::from(self.port));
        options.insert("configdb".into(), OptionValue::from(self.configdb.as_str()));
        build_args(&self.ctx.config.mongos_executable, &options, &[])
    }
}

impl Fixture for MongosFixture {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_num(&self) -> usize {
        self.job_num
    }

    fn state(&self) -> FixtureState {
        self.state
    }

    fn setup(&mut self) -> Result<(), FixtureError> {
        expect_state(
            &self.name,
            self.state,
            &[FixtureState::Created, FixtureState::Stopped],
            "created or stopped",
        )?;
        let mut process = Process::new(format!("mongos:{}", self.port), self.command_line());
        process.start()?;
        self.process = Some(process);
        self.state = FixtureState::Configured;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), FixtureError> {
        if self.state == FixtureState::Ready {
            return Ok(());
        }
        expect_state(&self.name, self.state, &[FixtureState::Configured], "configured")?;

        let deadline = self.ctx.clock.deadline(AWAIT_READY_TIMEOUT);
        loop {
            if let Some(process) = self.process.as_mut() {
                if let ProcessState::Exited(code) | ProcessState::Killed(code) = process.poll() {
                    return Err(FixtureError::ProcessExited {
                        name: self.name.clone(),
                        code,
                    });
                }
            }
            match self.ctx.client.ping(self.port) {
                Ok(()) => break,
                Err(_) if self.ctx.clock.remaining(deadline).is_zero() => {
                    return Err(FixtureError::ReadyTimeout {
                        name: self.name.clone(),
                        timeout: AWAIT_READY_TIMEOUT,
                    });
                }
                Err(err) => {
                    debug!("{}: waiting to accept connections: {}", self.name, err);
                    self.ctx.clock.sleep(POLL_INTERVAL);
                }
            }
        }
        self.state = FixtureState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> Result<bool, FixtureError> {
        let Some(process) = self.process.as_mut() else {
            self.state = FixtureState::Stopped;
            return Ok(true);
        };
        let was_running = process.is_running();
        if was_running {
            process.stop(StopSignal::Terminate)?;
        } else {
            warn!("{} had already exited before teardown", self.name);
        }
        let code = process.wait()?;
        self.state = FixtureState::Stopped;
        Ok(was_running && code == 0)
    }

    fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(Process::is_running)
    }

    fn get_primary(&self) -> Result<NodeInfo, FixtureError> {
        Ok(self.node())
    }

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError> {
        Ok(Vec::new())
    }

    fn connection_string(&self) -> String {
        self.node().host()
    }

    fn dbpath_prefix(&self) -> &Path {
        Path::new("")
    }
}

/// Config servers, shards and routers torn down as one unit.
pub struct ShardedClusterFixture {
    ctx: FixtureContext,
    job_num: usize,
    options: ShardedClusterOptions,
    dbpath_prefix: PathBuf,
    configsvr: ReplicaSetFixture,
    shards: Vec<Box<dyn Fixture>>,
    mongos: Vec<MongosFixture>,
    state: FixtureState,
}

impl ShardedClusterFixture {
    pub fn new(
        ctx: FixtureContext,
        job_num: usize,
        dbpath_prefix: PathBuf,
        options: ShardedClusterOptions,
    ) -> Result<Self, FixtureError> {
        let configsvr = ReplicaSetFixture::with_role(
            ctx.clone(),
            job_num,
            dbpath_prefix.join("config"),
            options.configsvr_options.clone(),
            ReplicaSetRole::ConfigServer,
        )?;

        let mut shards: Vec<Box<dyn Fixture>> = Vec::with_capacity(options.num_shards);
        for i in 0..options.num_shards {
            let shard_path = dbpath_prefix.join(format!("shard{}", i));
            match options.num_rs_nodes_per_shard {
                Some(num_nodes) => {
                    let rs_options = ReplicaSetOptions {
                        replset_name: format!("shard-rs{}", i),
                        num_nodes,
                        all_nodes_electable: options.all_nodes_electable,
                        mongod_options: options.shard_options.clone(),
                        ..ReplicaSetOptions::default()
                    };
                    shards.push(Box::new(ReplicaSetFixture::with_role(
                        ctx.clone(),
                        job_num,
                        shard_path,
                        rs_options,
                        ReplicaSetRole::Shard,
                    )?));
                }
                None => {
                    let mut shard_options = options.shard_options.clone();
                    shard_options.insert("shardsvr".into(), OptionValue::flag());
                    shards.push(Box::new(MongodFixture::new(
                        ctx.clone(),
                        job_num,
                        format!("shard{}", i),
                        shard_path,
                        shard_options,
                    )?));
                }
            }
        }

        let configdb = configsvr.connection_string();
        let mut mongos = Vec::with_capacity(options.num_mongos);
        for i in 0..options.num_mongos {
            mongos.push(MongosFixture::new(
                ctx.clone(),
                job_num,
                format!("mongos{}", i),
                configdb.clone(),
                options.mongos_options.clone(),
            )?);
        }

        Ok(Self {
            ctx,
            job_num,
            options,
            dbpath_prefix,
            configsvr,
            shards,
            mongos,
            state: FixtureState::Created,
        })
    }

    pub fn configsvr(&self) -> &ReplicaSetFixture {
        &self.configsvr
    }

    pub fn shards(&self) -> &[Box<dyn Fixture>] {
        &self.shards
    }

    pub fn mongos(&self) -> &[MongosFixture] {
        &self.mongos
    }

    fn first_router(&self) -> Result<&MongosFixture, FixtureError> {
        self.mongos
            .first()
            .ok_or(FixtureError::Unsupported("a sharded cluster without routers"))
    }

    fn add_shards(&self) -> Result<(), FixtureError> {
        let router = self.first_router()?;
        for shard in &self.shards {
            let connection = shard.connection_string();
            info!("Adding shard {} to the cluster", connection);
            self.ctx
                .client
                .run_command(router.port(), "admin", &json!({"addShard": connection}))?;
        }
        if !self.options.enable_balancer {
            self.ctx
                .client
                .run_command(router.port(), "admin", &json!({"balancerStop": 1}))?;
        }
        Ok(())
    }
}

impl Fixture for ShardedClusterFixture {
    fn name(&self) -> &str {
        "sharded-cluster"
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
        self.configsvr.setup()?;
        for shard in &mut self.shards {
            shard.setup()?;
        }
        self.state = FixtureState::Configured;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), FixtureError> {
        if self.state == FixtureState::Ready {
            return Ok(());
        }
        expect_state(self.name(), self.state, &[FixtureState::Configured], "configured")?;

        self.configsvr.await_ready()?;
        for shard in &mut self.shards {
            shard.await_ready()?;
        }
        // Routers refuse to start until the config servers are reachable.
        for router in &mut self.mongos {
            router.setup()?;
        }
        for router in &mut self.mongos {
            router.await_ready()?;
        }
        self.add_shards()?;

        info!("Sharded cluster with {} shard(s) is ready", self.shards.len());
        self.state = FixtureState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> Result<bool, FixtureError> {
        let mut tally = TeardownTally::new("sharded-cluster");
        for router in self.mongos.iter_mut().rev() {
            let result = router.teardown();
            tally.record(router.name(), result);
        }
        for shard in self.shards.iter_mut().rev() {
            let result = shard.teardown();
            tally.record(shard.name(), result);
        }
        let result = self.configsvr.teardown();
        tally.record("config servers", result);
        self.state = FixtureState::Stopped;
        tally.finish()
    }

    fn is_running(&mut self) -> bool {
        self.configsvr.is_running()
            && self.shards.iter_mut().all(|shard| shard.is_running())
            && self.mongos.iter_mut().all(|router| router.is_running())
    }

    fn get_primary(&self) -> Result<NodeInfo, FixtureError> {
        Ok(self.first_router()?.node())
    }

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError> {
        Ok(Vec::new())
    }

    fn connection_string(&self) -> String {
        self.mongos
            .first()
            .map(|router| router.node().host())
            .unwrap_or_default()
    }

    fn dbpath_prefix(&self) -> &Path {
        &self.dbpath_prefix
    }

    fn replica_sets(&self) -> Vec<ReplicaSetView> {
        let mut views = vec![self.configsvr.view()];
        for shard in &self.shards {
            views.extend(shard.replica_sets());
        }
        views
    }
}

impl std::fmt::Debug for ShardedClusterFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedClusterFixture")
            .field("job_num", &self.job_num)
            .field("configsvr", &self.configsvr)
            .field("shards", &self.shards.len())
            .field("mongos", &self.mongos)
            .field("state", &self.state)
            .finish()
    }
}
