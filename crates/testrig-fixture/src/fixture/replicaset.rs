//! Replica set topology: n data-bearing members plus an optional hidden
//! member that only ever performs initial sync.

use super::standalone::MongodFixture;
use super::{await_replicated_write, expect_state, Fixture, FixtureContext, FixtureState};
use super::{NodeInfo, TeardownTally, AWAIT_READY_TIMEOUT, AWAIT_REPL_TIMEOUT, POLL_INTERVAL};
use crate::client::{AdminClient, ClientError};
use crate::clock::Clock;
use crate::error::FixtureError;
use crate::process::{OptionMap, OptionValue};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Server error code for `replSetInitiate` on an initiated set.
const ALREADY_INITIALIZED: i64 = 23;

/// `replSetGetStatus.myState` of a primary.
pub const STATE_PRIMARY: i64 = 1;

/// `replSetGetStatus.myState` of a secondary.
pub const STATE_SECONDARY: i64 = 2;

/// Options of a replica set topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaSetOptions {
    pub replset_name: String,
    pub num_nodes: usize,
    /// Add a hidden, non-voting member used for continuous initial sync.
    pub start_initial_sync_node: bool,
    /// Give every data-bearing member the default priority.  Otherwise
    /// only the first member can become primary.
    pub all_nodes_electable: bool,
    /// Options of every member, on top of the run-wide server options.
    pub mongod_options: OptionMap,
    /// `settings` document of the replica set configuration.
    pub settings: Option<Value>,
}

impl Default for ReplicaSetOptions {
    fn default() -> Self {
        Self {
            replset_name: "rs".to_string(),
            num_nodes: 2,
            start_initial_sync_node: false,
            all_nodes_electable: false,
            mongod_options: OptionMap::new(),
            settings: None,
        }
    }
}

/// What a replica set is used for inside a larger topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaSetRole {
    ReplicaSet,
    Shard,
    ConfigServer,
}

/// Process-free view of a replica set.
///
/// Cheap to clone and safe to hand to background threads: it only holds
/// member addresses and the admin client.
#[derive(Clone)]
pub struct ReplicaSetView {
    name: String,
    role: ReplicaSetRole,
    members: Vec<NodeInfo>,
    all_nodes_electable: bool,
    client: Arc<dyn AdminClient>,
    clock: Arc<dyn Clock>,
}

impl ReplicaSetView {
    pub fn new(
        name: impl Into<String>,
        role: ReplicaSetRole,
        members: Vec<NodeInfo>,
        client: Arc<dyn AdminClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            members,
            all_nodes_electable: true,
            client,
            clock,
        }
    }

    pub fn with_all_nodes_electable(mut self, electable: bool) -> Self {
        self.all_nodes_electable = electable;
        self
    }

    /// Whether any member, not just the first, may become primary.
    pub fn all_nodes_electable(&self) -> bool {
        self.all_nodes_electable
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ReplicaSetRole {
        self.role
    }

    /// Data-bearing members, excluding the initial sync member.
    pub fn members(&self) -> &[NodeInfo] {
        &self.members
    }

    pub fn client(&self) -> &dyn AdminClient {
        self.client.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Whether `node` currently claims to be primary.
    pub fn is_primary(&self, node: &NodeInfo) -> Result<bool, ClientError> {
        let response = self
            .client
            .run_command(node.port, "admin", &json!({"isMaster": 1}))?;
        Ok(response.get("ismaster").and_then(Value::as_bool).unwrap_or(false))
    }

    /// `replSetGetStatus.myState` of `node`.
    pub fn member_state(&self, node: &NodeInfo) -> Result<i64, ClientError> {
        let response = self
            .client
            .run_command(node.port, "admin", &json!({"replSetGetStatus": 1}))?;
        response
            .get("myState")
            .and_then(Value::as_i64)
            .ok_or_else(|| ClientError::Protocol {
                port: node.port,
                detail: "replSetGetStatus response has no myState".to_string(),
            })
    }

    /// Poll every member until one is primary.
    pub fn find_primary(&self, timeout: Duration) -> Result<NodeInfo, FixtureError> {
        let deadline = self.clock.deadline(timeout);
        loop {
            for node in &self.members {
                match self.is_primary(node) {
                    Ok(true) => {
                        debug!("{}: primary is {}", self.name, node);
                        return Ok(node.clone());
                    }
                    Ok(false) => {}
                    Err(err) => debug!("{}: could not ask {} for its role: {}", self.name, node, err),
                }
            }
            if self.clock.remaining(deadline).is_zero() {
                return Err(FixtureError::NoPrimary {
                    replset: self.name.clone(),
                    timeout,
                });
            }
            self.clock.sleep(POLL_INTERVAL);
        }
    }

    /// Every member except `primary`.
    pub fn secondaries(&self, primary: &NodeInfo) -> Vec<NodeInfo> {
        self.members
            .iter()
            .filter(|node| *node != primary)
            .cloned()
            .collect()
    }
}

impl fmt::Debug for ReplicaSetView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaSetView")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

/// A replica set of [`MongodFixture`] members.
#[derive(Debug)]
pub struct ReplicaSetFixture {
    ctx: FixtureContext,
    job_num: usize,
    options: ReplicaSetOptions,
    role: ReplicaSetRole,
    dbpath_prefix: PathBuf,
    nodes: Vec<MongodFixture>,
    initial_sync_node: Option<MongodFixture>,
    state: FixtureState,
}

impl ReplicaSetFixture {
    pub fn new(
        ctx: FixtureContext,
        job_num: usize,
        dbpath_prefix: PathBuf,
        options: ReplicaSetOptions,
    ) -> Result<Self, FixtureError> {
        Self::with_role(ctx, job_num, dbpath_prefix, options, ReplicaSetRole::ReplicaSet)
    }

    /// A replica set playing `role` inside a sharded cluster.
    pub fn with_role(
        ctx: FixtureContext,
        job_num: usize,
        dbpath_prefix: PathBuf,
        options: ReplicaSetOptions,
        role: ReplicaSetRole,
    ) -> Result<Self, FixtureError> {
        let mut member_options = options.mongod_options.clone();
        member_options.insert(
            "replSet".into(),
            OptionValue::from(options.replset_name.as_str()),
        );
        match role {
            ReplicaSetRole::ReplicaSet => {}
            ReplicaSetRole::Shard => {
                member_options.insert("shardsvr".into(), OptionValue::flag());
            }
            ReplicaSetRole::ConfigServer => {
                member_options.insert("configsvr".into(), OptionValue::flag());
            }
        }

        let mut nodes = Vec::with_capacity(options.num_nodes);
        for i in 0..options.num_nodes {
            nodes.push(MongodFixture::new(
                ctx.clone(),
                job_num,
                format!("{}/node{}", options.replset_name, i),
                dbpath_prefix.join(format!("node{}", i)),
                member_options.clone(),
            )?);
        }

        let initial_sync_node = if options.start_initial_sync_node {
            Some(MongodFixture::new(
                ctx.clone(),
                job_num,
                format!("{}/initsync", options.replset_name),
                dbpath_prefix.join("initsync"),
                member_options,
            )?)
        } else {
            None
        };

        Ok(Self {
            ctx,
            job_num,
            options,
            role,
            dbpath_prefix,
            nodes,
            initial_sync_node,
            state: FixtureState::Created,
        })
    }

    pub fn replset_name(&self) -> &str {
        &self.options.replset_name
    }

    pub fn role(&self) -> ReplicaSetRole {
        self.role
    }

    pub fn nodes(&self) -> &[MongodFixture] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [MongodFixture] {
        &mut self.nodes
    }

    pub fn initial_sync_node_mut(&mut self) -> Option<&mut MongodFixture> {
        self.initial_sync_node.as_mut()
    }

    pub fn initial_sync_node(&self) -> Option<NodeInfo> {
        self.initial_sync_node.as_ref().map(MongodFixture::node)
    }

    pub fn view(&self) -> ReplicaSetView {
        ReplicaSetView::new(
            self.options.replset_name.clone(),
            self.role,
            self.nodes.iter().map(MongodFixture::node).collect(),
            Arc::clone(&self.ctx.client),
            Arc::clone(&self.ctx.clock),
        )
        .with_all_nodes_electable(self.options.all_nodes_electable)
    }

    /// The `replSetInitiate` configuration document.
    pub fn replset_config(&self) -> Value {
        let mut members: Vec<Value> = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| {
                let mut member = json!({"_id": i, "host": node.node().host()});
                if i > 0 && !self.options.all_nodes_electable {
                    member["priority"] = json!(0);
                }
                member
            })
            .collect();

        if let Some(node) = &self.initial_sync_node {
            members.push(json!({
                "_id": self.nodes.len(),
                "host": node.node().host(),
                "priority": 0,
                "hidden": true,
                "votes": 0,
            }));
        }

        let mut config = json!({
            "_id": self.options.replset_name,
            "protocolVersion": 1,
            "members": members,
        });
        if self.role == ReplicaSetRole::ConfigServer {
            config["configsvr"] = json!(true);
        }
        if let Some(settings) = &self.options.settings {
            config["settings"] = settings.clone();
        }
        config
    }

    fn initiate(&self) -> Result<(), FixtureError> {
        let Some(first) = self.nodes.first() else {
            return Ok(());
        };
        let command = json!({"replSetInitiate": self.replset_config()});
        info!("Initiating replica set {}", self.options.replset_name);
        match self.ctx.client.run_command(first.port(), "admin", &command) {
            Ok(_) => Ok(()),
            Err(ClientError::CommandFailed { code, .. }) if code == ALREADY_INITIALIZED => {
                debug!("{} was already initiated", self.options.replset_name);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Fixture for ReplicaSetFixture {
    fn name(&self) -> &str {
        &self.options.replset_name
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
        for node in &mut self.nodes {
            node.setup()?;
        }
        if let Some(node) = &mut self.initial_sync_node {
            node.setup()?;
        }
        self.state = FixtureState::Configured;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), FixtureError> {
        if self.state == FixtureState::Ready {
            return Ok(());
        }
        expect_state(self.name(), self.state, &[FixtureState::Configured], "configured")?;

        for node in &mut self.nodes {
            node.await_ready()?;
        }
        if let Some(node) = &mut self.initial_sync_node {
            node.await_ready()?;
        }

        self.initiate()?;
        let primary = self.view().find_primary(AWAIT_READY_TIMEOUT)?;
        if self.nodes.len() > 1 {
            await_replicated_write(&self.ctx, self.name(), primary.port, AWAIT_REPL_TIMEOUT)?;
        }

        info!("Replica set {} is ready; primary is {}", self.options.replset_name, primary);
        self.state = FixtureState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> Result<bool, FixtureError> {
        let mut tally = TeardownTally::new(self.options.replset_name.clone());
        if let Some(node) = &mut self.initial_sync_node {
            let result = node.teardown();
            tally.record(node.name(), result);
        }
        for node in self.nodes.iter_mut().rev() {
            let result = node.teardown();
            tally.record(node.name(), result);
        }
        self.state = FixtureState::Stopped;
        tally.finish()
    }

    fn is_running(&mut self) -> bool {
        self.nodes.iter_mut().all(|node| node.is_running())
            && self
                .initial_sync_node
                .as_mut()
                .map_or(true, |node| node.is_running())
    }

    fn get_primary(&self) -> Result<NodeInfo, FixtureError> {
        self.view().find_primary(AWAIT_READY_TIMEOUT)
    }

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError> {
        let view = self.view();
        let primary = view.find_primary(AWAIT_READY_TIMEOUT)?;
        Ok(view.secondaries(&primary))
    }

    fn connection_string(&self) -> String {
        let hosts: Vec<String> = self.nodes.iter().map(|node| node.node().host()).collect();
        format!("{}/{}", self.options.replset_name, hosts.join(","))
    }

    fn dbpath_prefix(&self) -> &Path {
        &self.dbpath_prefix
    }

    fn replica_sets(&self) -> Vec<ReplicaSetView> {
        vec![self.view()]
    }

    fn as_replica_set_mut(&mut self) -> Option<&mut ReplicaSetFixture> {
        Some(self)
    }
}
