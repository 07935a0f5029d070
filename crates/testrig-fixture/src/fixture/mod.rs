//! Deployment topologies that tests run against.
//!
//! Every topology implements [`Fixture`], a small state machine:
//!
//! ```text
//!  Created ──setup──▶ Configured ──await_ready──▶ Ready
//!     ▲                                             │
//!     └───────────── setup (restart) ◀── Stopped ◀──┘ teardown
//! ```
//!
//! Composite topologies hold their children by value and drive them in a
//! fixed order: children are set up front to back and torn down back to
//! front.  Teardown is total: every child is attempted even after a failure.

pub mod masterslave;
pub mod replicaset;
pub mod shardedcluster;
pub mod standalone;
pub mod yes;

use crate::client::AdminClient;
use crate::clock::{Clock, SystemClock};
use crate::config::RunConfig;
use crate::error::FixtureError;
use crate::ports::PortAllocator;
use log::{error, warn};
use serde_json::json;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub use replicaset::{ReplicaSetFixture, ReplicaSetOptions, ReplicaSetRole, ReplicaSetView};

/// Overall bound on the replicated write issued by `await_ready`.
pub const AWAIT_REPL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Overall bound on a member starting to accept connections.
pub const AWAIT_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Delay between polls in bounded waits.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lifecycle state of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureState {
    Created,
    Configured,
    Ready,
    Stopped,
}

impl fmt::Display for FixtureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FixtureState::Created => "created",
            FixtureState::Configured => "configured",
            FixtureState::Ready => "ready",
            FixtureState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A role-addressable member of a topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub name: String,
    pub port: u16,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// `localhost:<port>`.
    pub fn host(&self) -> String {
        format!("localhost:{}", self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.host())
    }
}

/// Everything a fixture needs from the run, passed to every constructor.
#[derive(Clone)]
pub struct FixtureContext {
    pub config: Arc<RunConfig>,
    pub ports: Arc<PortAllocator>,
    pub client: Arc<dyn AdminClient>,
    pub clock: Arc<dyn Clock>,
}

impl FixtureContext {
    /// Context with a fresh port allocator at `config.base_port` and the
    /// system clock.
    pub fn new(config: RunConfig, client: Arc<dyn AdminClient>) -> Self {
        let ports = Arc::new(PortAllocator::new(config.base_port));
        Self {
            config: Arc::new(config),
            ports,
            client,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_ports(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for FixtureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureContext")
            .field("config", &self.config)
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

/// A managed deployment topology.
pub trait Fixture: Send {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// The job this fixture belongs to.
    fn job_num(&self) -> usize;

    fn state(&self) -> FixtureState;

    /// Start every process.  Allowed from `Created` and `Stopped`.
    fn setup(&mut self) -> Result<(), FixtureError>;

    /// Block until the topology accepts work.
    fn await_ready(&mut self) -> Result<(), FixtureError>;

    /// Stop every process.  Returns whether all of them shut down cleanly.
    fn teardown(&mut self) -> Result<bool, FixtureError>;

    /// Whether every process of the topology is alive.
    fn is_running(&mut self) -> bool;

    fn get_primary(&self) -> Result<NodeInfo, FixtureError>;

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError>;

    /// Connection string handed to test programs.
    fn connection_string(&self) -> String;

    /// Directory under which this fixture keeps its data.
    fn dbpath_prefix(&self) -> &Path;

    /// Process-free views of the replica sets in this topology.
    fn replica_sets(&self) -> Vec<ReplicaSetView> {
        Vec::new()
    }

    /// Downcast for hooks that only operate on replica sets.
    fn as_replica_set_mut(&mut self) -> Option<&mut ReplicaSetFixture> {
        None
    }
}

/// Fail with `InvalidState` unless `state` is one of `allowed`.
pub(crate) fn expect_state(
    name: &str,
    state: FixtureState,
    allowed: &[FixtureState],
    expected: &'static str,
) -> Result<(), FixtureError> {
    if allowed.contains(&state) {
        Ok(())
    } else {
        Err(FixtureError::InvalidState {
            name: name.to_string(),
            state: state.to_string(),
            expected,
        })
    }
}

/// Accumulates child teardown results.
///
/// Every child is recorded; success is the AND of all results and the
/// first error is returned only once all children were attempted.
#[derive(Debug)]
pub struct TeardownTally {
    owner: String,
    success: bool,
    first_error: Option<FixtureError>,
}

impl TeardownTally {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            success: true,
            first_error: None,
        }
    }

    pub fn record(&mut self, child: &str, result: Result<bool, FixtureError>) {
        match result {
            Ok(true) => {}
            Ok(false) => {
                warn!("{}: {} did not shut down cleanly", self.owner, child);
                self.success = false;
            }
            Err(err) => {
                error!("{}: error tearing down {}: {}", self.owner, child, err);
                self.success = false;
                if self.first_error.is_none() {
                    self.first_error = Some(err);
                }
            }
        }
    }

    pub fn finish(self) -> Result<bool, FixtureError> {
        match self.first_error {
            Some(err) => Err(err),
            None => Ok(self.success),
        }
    }
}

/// Issue an insert that must be acknowledged by two members.
///
/// One absolute deadline bounds the whole wait; each attempt's `wtimeout` is
/// the time left until it.  Transient failures are retried until the
/// deadline, after which `ReplicationTimeout` is returned.
pub fn await_replicated_write(
    ctx: &FixtureContext,
    name: &str,
    port: u16,
    timeout: Duration,
) -> Result<(), FixtureError> {
    let deadline = ctx.clock.deadline(timeout);
    loop {
        // wtimeout 0 means "wait forever".
        let budget_ms = ctx.clock.remaining(deadline).as_millis().max(1) as u64;
        let command = json!({
            "insert": "await_ready",
            "documents": [{"created_by": "testrig"}],
            "writeConcern": {"w": 2, "wtimeout": budget_ms},
        });

        match ctx.client.run_command(port, "test", &command) {
            Ok(_) => return Ok(()),
            Err(err) if err.is_retryable_write() => {
                if ctx.clock.remaining(deadline).is_zero() {
                    return Err(FixtureError::ReplicationTimeout {
                        name: name.to_string(),
                        timeout,
                        last_error: err.to_string(),
                    });
                }
                warn!("{}: replicated write not acknowledged yet, retrying: {}", name, err);
                ctx.clock.sleep(POLL_INTERVAL.min(ctx.clock.remaining(deadline)));
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::clock::ManualClock;
    use crate::testing::ScriptedClient;
    use parking_lot::Mutex;

    fn context(client: ScriptedClient, clock: Arc<ManualClock>) -> FixtureContext {
        FixtureContext::new(RunConfig::default(), Arc::new(client)).with_clock(clock)
    }

    #[test]
    fn replicated_write_retries_until_acknowledged() {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&attempts);
        let client = ScriptedClient::new(move |port, _db, command| {
            let mut seen = seen.lock();
            seen.push(command["writeConcern"]["wtimeout"].as_u64().unwrap_or(0));
            if seen.len() < 3 {
                Err(ClientError::WriteConcern {
                    port,
                    code: 64,
                    message: "timed out".into(),
                })
            } else {
                Ok(json!({"ok": 1, "n": 1}))
            }
        });
        let clock = Arc::new(ManualClock::new());
        let ctx = context(client, Arc::clone(&clock));

        await_replicated_write(&ctx, "rs", 20000, Duration::from_secs(10)).unwrap();

        let budgets = attempts.lock().clone();
        assert_eq!(budgets.len(), 3);
        // The budget shrinks with the single deadline.
        assert_eq!(budgets[0], 10_000);
        assert!(budgets[1] < budgets[0] && budgets[2] < budgets[1]);
    }

    #[test]
    fn replicated_write_times_out_at_deadline() {
        let client = ScriptedClient::new(|port, _db, _command| {
            Err(ClientError::Unreachable {
                port,
                reason: "down".into(),
            })
        });
        let clock = Arc::new(ManualClock::new());
        let ctx = context(client, Arc::clone(&clock));

        let err = await_replicated_write(&ctx, "rs", 20000, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, FixtureError::ReplicationTimeout { .. }));
        assert!(clock.elapsed() >= Duration::from_secs(2));
        assert!(clock.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn non_transient_write_error_is_not_retried() {
        let client = ScriptedClient::new(|port, _db, _command| {
            Err(ClientError::CommandFailed {
                port,
                command: "insert".into(),
                code: 13,
                code_name: "Unauthorized".into(),
                message: "denied".into(),
            })
        });
        let ctx = context(client, Arc::new(ManualClock::new()));
        let err = await_replicated_write(&ctx, "rs", 20000, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, FixtureError::Client(ClientError::CommandFailed { code: 13, .. })));
    }

    #[test]
    fn teardown_tally_keeps_first_error_and_ands_results() {
        let mut tally = TeardownTally::new("cluster");
        tally.record("a", Ok(true));
        tally.record("b", Err(FixtureError::Unsupported("first")));
        tally.record("c", Ok(false));
        tally.record("d", Err(FixtureError::Unsupported("second")));
        assert!(matches!(tally.finish(), Err(FixtureError::Unsupported("first"))));

        let mut tally = TeardownTally::new("cluster");
        tally.record("a", Ok(true));
        tally.record("b", Ok(false));
        assert!(!tally.finish().unwrap());
    }

    #[test]
    fn expect_state_rejects_other_states() {
        assert!(expect_state("x", FixtureState::Created, &[FixtureState::Created], "created").is_ok());
        assert!(matches!(
            expect_state("x", FixtureState::Ready, &[FixtureState::Created], "created"),
            Err(FixtureError::InvalidState { .. })
        ));
    }
}
