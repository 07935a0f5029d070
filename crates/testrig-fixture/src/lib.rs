//! Ephemeral database deployments for test runs.
//!
//! This crate owns everything below the hook layer:
//!
//! - [`ports`]: per-job port blocks with a reserved fixture range
//! - [`process`]: option maps to argument vectors, and process handles
//! - [`fixture`]: deployment topologies as `setup`/`await_ready`/`teardown`
//!   state machines
//! - [`client`]: the admin-command seam fixtures and hooks talk through
//! - [`clock`]: the time seam every bounded wait uses
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testrig_fixture::{
//!     Fixture, FixtureContext, ReplicaSetFixture, ReplicaSetOptions, RunConfig, ShellClient,
//! };
//!
//! let config = RunConfig::from_env();
//! let client = Arc::new(ShellClient::new(&config.shell_executable));
//! let ctx = FixtureContext::new(config, client);
//! let dbpath = ctx.config.job_dbpath(0);
//!
//! let mut rs = ReplicaSetFixture::new(ctx, 0, dbpath, ReplicaSetOptions::default())?;
//! rs.setup()?;
//! rs.await_ready()?;
//! println!("primary: {}", rs.get_primary()?);
//! rs.teardown()?;
//! # Ok::<(), testrig_fixture::FixtureError>(())
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod fixture;
pub mod ports;
pub mod process;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{AdminClient, ClientError, ShellClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RunConfig;
pub use error::FixtureError;
pub use fixture::masterslave::{MasterSlaveFixture, MasterSlaveOptions};
pub use fixture::shardedcluster::{MongosFixture, ShardedClusterFixture, ShardedClusterOptions};
pub use fixture::standalone::MongodFixture;
pub use fixture::yes::{LoadGeneratorFixture, LoadGeneratorOptions};
pub use fixture::{
    Fixture, FixtureContext, FixtureState, NodeInfo, ReplicaSetFixture, ReplicaSetOptions,
    ReplicaSetRole, ReplicaSetView,
};
pub use ports::{PortAllocator, PortError};
pub use process::{OptionMap, OptionValue, Process, ProcessError, ProcessState, StopSignal};
