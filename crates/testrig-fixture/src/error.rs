//! Error types for the fixture engine.

use crate::client::ClientError;
use crate::ports::PortError;
use crate::process::ProcessError;
use std::time::Duration;
use thiserror::Error;

/// Errors from setting up, waiting on and tearing down fixtures.
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("port allocation failed: {0}")]
    Port(#[from] PortError),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("admin command failed: {0}")]
    Client(#[from] ClientError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A fixture process died while it was expected to be running.
    #[error("{name} exited unexpectedly with code {code}")]
    ProcessExited { name: String, code: i32 },

    #[error("{name} was not ready after {timeout:?}")]
    ReadyTimeout { name: String, timeout: Duration },

    /// A replicated write was not acknowledged before the deadline.
    #[error("write to {name} was not replicated within {timeout:?}: {last_error}")]
    ReplicationTimeout {
        name: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("no primary in replica set '{replset}' after {timeout:?}")]
    NoPrimary { replset: String, timeout: Duration },

    #[error("{name} is {state}, expected {expected}")]
    InvalidState {
        name: String,
        state: String,
        expected: &'static str,
    },

    #[error("{0} is not supported by this fixture")]
    Unsupported(&'static str),
}

impl FixtureError {
    /// A fixture process died or the port block is exhausted: the job cannot
    /// continue on this fixture.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FixtureError::Port(_) | FixtureError::ProcessExited { .. } | FixtureError::Process(_)
        )
    }
}
