//! Error taxonomy of a test run.

use testrig_fixture::{ClientError, FixtureError, ProcessError};
use thiserror::Error;

/// Errors raised by hooks, test cases and the job runner.
#[derive(Error, Debug)]
pub enum RunError {
    /// A test or a hook's check failed.  Recorded; the run may continue.
    #[error("test failure: {0}")]
    TestFailure(String),

    /// The deployment is broken.  Aborts the run.
    #[error("server failure: {0}")]
    ServerFailure(String),

    #[error("fixture error: {0}")]
    Fixture(#[from] FixtureError),

    #[error("admin command failed: {0}")]
    Client(#[from] ClientError),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("unknown behavior '{0}'")]
    UnknownBehavior(String),

    #[error("invalid options for {hook}: {source}")]
    InvalidOptions {
        hook: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{hook} cannot run against this fixture: {reason}")]
    IncompatibleFixture { hook: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Everything except a test failure aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RunError::TestFailure(_))
    }
}
