//! Hooks, stepdown coordination and the job runner.
//!
//! A [`Job`] owns one fixture and drives a suite through it:
//!
//! ```text
//!   setup ─▶ await_ready ─▶ before_suite ─┐
//!                                         ▼
//!          ┌─▶ before_test ─▶ test ─▶ after_test ─┐
//!          └──────────────────────────────────────┘
//!                                         │
//!                  teardown ◀─ after_suite ◀┘
//! ```
//!
//! Hooks are built by name from a [`HookRegistry`] and may inject dynamic
//! tests into the shared [`TestReport`].  [`ContinuousStepdown`] runs a
//! background actor gated by a [`StepdownLifecycle`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use testrig_fixture::{FixtureContext, ReplicaSetFixture, ReplicaSetOptions, RunConfig, ShellClient};
//! use testrig_hooks::{HookContext, HookRegistry, HookSpec, Job, JobConfig, ProgramTestCase, TestCase};
//!
//! let config = RunConfig::from_env();
//! let client = Arc::new(ShellClient::new(&config.shell_executable));
//! let ctx = FixtureContext::new(config.clone(), client.clone());
//! let options = ReplicaSetOptions { all_nodes_electable: true, ..ReplicaSetOptions::default() };
//! let fixture = ReplicaSetFixture::new(ctx, 0, config.job_dbpath(0), options)?;
//!
//! let hooks = HookRegistry::with_builtin_hooks().create_all(
//!     &HookContext::new(Arc::new(config), client),
//!     &[
//!         HookSpec::new("ContinuousStepdown"),
//!         HookSpec::new("CleanEveryN").with_options(json!({"n": 10})),
//!     ],
//! )?;
//! let mut tests: Vec<Box<dyn TestCase>> =
//!     vec![Box::new(ProgramTestCase::new("./insert_test", Vec::new()))];
//!
//! let summary = Job::new(0, Box::new(fixture), hooks, JobConfig::default()).run(&mut tests)?;
//! println!("{}", testrig_hooks::format_summary(&summary));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cleanup;
pub mod consistency;
pub mod error;
pub mod hook;
pub mod initsync;
pub mod job;
pub mod killsecondaries;
pub mod lifecycle;
pub mod policy;
pub mod registry;
pub mod report;
pub mod stepdown;
pub mod testcase;
#[cfg(test)]
mod testutil;

pub use cleanup::CleanEveryN;
pub use consistency::{ScriptCheck, ScriptHook, ScriptRunner};
pub use error::RunError;
pub use hook::Hook;
pub use initsync::BackgroundInitialSync;
pub use job::{Job, JobConfig};
pub use killsecondaries::PeriodicKillSecondaries;
pub use lifecycle::{FileLifecycle, FlagLifecycle, StepdownFiles, StepdownLifecycle};
pub use policy::StopPolicy;
pub use registry::{HookContext, HookRegistry, HookSpec};
pub use report::{format_summary, ReportSummary, TestRecord, TestReport, TestStatus};
pub use stepdown::{ContinuousStepdown, ContinuousStepdownOptions};
pub use testcase::{ProgramTestCase, TestCase, TestInfo};
