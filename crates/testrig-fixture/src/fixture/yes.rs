//! Synthetic load: processes that do nothing but write output.
//!
//! Used to exercise output forwarding and log shipping under volume.

use super::{expect_state, Fixture, FixtureState, NodeInfo, TeardownTally};
use crate::error::FixtureError;
use crate::process::{Process, StopSignal};
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadGeneratorOptions {
    pub num_processes: usize,
    /// Line each process repeats.
    pub message: String,
    pub executable: PathBuf,
}

impl Default for LoadGeneratorOptions {
    fn default() -> Self {
        Self {
            num_processes: 10,
            message: "y".to_string(),
            executable: PathBuf::from("yes"),
        }
    }
}

/// `num_processes` copies of `yes`.
#[derive(Debug)]
pub struct LoadGeneratorFixture {
    job_num: usize,
    options: LoadGeneratorOptions,
    processes: Vec<Process>,
    state: FixtureState,
}

impl LoadGeneratorFixture {
    pub fn new(job_num: usize, options: LoadGeneratorOptions) -> Self {
        Self {
            job_num,
            options,
            processes: Vec::new(),
            state: FixtureState::Created,
        }
    }
}

impl Fixture for LoadGeneratorFixture {
    fn name(&self) -> &str {
        "load-generator"
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
        self.processes.clear();
        for i in 0..self.options.num_processes {
            let args = vec![
                self.options.executable.to_string_lossy().into_owned(),
                self.options.message.clone(),
            ];
            let mut process = Process::new(format!("yes:{}:{}", self.job_num, i), args);
            process.start()?;
            self.processes.push(process);
        }
        self.state = FixtureState::Configured;
        Ok(())
    }

    fn await_ready(&mut self) -> Result<(), FixtureError> {
        expect_state(
            self.name(),
            self.state,
            &[FixtureState::Configured, FixtureState::Ready],
            "configured",
        )?;
        self.state = FixtureState::Ready;
        Ok(())
    }

    /// Success means every process was still running and died of SIGTERM.
    fn teardown(&mut self) -> Result<bool, FixtureError> {
        let mut tally = TeardownTally::new("load-generator");
        for process in self.processes.iter_mut().rev() {
            let was_running = process.is_running();
            let result = process
                .stop(StopSignal::Terminate)
                .and_then(|()| process.wait())
                .map(|code| was_running && code == -libc::SIGTERM)
                .map_err(FixtureError::from);
            let name = process.name().to_string();
            tally.record(&name, result);
        }
        info!("Stopped {} load generator process(es)", self.processes.len());
        self.state = FixtureState::Stopped;
        tally.finish()
    }

    fn is_running(&mut self) -> bool {
        !self.processes.is_empty() && self.processes.iter_mut().all(Process::is_running)
    }

    fn get_primary(&self) -> Result<NodeInfo, FixtureError> {
        Err(FixtureError::Unsupported("get_primary"))
    }

    fn get_secondaries(&self) -> Result<Vec<NodeInfo>, FixtureError> {
        Ok(Vec::new())
    }

    fn connection_string(&self) -> String {
        String::new()
    }

    fn dbpath_prefix(&self) -> &Path {
        Path::new("")
    }
}
