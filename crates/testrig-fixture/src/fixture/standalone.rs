//! A single database server process.

use super::{expect_state, Fixture, FixtureContext, FixtureState, NodeInfo};
use super::{AWAIT_READY_TIMEOUT, POLL_INTERVAL};
use crate::error::FixtureError;
use crate::process::{
    build_args, restrict_credential_files, OptionMap, OptionValue, Process, ProcessState,
    StopSignal,
};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// One `mongod` on a port from the job's fixture range.
///
/// Also the building block of every replicated topology.
#[derive(Debug)]
pub struct MongodFixture {
    ctx: FixtureContext,
    job_num: usize,
    name: String,
    port: u16,
    dbpath: PathBuf,
    options: OptionMap,
    preserve_dbpath: bool,
    process: Option<Process>,
    state: FixtureState,
}

impl MongodFixture {
    /// Reserve a port for a server keeping its data in `dbpath`.
    pub fn new(
        ctx: FixtureContext,
        job_num: usize,
        name: impl Into<String>,
        dbpath: PathBuf,
        options: OptionMap,
    ) -> Result<Self, FixtureError> {
        let port = ctx.ports.next_fixture_port(job_num)?;
        let preserve_dbpath = ctx.config.preserve_dbpath;
        Ok(Self {
            ctx,
            job_num,
            name: name.into(),
            port,
            dbpath,
            options,
            preserve_dbpath,
            process: None,
            state: FixtureState::Created,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dbpath(&self) -> &Path {
        &self.dbpath
    }

    pub fn node(&self) -> NodeInfo {
        NodeInfo::new(self.name.clone(), self.port)
    }

    pub fn preserve_dbpath(&self) -> bool {
        self.preserve_dbpath
    }

    /// Keep the data directory across the next `setup`.
    pub fn set_preserve_dbpath(&mut self, preserve: bool) {
        self.preserve_dbpath = preserve;
    }

    /// Full argument vector of the server.
    ///
    /// Run-wide options come first and are overridden by this server's own;
    /// `setParameter` maps are merged key by key.
    pub fn command_line(&self) -> Vec<String> {
        let config = &self.ctx.config;
        let mut options = OptionMap::new();
        let mut params: BTreeMap<String, OptionValue> = config.mongod_set_parameters.clone();

        for source in [&config.mongod_options, &self.options] {
            for (key, value) in source {
                match value {
                    OptionValue::Map(pairs) if key == "setParameter" => {
                        params.extend(pairs.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    _ => {
                        options.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        if !params.is_empty() {
            options.insert("setParameter".into(), OptionValue::Map(params));
        }
        options.insert("port".into(), OptionValue::from(self.port));
        options.insert(
            "dbpath".into(),
            OptionValue::from(self.dbpath.to_string_lossy().into_owned()),
        );

        build_args(&config.mongod_executable, &options, &[])
    }

    /// SIGKILL the server and reap it.  Returns the exit code.
    pub fn kill(&mut self) -> Result<i32, FixtureError> {
        let Some(process) = self.process.as_mut() else {
            return Err(FixtureError::InvalidState {
                name: self.name.clone(),
                state: self.state.to_string(),
                expected: "started",
            });
        };
        let result = process.stop(StopSignal::Kill).and_then(|()| process.wait());
        self.state = FixtureState::Stopped;
        Ok(result?)
    }

    /// Process id while a server has been started.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(Process::pid)
    }

    fn prepare_dbpath(&self) -> io::Result<()> {
        if !self.preserve_dbpath {
            match std::fs::remove_dir_all(&self.dbpath) {
                Ok(()) => debug!("{}: cleared {}", self.name, self.dbpath.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        std::fs::create_dir_all(&self.dbpath)
    }
}

impl Fixture for MongodFixture {
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
        self.prepare_dbpath()?;

        let mut merged = self.ctx.config.mongod_options.clone();
        merged.extend(self.options.clone());
        restrict_credential_files(&merged);

        let mut process = Process::new(format!("mongod:{}", self.port), self.command_line());
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
                Err(err) => {
                    if self.ctx.clock.remaining(deadline).is_zero() {
                        return Err(FixtureError::ReadyTimeout {
                            name: self.name.clone(),
                            timeout: AWAIT_READY_TIMEOUT,
                        });
                    }
                    debug!("{}: waiting to accept connections: {}", self.name, err);
                    self.ctx.clock.sleep(POLL_INTERVAL);
                }
            }
        }

        info!("{} is ready on port {}", self.name, self.port);
        self.state = FixtureState::Ready;
        Ok(())
    }

    fn teardown(&mut self) -> Result<bool, FixtureError> {
        let Some(process) = self.process.as_mut() else {
            warn!("{} was never started", self.name);
            self.state = FixtureState::Stopped;
            return Ok(true);
        };

        let was_running = process.is_running();
        let stopped = if was_running {
            info!("Stopping {} on port {}", self.name, self.port);
            process.stop(StopSignal::Terminate)
        } else {
            warn!("{} had already exited before teardown", self.name);
            Ok(())
        };
        // Stopped even when the wait failed; setup always starts afresh.
        let waited = stopped.and_then(|()| process.wait());
        self.state = FixtureState::Stopped;
        let code = waited?;

        let success = was_running && code == 0;
        if !success {
            warn!("{} exited with code {}", self.name, code);
        }
        Ok(success)
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
        &self.dbpath
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::testing::{exiting_program, fake_server, reap_behind_handle, ScriptedClient};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn context(dir: &Path, executable: PathBuf) -> FixtureContext {
        let config = RunConfig {
            dbpath_prefix: dir.join("db"),
            mongod_executable: executable,
            ..RunConfig::default()
        };
        FixtureContext::new(config, Arc::new(ScriptedClient::ok()))
    }

    fn wait_for_exit(fixture: &mut MongodFixture) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while fixture.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn lifecycle_start_ready_stop() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_server(dir.path(), "mongod").unwrap();
        let ctx = context(dir.path(), exe);
        let dbpath = ctx.config.job_dbpath(0);
        let mut fixture = MongodFixture::new(ctx, 0, "standalone", dbpath.clone(), OptionMap::new()).unwrap();
        assert_eq!(fixture.port(), 20000);
        assert_eq!(fixture.state(), FixtureState::Created);

        fixture.setup().unwrap();
        assert!(dbpath.is_dir());
        assert_eq!(fixture.state(), FixtureState::Configured);
        fixture.await_ready().unwrap();
        assert_eq!(fixture.state(), FixtureState::Ready);
        assert!(fixture.is_running());
        assert_eq!(fixture.connection_string(), "localhost:20000");

        assert!(matches!(fixture.setup(), Err(FixtureError::InvalidState { .. })));

        assert!(fixture.teardown().unwrap());
        assert_eq!(fixture.state(), FixtureState::Stopped);
        assert!(!fixture.is_running());

        // Restart from Stopped.
        fixture.setup().unwrap();
        fixture.await_ready().unwrap();
        assert!(fixture.teardown().unwrap());
    }

    #[test]
    fn command_line_merges_run_and_server_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig {
            mongod_executable: PathBuf::from("/bin/mongod"),
            ..RunConfig::default()
        };
        config.mongod_set_parameters.insert("enableTestCommands".into(), true.into());
        config.mongod_options.insert("nojournal".into(), OptionValue::flag());
        let ctx = FixtureContext::new(config, Arc::new(ScriptedClient::ok()));

        let mut own = OptionMap::new();
        let mut params = BTreeMap::new();
        params.insert("logLevel".to_string(), OptionValue::Int(2));
        own.insert("setParameter".into(), params.into());
        own.insert("replSet".into(), "rs".into());

        let fixture = MongodFixture::new(ctx, 1, "node", dir.path().join("n0"), own).unwrap();
        let dbpath = format!("--dbpath={}", dir.path().join("n0").display());
        assert_eq!(
            fixture.command_line(),
            vec![
                "/bin/mongod".to_string(),
                "--setParameter".into(),
                "enableTestCommands=true".into(),
                "--setParameter".into(),
                "logLevel=2".into(),
                dbpath,
                "--nojournal".into(),
                "--port=20250".into(),
                "--replSet=rs".into(),
            ]
        );
    }

    #[test]
    fn dbpath_is_wiped_unless_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_server(dir.path(), "mongod").unwrap();
        let ctx = context(dir.path(), exe);
        let dbpath = dir.path().join("data");
        let marker = dbpath.join("marker");
        let mut fixture = MongodFixture::new(ctx, 0, "standalone", dbpath.clone(), OptionMap::new()).unwrap();

        std::fs::create_dir_all(&dbpath).unwrap();
        std::fs::write(&marker, "x").unwrap();
        fixture.setup().unwrap();
        assert!(!marker.exists());
        fixture.teardown().unwrap();

        std::fs::write(&marker, "x").unwrap();
        fixture.set_preserve_dbpath(true);
        fixture.setup().unwrap();
        assert!(marker.exists());
        fixture.teardown().unwrap();
    }

    #[test]
    fn unexpected_exit_is_fatal_and_fails_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let exe = exiting_program(dir.path(), "mongod", 0).unwrap();
        let ctx = context(dir.path(), exe);
        let mut fixture =
            MongodFixture::new(ctx, 0, "standalone", dir.path().join("data"), OptionMap::new()).unwrap();

        fixture.setup().unwrap();
        wait_for_exit(&mut fixture);

        let err = fixture.await_ready().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, FixtureError::ProcessExited { code: 0, .. }));

        // It was not running when teardown started.
        assert!(!fixture.teardown().unwrap());
    }

    #[test]
    fn kill_reports_signal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_server(dir.path(), "mongod").unwrap();
        let ctx = context(dir.path(), exe);
        let mut fixture =
            MongodFixture::new(ctx, 0, "standalone", dir.path().join("data"), OptionMap::new()).unwrap();

        assert!(fixture.kill().is_err());
        fixture.setup().unwrap();
        assert_eq!(fixture.kill().unwrap(), -libc::SIGKILL);
        assert_eq!(fixture.state(), FixtureState::Stopped);
        assert!(!fixture.teardown().unwrap());
    }

    #[test]
    fn failed_teardown_still_reaches_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_server(dir.path(), "mongod").unwrap();
        let ctx = context(dir.path(), exe);
        let mut fixture =
            MongodFixture::new(ctx, 0, "standalone", dir.path().join("data"), OptionMap::new()).unwrap();
        fixture.setup().unwrap();
        fixture.await_ready().unwrap();

        reap_behind_handle(fixture.pid().unwrap());
        let err = fixture.teardown().unwrap_err();
        assert!(matches!(err, FixtureError::Process(_)));
        assert_eq!(fixture.state(), FixtureState::Stopped);

        fixture.setup().unwrap();
        fixture.await_ready().unwrap();
        assert!(fixture.teardown().unwrap());
    }

    #[test]
    fn teardown_without_setup_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), PathBuf::from("mongod"));
        let mut fixture =
            MongodFixture::new(ctx, 0, "standalone", dir.path().join("data"), OptionMap::new()).unwrap();
        assert!(fixture.teardown().unwrap());
        assert_eq!(fixture.state(), FixtureState::Stopped);
    }
}
