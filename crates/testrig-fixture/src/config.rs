//! Run-wide configuration handed over by the suite loader.
//!
//! The loader validates and builds a [`RunConfig`] once; everything in this
//! workspace only reads it.

use crate::ports::DEFAULT_BASE_PORT;
use crate::process::{OptionMap, OptionValue};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Immutable settings shared by every job of a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// First port of job 0.
    pub base_port: u16,
    /// Directory under which every job keeps its data directories.
    pub dbpath_prefix: PathBuf,
    /// Database server executable.
    pub mongod_executable: PathBuf,
    /// Router executable for sharded clusters.
    pub mongos_executable: PathBuf,
    /// Shell used for admin commands and validation scripts.
    pub shell_executable: PathBuf,
    /// Options merged into every server invocation.
    pub mongod_options: OptionMap,
    /// `setParameter` values merged into every server invocation.
    pub mongod_set_parameters: BTreeMap<String, OptionValue>,
    /// Options merged into every router invocation.
    pub mongos_options: OptionMap,
    /// Keep data directories between restarts instead of wiping them.
    pub preserve_dbpath: bool,
    /// Leak-detection instrumentation is active in the server binaries.
    pub leak_detection: bool,
    /// Seed for every random decision made by hooks.
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            dbpath_prefix: PathBuf::from("/data/db"),
            mongod_executable: PathBuf::from("mongod"),
            mongos_executable: PathBuf::from("mongos"),
            shell_executable: PathBuf::from("mongo"),
            mongod_options: OptionMap::new(),
            mongod_set_parameters: BTreeMap::new(),
            mongos_options: OptionMap::new(),
            preserve_dbpath: false,
            leak_detection: false,
            seed: None,
        }
    }
}

impl RunConfig {
    /// Defaults, with the settings the environment controls read from it.
    pub fn from_env() -> Self {
        Self {
            leak_detection: leak_detection_from_env(),
            ..Self::default()
        }
    }

    /// Data directory root of `job`.
    pub fn job_dbpath(&self, job: usize) -> PathBuf {
        self.dbpath_prefix.join(format!("job{}", job))
    }
}

/// Whether `ASAN_OPTIONS` asks the sanitizer to detect leaks.
pub fn leak_detection_from_env() -> bool {
    std::env::var("ASAN_OPTIONS").is_ok_and(|value| detects_leaks(&value))
}

fn detects_leaks(asan_options: &str) -> bool {
    asan_options
        .split([':', ',', ' '])
        .any(|option| option == "detect_leaks=1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_config_over_defaults() {
        let config: RunConfig = serde_json::from_value(serde_json::json!({
            "base_port": 30000,
            "dbpath_prefix": "/tmp/rig",
            "mongod_set_parameters": {"enableTestCommands": true},
            "seed": 7,
        }))
        .unwrap();
        assert_eq!(config.base_port, 30000);
        assert_eq!(config.job_dbpath(2), PathBuf::from("/tmp/rig/job2"));
        assert_eq!(config.mongod_executable, PathBuf::from("mongod"));
        assert_eq!(config.seed, Some(7));
        assert_eq!(
            config.mongod_set_parameters["enableTestCommands"],
            OptionValue::Bool(true)
        );
    }

    #[test]
    fn defaults_ignore_the_environment() {
        let config = RunConfig::default();
        assert!(!config.leak_detection);
        assert_eq!(config.base_port, DEFAULT_BASE_PORT);

        let from_env = RunConfig::from_env();
        assert_eq!(from_env.leak_detection, leak_detection_from_env());
        assert_eq!(from_env.dbpath_prefix, config.dbpath_prefix);
    }

    #[test]
    fn leak_detection_needs_the_exact_option() {
        assert!(detects_leaks("detect_leaks=1"));
        assert!(detects_leaks("abort_on_error=1:detect_leaks=1"));
        assert!(detects_leaks("abort_on_error=1,detect_leaks=1"));
        assert!(!detects_leaks("detect_leaks=0"));
        assert!(!detects_leaks("detect_leaks=10"));
        assert!(!detects_leaks(""));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<RunConfig, _> =
            serde_json::from_value(serde_json::json!({"basePort": 1}));
        assert!(result.is_err());
    }
}
