//! Name-to-constructor table for hooks.
//!
//! Suite definitions name hooks by class and pass free-form options.  The
//! registry is built once at startup; an unknown class fails immediately
//! with [`RunError::UnknownBehavior`].

use crate::cleanup::CleanEveryN;
use crate::consistency::{ScriptCheck, ScriptHook};
use crate::error::RunError;
use crate::hook::Hook;
use crate::initsync::BackgroundInitialSync;
use crate::killsecondaries::PeriodicKillSecondaries;
use crate::stepdown::ContinuousStepdown;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use testrig_fixture::{AdminClient, Clock, RunConfig, SystemClock};

/// Run-wide collaborators handed to every hook constructor.
#[derive(Clone)]
pub struct HookContext {
    pub config: Arc<RunConfig>,
    pub client: Arc<dyn AdminClient>,
    pub clock: Arc<dyn Clock>,
}

impl HookContext {
    pub fn new(config: Arc<RunConfig>, client: Arc<dyn AdminClient>) -> Self {
        Self {
            config,
            client,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Randomness for one hook.  Seeded from the run seed and `salt` when a
    /// seed is configured, from entropy otherwise.
    pub fn rng(&self, salt: u64) -> Box<dyn RngCore + Send> {
        match self.config.seed {
            Some(seed) => Box::new(ChaCha20Rng::seed_from_u64(seed ^ salt)),
            None => Box::new(ChaCha20Rng::from_entropy()),
        }
    }
}

impl fmt::Debug for HookContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A hook as named in a suite definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    pub class: String,
    #[serde(default)]
    pub options: Value,
}

impl HookSpec {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            options: Value::Null,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

pub type HookConstructor = fn(&HookContext, &Value) -> Result<Box<dyn Hook>, RunError>;

/// Decode a hook's options; `null` means all defaults.
pub fn parse_options<T>(hook: &str, options: &Value) -> Result<T, RunError>
where
    T: DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|source| RunError::InvalidOptions {
        hook: hook.to_string(),
        source,
    })
}

#[derive(Debug, Default)]
pub struct HookRegistry {
    constructors: BTreeMap<String, HookConstructor>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every hook this crate provides.
    pub fn with_builtin_hooks() -> Self {
        let mut registry = Self::new();
        registry.register("CleanEveryN", |ctx, options| {
            Ok(Box::new(CleanEveryN::from_options(ctx, options)?))
        });
        registry.register("BackgroundInitialSync", |ctx, options| {
            Ok(Box::new(BackgroundInitialSync::from_options(ctx, options)?))
        });
        registry.register("ContinuousStepdown", |ctx, options| {
            Ok(Box::new(ContinuousStepdown::from_options(ctx, options)?))
        });
        registry.register("PeriodicKillSecondaries", |ctx, options| {
            Ok(Box::new(PeriodicKillSecondaries::from_options(ctx, options)?))
        });
        registry.register("ValidateCollections", |ctx, options| {
            Ok(Box::new(ScriptHook::from_options(ScriptCheck::ValidateCollections, ctx, options)?))
        });
        registry.register("CheckReplDBHash", |ctx, options| {
            Ok(Box::new(ScriptHook::from_options(ScriptCheck::CheckReplDBHash, ctx, options)?))
        });
        registry.register("CheckReplOplogs", |ctx, options| {
            Ok(Box::new(ScriptHook::from_options(ScriptCheck::CheckReplOplogs, ctx, options)?))
        });
        registry
    }

    /// Add or replace the constructor for `class`.
    pub fn register(&mut self, class: impl Into<String>, constructor: HookConstructor) {
        self.constructors.insert(class.into(), constructor);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn create(&self, ctx: &HookContext, spec: &HookSpec) -> Result<Box<dyn Hook>, RunError> {
        let constructor = self
            .constructors
            .get(&spec.class)
            .ok_or_else(|| RunError::UnknownBehavior(spec.class.clone()))?;
        constructor(ctx, &spec.options)
    }

    /// Build every hook of a suite, in order.
    pub fn create_all(
        &self,
        ctx: &HookContext,
        specs: &[HookSpec],
    ) -> Result<Vec<Box<dyn Hook>>, RunError> {
        specs.iter().map(|spec| self.create(ctx, spec)).collect()
    }
}
