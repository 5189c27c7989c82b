//! Per-stack environment resolution.
//!
//! Layers, lowest precedence first:
//!
//! 1. the base environment with `HAPPIER_STACK_*` keys removed, except the
//!    keep-list below;
//! 2. pointer keys naming the stack, its env file and runtime state file;
//! 3. the stack env file;
//! 4. caller overrides;
//! 5. runtime ports, only while the recorded owner PID is alive.
//!
//! Resolution never mutates its inputs and returns a fresh map each call.

use std::collections::BTreeMap;

use crate::dotenv;
use crate::error::{Result, StackError};
use crate::paths::StackPaths;
use crate::runtime_state::{self, RuntimeState};
use crate::settings::{Settings, ENV_PREFIX};

/// `HAPPIER_STACK_*` suffixes that survive scrubbing of the base environment.
pub const KEEP_PREFIXED: [&str; 23] = [
    "ENV_FILE",
    "STACK",
    "SANDBOX_DIR",
    "SANDBOX_ALLOW_GLOBAL",
    "CLI_ROOT_DISABLE",
    "CANONICAL_HOME_DIR",
    "HOME_DIR",
    "WORKSPACE_DIR",
    "RUNTIME_DIR",
    "STORAGE_DIR",
    "VERBOSE",
    "UPDATE_CHECK",
    "UPDATE_CHECK_INTERVAL_MS",
    "UPDATE_NOTIFY_INTERVAL_MS",
    "DAEMON_WAIT_FOR_AUTH",
    "AUTH_FLOW",
    "STACK_PORT_START",
    "BIND_MODE",
    "EXPO_HOST",
    "EXPO_DEV_PORT",
    "EXPO_DEV_PORT_STRATEGY",
    "EXPO_DEV_PORT_BASE",
    "EXPO_DEV_PORT_RANGE",
];

pub const STACK_KEY: &str = "HAPPIER_STACK_STACK";
pub const ENV_FILE_KEY: &str = "HAPPIER_STACK_ENV_FILE";
pub const RUNTIME_STATE_PATH_KEY: &str = "HAPPIER_STACK_RUNTIME_STATE_PATH";
pub const EPHEMERAL_PORTS_KEY: &str = "HAPPIER_STACK_EPHEMERAL_PORTS";

/// Removes stack-scoped keys that must not leak from the invoking shell.
pub fn scrub_stack_prefixed(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| match key.strip_prefix(ENV_PREFIX) {
            Some(suffix) => KEEP_PREFIXED.contains(&suffix),
            None => true,
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// One-shot overrides applied above the stack env file.
    pub overrides: BTreeMap<String, String>,
    /// Fail when the stack env file does not exist.
    pub require_env_file: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedStackEnv {
    pub env: BTreeMap<String, String>,
    pub paths: StackPaths,
    /// Pairs parsed from the stack env file alone.
    pub stack_env: BTreeMap<String, String>,
    pub runtime_state: Option<RuntimeState>,
    /// Whether runtime ports were applied.
    pub runtime_live: bool,
}

impl ResolvedStackEnv {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

/// Resolves the environment a stack's services run with.
pub fn resolve_stack_env(
    settings: &Settings,
    stack: &str,
    options: &ResolveOptions,
) -> Result<ResolvedStackEnv> {
    let paths = StackPaths::new(&settings.storage_dir, stack);
    if options.require_env_file && !paths.exists() {
        return Err(StackError::StackMissing {
            name: stack.to_string(),
            env_path: paths.env_path.clone(),
        });
    }

    let mut env = scrub_stack_prefixed(&settings.base_env);
    env.insert(STACK_KEY.to_string(), stack.to_string());
    env.insert(ENV_FILE_KEY.to_string(), paths.env_path.display().to_string());
    env.insert(
        RUNTIME_STATE_PATH_KEY.to_string(),
        paths.runtime_state_path.display().to_string(),
    );

    let stack_env = dotenv::read_env_file(&paths.env_path)?;
    env.extend(stack_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(options.overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

    let runtime_state = runtime_state::read_runtime_state(&paths.runtime_state_path);
    let runtime_live = match runtime_state.as_ref().and_then(|s| s.live_ports().map(|p| (s, p))) {
        Some((state, ports)) => {
            env.extend(ports.as_env());
            if state.ephemeral {
                env.insert(EPHEMERAL_PORTS_KEY.to_string(), "1".to_string());
            }
            true
        }
        None => false,
    };

    Ok(ResolvedStackEnv {
        env,
        paths,
        stack_env,
        runtime_state,
        runtime_live,
    })
}

/// Network exposure of dev servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BindMode {
    Loopback,
    Lan,
}

impl BindMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BindMode::Loopback => "loopback",
            BindMode::Lan => "lan",
        }
    }
}

/// Applies a bind mode to a resolved environment.
pub fn apply_bind_mode(env: &mut BTreeMap<String, String>, mode: BindMode) {
    env.insert("HAPPIER_STACK_BIND_MODE".to_string(), mode.as_str().to_string());
    match mode {
        BindMode::Loopback => {
            env.insert("HAPPIER_STACK_EXPO_HOST".to_string(), "localhost".to_string());
            env.insert("HOST".to_string(), "127.0.0.1".to_string());
        }
        BindMode::Lan => {
            env.insert("HAPPIER_STACK_EXPO_HOST".to_string(), "lan".to_string());
        }
    }
}
