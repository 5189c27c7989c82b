//! Port allocation for stacks.
//!
//! Ports are probed by binding `127.0.0.1:<port>` and releasing the listener
//! right away. Nothing is leased: another process may grab a port between the
//! probe and its use, which callers accept.

use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dotenv;
use crate::error::StackError;
use crate::paths::{self, StackPaths, MAIN_STACK};
use crate::runtime_state;

/// Upper bound on candidates tried per allocation.
pub const MAX_ATTEMPTS: u32 = 1000;

pub const SERVER_PORT_KEY: &str = "HAPPIER_STACK_SERVER_PORT";
pub const BACKEND_PORT_KEY: &str = "HAPPIER_STACK_HAPPY_SERVER_BACKEND_PORT";
pub const PG_PORT_KEY: &str = "HAPPIER_STACK_PG_PORT";
pub const REDIS_PORT_KEY: &str = "HAPPIER_STACK_REDIS_PORT";
pub const MINIO_PORT_KEY: &str = "HAPPIER_STACK_MINIO_PORT";
pub const MINIO_CONSOLE_PORT_KEY: &str = "HAPPIER_STACK_MINIO_CONSOLE_PORT";

/// Env keys whose values count as ports reserved by a stack.
pub const STACK_RESERVED_PORT_KEYS: [&str; 6] = [
    SERVER_PORT_KEY,
    BACKEND_PORT_KEY,
    PG_PORT_KEY,
    REDIS_PORT_KEY,
    MINIO_PORT_KEY,
    MINIO_CONSOLE_PORT_KEY,
];

const DEFAULT_MAIN_PORT: u16 = 3005;
const DEFAULT_STACK_PORT: u16 = 3009;
const EXPO_DEFAULT_PORT: u16 = 8081;
const EXPO_DEFAULT_RANGE: u32 = 1000;

/// Ports a running stack uses. Absent entries are not used by that stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minio: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minio_console: Option<u16>,
}

impl StackPorts {
    /// Reads pinned ports from a stack env map.
    pub fn from_env(env: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| env.get(key).and_then(|v| coerce_port(v));
        Self {
            server: get(SERVER_PORT_KEY),
            backend: get(BACKEND_PORT_KEY),
            pg: get(PG_PORT_KEY),
            redis: get(REDIS_PORT_KEY),
            minio: get(MINIO_PORT_KEY),
            minio_console: get(MINIO_CONSOLE_PORT_KEY),
        }
    }

    /// Env entries for the ports that are set.
    pub fn as_env(&self) -> Vec<(String, String)> {
        self.entries()
            .into_iter()
            .filter_map(|(key, port)| port.map(|p| (key.to_string(), p.to_string())))
            .collect()
    }

    pub fn values(&self) -> Vec<u16> {
        self.entries().into_iter().filter_map(|(_, p)| p).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }

    fn entries(&self) -> [(&'static str, Option<u16>); 6] {
        [
            (SERVER_PORT_KEY, self.server),
            (BACKEND_PORT_KEY, self.backend),
            (PG_PORT_KEY, self.pg),
            (REDIS_PORT_KEY, self.redis),
            (MINIO_PORT_KEY, self.minio),
            (MINIO_CONSOLE_PORT_KEY, self.minio_console),
        ]
    }
}

/// Which ports a stack flavor needs besides the server port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortLayout {
    /// Separate backend port behind the full server.
    pub backend: bool,
    /// Postgres, Redis and Minio managed per stack.
    pub managed_infra: bool,
}

/// Parses a positive TCP port.
pub fn coerce_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|p| *p > 0)
}

/// Every reserved-key port in an env map.
pub fn ports_from_env(env: &BTreeMap<String, String>) -> Vec<u16> {
    STACK_RESERVED_PORT_KEYS
        .iter()
        .filter_map(|key| env.get(*key).and_then(|v| coerce_port(v)))
        .collect()
}

/// Returns true when a listener can bind `127.0.0.1:port` right now.
pub fn is_port_free(port: u16) -> bool {
    port != 0 && TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Smallest `p >= start` that is not reserved and binds on loopback.
pub fn pick_next_free_port(start: u16, reserved: &BTreeSet<u16>) -> Result<u16, StackError> {
    let start = start.max(1);
    let mut port = start;
    for attempt in 1..=MAX_ATTEMPTS {
        if !reserved.contains(&port) && is_port_free(port) {
            return Ok(port);
        }
        match port.checked_add(1) {
            Some(next) => port = next,
            None => {
                return Err(StackError::NoFreePort {
                    start,
                    attempts: attempt,
                })
            }
        }
    }
    Err(StackError::NoFreePort {
        start,
        attempts: MAX_ATTEMPTS,
    })
}

fn pick_from_offset(
    base: u16,
    offset: u16,
    reserved: &mut BTreeSet<u16>,
) -> Result<u16, StackError> {
    let start = base.checked_add(offset).ok_or(StackError::NoFreePort {
        start: base,
        attempts: 0,
    })?;
    let port = pick_next_free_port(start, reserved)?;
    reserved.insert(port);
    Ok(port)
}

/// Allocates a full port set for a stack.
///
/// Each picked port is added to `reserved` before the next pick so the set
/// never contains duplicates.
pub fn allocate_stack_ports(
    start: u16,
    layout: PortLayout,
    reserved: &mut BTreeSet<u16>,
) -> Result<StackPorts, StackError> {
    let server = pick_from_offset(start, 0, reserved)?;
    let mut ports = StackPorts {
        server: Some(server),
        ..StackPorts::default()
    };
    if layout.backend {
        ports.backend = Some(pick_from_offset(server, 10, reserved)?);
    }
    if layout.managed_infra {
        let pg = pick_from_offset(server, 1000, reserved)?;
        let redis = pick_from_offset(pg, 1, reserved)?;
        let minio = pick_from_offset(redis, 1, reserved)?;
        let minio_console = pick_from_offset(minio, 1, reserved)?;
        ports.pg = Some(pg);
        ports.redis = Some(redis);
        ports.minio = Some(minio);
        ports.minio_console = Some(minio_console);
    }
    Ok(ports)
}

/// First candidate port for a stack's server.
pub fn default_port_start(port_start_override: Option<&str>, stack: &str) -> u16 {
    if let Some(port) = port_start_override.and_then(coerce_port) {
        return port;
    }
    if stack == MAIN_STACK {
        DEFAULT_MAIN_PORT
    } else {
        DEFAULT_STACK_PORT
    }
}

fn hash_name(name: &str) -> u32 {
    name.encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as u32))
}

/// Deterministic per-stack start inside `[base, base + range)`.
pub fn stable_port_start(stack: &str, base: u16, range: u32) -> u16 {
    let range = range.max(1);
    let offset = hash_name(stack) % range;
    let start = base as u32 + offset;
    u16::try_from(start).unwrap_or(base)
}

/// Picks the Expo dev server port.
///
/// A forced `HAPPIER_STACK_EXPO_DEV_PORT` wins when it binds. Otherwise the
/// search starts at 8081, or at a per-stack stable offset when
/// `HAPPIER_STACK_EXPO_DEV_PORT_STRATEGY=stable`.
pub fn pick_expo_dev_port(
    env: &BTreeMap<String, String>,
    stack: &str,
    reserved: &BTreeSet<u16>,
) -> Result<u16, StackError> {
    let value = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
    if let Some(forced) = value("HAPPIER_STACK_EXPO_DEV_PORT").and_then(coerce_port) {
        if is_port_free(forced) {
            return Ok(forced);
        }
        tracing::warn!("forced Expo port {} is busy; picking another", forced);
    }
    let stable = value("HAPPIER_STACK_EXPO_DEV_PORT_STRATEGY") == Some("stable");
    let start = if stable {
        let base = value("HAPPIER_STACK_EXPO_DEV_PORT_BASE")
            .and_then(coerce_port)
            .unwrap_or(EXPO_DEFAULT_PORT);
        let range = value("HAPPIER_STACK_EXPO_DEV_PORT_RANGE")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|r| *r > 0)
            .unwrap_or(EXPO_DEFAULT_RANGE);
        stable_port_start(stack, base, range)
    } else {
        EXPO_DEFAULT_PORT
    };
    pick_next_free_port(start, reserved)
}

/// Ports other stacks claim, mapped to the claiming stack.
///
/// Pinned ports in every other stack's env file count, as do the runtime
/// ports of other stacks whose owner process is still alive.
pub fn collect_reserved_ports(storage_dir: &Path, exclude: Option<&str>) -> BTreeMap<u16, String> {
    let mut reserved = BTreeMap::new();
    for name in paths::list_stack_names(storage_dir) {
        if Some(name.as_str()) == exclude {
            continue;
        }
        let stack = StackPaths::new(storage_dir, &name);
        match dotenv::read_env_file(&stack.env_path) {
            Ok(env) => {
                for port in ports_from_env(&env) {
                    reserved.entry(port).or_insert_with(|| name.clone());
                }
            }
            Err(err) => tracing::debug!("skipping env of stack {}: {}", name, err),
        }
        if let Some(state) = runtime_state::read_runtime_state(&stack.runtime_state_path) {
            if state.is_live() {
                for port in state.ports.values() {
                    reserved.entry(port).or_insert_with(|| name.clone());
                }
                if let Some(port) = state.expo.as_ref().and_then(|e| e.dev_port) {
                    reserved.entry(port).or_insert_with(|| name.clone());
                }
            }
        }
    }
    reserved
}
