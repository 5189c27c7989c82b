//! Per-stack runtime state (`stack.runtime.json`).
//!
//! The file records which process owns a running stack and the ports it got.
//! A state whose owner PID is not alive is stale and must never be trusted.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dotenv::write_atomic;
use crate::error::{Result, StackError};
use crate::ports::StackPorts;

const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpoPorts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub stack_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub ports: StackPorts,
    /// Service name to PID.
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expo: Option<ExpoPorts>,
    /// Log name to file path.
    #[serde(default)]
    pub logs: BTreeMap<String, String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RuntimeState {
    pub fn new(stack_name: &str) -> Self {
        Self {
            version: STATE_VERSION,
            stack_name: stack_name.to_string(),
            script: None,
            ephemeral: false,
            owner_pid: None,
            ports: StackPorts::default(),
            processes: BTreeMap::new(),
            expo: None,
            logs: BTreeMap::new(),
            started_at: None,
            updated_at: None,
        }
    }

    /// True when the recorded owner process is alive.
    pub fn is_live(&self) -> bool {
        self.owner_pid.map(is_pid_alive).unwrap_or(false)
    }

    /// Recorded ports, only if the owner is alive.
    pub fn live_ports(&self) -> Option<&StackPorts> {
        if self.is_live() {
            Some(&self.ports)
        } else {
            None
        }
    }

    /// Recorded service PIDs that are still running.
    pub fn alive_processes(&self) -> Vec<(String, u32)> {
        self.processes
            .iter()
            .filter(|(_, pid)| is_pid_alive(**pid))
            .map(|(name, pid)| (name.clone(), *pid))
            .collect()
    }
}

/// Reads the state file. Missing or unparsable files read as `None`.
pub fn read_runtime_state(path: &Path) -> Option<RuntimeState> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::warn!("failed to read runtime state {}: {}", path.display(), err);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(err) => {
            tracing::warn!("ignoring invalid runtime state {}: {}", path.display(), err);
            None
        }
    }
}

pub fn write_runtime_state(path: &Path, state: &RuntimeState) -> Result<()> {
    let mut body = serde_json::to_string_pretty(state).map_err(|err| {
        StackError::FileWrite(path.to_path_buf(), std::io::Error::other(err))
    })?;
    body.push('\n');
    write_atomic(path, body.as_bytes(), None)
}

/// Writes a fresh state for a run that is starting now.
pub fn record_start(path: &Path, mut state: RuntimeState) -> Result<RuntimeState> {
    let now = Utc::now();
    state.started_at = Some(now);
    state.updated_at = Some(now);
    write_runtime_state(path, &state)?;
    Ok(state)
}

/// Read-modify-write. A missing file starts from an empty state for `stack`.
pub fn update_runtime_state<F>(path: &Path, stack: &str, f: F) -> Result<RuntimeState>
where
    F: FnOnce(&mut RuntimeState),
{
    let mut state = read_runtime_state(path).unwrap_or_else(|| RuntimeState::new(stack));
    f(&mut state);
    state.updated_at = Some(Utc::now());
    write_runtime_state(path, &state)?;
    Ok(state)
}

/// Removes the state file. Returns whether a file was removed.
pub fn delete_runtime_state(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(StackError::FileWrite(path.to_path_buf(), err)),
    }
}

/// Signal-0 liveness probe. `EPERM` means the process exists under another user.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 1 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}
