//! Proving that a process belongs to a stack.
//!
//! Processes spawned for a stack inherit `HAPPIER_STACK_STACK`,
//! `HAPPIER_STACK_ENV_FILE` and the stack's CLI home. A process is treated as
//! owned only when its environment points back at the stack; anything else is
//! left alone.

use std::collections::BTreeMap;
use std::process::Command;

use crate::auth::CLI_HOME_KEY;
use crate::paths::StackPaths;
use crate::stack_env::{ENV_FILE_KEY, STACK_KEY};

/// Environment of another process, if readable.
#[cfg(target_os = "linux")]
pub fn process_environ(pid: u32) -> Option<BTreeMap<String, String>> {
    let raw = std::fs::read(format!("/proc/{}/environ", pid)).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter_map(|entry| {
                let text = String::from_utf8_lossy(entry);
                let (key, value) = text.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect(),
    )
}

/// Environment of another process, if readable.
///
/// `ps eww` appends the environment to the command line; values with spaces
/// are not recoverable, which is fine for the keys checked here.
#[cfg(not(target_os = "linux"))]
pub fn process_environ(pid: u32) -> Option<BTreeMap<String, String>> {
    let output = Command::new("ps")
        .args(["eww", "-o", "command=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Some(
        text.split_whitespace()
            .filter_map(|token| {
                let (key, value) = token.split_once('=')?;
                crate::dotenv::is_valid_key(key).then(|| (key.to_string(), value.to_string()))
            })
            .collect(),
    )
}

/// True when `env` points at `stack`: its env file, or its name together with
/// its CLI home. A different stack name always wins.
pub fn env_belongs_to_stack(env: &BTreeMap<String, String>, stack: &StackPaths) -> bool {
    let value = |key: &str| env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
    let named = value(STACK_KEY);
    if named.is_some_and(|name| name != stack.name) {
        return false;
    }
    let env_file = stack.env_path.display().to_string();
    let cli_home = stack.cli_home_dir.display().to_string();
    value(ENV_FILE_KEY) == Some(env_file.as_str())
        || (named.is_some() && value(CLI_HOME_KEY) == Some(cli_home.as_str()))
}

pub fn is_owned_by_stack(pid: u32, stack: &StackPaths) -> bool {
    process_environ(pid)
        .map(|env| env_belongs_to_stack(&env, stack))
        .unwrap_or(false)
}

/// Every PID on the machine we can see.
pub fn list_pids() -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc") {
            return entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
                .collect();
        }
    }
    match Command::new("ps").args(["-axo", "pid="]).output() {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .filter_map(|s| s.parse().ok())
            .collect(),
        Err(err) => {
            tracing::debug!("ps unavailable: {}", err);
            Vec::new()
        }
    }
}

/// PIDs, other than this process, whose environment proves stack ownership.
pub fn list_owned_pids(stack: &StackPaths) -> Vec<u32> {
    let me = std::process::id();
    list_pids()
        .into_iter()
        .filter(|pid| *pid != me && *pid > 1)
        .filter(|pid| is_owned_by_stack(*pid, stack))
        .collect()
}

/// PIDs listening on a TCP port, via `lsof`. Empty when `lsof` is missing.
pub fn list_listen_pids(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .output();
    match output {
        Ok(output) => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect(),
        Err(err) => {
            tracing::debug!("lsof unavailable: {}", err);
            Vec::new()
        }
    }
}

/// Listener PIDs on `port`, split into (owned by `stack`, foreign).
pub fn classify_listeners(port: u16, stack: &StackPaths) -> (Vec<u32>, Vec<u32>) {
    list_listen_pids(port)
        .into_iter()
        .partition(|pid| is_owned_by_stack(*pid, stack))
}
