//! Data structures for tracking service state.
//!
//! This module defines the fully-resolved specification of a service
//! (`ServiceSpec`), its current execution status (`ServiceStatus`) and the
//! state the supervisor keeps per service (`ServiceState`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{expand_template, ReadinessCheck, ServiceConfig, ServiceRole};
use crate::ports::coerce_port;

/// Readiness check with its targets expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyProbe {
    Tcp(u16),
    Http(String),
    Delay(u64),
    Log(String),
}

/// Specification for a service to be run.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Friendly name for the service.
    pub name: String,
    /// The command executable.
    pub cmd: String,
    /// Arguments for the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Full environment the service runs with.
    pub env: BTreeMap<String, String>,
    /// Whether to restart the service on failure.
    pub restart_on_fail: bool,
    /// List of service names this service depends on.
    pub depends_on: Vec<String>,
    /// How to tell the service is ready.
    pub ready_check: Option<ReadyProbe>,
    pub role: Option<ServiceRole>,
}

/// The current lifecycle status of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Not started yet.
    Idle,
    /// Started, not ready.
    Starting,
    /// Passed its readiness check.
    Running,
    /// Service has exited.
    Exited { code: Option<i32> },
    /// Service failed to start or encountered a runtime error.
    Failed { error: String },
}

/// Runtime state of a single service.
#[derive(Debug, Clone)]
pub struct ServiceState {
    pub spec: ServiceSpec,
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub exit_code: Option<i32>,
}

impl ServiceState {
    pub fn new(spec: ServiceSpec) -> Self {
        Self {
            spec,
            status: ServiceStatus::Idle,
            pid: None,
            started_at: None,
            exit_code: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            ServiceStatus::Exited { .. } | ServiceStatus::Failed { .. }
        )
    }

    pub fn failed(&self) -> bool {
        match &self.status {
            ServiceStatus::Exited { code } => code.unwrap_or(1) != 0,
            ServiceStatus::Failed { .. } => true,
            _ => false,
        }
    }
}

/// Turns a configured service into a runnable spec for one stack.
///
/// `env` is the resolved stack environment; the service's own `env` entries are
/// expanded against it and layered on top.
pub fn spec_from_config(
    config: &ServiceConfig,
    env: &BTreeMap<String, String>,
    repo_dir: &Path,
) -> Result<ServiceSpec> {
    let cmd_line = expand_template(&config.cmd, env)
        .with_context(|| format!("failed to expand cmd for {}", config.name))?;
    let mut parts = shell_words::split(&cmd_line)
        .with_context(|| format!("failed to parse cmd for {}", config.name))?;
    if parts.is_empty() {
        return Err(anyhow!("empty cmd for {}", config.name));
    }
    let cmd = parts.remove(0);

    let cwd = match &config.cwd {
        Some(raw) => {
            let expanded = expand_template(raw, env)?;
            let path = PathBuf::from(expanded);
            Some(if path.is_absolute() {
                path
            } else {
                repo_dir.join(path)
            })
        }
        None => Some(repo_dir.to_path_buf()),
    };

    let mut service_env = env.clone();
    if let Some(extra) = &config.env {
        for (key, value) in extra {
            let value = expand_template(value, env)
                .with_context(|| format!("failed to expand env {} for {}", key, config.name))?;
            service_env.insert(key.clone(), value);
        }
    }

    let ready_check = match &config.ready_check {
        None => None,
        Some(ReadinessCheck::Tcp(raw)) => {
            let expanded = expand_template(raw, env)?;
            match coerce_port(&expanded) {
                Some(port) => Some(ReadyProbe::Tcp(port)),
                None => bail!("invalid tcp ready_check port {:?} for {}", expanded, config.name),
            }
        }
        Some(ReadinessCheck::Http(raw)) => Some(ReadyProbe::Http(expand_template(raw, env)?)),
        Some(ReadinessCheck::Delay(ms)) => Some(ReadyProbe::Delay(*ms)),
        Some(ReadinessCheck::Log(pattern)) => Some(ReadyProbe::Log(pattern.clone())),
    };

    Ok(ServiceSpec {
        name: config.name.clone(),
        cmd,
        args: parts,
        cwd,
        env: service_env,
        restart_on_fail: config.restart_on_fail.unwrap_or(false),
        depends_on: config.depends_on.clone().unwrap_or_default(),
        ready_check,
        role: config.role,
    })
}

/// Rejects duplicate names and dependencies on unknown services.
pub fn validate_specs(specs: &[ServiceSpec]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for spec in specs {
        if !seen.insert(spec.name.as_str()) {
            bail!("duplicate service name: {}", spec.name);
        }
    }
    for spec in specs {
        for dep in &spec.depends_on {
            if !seen.contains(dep.as_str()) {
                bail!("service {} depends on unknown service {}", spec.name, dep);
            }
        }
    }
    Ok(())
}

/// Shell-quoted command line for display.
pub fn format_command(spec: &ServiceSpec) -> String {
    let mut parts = Vec::with_capacity(1 + spec.args.len());
    parts.push(spec.cmd.clone());
    parts.extend(spec.args.clone());
    shell_words::join(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_services;

    fn stack_env() -> BTreeMap<String, String> {
        [
            ("HAPPIER_STACK_SERVER_PORT", "3009"),
            ("HAPPIER_STACK_EXPO_DEV_PORT", "8082"),
            ("HAPPIER_STACK_CLI_HOME_DIR", "/s/dev/cli"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_expand_against_stack_env() {
        let env = stack_env();
        let specs: Vec<ServiceSpec> = default_services()
            .iter()
            .map(|c| spec_from_config(c, &env, Path::new("/repo")).unwrap())
            .collect();
        validate_specs(&specs).unwrap();

        let server = &specs[0];
        assert_eq!(server.cmd, "yarn");
        assert_eq!(server.cwd.as_deref(), Some(Path::new("/repo/apps/server")));
        assert_eq!(server.env.get("PORT").map(String::as_str), Some("3009"));
        assert_eq!(
            server.ready_check,
            Some(ReadyProbe::Http("http://127.0.0.1:3009/health".to_string()))
        );

        let ui = &specs[2];
        assert_eq!(ui.args, vec!["start", "--port", "8082"]);
        assert_eq!(ui.ready_check, Some(ReadyProbe::Tcp(8082)));
        assert_eq!(ui.depends_on, vec!["server"]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let env = stack_env();
        let mut config = default_services().remove(1);
        config.depends_on = Some(vec!["nope".to_string()]);
        let spec = spec_from_config(&config, &env, Path::new("/repo")).unwrap();
        assert!(validate_specs(&[spec]).is_err());
    }

    #[test]
    fn format_command_quotes() {
        let env = stack_env();
        let mut config = default_services().remove(0);
        config.cmd = "node 'my server.js'".to_string();
        let spec = spec_from_config(&config, &env, Path::new("/repo")).unwrap();
        assert_eq!(format_command(&spec), "node 'my server.js'");
    }
}
