//! Service definitions for stack runs.
//!
//! This module defines the structure of the `hstack.toml` services file and the
//! built-in defaults used when no file exists. Commands, working directories,
//! env values and ready-check targets may reference the resolved stack env
//! with `${VAR}` or `${VAR:-default}`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;

pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1500;
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 180_000;

/// Top-level configuration structure corresponding to `hstack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Time between SIGINT and SIGKILL when stopping services (ms).
    pub shutdown_grace_ms: Option<u64>,
    /// How long a background start waits for the server health check (ms).
    pub ready_timeout_ms: Option<u64>,
    /// Services to run. Empty means the built-in set.
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name; also the key in the runtime state's `processes` map.
    pub name: String,
    /// Command line, split with shell rules after expansion.
    pub cmd: String,
    /// Working directory, relative to the repo checkout.
    pub cwd: Option<String>,
    /// Extra environment for this service.
    pub env: Option<HashMap<String, String>>,
    /// Names of services that must be ready first.
    pub depends_on: Option<Vec<String>>,
    /// Readiness check configuration.
    pub ready_check: Option<ReadinessCheck>,
    /// Restart the service when it exits with a failure.
    pub restart_on_fail: Option<bool>,
    /// Which start flag turns this service off (`ui` or `daemon`).
    pub role: Option<ServiceRole>,
}

/// Start flags that can skip a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Server,
    Daemon,
    Ui,
}

/// Configuration for service readiness checks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessCheck {
    /// Wait for a TCP port (template) to accept connections.
    Tcp(String),
    /// Wait for an HTTP URL (template) to answer 2xx.
    Http(String),
    /// Wait for a specific duration (milliseconds).
    Delay(u64),
    /// Wait for a log line matching a regex.
    Log(String),
}

impl Config {
    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS)
    }

    pub fn ready_timeout_ms(&self) -> u64 {
        self.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS)
    }

    /// Configured services, or the built-in set.
    pub fn services_or_default(&self) -> Vec<ServiceConfig> {
        if self.services.is_empty() {
            default_services()
        } else {
            self.services.clone()
        }
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Loads `path` when it exists, otherwise defaults.
pub fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        tracing::debug!("no services file at {}; using defaults", path.display());
        Ok(Config::default())
    }
}

/// Server, daemon and UI dev server, run with yarn from the monorepo.
pub fn default_services() -> Vec<ServiceConfig> {
    let env = |pairs: &[(&str, &str)]| {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        )
    };
    vec![
        ServiceConfig {
            name: "server".to_string(),
            cmd: "yarn start".to_string(),
            cwd: Some("apps/server".to_string()),
            env: env(&[("PORT", "${HAPPIER_STACK_SERVER_PORT}")]),
            depends_on: None,
            ready_check: Some(ReadinessCheck::Http(
                "http://127.0.0.1:${HAPPIER_STACK_SERVER_PORT}/health".to_string(),
            )),
            restart_on_fail: None,
            role: Some(ServiceRole::Server),
        },
        ServiceConfig {
            name: "daemon".to_string(),
            cmd: "yarn start daemon start-sync".to_string(),
            cwd: Some("apps/cli".to_string()),
            env: env(&[
                ("HAPPIER_HOME_DIR", "${HAPPIER_STACK_CLI_HOME_DIR}"),
                (
                    "HAPPIER_SERVER_URL",
                    "http://127.0.0.1:${HAPPIER_STACK_SERVER_PORT}",
                ),
            ]),
            depends_on: Some(vec!["server".to_string()]),
            ready_check: None,
            restart_on_fail: Some(true),
            role: Some(ServiceRole::Daemon),
        },
        ServiceConfig {
            name: "ui".to_string(),
            cmd: "yarn start --port ${HAPPIER_STACK_EXPO_DEV_PORT}".to_string(),
            cwd: Some("apps/ui".to_string()),
            env: env(&[
                (
                    "EXPO_PUBLIC_SERVER_URL",
                    "http://localhost:${HAPPIER_STACK_SERVER_PORT}",
                ),
                ("BROWSER", "none"),
            ]),
            depends_on: Some(vec!["server".to_string()]),
            ready_check: Some(ReadinessCheck::Tcp(
                "${HAPPIER_STACK_EXPO_DEV_PORT}".to_string(),
            )),
            restart_on_fail: None,
            role: Some(ServiceRole::Ui),
        },
    ]
}

fn template_regex() -> Option<&'static Regex> {
    static TEMPLATE: OnceLock<Option<Regex>> = OnceLock::new();
    TEMPLATE
        .get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok())
        .as_ref()
}

/// Expands `${VAR}` and `${VAR:-default}` against `env`.
///
/// Unknown variables without a default are an error so that a service never
/// starts with a half-formed command line.
pub fn expand_template(template: &str, env: &BTreeMap<String, String>) -> Result<String> {
    let Some(regex) = template_regex() else {
        return Ok(template.to_string());
    };
    let mut missing = None;
    let expanded = regex.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        match env.get(name).filter(|v| !v.is_empty()) {
            Some(value) => value.clone(),
            None => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            },
        }
    });
    match missing {
        Some(name) => Err(anyhow!("{} is not set (needed by \"{}\")", name, template)),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
shutdown_grace_ms = 500
ready_timeout_ms = 1000

[[service]]
name = "server"
cmd = "node server.js"
cwd = "apps/server"
env = { PORT = "${HAPPIER_STACK_SERVER_PORT}" }
ready_check = { http = "http://127.0.0.1:${HAPPIER_STACK_SERVER_PORT}/health" }
role = "server"

[[service]]
name = "worker"
cmd = "node worker.js"
depends_on = ["server"]
ready_check = { delay = 250 }
restart_on_fail = true
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.shutdown_grace_ms(), 500);
        assert_eq!(config.ready_timeout_ms, Some(1000));
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].role, Some(ServiceRole::Server));
        assert!(matches!(
            config.services[0].ready_check,
            Some(ReadinessCheck::Http(_))
        ));
        assert_eq!(config.services[1].ready_check, Some(ReadinessCheck::Delay(250)));
        assert_eq!(config.services[1].restart_on_fail, Some(true));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.shutdown_grace_ms(), DEFAULT_SHUTDOWN_GRACE_MS);
        let names: Vec<String> = config
            .services_or_default()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["server", "daemon", "ui"]);
    }

    #[test]
    fn expands_variables_and_defaults() {
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "3009".to_string());
        assert_eq!(
            expand_template("http://127.0.0.1:${PORT}/health", &env).unwrap(),
            "http://127.0.0.1:3009/health"
        );
        assert_eq!(
            expand_template("${HOST:-localhost}:${PORT}", &env).unwrap(),
            "localhost:3009"
        );
        assert_eq!(expand_template("no vars", &env).unwrap(), "no vars");
    }

    #[test]
    fn missing_variable_is_an_error() {
        let env = BTreeMap::new();
        let err = expand_template("port ${NOPE}", &env).unwrap_err();
        assert!(err.to_string().contains("NOPE"));
    }
}
