//! Stack management commands: creating, editing, listing and archiving stacks.
//!
//! Every handler returns `anyhow::Result<()>` and prints one result through
//! [`print_result`], so `--json` always yields a single object on stdout.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;

use crate::auth::{self, AuthCopy};
use crate::dotenv;
use crate::error::StackError;
use crate::output::print_result;
use crate::paths::{self, StackPaths, MAIN_STACK};
use crate::ports::{
    self, collect_reserved_ports, is_port_free, PortLayout, StackPorts, SERVER_PORT_KEY,
};
use crate::runtime_state;
use crate::settings::{expand_home, Settings};
use crate::stack_env::{resolve_stack_env, ResolveOptions, STACK_KEY};

pub const SERVER_COMPONENT_KEY: &str = "HAPPIER_STACK_SERVER_COMPONENT";
pub const REPO_DIR_KEY: &str = "HAPPIER_STACK_REPO_DIR";
pub const MANAGED_INFRA_KEY: &str = "HAPPIER_STACK_MANAGED_INFRA";
const MAIN_PORT: u16 = 3005;

/// Server implementation a stack runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerFlavor {
    /// SQLite and local files, no extra infrastructure.
    #[default]
    Light,
    /// Postgres, Redis and Minio per stack.
    Full,
}

impl ServerFlavor {
    pub fn component(self) -> &'static str {
        match self {
            ServerFlavor::Light => "happy-server-light",
            ServerFlavor::Full => "happy-server",
        }
    }

    /// Reads the flavor recorded in a stack env. Unknown values mean light.
    pub fn from_env(env: &BTreeMap<String, String>) -> Self {
        match env.get(SERVER_COMPONENT_KEY).map(|v| v.trim()) {
            Some("happy-server") | Some("full") => ServerFlavor::Full,
            _ => ServerFlavor::Light,
        }
    }

    /// Extra ports this flavor needs.
    pub fn layout(self, env: &BTreeMap<String, String>) -> PortLayout {
        match self {
            ServerFlavor::Light => PortLayout::default(),
            ServerFlavor::Full => PortLayout {
                backend: true,
                managed_infra: env.get(MANAGED_INFRA_KEY).map(|v| v.trim()) != Some("0"),
            },
        }
    }
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct NewArgs {
    /// Stack name
    pub name: String,
    /// Pin the server port instead of picking one at start time
    #[arg(long)]
    pub port: Option<u16>,
    /// Pin the port even when another stack reserves it
    #[arg(long)]
    pub force_port: bool,
    /// Server flavor
    #[arg(long, value_enum, default_value_t = ServerFlavor::Light)]
    pub server: ServerFlavor,
    /// Monorepo checkout to run from
    #[arg(long)]
    pub repo: Option<String>,
    /// Git remote new worktrees track
    #[arg(long)]
    pub remote: Option<String>,
    /// Stack to copy credentials from
    #[arg(long)]
    pub copy_auth_from: Option<String>,
    /// Symlink credentials instead of copying them
    #[arg(long)]
    pub link_auth: bool,
    /// Start with fresh credentials
    #[arg(long)]
    pub no_copy_auth: bool,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct EditArgs {
    pub name: String,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long, value_enum)]
    pub server: Option<ServerFlavor>,
    #[arg(long)]
    pub repo: Option<String>,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum EnvCommand {
    /// Print the stack env file
    List,
    /// Print one value
    Get { key: String },
    /// Set KEY=VALUE pairs
    Set {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Remove keys
    Unset {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print the fully resolved environment
    Resolved,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatedStack {
    ok: bool,
    stack_name: String,
    env_path: String,
    port: Option<u16>,
    server_component: String,
    ports_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthCopy>,
}

/// Validates a name and requires its env file to exist.
pub fn require_stack(settings: &Settings, name: &str) -> Result<StackPaths> {
    paths::validate_stack_name(name)?;
    let stack = StackPaths::new(&settings.storage_dir, name);
    if !stack.exists() {
        bail!(StackError::StackMissing {
            name: name.to_string(),
            env_path: stack.env_path.clone(),
        });
    }
    Ok(stack)
}

/// Hex string of `bytes` random bytes from the OS.
fn random_token(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::fill(&mut buf).map_err(|e| anyhow!("failed to generate random bytes: {}", e))?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Lowercase DNS label for bucket names.
fn dns_label(raw: &str) -> String {
    let label: String = raw
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "happy".to_string()
    } else {
        label.chars().take(63).collect()
    }
}

fn resolve_repo(settings: &Settings, raw: &str) -> Result<PathBuf> {
    let path = expand_home(raw, &settings.user_home);
    let path = if path.is_absolute() {
        path
    } else {
        settings.workspace_dir.join(path)
    };
    if !path.is_dir() {
        bail!(
            "[stack] repo checkout does not exist: {}\n[stack] pass an existing --repo path",
            path.display()
        );
    }
    Ok(path)
}

/// Fails closed when `port` is claimed by another stack or cannot be bound.
fn check_pinned_port(reserved: &BTreeMap<u16, String>, port: u16, force: bool) -> Result<()> {
    if !force {
        if let Some(owner) = reserved.get(&port) {
            bail!(StackError::PortReserved {
                port,
                owner: owner.clone(),
            });
        }
    }
    if !is_port_free(port) {
        bail!(StackError::PortBusy(port));
    }
    Ok(())
}

/// Light flavor keeps its SQLite database and files inside the stack dir.
fn light_server_env(stack: &StackPaths) -> Vec<(String, String)> {
    let data_dir = &stack.server_light_data_dir;
    vec![
        (auth::LIGHT_DATA_DIR_KEY.to_string(), data_dir.display().to_string()),
        (
            "HAPPY_SERVER_LIGHT_FILES_DIR".to_string(),
            data_dir.join("files").display().to_string(),
        ),
        (
            "DATABASE_URL".to_string(),
            format!("file:{}", data_dir.join("happy-server-light.sqlite").display()),
        ),
    ]
}

/// Credentials for the full flavor's managed infrastructure. Existing values win.
fn full_server_env(stack: &StackPaths, existing: &BTreeMap<String, String>) -> Result<Vec<(String, String)>> {
    let keep = |key: &str, fresh: String| {
        existing
            .get(key)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or(fresh)
    };
    Ok(vec![
        (MANAGED_INFRA_KEY.to_string(), keep(MANAGED_INFRA_KEY, "1".to_string())),
        ("HAPPIER_STACK_PG_USER".to_string(), keep("HAPPIER_STACK_PG_USER", "handy".to_string())),
        (
            "HAPPIER_STACK_PG_PASSWORD".to_string(),
            keep("HAPPIER_STACK_PG_PASSWORD", random_token(24)?),
        ),
        (
            "HAPPIER_STACK_PG_DATABASE".to_string(),
            keep("HAPPIER_STACK_PG_DATABASE", "handy".to_string()),
        ),
        (
            auth::MASTER_SECRET_FILE_KEY.to_string(),
            stack
                .base_dir
                .join("happy-server")
                .join(auth::MASTER_SECRET_FILE)
                .display()
                .to_string(),
        ),
        ("S3_ACCESS_KEY".to_string(), keep("S3_ACCESS_KEY", random_token(12)?)),
        ("S3_SECRET_KEY".to_string(), keep("S3_SECRET_KEY", random_token(24)?)),
        (
            "S3_BUCKET".to_string(),
            keep("S3_BUCKET", dns_label(&format!("happy-{}", stack.name))),
        ),
    ])
}

/// Pins infra ports next to a pinned server port, plus the URLs derived from them.
fn pinned_infra_env(
    server_port: u16,
    env: &BTreeMap<String, String>,
    reserved: &BTreeMap<u16, String>,
) -> Result<Vec<(String, String)>> {
    let mut taken: BTreeSet<u16> = reserved.keys().copied().collect();
    taken.insert(server_port);
    let mut pick = |start: u16| -> Result<u16> {
        let port = ports::pick_next_free_port(start, &taken)?;
        taken.insert(port);
        Ok(port)
    };
    let backend = pick(server_port.saturating_add(10))?;
    let pg = pick(server_port.saturating_add(1000))?;
    let redis = pick(pg.saturating_add(1))?;
    let minio = pick(redis.saturating_add(1))?;
    let minio_console = pick(minio.saturating_add(1))?;
    let ports = StackPorts {
        server: Some(server_port),
        backend: Some(backend),
        pg: Some(pg),
        redis: Some(redis),
        minio: Some(minio),
        minio_console: Some(minio_console),
    };

    let get = |key: &str| env.get(key).cloned().unwrap_or_default();
    let mut out: Vec<(String, String)> = ports.as_env();
    out.push((
        "DATABASE_URL".to_string(),
        format!(
            "postgresql://{}:{}@127.0.0.1:{}/{}",
            get("HAPPIER_STACK_PG_USER"),
            get("HAPPIER_STACK_PG_PASSWORD"),
            pg,
            get("HAPPIER_STACK_PG_DATABASE")
        ),
    ));
    out.push(("REDIS_URL".to_string(), format!("redis://127.0.0.1:{}", redis)));
    out.push(("S3_HOST".to_string(), "127.0.0.1".to_string()));
    out.push(("S3_PORT".to_string(), minio.to_string()));
    out.push(("S3_USE_SSL".to_string(), "false".to_string()));
    out.push((
        "S3_PUBLIC_URL".to_string(),
        format!("http://127.0.0.1:{}/{}", minio, get("S3_BUCKET")),
    ));
    Ok(out)
}

fn apply(env: &mut BTreeMap<String, String>, pairs: Vec<(String, String)>) {
    for (key, value) in pairs {
        env.insert(key, value);
    }
}

fn write_stack_env(stack: &StackPaths, env: &BTreeMap<String, String>) -> Result<()> {
    dotenv::write_atomic(&stack.env_path, dotenv::stringify_env(env).as_bytes(), Some(0o600))?;
    for dir in [&stack.logs_dir, &stack.cli_home_dir] {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

fn base_stack_env(settings: &Settings, stack: &StackPaths, flavor: ServerFlavor) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(STACK_KEY.to_string(), stack.name.clone());
    env.insert(SERVER_COMPONENT_KEY.to_string(), flavor.component().to_string());
    env.insert(
        "HAPPIER_STACK_UI_BUILD_DIR".to_string(),
        stack.ui_build_dir.display().to_string(),
    );
    env.insert(auth::CLI_HOME_KEY.to_string(), stack.cli_home_dir.display().to_string());
    env.insert(REPO_DIR_KEY.to_string(), settings.repo_dir.display().to_string());
    env
}

/// `hstack setup`: creates (or re-pins) the main stack.
pub fn setup(settings: &Settings, json: bool, port: Option<u16>) -> Result<()> {
    let stack = StackPaths::new(&settings.storage_dir, MAIN_STACK);
    let created = !stack.exists();
    let reserved = collect_reserved_ports(&settings.storage_dir, Some(MAIN_STACK));

    let port = if created {
        let port = port.unwrap_or(MAIN_PORT);
        if let Some(owner) = reserved.get(&port) {
            bail!(StackError::PortReserved {
                port,
                owner: owner.clone(),
            });
        }
        let mut env = base_stack_env(settings, &stack, ServerFlavor::Light);
        env.insert(SERVER_PORT_KEY.to_string(), port.to_string());
        apply(&mut env, light_server_env(&stack));
        write_stack_env(&stack, &env)?;
        tracing::info!("created main stack at {}", stack.env_path.display());
        Some(port)
    } else {
        if let Some(port) = port {
            if let Some(owner) = reserved.get(&port) {
                bail!(StackError::PortReserved {
                    port,
                    owner: owner.clone(),
                });
            }
            dotenv::update_env_file(&stack.env_path, &[(SERVER_PORT_KEY.to_string(), port.to_string())])?;
        }
        let env = dotenv::read_env_file(&stack.env_path)?;
        StackPorts::from_env(&env).server
    };

    let data = serde_json::json!({
        "ok": true,
        "stackName": MAIN_STACK,
        "envPath": stack.env_path.display().to_string(),
        "created": created,
        "port": port,
    });
    print_result(json, &data, || {
        format!(
            "[stack] main {} at {} (port {})",
            if created { "created" } else { "already set up" },
            stack.env_path.display(),
            port.map(|p| p.to_string()).unwrap_or_else(|| "ephemeral".to_string())
        )
    })
}

/// `hstack stack new`.
pub fn new_stack(settings: &Settings, json: bool, args: &NewArgs) -> Result<()> {
    let name = args.name.trim();
    paths::validate_stack_name(name)?;
    if name == MAIN_STACK {
        bail!(StackError::ReservedName(name.to_string()));
    }
    let stack = StackPaths::new(&settings.storage_dir, name);
    if stack.exists() {
        bail!(StackError::StackExists(name.to_string()));
    }

    let reserved = collect_reserved_ports(&settings.storage_dir, Some(name));
    if let Some(port) = args.port {
        check_pinned_port(&reserved, port, args.force_port)?;
    }

    let mut env = base_stack_env(settings, &stack, args.server);
    env.insert(
        "HAPPIER_STACK_STACK_REMOTE".to_string(),
        args.remote.clone().unwrap_or_else(|| "upstream".to_string()),
    );
    if let Some(repo) = &args.repo {
        env.insert(REPO_DIR_KEY.to_string(), resolve_repo(settings, repo)?.display().to_string());
    }
    if let Some(port) = args.port {
        env.insert(SERVER_PORT_KEY.to_string(), port.to_string());
    }
    match args.server {
        ServerFlavor::Light => apply(&mut env, light_server_env(&stack)),
        ServerFlavor::Full => {
            let infra = full_server_env(&stack, &env)?;
            apply(&mut env, infra);
            if let Some(port) = args.port {
                let pinned = pinned_infra_env(port, &env, &reserved)?;
                apply(&mut env, pinned);
            }
        }
    }
    write_stack_env(&stack, &env)?;
    tracing::info!("created stack {} at {}", name, stack.env_path.display());

    let auth = if args.no_copy_auth {
        None
    } else {
        let source = args
            .copy_auth_from
            .clone()
            .unwrap_or_else(|| auth::seed_source(settings));
        let link = args.link_auth || auth::link_mode_from_env(settings);
        match auth::copy_auth_from_stack(settings, &source, &stack, &env, link, args.copy_auth_from.is_some()) {
            Ok(copied) => Some(copied),
            Err(err) => {
                tracing::warn!("auth copy skipped: {}", err);
                None
            }
        }
    };

    let data = CreatedStack {
        ok: true,
        stack_name: name.to_string(),
        env_path: stack.env_path.display().to_string(),
        port: args.port,
        server_component: args.server.component().to_string(),
        ports_mode: if args.port.is_some() { "pinned" } else { "ephemeral" },
        auth,
    };
    print_result(json, &data, || {
        let mut text = format!(
            "[stack] created \"{}\" ({}, {} ports)\n  env: {}",
            data.stack_name, data.server_component, data.ports_mode, data.env_path
        );
        if data.auth.as_ref().is_some_and(AuthCopy::any) {
            text.push_str("\n  auth: copied from ");
            text.push_str(data.auth.as_ref().map(|a| a.source_stack.as_str()).unwrap_or(""));
        }
        text
    })
}

/// `hstack stack edit`.
pub fn edit_stack(settings: &Settings, json: bool, args: &EditArgs) -> Result<()> {
    let stack = require_stack(settings, &args.name)?;
    let mut env = dotenv::read_env_file(&stack.env_path)?;
    let reserved = collect_reserved_ports(&settings.storage_dir, Some(&stack.name));
    let mut updates: Vec<(String, String)> = Vec::new();

    if let Some(port) = args.port {
        if let Some(owner) = reserved.get(&port) {
            bail!(StackError::PortReserved {
                port,
                owner: owner.clone(),
            });
        }
        updates.push((SERVER_PORT_KEY.to_string(), port.to_string()));
    }
    if let Some(repo) = &args.repo {
        updates.push((REPO_DIR_KEY.to_string(), resolve_repo(settings, repo)?.display().to_string()));
    }
    if let Some(flavor) = args.server {
        updates.push((SERVER_COMPONENT_KEY.to_string(), flavor.component().to_string()));
        match flavor {
            ServerFlavor::Light => updates.extend(light_server_env(&stack)),
            ServerFlavor::Full => updates.extend(full_server_env(&stack, &env)?),
        }
    }
    apply(&mut env, updates.clone());

    let flavor = ServerFlavor::from_env(&env);
    let pinned_server = StackPorts::from_env(&env).server;
    if flavor == ServerFlavor::Full && (args.port.is_some() || args.server.is_some()) {
        if let Some(port) = pinned_server {
            let pinned = pinned_infra_env(port, &env, &reserved)?;
            updates.extend(pinned);
        }
    }
    if updates.is_empty() {
        bail!("[stack] nothing to edit (pass --port, --server or --repo)");
    }
    dotenv::update_env_file(&stack.env_path, &updates)?;

    let keys: Vec<String> = updates
        .iter()
        .map(|(k, _)| k.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let data = serde_json::json!({
        "ok": true,
        "stackName": stack.name,
        "envPath": stack.env_path.display().to_string(),
        "updated": keys,
    });
    print_result(json, &data, || {
        format!("[stack] updated {}: {}", stack.name, keys.join(", "))
    })
}

fn parse_assignment(raw: &str) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("[stack] expected KEY=VALUE, got {:?}", raw);
    };
    let key = key.trim();
    if !dotenv::is_valid_key(key) {
        bail!("[stack] invalid env key {:?}", key);
    }
    Ok((key.to_string(), value.to_string()))
}

/// `hstack stack env`.
pub fn stack_env_command(settings: &Settings, json: bool, name: &str, command: Option<&EnvCommand>) -> Result<()> {
    let stack = require_stack(settings, name)?;
    let env_path = stack.env_path.display().to_string();
    match command.unwrap_or(&EnvCommand::List) {
        EnvCommand::List => {
            let env = dotenv::read_env_file(&stack.env_path)?;
            let data = serde_json::json!({ "ok": true, "stackName": name, "envPath": env_path, "env": env });
            print_result(json, &data, || dotenv::stringify_env(&env))
        }
        EnvCommand::Get { key } => {
            let env = dotenv::read_env_file(&stack.env_path)?;
            let Some(value) = env.get(key) else {
                bail!("[stack] {} is not set for stack \"{}\"", key, name);
            };
            let data = serde_json::json!({ "ok": true, "stackName": name, "key": key, "value": value });
            print_result(json, &data, || value.clone())
        }
        EnvCommand::Set { pairs } => {
            let updates = pairs
                .iter()
                .map(|p| parse_assignment(p.as_str()))
                .collect::<Result<Vec<_>>>()?;
            dotenv::update_env_file(&stack.env_path, &updates)?;
            let keys: Vec<&str> = updates.iter().map(|(k, _)| k.as_str()).collect();
            let data = serde_json::json!({ "ok": true, "stackName": name, "envPath": env_path, "set": keys });
            print_result(json, &data, || format!("[stack] {}: set {}", name, keys.join(", ")))
        }
        EnvCommand::Unset { keys } => {
            dotenv::prune_env_file(&stack.env_path, keys)?;
            let data = serde_json::json!({ "ok": true, "stackName": name, "envPath": env_path, "unset": keys });
            print_result(json, &data, || format!("[stack] {}: unset {}", name, keys.join(", ")))
        }
        EnvCommand::Resolved => {
            let options = ResolveOptions {
                require_env_file: true,
                ..ResolveOptions::default()
            };
            let resolved = resolve_stack_env(settings, name, &options)?;
            let data = serde_json::json!({
                "ok": true,
                "stackName": name,
                "runtimeLive": resolved.runtime_live,
                "env": resolved.env,
            });
            print_result(json, &data, || dotenv::stringify_env(&resolved.env))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StackSummary {
    name: String,
    env_path: String,
    exists: bool,
    running: bool,
    server_port: Option<u16>,
}

/// `hstack stack list`.
pub fn list_stacks(settings: &Settings, json: bool) -> Result<()> {
    let stacks: Vec<StackSummary> = paths::list_stack_names(&settings.storage_dir)
        .into_iter()
        .map(|name| {
            let stack = StackPaths::new(&settings.storage_dir, &name);
            let env = dotenv::read_env_file(&stack.env_path).unwrap_or_default();
            let runtime = runtime_state::read_runtime_state(&stack.runtime_state_path);
            let live_port = runtime
                .as_ref()
                .and_then(|s| s.live_ports())
                .and_then(|p| p.server);
            StackSummary {
                exists: stack.exists(),
                running: runtime.as_ref().is_some_and(|s| s.is_live()),
                server_port: live_port.or_else(|| StackPorts::from_env(&env).server),
                env_path: stack.env_path.display().to_string(),
                name,
            }
        })
        .collect();
    let data = serde_json::json!({ "ok": true, "stacks": stacks });
    print_result(json, &data, || {
        stacks
            .iter()
            .map(|s| {
                let state = if !s.exists {
                    "missing"
                } else if s.running {
                    "running"
                } else {
                    "stopped"
                };
                let port = s
                    .server_port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                format!("{:<24} {:<8} {}", s.name, state, port)
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StackInfo {
    ok: bool,
    stack_name: String,
    env_path: String,
    runtime_state_path: String,
    server_component: String,
    running: bool,
    owner_pid: Option<u32>,
    ports: StackPorts,
    #[serde(skip_serializing_if = "Option::is_none")]
    expo_dev_port: Option<u16>,
    urls: BTreeMap<String, String>,
}

/// `hstack stack info`.
pub fn stack_info(settings: &Settings, json: bool, name: &str) -> Result<()> {
    require_stack(settings, name)?;
    let options = ResolveOptions {
        require_env_file: true,
        ..ResolveOptions::default()
    };
    let resolved = resolve_stack_env(settings, name, &options)?;
    let runtime = resolved.runtime_state.as_ref().filter(|s| s.is_live());
    let ports = StackPorts::from_env(&resolved.env);
    let expo_dev_port = runtime
        .and_then(|s| s.expo.as_ref())
        .and_then(|e| e.dev_port);

    let mut urls = BTreeMap::new();
    if let Some(port) = ports.server {
        urls.insert("server".to_string(), format!("http://127.0.0.1:{}", port));
        urls.insert("health".to_string(), format!("http://127.0.0.1:{}/health", port));
    }
    if let Some(port) = expo_dev_port {
        urls.insert("ui".to_string(), format!("http://localhost:{}", port));
    }

    let info = StackInfo {
        ok: true,
        stack_name: name.to_string(),
        env_path: resolved.paths.env_path.display().to_string(),
        runtime_state_path: resolved.paths.runtime_state_path.display().to_string(),
        server_component: ServerFlavor::from_env(&resolved.env).component().to_string(),
        running: runtime.is_some(),
        owner_pid: runtime.and_then(|s| s.owner_pid),
        ports,
        expo_dev_port,
        urls,
    };
    print_result(json, &info, || {
        let mut lines = vec![
            format!("stack:   {}", info.stack_name),
            format!("env:     {}", info.env_path),
            format!("runtime: {}", info.runtime_state_path),
            format!("server:  {}", info.server_component),
            format!(
                "status:  {}",
                match info.owner_pid {
                    Some(pid) => format!("running (pid {})", pid),
                    None => "stopped".to_string(),
                }
            ),
        ];
        for (label, url) in &info.urls {
            lines.push(format!("{:<8} {}", format!("{}:", label), url));
        }
        lines.join("\n")
    })
}

/// `hstack stack archive`.
pub fn archive_stack(settings: &Settings, json: bool, name: &str) -> Result<()> {
    let stack = require_stack(settings, name)?;
    if name == MAIN_STACK {
        bail!(StackError::ReservedName(name.to_string()));
    }
    let runtime = runtime_state::read_runtime_state(&stack.runtime_state_path);
    if runtime.as_ref().is_some_and(|s| s.is_live())
        || !crate::ownership::list_owned_pids(&stack).is_empty()
    {
        bail!(StackError::StackRunning(name.to_string()));
    }

    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    let dest = paths::archive_dir(&settings.storage_dir, &date, name);
    if dest.exists() {
        bail!("[stack] archive destination already exists: {}", dest.display());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::rename(&stack.base_dir, &dest).with_context(|| {
        format!(
            "failed to move {} to {}",
            stack.base_dir.display(),
            dest.display()
        )
    })?;
    tracing::info!("archived {} to {}", name, dest.display());

    let data = serde_json::json!({
        "ok": true,
        "stackName": name,
        "archivedTo": dest.display().to_string(),
    });
    print_result(json, &data, || format!("[stack] archived {} to {}", name, dest.display()))
}

/// `hstack stack auth <name> copy-from <source>`.
pub fn auth_copy_from(settings: &Settings, json: bool, name: &str, source: &str, link: bool) -> Result<()> {
    let stack = require_stack(settings, name)?;
    let env = dotenv::read_env_file(&stack.env_path)?;
    let copied = auth::copy_auth_from_stack(settings, source, &stack, &env, link, true)?;
    let data = serde_json::json!({ "ok": true, "stackName": name, "copied": copied });
    print_result(json, &data, || {
        if copied.any() {
            let mut parts = Vec::new();
            if copied.secret {
                parts.push("master secret");
            }
            if copied.access_key {
                parts.push(auth::ACCESS_KEY_FILE);
            }
            if copied.settings {
                parts.push(auth::SETTINGS_FILE);
            }
            format!("[auth] copied {} from \"{}\" into \"{}\"", parts.join(", "), source, name)
        } else {
            format!("[auth] nothing to copy from \"{}\" (already present or missing)", source)
        }
    })
}
