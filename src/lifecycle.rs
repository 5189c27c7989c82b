//! Starting and stopping stacks.
//!
//! A foreground start owns the stack: it records itself as `ownerPid` in the
//! runtime state, supervises the services and cleans up on exit. A background
//! start re-executes the foreground runner detached and waits until the
//! server answers its health check.
//!
//! Stopping only ever signals processes that are provably part of the stack:
//! the recorded owner, recorded services whose environment carries the stack
//! pointer, and other processes found by the same environment check.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::auth;
use crate::config::{Config, ServiceConfig, ServiceRole};
use crate::error::StackError;
use crate::events::{Event, ProcessSignal};
use crate::health;
use crate::output::{
    format_tool_message, print_result, read_last_lines, service_prefix, LogSink, StreamKind,
};
use crate::ownership;
use crate::paths::StackPaths;
use crate::ports::{
    allocate_stack_ports, collect_reserved_ports, default_port_start, is_port_free,
    pick_expo_dev_port, StackPorts,
};
use crate::process::{format_command, spec_from_config, validate_specs, ServiceState, ServiceStatus};
use crate::runner::{kill_process_tree, ServiceManager, ShutdownConfig};
use crate::runtime_state::{
    delete_runtime_state, is_pid_alive, read_runtime_state, record_start, update_runtime_state,
    ExpoPorts, RuntimeState,
};
use crate::settings::Settings;
use crate::stack::{require_stack, ServerFlavor, REPO_DIR_KEY};
use crate::stack_env::{apply_bind_mode, resolve_stack_env, BindMode, ResolveOptions, EPHEMERAL_PORTS_KEY};

const BACKGROUND_READY_TIMEOUT_KEY: &str = "HAPPIER_STACK_STACK_BACKGROUND_READY_TIMEOUT_MS";
const BACKGROUND_POLL_INTERVAL: Duration = Duration::from_millis(300);
const LOG_TAIL_LINES: usize = 40;
const TICK: Duration = Duration::from_millis(200);
const DRAIN_WINDOW: Duration = Duration::from_millis(150);
const OUTPUT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Default, clap::Args)]
pub struct StartArgs {
    /// Stack name
    pub name: String,
    /// Stop a running instance first
    #[arg(long)]
    pub restart: bool,
    /// Run detached and return once the server is healthy
    #[arg(long)]
    pub background: bool,
    /// Skip the UI dev server
    #[arg(long)]
    pub no_ui: bool,
    /// Skip the CLI daemon
    #[arg(long)]
    pub no_daemon: bool,
    /// Network exposure of dev servers
    #[arg(long, value_enum)]
    pub bind: Option<BindMode>,
    /// Ports a restarted background runner should try to keep (JSON).
    #[arg(long, hide = true)]
    pub reuse_ports: Option<String>,
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct StopArgs {
    pub name: String,
    /// Also free recorded and pinned ports held by stack-owned listeners
    #[arg(long)]
    pub aggressive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoppedProcess {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopReport {
    pub ok: bool,
    pub stack_name: String,
    pub owner_pid: Option<u32>,
    pub stopped_processes: Vec<StoppedProcess>,
    pub swept_pids: Vec<u32>,
    pub freed_ports: Vec<u16>,
    pub runtime_state_deleted: bool,
}

/// PIDs a stop must never signal: this process and its parent.
fn protected_pids() -> HashSet<u32> {
    let mut pids = HashSet::new();
    pids.insert(std::process::id());
    #[cfg(unix)]
    {
        let parent = unsafe { libc::getppid() };
        if let Ok(parent) = u32::try_from(parent) {
            pids.insert(parent);
        }
    }
    pids
}

/// Kills stack-owned listeners on `port`. Foreign listeners are an error.
async fn free_owned_listeners(port: u16, stack: &StackPaths, grace: Duration) -> Result<Vec<u32>> {
    let (owned, foreign) = ownership::classify_listeners(port, stack);
    if !foreign.is_empty() {
        bail!(StackError::ForeignListener {
            port,
            stack: stack.name.clone(),
        });
    }
    let mut killed = Vec::new();
    for pid in owned {
        if kill_process_tree(pid, grace).await {
            killed.push(pid);
        }
    }
    Ok(killed)
}

/// Stops everything that belongs to `stack` and deletes its runtime state.
pub async fn stop_stack(stack: &StackPaths, aggressive: bool, grace: Duration) -> Result<StopReport> {
    let protected = protected_pids();
    let mut report = StopReport {
        ok: true,
        stack_name: stack.name.clone(),
        ..StopReport::default()
    };
    let state = read_runtime_state(&stack.runtime_state_path);

    if let Some(state) = &state {
        if let Some(pid) = state
            .owner_pid
            .filter(|pid| !protected.contains(pid) && is_pid_alive(*pid))
        {
            tracing::info!("stopping runner {} of stack {}", pid, stack.name);
            kill_process_tree(pid, grace).await;
            report.owner_pid = Some(pid);
        }
        for (name, pid) in state.alive_processes() {
            if protected.contains(&pid) {
                continue;
            }
            if !ownership::is_owned_by_stack(pid, stack) {
                tracing::warn!(
                    "recorded {} pid {} is not owned by stack {}; leaving it alone",
                    name,
                    pid,
                    stack.name
                );
                continue;
            }
            if kill_process_tree(pid, grace).await {
                report.stopped_processes.push(StoppedProcess { name, pid });
            }
        }
    }

    for pid in ownership::list_owned_pids(stack) {
        if protected.contains(&pid) || !is_pid_alive(pid) {
            continue;
        }
        tracing::debug!("sweeping stack-owned pid {}", pid);
        if kill_process_tree(pid, grace).await {
            report.swept_pids.push(pid);
        }
    }

    if aggressive {
        let mut ports: BTreeSet<u16> = BTreeSet::new();
        if let Some(state) = &state {
            ports.extend(state.ports.values());
            ports.extend(state.expo.as_ref().and_then(|e| e.dev_port));
        }
        let env = crate::dotenv::read_env_file(&stack.env_path)?;
        ports.extend(StackPorts::from_env(&env).values());
        for port in ports {
            match free_owned_listeners(port, stack, grace).await {
                Ok(killed) if !killed.is_empty() => report.freed_ports.push(port),
                Ok(_) => {}
                Err(err) => tracing::warn!("{}", err),
            }
        }
    }

    report.runtime_state_deleted = delete_runtime_state(&stack.runtime_state_path)?;
    Ok(report)
}

/// `hstack stack stop`.
pub async fn stop(settings: &Settings, config: &Config, json: bool, args: &StopArgs) -> Result<()> {
    let stack = require_stack(settings, &args.name)?;
    let grace = Duration::from_millis(config.shutdown_grace_ms());
    let report = stop_stack(&stack, args.aggressive, grace).await?;
    print_result(json, &report, || {
        let mut text = format!("[stack] stopped {}", report.stack_name);
        if let Some(pid) = report.owner_pid {
            text.push_str(&format!("\n  runner: pid {}", pid));
        }
        for process in &report.stopped_processes {
            text.push_str(&format!("\n  {}: pid {}", process.name, process.pid));
        }
        if !report.swept_pids.is_empty() {
            text.push_str(&format!("\n  swept: {:?}", report.swept_pids));
        }
        if !report.freed_ports.is_empty() {
            text.push_str(&format!("\n  freed ports: {:?}", report.freed_ports));
        }
        text
    })
}

/// `hstack stack start`.
pub async fn start(
    settings: &Settings,
    config: &Config,
    config_path: &Path,
    json: bool,
    args: &StartArgs,
) -> Result<()> {
    let stack = require_stack(settings, &args.name)?;
    let options = ResolveOptions {
        require_env_file: true,
        ..ResolveOptions::default()
    };
    let resolved = resolve_stack_env(settings, &args.name, &options)?;
    let grace = Duration::from_millis(config.shutdown_grace_ms());

    if resolved.runtime_live && !args.restart {
        let state = resolved.runtime_state.clone().unwrap_or_else(|| RuntimeState::new(&args.name));
        let data = serde_json::json!({
            "ok": true,
            "stackName": args.name,
            "alreadyRunning": true,
            "ownerPid": state.owner_pid,
            "ports": state.ports,
        });
        return print_result(json, &data, || {
            format!(
                "[stack] {} is already running (pid {}, server port {})",
                args.name,
                state.owner_pid.map(|p| p.to_string()).unwrap_or_default(),
                state
                    .ports
                    .server
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string())
            )
        });
    }

    let mut previous_ports = match &args.reuse_ports {
        Some(raw) => serde_json::from_str::<StackPorts>(raw).ok(),
        None => None,
    };
    if args.restart {
        if previous_ports.is_none() {
            previous_ports = resolved
                .runtime_state
                .as_ref()
                .map(|s| s.ports.clone())
                .filter(|p| !p.is_empty());
        }
        let report = stop_stack(&stack, false, grace).await?;
        tracing::info!(
            "restart: stopped {} (runner {:?}, {} services, {} swept)",
            stack.name,
            report.owner_pid,
            report.stopped_processes.len(),
            report.swept_pids.len()
        );
    }

    if args.background {
        start_background(settings, config, config_path, json, &stack, args, previous_ports).await
    } else {
        run_foreground(settings, config, json, &stack, args, previous_ports).await
    }
}

fn background_timeout(settings: &Settings, config: &Config) -> Duration {
    let ms = settings
        .var(BACKGROUND_READY_TIMEOUT_KEY)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or_else(|| config.ready_timeout_ms());
    Duration::from_millis(ms)
}

async fn start_background(
    settings: &Settings,
    config: &Config,
    config_path: &Path,
    json: bool,
    stack: &StackPaths,
    args: &StartArgs,
    previous_ports: Option<StackPorts>,
) -> Result<()> {
    std::fs::create_dir_all(&stack.logs_dir)
        .with_context(|| format!("failed to create {}", stack.logs_dir.display()))?;
    let log_path = stack
        .logs_dir
        .join(format!("runner.{}.log", Utc::now().format("%Y%m%d-%H%M%S")));
    let log = File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log_err = log.try_clone().context("failed to duplicate log handle")?;

    let exe = std::env::current_exe().context("failed to locate the hstack executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("--config")
        .arg(config_path)
        .args(["stack", "start", &stack.name]);
    if args.no_ui {
        command.arg("--no-ui");
    }
    if args.no_daemon {
        command.arg("--no-daemon");
    }
    if let Some(bind) = args.bind {
        command.args(["--bind", bind.as_str()]);
    }
    if let Some(ports) = &previous_ports {
        command
            .arg("--reuse-ports")
            .arg(serde_json::to_string(ports).context("failed to encode ports")?);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setsid();
                Ok(())
            });
        }
    }

    let mut child = command.spawn().context("failed to spawn background runner")?;
    let pid = child.id();
    tracing::info!("background runner for {} started as pid {}", stack.name, pid);

    let wants_server = config
        .services_or_default()
        .iter()
        .any(|s| s.role == Some(ServiceRole::Server));
    let timeout = background_timeout(settings, config);
    let deadline = Instant::now() + timeout;

    let failure = loop {
        match child.try_wait() {
            Ok(Some(status)) => break format!("runner exited early ({})", status),
            Ok(None) => {}
            Err(err) => break format!("failed to poll runner: {}", err),
        }
        let recorded = read_runtime_state(&stack.runtime_state_path).filter(|s| s.owner_pid == Some(pid));
        if let Some(state) = recorded {
            match state.ports.server {
                Some(port) if wants_server => {
                    if health::http_ok(&format!("http://127.0.0.1:{}/health", port)).await {
                        let data = serde_json::json!({
                            "ok": true,
                            "stackName": stack.name,
                            "background": true,
                            "pid": pid,
                            "port": port,
                            "url": format!("http://127.0.0.1:{}", port),
                            "logPath": log_path.display().to_string(),
                        });
                        return print_result(json, &data, || {
                            format!(
                                "[stack] {} running in background (pid {})\n  server: http://127.0.0.1:{}\n  log: {}",
                                stack.name,
                                pid,
                                port,
                                log_path.display()
                            )
                        });
                    }
                }
                _ if !wants_server => {
                    let data = serde_json::json!({
                        "ok": true,
                        "stackName": stack.name,
                        "background": true,
                        "pid": pid,
                        "logPath": log_path.display().to_string(),
                    });
                    return print_result(json, &data, || {
                        format!("[stack] {} running in background (pid {})", stack.name, pid)
                    });
                }
                _ => {}
            }
        }
        if Instant::now() >= deadline {
            break format!("server not healthy after {}ms", timeout.as_millis());
        }
        tokio::time::sleep(BACKGROUND_POLL_INTERVAL).await;
    };

    let tail = read_last_lines(&log_path, LOG_TAIL_LINES).join("\n");
    kill_process_tree(pid, Duration::from_millis(config.shutdown_grace_ms())).await;
    let _ = child.try_wait();
    if let Err(err) = delete_runtime_state(&stack.runtime_state_path) {
        tracing::warn!("{}", err);
    }
    bail!(StackError::Service(format!(
        "stack \"{}\" failed to start in background: {}\n--- last lines of {} ---\n{}",
        stack.name,
        failure,
        log_path.display(),
        tail
    )))
}

/// Picks the ports for a foreground run.
#[allow(clippy::too_many_arguments)]
async fn choose_ports(
    settings: &Settings,
    stack: &StackPaths,
    pinned: StackPorts,
    previous: Option<StackPorts>,
    layout: crate::ports::PortLayout,
    restart: bool,
    reserved: &mut BTreeSet<u16>,
    grace: Duration,
) -> Result<StackPorts> {
    if let Some(server) = pinned.server {
        if !is_port_free(server) && restart {
            free_owned_listeners(server, stack, grace).await?;
        }
        if !is_port_free(server) {
            bail!(StackError::PortBusy(server));
        }
        return Ok(pinned);
    }

    if let Some(previous) = previous.filter(|p| p.server.is_some()) {
        let busy: Vec<u16> = previous.values().into_iter().filter(|p| !is_port_free(*p)).collect();
        for port in busy {
            if let Err(err) = free_owned_listeners(port, stack, grace).await {
                tracing::warn!("{}", err);
            }
        }
        let still_busy: Vec<u16> = previous.values().into_iter().filter(|p| !is_port_free(*p)).collect();
        if !still_busy.is_empty() {
            bail!(
                "[ports] cannot reuse ports of \"{}\": {:?} still in use\n[ports] stop whatever holds them, or start without --restart",
                stack.name,
                still_busy
            );
        }
        return Ok(previous);
    }

    let start = default_port_start(settings.var("HAPPIER_STACK_STACK_PORT_START"), &stack.name);
    Ok(allocate_stack_ports(start, layout, reserved)?)
}

fn service_enabled(service: &ServiceConfig, args: &StartArgs) -> bool {
    match service.role {
        Some(ServiceRole::Ui) => !args.no_ui,
        Some(ServiceRole::Daemon) => !args.no_daemon,
        _ => true,
    }
}

/// Seeds credentials from the seed stack when the daemon would start unauthenticated.
fn maybe_seed_auth(settings: &Settings, stack: &StackPaths, stack_env: &std::collections::BTreeMap<String, String>) {
    let cli_home = auth::cli_home_for(stack, stack_env);
    if !auth::needs_seed(&cli_home) {
        return;
    }
    if !auth::auto_seed_enabled(settings, &stack.name, std::io::stdin().is_terminal()) {
        tracing::debug!("auth auto-seed disabled for {}", stack.name);
        return;
    }
    let source = auth::seed_source(settings);
    if source == stack.name {
        return;
    }
    tracing::info!("auth: seeding {} from {} (missing credentials)", stack.name, source);
    let link = auth::link_mode_from_env(settings);
    if let Err(err) = auth::copy_auth_from_stack(settings, &source, stack, stack_env, link, false) {
        tracing::warn!("auth auto-seed failed: {}", err);
    }
}

async fn run_foreground(
    settings: &Settings,
    config: &Config,
    json: bool,
    stack: &StackPaths,
    args: &StartArgs,
    previous_ports: Option<StackPorts>,
) -> Result<()> {
    let options = ResolveOptions {
        require_env_file: true,
        ..ResolveOptions::default()
    };
    let resolved = resolve_stack_env(settings, &stack.name, &options)?;
    let grace = Duration::from_millis(config.shutdown_grace_ms());
    let flavor = ServerFlavor::from_env(&resolved.env);
    let pinned = StackPorts::from_env(&resolved.stack_env);
    let ephemeral = pinned.server.is_none();

    let mut reserved: BTreeSet<u16> = collect_reserved_ports(&settings.storage_dir, Some(&stack.name))
        .into_keys()
        .collect();
    let ports = choose_ports(
        settings,
        stack,
        pinned,
        previous_ports,
        flavor.layout(&resolved.env),
        args.restart || args.reuse_ports.is_some(),
        &mut reserved,
        grace,
    )
    .await?;
    let server_port = ports
        .server
        .ok_or_else(|| anyhow!("[ports] no server port for {}", stack.name))?;
    if !is_port_free(server_port) {
        bail!(StackError::PortBusy(server_port));
    }
    reserved.extend(ports.values());

    let mut configs: Vec<ServiceConfig> = config
        .services_or_default()
        .into_iter()
        .filter(|s| service_enabled(s, args))
        .collect();
    let enabled: HashSet<String> = configs.iter().map(|s| s.name.clone()).collect();
    for service in &mut configs {
        if let Some(deps) = service.depends_on.as_mut() {
            deps.retain(|d| enabled.contains(d));
        }
    }
    let runs_ui = configs.iter().any(|s| s.role == Some(ServiceRole::Ui));
    let runs_daemon = configs.iter().any(|s| s.role == Some(ServiceRole::Daemon));

    let expo_port = if runs_ui {
        Some(pick_expo_dev_port(&resolved.env, &stack.name, &reserved)?)
    } else {
        None
    };
    if runs_daemon {
        maybe_seed_auth(settings, stack, &resolved.stack_env);
    }

    let mut env = resolved.env.clone();
    env.extend(ports.as_env());
    if ephemeral {
        env.insert(EPHEMERAL_PORTS_KEY.to_string(), "1".to_string());
    }
    if let Some(port) = expo_port {
        env.insert("HAPPIER_STACK_EXPO_DEV_PORT".to_string(), port.to_string());
    }
    // Without an explicit mode the stack env keeps its own HOST and Expo host.
    let bind = args.bind.or_else(|| {
        resolved.get("HAPPIER_STACK_BIND_MODE").and_then(|v| match BindMode::from_str(v, true) {
            Ok(mode) => Some(mode),
            Err(_) => {
                tracing::warn!("ignoring unknown HAPPIER_STACK_BIND_MODE {:?}", v);
                None
            }
        })
    });
    if let Some(bind) = bind {
        apply_bind_mode(&mut env, bind);
    }

    let repo_dir = env
        .get(REPO_DIR_KEY)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| settings.repo_dir.clone());
    let specs = configs
        .iter()
        .map(|c| spec_from_config(c, &env, &repo_dir))
        .collect::<Result<Vec<_>>>()?;
    validate_specs(&specs)?;
    if specs.is_empty() {
        bail!("[stack] no services to run for {}", stack.name);
    }

    let mut state = RuntimeState::new(&stack.name);
    state.owner_pid = Some(std::process::id());
    state.script = Some("start".to_string());
    state.ephemeral = ephemeral;
    state.ports = ports.clone();
    state.expo = expo_port.map(|port| ExpoPorts {
        dev_port: Some(port),
        ..ExpoPorts::default()
    });
    let mut sinks = Vec::with_capacity(specs.len());
    for spec in &specs {
        let path = stack.logs_dir.join(format!("{}.log", spec.name));
        state
            .logs
            .insert(spec.name.clone(), path.display().to_string());
        sinks.push(LogSink::open(&path)?);
    }
    record_start(&stack.runtime_state_path, state)?;

    let summary = serde_json::json!({
        "ok": true,
        "stackName": stack.name,
        "ownerPid": std::process::id(),
        "ports": ports,
        "expoDevPort": expo_port,
        "bind": bind.map(BindMode::as_str),
        "services": specs.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
    });
    print_result(json, &summary, || {
        format_tool_message(&format!(
            "starting {} (server port {}{})",
            stack.name,
            server_port,
            expo_port
                .map(|p| format!(", ui port {}", p))
                .unwrap_or_default()
        ))
    })?;

    let result = supervise(stack, config, specs, sinks, json).await;
    finish_foreground(stack, server_port);
    result
}

/// Prefixed stdout plus per-service log files.
struct OutputState {
    names: Vec<String>,
    sinks: Vec<LogSink>,
    width: usize,
    color: bool,
    quiet: bool,
}

impl OutputState {
    fn line(&mut self, id: usize, text: &str, stream: StreamKind) {
        if let Some(sink) = self.sinks.get_mut(id) {
            sink.write_line(text);
        }
        if self.quiet {
            return;
        }
        let name = self.names.get(id).map(String::as_str).unwrap_or("service");
        let prefix = service_prefix(name, id, self.width, self.color);
        match stream {
            StreamKind::Stdout => println!("{}{}", prefix, text),
            StreamKind::Stderr => eprintln!("{}{}", prefix, text),
        }
    }

    fn tool(&mut self, id: usize, text: &str) {
        self.line(id, &format_tool_message(text), StreamKind::Stdout);
    }

    fn flush(&mut self) {
        for sink in &mut self.sinks {
            sink.flush();
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let capped = attempt.saturating_sub(1).min(5);
    let delay = 1_u64 << capped;
    Duration::from_secs(delay.min(30))
}

fn spawn_signal_listener(tx: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = tx.send(Event::Shutdown { signal: ProcessSignal::SigInt });
                }
                _ = sigterm.recv() => {
                    let _ = tx.send(Event::Shutdown { signal: ProcessSignal::SigTerm });
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            let _ = tx.send(Event::Shutdown {
                signal: ProcessSignal::SigInt,
            });
        }
    });
}

async fn supervise(
    stack: &StackPaths,
    config: &Config,
    specs: Vec<crate::process::ServiceSpec>,
    sinks: Vec<LogSink>,
    json: bool,
) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (output_tx, mut output_rx) = mpsc::channel(OUTPUT_BUFFER);
    let shutdown = ShutdownConfig::new(config.shutdown_grace_ms(), config.ready_timeout_ms());
    let mut manager = ServiceManager::new(specs.clone(), event_tx.clone(), output_tx, shutdown);
    let mut output = OutputState {
        names: specs.iter().map(|s| s.name.clone()).collect(),
        width: specs.iter().map(|s| s.name.len()).max().unwrap_or(0),
        sinks,
        color: !json && std::io::stdout().is_terminal(),
        quiet: json,
    };
    let mut services: Vec<ServiceState> = specs.into_iter().map(ServiceState::new).collect();
    let mut restart_attempts: HashMap<usize, u32> = HashMap::new();
    let mut pending_restarts: HashSet<usize> = HashSet::new();
    let mut shutting_down = false;
    let mut result = Ok(());

    spawn_signal_listener(event_tx.clone());
    manager.start_all().await?;
    let mut ticker = tokio::time::interval(TICK);

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::ServiceStarting { id } => {
                        if let Some(service) = services.get_mut(id) {
                            service.status = ServiceStatus::Starting;
                            let cmd = format_command(&service.spec);
                            output.tool(id, &format!("starting: {}", cmd));
                        }
                    }
                    Event::ServiceStarted { id, pid } => {
                        if let Some(service) = services.get_mut(id) {
                            service.pid = Some(pid);
                            service.started_at = Some(Instant::now());
                            let name = service.spec.name.clone();
                            if let Err(err) = update_runtime_state(&stack.runtime_state_path, &stack.name, |s| {
                                s.processes.insert(name, pid);
                            }) {
                                tracing::warn!("failed to record pid {}: {}", pid, err);
                            }
                        }
                    }
                    Event::ServiceReady { id } => {
                        let first = services
                            .get(id)
                            .is_some_and(|s| s.status == ServiceStatus::Starting);
                        if first {
                            services[id].status = ServiceStatus::Running;
                            output.tool(id, "ready");
                            if let Err(err) = manager.mark_ready(id).await {
                                output.tool(id, &format!("failed: {}", err));
                                services[id].status = ServiceStatus::Failed { error: err.to_string() };
                            }
                        }
                    }
                    Event::ServiceWaiting { id, deps } => {
                        output.tool(id, &format!("waiting for {}", deps.join(", ")));
                    }
                    Event::ServiceOutput { id, line, stream } => {
                        output.line(id, &line, stream);
                    }
                    Event::ServiceExited { id, code } => {
                        let message = match code {
                            Some(0) => "exited successfully".to_string(),
                            Some(code) => format!("exited with code {}", code),
                            None => "exited".to_string(),
                        };
                        output.tool(id, &message);
                        on_service_end(
                            id,
                            ServiceStatus::Exited { code },
                            &mut services,
                            stack,
                            &mut manager,
                            &mut restart_attempts,
                            &mut pending_restarts,
                            &mut shutting_down,
                            &mut result,
                            &event_tx,
                            &mut output,
                        )
                        .await;
                    }
                    Event::ServiceFailed { id, error } => {
                        output.tool(id, &format!("failed: {}", error));
                        on_service_end(
                            id,
                            ServiceStatus::Failed { error },
                            &mut services,
                            stack,
                            &mut manager,
                            &mut restart_attempts,
                            &mut pending_restarts,
                            &mut shutting_down,
                            &mut result,
                            &event_tx,
                            &mut output,
                        )
                        .await;
                    }
                    Event::ServiceSignal { id, signal } => {
                        output.tool(id, &format!("sent {}", signal.label()));
                    }
                    Event::Restart { id } => {
                        pending_restarts.remove(&id);
                        if !shutting_down {
                            if let Err(err) = manager.restart_service(id).await {
                                output.tool(id, &format!("restart failed: {}", err));
                            }
                        }
                    }
                    Event::Shutdown { signal } => {
                        if !shutting_down {
                            tracing::info!(
                                "received {}, stopping {} {:?}",
                                signal.label(),
                                stack.name,
                                manager.running_pids()
                            );
                            shutting_down = true;
                            manager.begin_shutdown_all().await;
                        }
                    }
                }
            }
            Some(event) = output_rx.recv() => {
                if let Event::ServiceOutput { id, line, stream } = event {
                    output.line(id, &line, stream);
                }
            }
            _ = ticker.tick() => {
                manager.poll_exits().await;
                output.flush();
            }
        }

        if shutting_down && !manager.has_running() {
            break;
        }
        if !shutting_down
            && pending_restarts.is_empty()
            && services.iter().all(|s| s.is_finished())
        {
            break;
        }
    }

    manager.shutdown_all().await;
    drop(manager);
    drain_output(&mut output_rx, &mut output).await;
    output.flush();
    result
}

/// Output still in flight from services that already exited.
async fn drain_output(output_rx: &mut mpsc::Receiver<Event>, output: &mut OutputState) {
    while let Ok(Some(event)) = tokio::time::timeout(DRAIN_WINDOW, output_rx.recv()).await {
        if let Event::ServiceOutput { id, line, stream } = event {
            output.line(id, &line, stream);
        }
    }
}

/// Bookkeeping after a service exits or fails: restart policy, runtime
/// state, and stopping the stack when the server goes away.
#[allow(clippy::too_many_arguments)]
async fn on_service_end(
    id: usize,
    status: ServiceStatus,
    services: &mut [ServiceState],
    stack: &StackPaths,
    manager: &mut ServiceManager,
    restart_attempts: &mut HashMap<usize, u32>,
    pending_restarts: &mut HashSet<usize>,
    shutting_down: &mut bool,
    result: &mut Result<()>,
    event_tx: &mpsc::UnboundedSender<Event>,
    output: &mut OutputState,
) {
    let Some(service) = services.get_mut(id) else {
        return;
    };
    if let ServiceStatus::Exited { code } = &status {
        service.exit_code = *code;
    }
    service.status = status;
    service.pid = None;
    let failed = service.failed();
    let name = service.spec.name.clone();
    let restart_on_fail = service.spec.restart_on_fail;
    let is_server = service.spec.role == Some(ServiceRole::Server);

    if let Err(err) = update_runtime_state(&stack.runtime_state_path, &stack.name, |s| {
        s.processes.remove(&name);
    }) {
        tracing::warn!("failed to update runtime state: {}", err);
    }
    if *shutting_down {
        return;
    }

    if failed && restart_on_fail {
        let attempt = restart_attempts.entry(id).and_modify(|a| *a += 1).or_insert(1);
        let delay = backoff_delay(*attempt);
        output.tool(
            id,
            &format!("restarting in {}s (attempt {})", delay.as_secs(), attempt),
        );
        pending_restarts.insert(id);
        let tx = event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Event::Restart { id });
        });
        return;
    }
    if !failed {
        restart_attempts.remove(&id);
    }

    if is_server {
        *shutting_down = true;
        if failed {
            *result = Err(anyhow!(StackError::Service(format!(
                "{} of stack \"{}\" stopped unexpectedly",
                name, stack.name
            ))));
        }
        manager.begin_shutdown_all().await;
    }
}

/// Deletes the runtime state once nothing recorded is alive and the server port is free.
fn finish_foreground(stack: &StackPaths, server_port: u16) {
    let Some(state) = read_runtime_state(&stack.runtime_state_path) else {
        return;
    };
    if state.owner_pid != Some(std::process::id()) {
        return;
    }
    let alive = state.alive_processes();
    if alive.is_empty() && is_port_free(server_port) {
        if let Err(err) = delete_runtime_state(&stack.runtime_state_path) {
            tracing::warn!("{}", err);
        }
    } else {
        tracing::warn!(
            "keeping runtime state of {}: processes {:?} still alive or port {} busy",
            stack.name,
            alive,
            server_port
        );
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ReadinessCheck;
    use crate::stack_env::{ENV_FILE_KEY, STACK_KEY};
    use std::collections::BTreeMap;
    use std::os::unix::process::CommandExt;
    use tempfile::tempdir;

    fn settings(root: &Path) -> Settings {
        let mut env = BTreeMap::new();
        env.insert(
            "HAPPIER_STACK_STORAGE_DIR".to_string(),
            root.join("stacks").display().to_string(),
        );
        env.insert(
            "HAPPIER_STACK_HOME_DIR".to_string(),
            root.join("home").display().to_string(),
        );
        env.insert(
            "HAPPIER_STACK_REPO_DIR".to_string(),
            root.display().to_string(),
        );
        Settings::from_env(env, root.to_path_buf())
    }

    fn make_stack(settings: &Settings, name: &str) -> StackPaths {
        let stack = StackPaths::new(&settings.storage_dir, name);
        std::fs::create_dir_all(&stack.base_dir).unwrap();
        std::fs::write(&stack.env_path, format!("HAPPIER_STACK_STACK={}\n", name)).unwrap();
        stack
    }

    fn has_program(program: &str, probe_arg: &str) -> bool {
        std::process::Command::new(program)
            .arg(probe_arg)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    fn busy_port() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn server_only(port: u16) -> StackPorts {
        StackPorts {
            server: Some(port),
            ..StackPorts::default()
        }
    }

    async fn pick(
        settings: &Settings,
        stack: &StackPaths,
        pinned: StackPorts,
        previous: Option<StackPorts>,
        restart: bool,
    ) -> Result<StackPorts> {
        let mut reserved = BTreeSet::new();
        choose_ports(
            settings,
            stack,
            pinned,
            previous,
            crate::ports::PortLayout::default(),
            restart,
            &mut reserved,
            Duration::from_millis(300),
        )
        .await
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn stop_sweeps_owned_detached_process() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "exp1");

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .env(STACK_KEY, "exp1")
            .env(ENV_FILE_KEY, stack.env_path.display().to_string())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let report = stop_stack(&stack, false, Duration::from_millis(500)).await.unwrap();
        let _ = reaper.join();
        assert!(report.swept_pids.contains(&pid));
        assert!(!report.runtime_state_deleted);
    }

    #[tokio::test]
    async fn stop_leaves_foreign_recorded_pid_alone() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "exp2");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let mut state = RuntimeState::new("exp2");
        state.processes.insert("server".to_string(), pid);
        record_start(&stack.runtime_state_path, state).unwrap();

        let report = stop_stack(&stack, false, Duration::from_millis(200)).await.unwrap();
        assert!(report.stopped_processes.is_empty());
        assert!(is_pid_alive(pid));
        assert!(report.runtime_state_deleted);
        let _ = child.kill();
        let _ = child.wait();
    }

    #[tokio::test]
    async fn foreground_run_records_and_cleans_up() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "fg");
        let config = Config {
            shutdown_grace_ms: Some(200),
            ready_timeout_ms: Some(2000),
            services: vec![ServiceConfig {
                name: "server".to_string(),
                cmd: "sh -c 'echo port=$PORT'".to_string(),
                cwd: None,
                env: Some(
                    [("PORT".to_string(), "${HAPPIER_STACK_SERVER_PORT}".to_string())]
                        .into_iter()
                        .collect(),
                ),
                depends_on: None,
                ready_check: Some(ReadinessCheck::Log("port=".to_string())),
                restart_on_fail: None,
                role: Some(ServiceRole::Server),
            }],
        };
        let args = StartArgs {
            name: "fg".to_string(),
            ..StartArgs::default()
        };
        run_foreground(&settings, &config, true, &stack, &args, None)
            .await
            .unwrap();

        assert!(read_runtime_state(&stack.runtime_state_path).is_none());
        let log = std::fs::read_to_string(stack.logs_dir.join("server.log")).unwrap();
        assert!(log
            .lines()
            .filter_map(|l| l.trim_end().rsplit("port=").next())
            .any(|p| p.parse::<u16>().is_ok()));
    }

    #[tokio::test]
    async fn failing_server_fails_the_run() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "bad");
        let config = Config {
            shutdown_grace_ms: Some(200),
            ready_timeout_ms: Some(2000),
            services: vec![ServiceConfig {
                name: "server".to_string(),
                cmd: "sh -c 'exit 4'".to_string(),
                cwd: None,
                env: None,
                depends_on: None,
                ready_check: None,
                restart_on_fail: None,
                role: Some(ServiceRole::Server),
            }],
        };
        let args = StartArgs {
            name: "bad".to_string(),
            ..StartArgs::default()
        };
        let err = run_foreground(&settings, &config, true, &stack, &args, None)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("stopped unexpectedly"));
    }

    #[tokio::test]
    async fn free_previous_ports_are_reused() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "again");
        let (listener, port) = busy_port();
        drop(listener);

        let ports = pick(&settings, &stack, StackPorts::default(), Some(server_only(port)), true)
            .await
            .unwrap();
        assert_eq!(ports, server_only(port));
    }

    #[tokio::test]
    async fn previous_ports_held_by_someone_else_fail() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "held");
        let (listener, port) = busy_port();

        let err = pick(&settings, &stack, StackPorts::default(), Some(server_only(port)), true)
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("still in use"));
        assert!(!is_port_free(port));
        drop(listener);
    }

    #[tokio::test]
    async fn busy_pinned_port_fails_without_restart() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "pinned");
        let (listener, port) = busy_port();

        let err = pick(&settings, &stack, server_only(port), None, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StackError>(),
            Some(StackError::PortBusy(p)) if *p == port
        ));
        drop(listener);
    }

    #[tokio::test]
    async fn pinned_restart_refuses_foreign_listener() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "pinned2");
        let (listener, port) = busy_port();

        let err = pick(&settings, &stack, server_only(port), None, true)
            .await
            .unwrap_err();
        match err.downcast_ref::<StackError>() {
            Some(StackError::ForeignListener { port: p, .. }) => assert_eq!(*p, port),
            // Without lsof no listener can be identified, so nothing is killed.
            Some(StackError::PortBusy(p)) => {
                assert!(!has_program("lsof", "-v"));
                assert_eq!(*p, port);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!is_port_free(port));
        drop(listener);
    }

    #[tokio::test]
    async fn pinned_restart_frees_owned_listener() {
        if !has_program("lsof", "-v") || !has_program("python3", "--version") {
            return;
        }
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "pinned3");
        let (listener, port) = busy_port();
        drop(listener);

        let script = format!(
            "import socket, time\n\
             s = socket.socket()\n\
             s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             s.bind(('127.0.0.1', {}))\n\
             s.listen()\n\
             time.sleep(30)\n",
            port
        );
        let mut child = std::process::Command::new("python3")
            .args(["-c", &script])
            .env(STACK_KEY, "pinned3")
            .env(ENV_FILE_KEY, stack.env_path.display().to_string())
            .spawn()
            .unwrap();
        let pid = child.id();
        let deadline = Instant::now() + Duration::from_secs(5);
        while is_port_free(port) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(!is_port_free(port));
        let reaper = std::thread::spawn(move || child.wait());

        let ports = pick(&settings, &stack, server_only(port), None, true).await.unwrap();
        assert_eq!(ports, server_only(port));
        let _ = reaper.join();
        assert!(!is_pid_alive(pid));
    }

    #[tokio::test]
    async fn stack_env_host_survives_without_bind_flag() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "hosts");
        std::fs::write(
            &stack.env_path,
            "HAPPIER_STACK_STACK=hosts\nHOST=0.0.0.0\nHAPPIER_STACK_EXPO_HOST=lan\n",
        )
        .unwrap();
        let config = Config {
            shutdown_grace_ms: Some(200),
            ready_timeout_ms: Some(2000),
            services: vec![ServiceConfig {
                name: "server".to_string(),
                cmd: "sh -c 'echo host=$HOST expo=$HAPPIER_STACK_EXPO_HOST'".to_string(),
                cwd: None,
                env: None,
                depends_on: None,
                ready_check: Some(ReadinessCheck::Log("host=".to_string())),
                restart_on_fail: None,
                role: Some(ServiceRole::Server),
            }],
        };
        let args = StartArgs {
            name: "hosts".to_string(),
            ..StartArgs::default()
        };
        run_foreground(&settings, &config, true, &stack, &args, None)
            .await
            .unwrap();
        let log = std::fs::read_to_string(stack.logs_dir.join("server.log")).unwrap();
        assert!(log.contains("host=0.0.0.0 expo=lan"), "log was: {}", log);

        let args = StartArgs {
            name: "hosts".to_string(),
            bind: Some(BindMode::Loopback),
            ..StartArgs::default()
        };
        run_foreground(&settings, &config, true, &stack, &args, None)
            .await
            .unwrap();
        let log = std::fs::read_to_string(stack.logs_dir.join("server.log")).unwrap();
        assert!(log.contains("host=127.0.0.1 expo=localhost"), "log was: {}", log);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chatty_server_with_dependent_finishes() {
        let dir = tempdir().unwrap();
        let settings = settings(dir.path());
        let stack = make_stack(&settings, "chatty");
        let config = Config {
            shutdown_grace_ms: Some(300),
            ready_timeout_ms: Some(5000),
            services: vec![
                ServiceConfig {
                    name: "server".to_string(),
                    cmd: "sh -c 'echo ready; yes line | head -n 200000; yes err | head -n 200000 1>&2; sleep 1'"
                        .to_string(),
                    cwd: None,
                    env: None,
                    depends_on: None,
                    ready_check: Some(ReadinessCheck::Log("ready".to_string())),
                    restart_on_fail: None,
                    role: Some(ServiceRole::Server),
                },
                ServiceConfig {
                    name: "worker".to_string(),
                    cmd: "sh -c 'echo worker up'".to_string(),
                    cwd: None,
                    env: None,
                    depends_on: Some(vec!["server".to_string()]),
                    ready_check: None,
                    restart_on_fail: None,
                    role: None,
                },
            ],
        };
        let args = StartArgs {
            name: "chatty".to_string(),
            ..StartArgs::default()
        };
        tokio::time::timeout(
            Duration::from_secs(60),
            run_foreground(&settings, &config, true, &stack, &args, None),
        )
        .await
        .expect("supervisor stalled")
        .unwrap();

        let worker = std::fs::read_to_string(stack.logs_dir.join("worker.log")).unwrap();
        assert!(worker.contains("worker up"));
        assert!(read_runtime_state(&stack.runtime_state_path).is_none());
    }
}
