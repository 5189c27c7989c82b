//! Service execution and process-tree termination.
//!
//! This module contains the `ServiceManager`, which spawns a stack's services
//! in dependency order, watches their readiness and output, and stops them.
//! Every service runs in its own process group so a stop reaches the whole
//! tree (yarn, node, watchers). Stopping sends SIGINT to the group, waits for
//! the grace period, then sends SIGKILL.
//!
//! [`kill_process_tree`] applies the same escalation to PIDs this process did
//! not spawn, such as a previous runner recorded in the runtime state.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::events::{Event, ProcessSignal};
use crate::health;
use crate::output::StreamKind;
use crate::process::{ReadyProbe, ServiceSpec};
use crate::runtime_state::is_pid_alive;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(300);
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Manages the lifecycle and I/O of a stack's services.
pub struct ServiceManager {
    services: Vec<ManagedService>,
    event_tx: mpsc::UnboundedSender<Event>,
    output_tx: mpsc::Sender<Event>,
    shutdown: ShutdownConfig,
}

struct ManagedService {
    spec: ServiceSpec,
    child: Option<tokio::process::Child>,
    started: bool,
    ready: bool,
    waiting_on: Vec<String>,
    shutdown_deadline: Option<tokio::time::Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    grace_ms: u64,
    ready_timeout_ms: u64,
}

impl ShutdownConfig {
    pub fn new(grace_ms: u64, ready_timeout_ms: u64) -> Self {
        Self {
            grace_ms,
            ready_timeout_ms,
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

impl ServiceManager {
    /// Creates a new `ServiceManager` with the given service specifications.
    ///
    /// Lifecycle events go to `event_tx`, which never blocks, so the receiver
    /// may await manager calls. Service output goes to the bounded `output_tx`.
    pub fn new(
        specs: Vec<ServiceSpec>,
        event_tx: mpsc::UnboundedSender<Event>,
        output_tx: mpsc::Sender<Event>,
        shutdown: ShutdownConfig,
    ) -> Self {
        let services = specs
            .into_iter()
            .map(|spec| ManagedService {
                spec,
                child: None,
                started: false,
                ready: false,
                waiting_on: Vec::new(),
                shutdown_deadline: None,
            })
            .collect();
        Self {
            services,
            event_tx,
            output_tx,
            shutdown,
        }
    }

    /// PIDs of services that are currently running.
    pub fn running_pids(&self) -> Vec<(String, u32)> {
        self.services
            .iter()
            .filter_map(|s| {
                let pid = s.child.as_ref().and_then(|c| c.id())?;
                Some((s.spec.name.clone(), pid))
            })
            .collect()
    }

    pub fn has_running(&self) -> bool {
        self.services.iter().any(|s| s.child.is_some())
    }

    /// Starts all configured services, respecting dependencies.
    pub async fn start_all(&mut self) -> Result<()> {
        self.update_scheduler().await
    }

    /// Checks dependencies and starts pending services.
    pub async fn update_scheduler(&mut self) -> Result<()> {
        let mut changed = true;
        while changed {
            changed = false;
            let states: Vec<(String, bool)> = self
                .services
                .iter()
                .map(|s| (s.spec.name.clone(), s.ready))
                .collect();

            for idx in 0..self.services.len() {
                if self.services[idx].started {
                    continue;
                }

                let missing: Vec<String> = self.services[idx]
                    .spec
                    .depends_on
                    .iter()
                    .filter(|dep| !states.iter().any(|(name, ready)| name == *dep && *ready))
                    .cloned()
                    .collect();

                if missing.is_empty() {
                    self.start_service(idx).await?;
                    changed = true;
                } else if self.services[idx].waiting_on != missing {
                    self.services[idx].waiting_on = missing.clone();
                    let _ = self.event_tx.send(Event::ServiceWaiting {
                        id: idx,
                        deps: missing,
                    });
                }
            }
        }
        Ok(())
    }

    /// Marks a service as ready and starts whatever was waiting on it.
    pub async fn mark_ready(&mut self, id: usize) -> Result<()> {
        if let Some(service) = self.services.get_mut(id) {
            service.ready = true;
        }
        self.update_scheduler().await
    }

    /// Spawns a service in its own process group and wires up output and readiness.
    pub async fn start_service(&mut self, id: usize) -> Result<()> {
        let Some(spec) = self.services.get(id).map(|s| s.spec.clone()) else {
            return Ok(());
        };

        self.services[id].started = true;
        self.services[id].waiting_on.clear();
        let _ = self.event_tx.send(Event::ServiceStarting { id });

        let mut command = Command::new(&spec.cmd);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command.env_clear().envs(&spec.env);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = self.event_tx.send(Event::ServiceFailed {
                    id,
                    error: format!("failed to spawn {}: {}", spec.cmd, err),
                });
                return Ok(());
            }
        };
        let pid = child.id().unwrap_or(0);
        let _ = self.event_tx.send(Event::ServiceStarted { id, pid });

        let log_ready_regex = match &spec.ready_check {
            Some(ReadyProbe::Log(pattern)) => Some(
                Regex::new(pattern)
                    .with_context(|| format!("invalid log ready_check for {}", spec.name))?,
            ),
            _ => None,
        };

        if let Some(stdout) = child.stdout.take() {
            let tx = self.event_tx.clone();
            let out = self.output_tx.clone();
            let regex = log_ready_regex.clone();
            tokio::spawn(read_stream(id, StreamKind::Stdout, stdout, tx, out, regex));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = self.event_tx.clone();
            let out = self.output_tx.clone();
            tokio::spawn(read_stream(id, StreamKind::Stderr, stderr, tx, out, log_ready_regex));
        }

        if let Some(service) = self.services.get_mut(id) {
            service.child = Some(child);
        }

        let timeout = self.shutdown.ready_timeout();
        match &spec.ready_check {
            Some(ReadyProbe::Tcp(port)) => {
                let tx = self.event_tx.clone();
                let port = *port;
                let name = spec.name.clone();
                tokio::spawn(async move {
                    if health::wait_for_tcp(port, timeout, READY_POLL_INTERVAL).await {
                        let _ = tx.send(Event::ServiceReady { id });
                    } else {
                        tracing::warn!("{} did not open port {} in time", name, port);
                    }
                });
            }
            Some(ReadyProbe::Http(url)) => {
                let tx = self.event_tx.clone();
                let url = url.clone();
                let name = spec.name.clone();
                tokio::spawn(async move {
                    if health::wait_for_http_ok(&url, timeout, READY_POLL_INTERVAL).await {
                        let _ = tx.send(Event::ServiceReady { id });
                    } else {
                        tracing::warn!("{} did not answer {} in time", name, url);
                    }
                });
            }
            Some(ReadyProbe::Delay(ms)) => {
                let tx = self.event_tx.clone();
                let ms = *ms;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    let _ = tx.send(Event::ServiceReady { id });
                });
            }
            Some(ReadyProbe::Log(_)) => {
                // Handled in read_stream
            }
            None => {
                let _ = self.event_tx.send(Event::ServiceReady { id });
            }
        }

        Ok(())
    }

    /// Stops a service, then starts it again without waiting on dependencies.
    pub async fn restart_service(&mut self, id: usize) -> Result<()> {
        self.stop_service(id).await;
        if let Some(service) = self.services.get_mut(id) {
            service.started = false;
            service.ready = false;
        }
        self.start_service(id).await
    }

    /// Sends the first shutdown signal to every running service.
    pub async fn begin_shutdown_all(&mut self) {
        let deadline = tokio::time::Instant::now() + self.shutdown.grace();
        for id in 0..self.services.len() {
            let pid = {
                let service = &mut self.services[id];
                if service.child.is_none() || service.shutdown_deadline.is_some() {
                    continue;
                }
                service.shutdown_deadline = Some(deadline);
                service.child.as_ref().and_then(|c| c.id())
            };
            if let Some(pid) = pid {
                self.send_signal(id, pid, ProcessSignal::SigInt);
            }
        }
    }

    /// Stops every service and waits for each to exit.
    pub async fn shutdown_all(&mut self) {
        for id in 0..self.services.len() {
            self.stop_service(id).await;
        }
    }

    /// Reaps exited services and escalates overdue shutdowns.
    pub async fn poll_exits(&mut self) {
        for (id, service) in self.services.iter_mut().enumerate() {
            let Some(child) = service.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = self.event_tx.send(Event::ServiceExited {
                        id,
                        code: status.code(),
                    });
                    service.child = None;
                    service.ready = false;
                    service.shutdown_deadline = None;
                }
                Ok(None) => {}
                Err(err) => {
                    let _ = self.event_tx.send(Event::ServiceFailed {
                        id,
                        error: err.to_string(),
                    });
                    service.child = None;
                    service.ready = false;
                    service.shutdown_deadline = None;
                }
            }
        }
        self.poll_shutdowns().await;
    }

    async fn poll_shutdowns(&mut self) {
        let now = tokio::time::Instant::now();
        for id in 0..self.services.len() {
            let overdue = match (&self.services[id].child, self.services[id].shutdown_deadline) {
                (Some(_), Some(deadline)) => now >= deadline,
                _ => false,
            };
            if !overdue {
                continue;
            }
            let pid = self.services[id].child.as_ref().and_then(|c| c.id());
            if let Some(pid) = pid {
                self.send_signal(id, pid, ProcessSignal::SigKill);
            }
            self.services[id].shutdown_deadline = None;
        }
    }

    async fn stop_service(&mut self, id: usize) {
        let Some(mut child) = self.services.get_mut(id).and_then(|s| {
            s.ready = false;
            s.shutdown_deadline = None;
            s.child.take()
        }) else {
            return;
        };

        if let Some(pid) = child.id() {
            self.send_signal(id, pid, ProcessSignal::SigInt);
        }
        let status = match wait_for_exit(&mut child, self.shutdown.grace()).await {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                if let Some(pid) = child.id() {
                    self.send_signal(id, pid, ProcessSignal::SigKill);
                }
                let _ = child.kill().await;
                child.wait().await.map_err(anyhow::Error::from)
            }
            Err(err) => Err(err),
        };
        let event = match status {
            Ok(status) => Event::ServiceExited {
                id,
                code: status.code(),
            },
            Err(err) => Event::ServiceFailed {
                id,
                error: err.to_string(),
            },
        };
        let _ = self.event_tx.send(event);
    }

    fn send_signal(&self, id: usize, pid: u32, signal: ProcessSignal) {
        let _ = self.event_tx.send(Event::ServiceSignal { id, signal });
        signal_group(pid, signal, true);
    }
}

/// Sends `signal` to `pid`, and to its process group when `group` is set and
/// `pid` leads that group.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: ProcessSignal, group: bool) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 1 {
        return;
    }
    let sig = signal.as_raw();
    unsafe {
        if group && libc::getpgid(pid) == pid {
            let _ = libc::kill(-pid, sig);
        }
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: ProcessSignal, _group: bool) {}

/// SIGINT, wait up to `grace`, then SIGKILL, for a PID this process may not
/// have spawned. Returns true once the process is gone.
pub async fn kill_process_tree(pid: u32, grace: Duration) -> bool {
    if !is_pid_alive(pid) {
        return true;
    }
    tracing::debug!("sending SIGINT to process tree {}", pid);
    signal_group(pid, ProcessSignal::SigInt, true);
    if wait_until_dead(pid, grace).await {
        return true;
    }
    tracing::debug!("process {} survived SIGINT; sending SIGKILL", pid);
    signal_group(pid, ProcessSignal::SigKill, true);
    wait_until_dead(pid, Duration::from_millis(500)).await
}

async fn wait_until_dead(pid: u32, timeout: Duration) -> bool {
    let end = tokio::time::Instant::now() + timeout;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= end {
            return false;
        }
        tokio::time::sleep(LIVENESS_POLL_INTERVAL).await;
    }
}

async fn wait_for_exit(
    child: &mut tokio::process::Child,
    timeout: Duration,
) -> Result<Option<std::process::ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Ok(None),
    }
}

async fn read_stream<R>(
    id: usize,
    stream: StreamKind,
    reader: R,
    tx: mpsc::UnboundedSender<Event>,
    output_tx: mpsc::Sender<Event>,
    readiness_regex: Option<Regex>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut matched = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if !matched {
            if let Some(regex) = &readiness_regex {
                if regex.is_match(&line) {
                    let _ = tx.send(Event::ServiceReady { id });
                    matched = true;
                }
            }
        }
        if output_tx
            .send(Event::ServiceOutput { id, line, stream })
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::process::CommandExt;

    fn sh(name: &str, script: &str, depends_on: &[&str], ready: Option<ReadyProbe>) -> ServiceSpec {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        ServiceSpec {
            name: name.to_string(),
            cmd: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: None,
            env,
            restart_on_fail: false,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            ready_check: ready,
            role: None,
        }
    }

    /// Control events plus forwarded output on one receiver.
    fn event_channels() -> (
        mpsc::UnboundedSender<Event>,
        mpsc::Sender<Event>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let forward = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let _ = forward.send(event);
            }
        });
        (tx, out_tx, rx)
    }

    async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<Event>, mut pred: F) -> Event
    where
        F: FnMut(&Event) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn dependents_wait_for_log_readiness() {
        let (tx, out, mut rx) = event_channels();
        let specs = vec![
            sh(
                "server",
                "echo booting; echo listening; sleep 5",
                &[],
                Some(ReadyProbe::Log("listening".to_string())),
            ),
            sh("client", "echo hi; sleep 5", &["server"], None),
        ];
        let mut manager = ServiceManager::new(specs, tx, out, ShutdownConfig::new(500, 2000));
        manager.start_all().await.unwrap();

        next_matching(&mut rx, |e| matches!(e, Event::ServiceWaiting { id: 1, .. })).await;
        next_matching(&mut rx, |e| matches!(e, Event::ServiceReady { id: 0 })).await;
        manager.mark_ready(0).await.unwrap();
        next_matching(&mut rx, |e| matches!(e, Event::ServiceStarted { id: 1, .. })).await;
        assert_eq!(manager.running_pids().len(), 2);

        manager.shutdown_all().await;
        assert!(!manager.has_running());
    }

    #[tokio::test]
    async fn sigint_ignoring_service_is_killed_after_grace() {
        let (tx, out, mut rx) = event_channels();
        let specs = vec![sh("stubborn", "trap '' INT; echo up; sleep 30", &[], None)];
        let mut manager = ServiceManager::new(specs, tx, out, ShutdownConfig::new(300, 2000));
        manager.start_all().await.unwrap();
        next_matching(&mut rx, |e| matches!(e, Event::ServiceOutput { .. })).await;

        let started = std::time::Instant::now();
        manager.shutdown_all().await;
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!manager.has_running());
        next_matching(&mut rx, |e| {
            matches!(
                e,
                Event::ServiceSignal {
                    signal: ProcessSignal::SigKill,
                    ..
                }
            )
        })
        .await;
    }

    #[tokio::test]
    async fn exits_are_reported_by_polling() {
        let (tx, out, mut rx) = event_channels();
        let specs = vec![sh("quick", "exit 3", &[], None)];
        let mut manager = ServiceManager::new(specs, tx, out, ShutdownConfig::new(300, 2000));
        manager.start_all().await.unwrap();
        let mut code = None;
        for _ in 0..50 {
            manager.poll_exits().await;
            while let Ok(event) = rx.try_recv() {
                if let Event::ServiceExited { code: c, .. } = event {
                    code = c;
                }
            }
            if code.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(code, Some(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manager_calls_do_not_wait_on_unread_output() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::channel(1);
        let specs = vec![
            sh("server", "yes line | head -n 5000; sleep 5", &[], None),
            sh("worker", "sleep 5", &["server"], None),
        ];
        let mut manager = ServiceManager::new(specs, tx, out_tx, ShutdownConfig::new(300, 2000));
        manager.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(5), manager.mark_ready(0))
            .await
            .expect("mark_ready blocked on output")
            .unwrap();
        next_matching(&mut rx, |e| matches!(e, Event::ServiceStarted { id: 1, .. })).await;
        tokio::time::timeout(Duration::from_secs(5), manager.shutdown_all())
            .await
            .expect("shutdown blocked on output");
    }

    #[tokio::test]
    async fn kill_process_tree_stops_detached_group() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());
        assert!(kill_process_tree(pid, Duration::from_millis(500)).await);
        let _ = reaper.join();
    }
}
