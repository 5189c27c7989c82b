//! Autostart through launchd (macOS) or systemd user units (Linux).
//!
//! The installed unit stores only the stack pointer (`HAPPIER_STACK_STACK` and
//! `HAPPIER_STACK_ENV_FILE`), so later edits to the stack env take effect on
//! the next start without reinstalling.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::error::StackError;
use crate::paths::{AutostartPaths, StackPaths};
use crate::settings::Settings;
use crate::stack_env::{ENV_FILE_KEY, STACK_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Launchd,
    Systemd,
}

impl Platform {
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Platform::Launchd)
        } else if cfg!(target_os = "linux") {
            Some(Platform::Systemd)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Platform::Launchd => "launchd",
            Platform::Systemd => "systemd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::Subcommand)]
pub enum ServiceAction {
    /// Install and enable the autostart unit
    Install,
    /// Disable and remove the autostart unit
    Uninstall,
    /// Show unit path and manager status
    Status,
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    fn mutates(self) -> bool {
        !matches!(self, ServiceAction::Status)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub ok: bool,
    pub action: String,
    pub stack_name: String,
    pub platform: String,
    pub label: String,
    pub unit_path: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Environment baked into the unit.
fn unit_env(stack: &StackPaths) -> Vec<(&'static str, String)> {
    vec![
        (ENV_FILE_KEY, stack.env_path.display().to_string()),
        (STACK_KEY, stack.name.clone()),
    ]
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// LaunchAgent plist running `<exe> stack start <name>`.
pub fn render_plist(exe: &Path, stack: &StackPaths, autostart: &AutostartPaths, path_env: &str) -> String {
    let mut env_entries = String::new();
    for (key, value) in unit_env(stack) {
        env_entries.push_str(&format!(
            "      <key>{}</key>\n      <string>{}</string>\n",
            key,
            xml_escape(&value)
        ));
    }
    env_entries.push_str(&format!(
        "      <key>PATH</key>\n      <string>{}</string>\n",
        xml_escape(path_env)
    ));
    let args: String = [
        exe.display().to_string(),
        "stack".to_string(),
        "start".to_string(),
        stack.name.clone(),
    ]
    .iter()
    .map(|a| format!("      <string>{}</string>\n", xml_escape(a)))
    .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
  <dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{args}    </array>
    <key>EnvironmentVariables</key>
    <dict>
{env_entries}    </dict>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{stdout}</string>
    <key>StandardErrorPath</key>
    <string>{stderr}</string>
  </dict>
</plist>
"#,
        label = xml_escape(&autostart.label),
        args = args,
        env_entries = env_entries,
        stdout = xml_escape(&autostart.stdout_log.display().to_string()),
        stderr = xml_escape(&autostart.stderr_log.display().to_string()),
    )
}

/// systemd user unit running `<exe> stack start <name>`.
pub fn render_systemd_unit(exe: &Path, stack: &StackPaths, autostart: &AutostartPaths) -> String {
    let env_lines: String = unit_env(stack)
        .into_iter()
        .map(|(k, v)| format!("Environment={}={}\n", k, v))
        .collect();
    let exec = shell_words::join([
        exe.display().to_string(),
        "stack".to_string(),
        "start".to_string(),
        stack.name.clone(),
    ]);
    format!(
        "[Unit]\n\
         Description=Happier Stack ({label})\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         WorkingDirectory=%h\n\
         {env_lines}\
         ExecStart={exec}\n\
         Restart=always\n\
         RestartSec=2\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        label = autostart.label,
        env_lines = env_lines,
        exec = exec,
    )
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    tracing::debug!("running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {}", program))?;
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        bail!(StackError::Service(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            text.trim()
        )));
    }
    Ok(text)
}

/// Like `run`, for calls whose failure is expected (unit already stopped, etc).
fn run_quiet(program: &str, args: &[&str]) -> Option<String> {
    match run(program, args) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::debug!("{:#}", err);
            None
        }
    }
}

#[cfg(unix)]
fn gui_domain() -> String {
    format!("gui/{}", unsafe { libc::getuid() })
}

#[cfg(not(unix))]
fn gui_domain() -> String {
    "gui/0".to_string()
}

/// Runs one autostart action for `stack`.
pub fn run_service_action(settings: &Settings, stack: &StackPaths, action: ServiceAction) -> Result<ServiceReport> {
    let Some(platform) = Platform::current() else {
        bail!(StackError::Service(
            "autostart is only supported on macOS (launchd) and Linux (systemd --user)".to_string()
        ));
    };
    if action.mutates() && !settings.allows_global_side_effects() {
        bail!(StackError::Service(
            "autostart is disabled in sandbox mode (set HAPPIER_STACK_SANDBOX_ALLOW_GLOBAL=1)".to_string()
        ));
    }
    if action == ServiceAction::Install && !stack.exists() {
        bail!(StackError::StackMissing {
            name: stack.name.clone(),
            env_path: stack.env_path.clone(),
        });
    }

    let autostart = AutostartPaths::new(&settings.user_home, stack);
    let unit_path = match platform {
        Platform::Launchd => autostart.plist_path.clone(),
        Platform::Systemd => autostart.systemd_unit_path.clone(),
    };
    let mut detail = None;

    match (platform, action) {
        (_, ServiceAction::Install) => {
            let exe = std::env::current_exe().context("failed to locate the hstack executable")?;
            fs::create_dir_all(&stack.logs_dir)
                .with_context(|| format!("failed to create {}", stack.logs_dir.display()))?;
            let body = match platform {
                Platform::Launchd => {
                    render_plist(&exe, stack, &autostart, settings.var("PATH").unwrap_or("/usr/bin:/bin"))
                }
                Platform::Systemd => render_systemd_unit(&exe, stack, &autostart),
            };
            crate::dotenv::write_atomic(&unit_path, body.as_bytes(), None)?;
            match platform {
                Platform::Launchd => {
                    let domain = gui_domain();
                    let target = format!("{}/{}", domain, autostart.label);
                    run_quiet("launchctl", &["bootout", &target]);
                    run("launchctl", &["bootstrap", &domain, &unit_path.display().to_string()])?;
                    run_quiet("launchctl", &["enable", &target]);
                    run_quiet("launchctl", &["kickstart", "-k", &target]);
                }
                Platform::Systemd => {
                    run_quiet("systemctl", &["--user", "daemon-reload"]);
                    run("systemctl", &["--user", "enable", "--now", &autostart.systemd_unit_name])?;
                }
            }
            tracing::info!("installed autostart unit {}", unit_path.display());
        }
        (Platform::Launchd, ServiceAction::Uninstall) => {
            run_quiet("launchctl", &["bootout", &format!("{}/{}", gui_domain(), autostart.label)]);
            remove_if_present(&unit_path)?;
        }
        (Platform::Systemd, ServiceAction::Uninstall) => {
            run_quiet("systemctl", &["--user", "disable", "--now", &autostart.systemd_unit_name]);
            remove_if_present(&unit_path)?;
            run_quiet("systemctl", &["--user", "daemon-reload"]);
        }
        (Platform::Launchd, ServiceAction::Status) => {
            detail = run_quiet("launchctl", &["list"]).map(|list| {
                list.lines()
                    .find(|line| line.split_whitespace().last() == Some(autostart.label.as_str()))
                    .unwrap_or("(not listed)")
                    .to_string()
            });
        }
        (Platform::Systemd, ServiceAction::Status) => {
            // `status` exits non-zero for inactive units; the text is still useful.
            detail = Command::new("systemctl")
                .args(["--user", "status", &autostart.systemd_unit_name, "--no-pager"])
                .output()
                .ok()
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());
        }
        (Platform::Launchd, ServiceAction::Start) | (Platform::Launchd, ServiceAction::Restart) => {
            require_installed(&unit_path)?;
            let domain = gui_domain();
            let target = format!("{}/{}", domain, autostart.label);
            if run_quiet("launchctl", &["kickstart", "-k", &target]).is_none() {
                run("launchctl", &["bootstrap", &domain, &unit_path.display().to_string()])?;
                run_quiet("launchctl", &["kickstart", "-k", &target]);
            }
        }
        (Platform::Launchd, ServiceAction::Stop) => {
            require_installed(&unit_path)?;
            run_quiet("launchctl", &["bootout", &format!("{}/{}", gui_domain(), autostart.label)]);
        }
        (Platform::Systemd, ServiceAction::Start) => {
            run("systemctl", &["--user", "start", &autostart.systemd_unit_name])?;
        }
        (Platform::Systemd, ServiceAction::Stop) => {
            run("systemctl", &["--user", "stop", &autostart.systemd_unit_name])?;
        }
        (Platform::Systemd, ServiceAction::Restart) => {
            run("systemctl", &["--user", "restart", &autostart.systemd_unit_name])?;
        }
    }

    Ok(ServiceReport {
        ok: true,
        action: format!("{:?}", action).to_ascii_lowercase(),
        stack_name: stack.name.clone(),
        platform: platform.label().to_string(),
        label: autostart.label,
        installed: unit_path.is_file(),
        unit_path: unit_path.display().to_string(),
        detail,
    })
}

fn require_installed(unit_path: &Path) -> Result<()> {
    if unit_path.is_file() {
        Ok(())
    } else {
        bail!(StackError::Service(format!(
            "unit not found at {}; run: hstack service install",
            unit_path.display()
        )))
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StackError::FileWrite(path.to_path_buf(), err).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn fixture(name: &str) -> (StackPaths, AutostartPaths) {
        let stack = StackPaths::new(Path::new("/home/u/.happier/stacks"), name);
        let autostart = AutostartPaths::new(Path::new("/home/u"), &stack);
        (stack, autostart)
    }

    #[test]
    fn systemd_unit_carries_stack_pointer() {
        let (stack, autostart) = fixture("dev");
        let unit = render_systemd_unit(Path::new("/usr/local/bin/hstack"), &stack, &autostart);
        assert!(unit.contains("Description=Happier Stack (dev.happier.stack.dev)\n"));
        assert!(unit.contains("Environment=HAPPIER_STACK_ENV_FILE=/home/u/.happier/stacks/dev/env\n"));
        assert!(unit.contains("Environment=HAPPIER_STACK_STACK=dev\n"));
        assert!(unit.contains("ExecStart=/usr/local/bin/hstack stack start dev\n"));
        assert!(unit.contains("Restart=always\nRestartSec=2\n"));
        assert!(unit.ends_with("WantedBy=default.target\n"));
        assert_eq!(
            autostart.systemd_unit_path,
            PathBuf::from("/home/u/.config/systemd/user/dev.happier.stack.dev.service")
        );
    }

    #[test]
    fn plist_for_main_uses_base_label() {
        let (stack, autostart) = fixture("main");
        let plist = render_plist(Path::new("/opt/hstack"), &stack, &autostart, "/usr/bin:/bin");
        assert!(plist.contains("<string>dev.happier.stack</string>"));
        assert!(plist.contains("<string>/opt/hstack</string>\n      <string>stack</string>\n      <string>start</string>\n      <string>main</string>"));
        assert!(plist.contains("<key>HAPPIER_STACK_STACK</key>\n      <string>main</string>"));
        assert!(plist.contains("/home/u/.happier/stacks/main/logs/happier-stack.err.log"));
    }

    #[test]
    fn sandbox_refuses_install() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert(
            "HAPPIER_STACK_SANDBOX_DIR".to_string(),
            dir.path().display().to_string(),
        );
        env.insert(
            "HAPPIER_STACK_HOME_DIR".to_string(),
            dir.path().join("home").display().to_string(),
        );
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        let stack = StackPaths::new(dir.path(), "dev");
        if Platform::current().is_some() {
            let err = run_service_action(&settings, &stack, ServiceAction::Install).unwrap_err();
            assert!(format!("{:#}", err).contains("sandbox"));
        }
    }
}
