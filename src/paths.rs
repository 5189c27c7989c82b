//! Filesystem layout of a stack.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::StackError;

pub const MAIN_STACK: &str = "main";
pub const ENV_FILE_NAME: &str = "env";
pub const RUNTIME_STATE_FILE_NAME: &str = "stack.runtime.json";
const ARCHIVE_DIR_NAME: &str = ".archived";

/// Locations owned by one stack under the storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPaths {
    pub name: String,
    pub base_dir: PathBuf,
    pub env_path: PathBuf,
    pub runtime_state_path: PathBuf,
    pub logs_dir: PathBuf,
    pub cli_home_dir: PathBuf,
    pub ui_build_dir: PathBuf,
    pub server_light_data_dir: PathBuf,
}

impl StackPaths {
    pub fn new(storage_dir: &Path, name: &str) -> Self {
        let base_dir = storage_dir.join(name);
        Self {
            name: name.to_string(),
            env_path: base_dir.join(ENV_FILE_NAME),
            runtime_state_path: base_dir.join(RUNTIME_STATE_FILE_NAME),
            logs_dir: base_dir.join("logs"),
            cli_home_dir: base_dir.join("cli"),
            ui_build_dir: base_dir.join("ui"),
            server_light_data_dir: base_dir.join("server-light"),
            base_dir,
        }
    }

    pub fn exists(&self) -> bool {
        self.env_path.is_file()
    }
}

/// Stack names become directory names, launchd labels and systemd unit names.
pub fn validate_stack_name(name: &str) -> Result<(), StackError> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if first_ok && rest_ok && name.len() <= 64 {
        Ok(())
    } else {
        Err(StackError::InvalidName(name.to_string()))
    }
}

/// Lists stack names: `main` first, then every storage dir holding an env file.
pub fn list_stack_names(storage_dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(storage_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(ENV_FILE_NAME).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.') && name != MAIN_STACK)
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names.insert(0, MAIN_STACK.to_string());
    names
}

/// Destination for an archived stack directory.
pub fn archive_dir(storage_dir: &Path, date: &str, name: &str) -> PathBuf {
    storage_dir.join(ARCHIVE_DIR_NAME).join(date).join(name)
}

/// launchd / systemd label for a stack.
pub fn stack_label(name: &str) -> String {
    if name == MAIN_STACK {
        "dev.happier.stack".to_string()
    } else {
        format!("dev.happier.stack.{}", name)
    }
}

/// Files an autostart installation writes or reads.
#[derive(Debug, Clone)]
pub struct AutostartPaths {
    pub label: String,
    pub plist_path: PathBuf,
    pub systemd_unit_name: String,
    pub systemd_unit_path: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl AutostartPaths {
    pub fn new(user_home: &Path, stack: &StackPaths) -> Self {
        let label = stack_label(&stack.name);
        let systemd_unit_name = format!("{}.service", label);
        Self {
            plist_path: user_home
                .join("Library")
                .join("LaunchAgents")
                .join(format!("{}.plist", label)),
            systemd_unit_path: user_home
                .join(".config")
                .join("systemd")
                .join("user")
                .join(&systemd_unit_name),
            systemd_unit_name,
            stdout_log: stack.logs_dir.join("happier-stack.out.log"),
            stderr_log: stack.logs_dir.join("happier-stack.err.log"),
            label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stack_layout() {
        let paths = StackPaths::new(Path::new("/s"), "dev");
        assert_eq!(paths.env_path, PathBuf::from("/s/dev/env"));
        assert_eq!(
            paths.runtime_state_path,
            PathBuf::from("/s/dev/stack.runtime.json")
        );
        assert_eq!(paths.cli_home_dir, PathBuf::from("/s/dev/cli"));
    }

    #[test]
    fn names_are_validated() {
        assert!(validate_stack_name("dev-2").is_ok());
        assert!(validate_stack_name("pr_42").is_ok());
        assert!(validate_stack_name("").is_err());
        assert!(validate_stack_name("-x").is_err());
        assert!(validate_stack_name("a/b").is_err());
        assert!(validate_stack_name("..").is_err());
    }

    #[test]
    fn labels() {
        assert_eq!(stack_label("main"), "dev.happier.stack");
        assert_eq!(stack_label("dev"), "dev.happier.stack.dev");
    }

    #[test]
    fn list_includes_main_and_stacks_with_env() {
        let dir = tempdir().unwrap();
        for name in ["zeta", "alpha"] {
            fs::create_dir_all(dir.path().join(name)).unwrap();
            fs::write(dir.path().join(name).join("env"), "").unwrap();
        }
        fs::create_dir_all(dir.path().join("no-env")).unwrap();
        fs::create_dir_all(dir.path().join(".archived").join("x")).unwrap();
        assert_eq!(list_stack_names(dir.path()), vec!["main", "alpha", "zeta"]);
    }
}
