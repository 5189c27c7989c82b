//! Seeding a stack's credentials from another stack.
//!
//! A stack is authenticated once its CLI home holds `access.key`. New stacks
//! and daemon starts can copy (or symlink) that file, `settings.json` and the
//! server master secret from a seed stack so no new login is needed. Existing
//! files are never overwritten.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::dotenv::{self, write_atomic};
use crate::error::{Result, StackError};
use crate::paths::{StackPaths, MAIN_STACK};
use crate::settings::{is_truthy, Settings};

pub const ACCESS_KEY_FILE: &str = "access.key";
pub const SETTINGS_FILE: &str = "settings.json";
pub const MASTER_SECRET_FILE: &str = "handy-master-secret.txt";

pub const CLI_HOME_KEY: &str = "HAPPIER_STACK_CLI_HOME_DIR";
pub const MASTER_SECRET_FILE_KEY: &str = "HAPPIER_STACK_HANDY_MASTER_SECRET_FILE";
pub const LIGHT_DATA_DIR_KEY: &str = "HAPPY_SERVER_LIGHT_DATA_DIR";

const SECRET_MODE: u32 = 0o600;

/// What a copy-from run actually wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCopy {
    pub source_stack: String,
    pub secret: bool,
    pub access_key: bool,
    pub settings: bool,
}

impl AuthCopy {
    pub fn any(&self) -> bool {
        self.secret || self.access_key || self.settings
    }
}

/// Copies `from` to `to` with mode 0600 unless `to` exists or `from` is missing.
pub fn copy_file_if_missing(from: &Path, to: &Path) -> Result<bool> {
    if to.exists() {
        return Ok(false);
    }
    let data = match fs::read(from) {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StackError::FileRead(from.to_path_buf(), err)),
    };
    write_atomic(to, &data, Some(SECRET_MODE))?;
    Ok(true)
}

/// Symlinks `to` -> `from` unless `to` exists or `from` is missing.
pub fn link_file_if_missing(from: &Path, to: &Path) -> Result<bool> {
    if to.symlink_metadata().is_ok() || !from.exists() {
        return Ok(false);
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| StackError::FileWrite(parent.to_path_buf(), err))?;
    }
    symlink(from, to).map_err(|err| StackError::FileWrite(to.to_path_buf(), err))?;
    Ok(true)
}

#[cfg(unix)]
fn symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(from, to)
}

#[cfg(not(unix))]
fn symlink(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::copy(from, to).map(|_| ())
}

/// The seed stack named by `HAPPIER_STACK_AUTH_SEED_FROM`, defaulting to main.
pub fn seed_source(settings: &Settings) -> String {
    settings
        .var("HAPPIER_STACK_AUTH_SEED_FROM")
        .unwrap_or(MAIN_STACK)
        .to_string()
}

/// Link instead of copy when `HAPPIER_STACK_AUTH_LINK=1` or `HAPPIER_STACK_AUTH_MODE=link`.
pub fn link_mode_from_env(settings: &Settings) -> bool {
    settings.var("HAPPIER_STACK_AUTH_LINK").map(is_truthy).unwrap_or(false)
        || settings.var("HAPPIER_STACK_AUTH_MODE") == Some("link")
}

/// Whether a daemon start may seed credentials automatically.
pub fn auto_seed_enabled(settings: &Settings, stack: &str, interactive: bool) -> bool {
    if !settings.allows_global_side_effects() {
        return false;
    }
    if let Some(raw) = settings.var("HAPPIER_STACK_AUTO_AUTH_SEED") {
        return raw != "0";
    }
    if stack == MAIN_STACK {
        return false;
    }
    if !interactive {
        return true;
    }
    matches!(settings.var("HAPPIER_STACK_AUTH_SEED_FROM"), Some(seed) if seed != MAIN_STACK)
}

/// True when the CLI home has no credentials yet.
pub fn needs_seed(cli_home: &Path) -> bool {
    !cli_home.join(ACCESS_KEY_FILE).exists()
}

/// CLI home of a stack, honoring an override in its env file.
pub fn cli_home_for(stack: &StackPaths, stack_env: &BTreeMap<String, String>) -> PathBuf {
    stack_env
        .get(CLI_HOME_KEY)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| stack.cli_home_dir.clone())
}

/// Where a stack's server master secret lives.
fn master_secret_path(
    stack: &StackPaths,
    stack_env: &BTreeMap<String, String>,
) -> PathBuf {
    if let Some(file) = stack_env.get(MASTER_SECRET_FILE_KEY).filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(file.trim());
    }
    let data_dir = stack_env
        .get(LIGHT_DATA_DIR_KEY)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| stack.server_light_data_dir.clone());
    data_dir.join(MASTER_SECRET_FILE)
}

/// Copies (or links) credentials from `source` into `target`.
///
/// `target_env` is the target stack's env file contents; it decides where the
/// master secret goes. With `require_source` a missing source stack is an error.
pub fn copy_auth_from_stack(
    settings: &Settings,
    source: &str,
    target: &StackPaths,
    target_env: &BTreeMap<String, String>,
    link: bool,
    require_source: bool,
) -> Result<AuthCopy> {
    let source_paths = StackPaths::new(&settings.storage_dir, source);
    if !source_paths.exists() {
        if require_source {
            return Err(StackError::Auth(format!(
                "cannot copy auth: source stack \"{}\" does not exist",
                source
            )));
        }
        tracing::debug!("seed stack {} has no env file", source);
    }
    if source_paths.name == target.name {
        return Err(StackError::Auth("source and target stack are the same".to_string()));
    }
    let source_env = dotenv::read_env_file(&source_paths.env_path)?;

    let transfer = |from: &Path, to: &Path| {
        if link {
            link_file_if_missing(from, to)
        } else {
            copy_file_if_missing(from, to)
        }
    };

    let mut copied = AuthCopy {
        source_stack: source.to_string(),
        ..AuthCopy::default()
    };

    copied.secret = transfer(
        &master_secret_path(&source_paths, &source_env),
        &master_secret_path(target, target_env),
    )?;

    let source_cli = cli_home_for(&source_paths, &source_env);
    let target_cli = cli_home_for(target, target_env);
    copied.access_key = transfer(
        &source_cli.join(ACCESS_KEY_FILE),
        &target_cli.join(ACCESS_KEY_FILE),
    )?;
    copied.settings = transfer(
        &source_cli.join(SETTINGS_FILE),
        &target_cli.join(SETTINGS_FILE),
    )?;

    tracing::info!(
        "auth from {} into {}: secret={} accessKey={} settings={}",
        source,
        target.name,
        copied.secret,
        copied.access_key,
        copied.settings
    );
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn settings(storage: &Path, extra: &[(&str, &str)]) -> Settings {
        let mut env: BTreeMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.insert("HAPPIER_STACK_STORAGE_DIR".into(), storage.display().to_string());
        env.insert(
            "HAPPIER_STACK_HOME_DIR".into(),
            storage.join("home").display().to_string(),
        );
        Settings::from_env(env, storage.to_path_buf())
    }

    fn make_stack(storage: &Path, name: &str) -> StackPaths {
        let paths = StackPaths::new(storage, name);
        fs::create_dir_all(&paths.base_dir).unwrap();
        fs::write(&paths.env_path, format!("HAPPIER_STACK_STACK={}\n", name)).unwrap();
        paths
    }

    #[test]
    fn copies_without_overwriting() {
        let dir = tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("nested").join("b");
        fs::write(&from, "one").unwrap();
        assert!(copy_file_if_missing(&from, &to).unwrap());
        fs::write(&from, "two").unwrap();
        assert!(!copy_file_if_missing(&from, &to).unwrap());
        assert_eq!(fs::read_to_string(&to).unwrap(), "one");
        assert!(!copy_file_if_missing(&dir.path().join("missing"), &dir.path().join("c")).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn copied_secrets_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, "k").unwrap();
        copy_file_if_missing(&from, &to).unwrap();
        let mode = fs::metadata(&to).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn copy_auth_moves_cli_credentials_and_secret() {
        let dir = tempdir().unwrap();
        let storage = dir.path();
        let main = make_stack(storage, MAIN_STACK);
        fs::create_dir_all(&main.cli_home_dir).unwrap();
        fs::write(main.cli_home_dir.join(ACCESS_KEY_FILE), "key").unwrap();
        fs::write(main.cli_home_dir.join(SETTINGS_FILE), "{}").unwrap();
        fs::create_dir_all(&main.server_light_data_dir).unwrap();
        fs::write(main.server_light_data_dir.join(MASTER_SECRET_FILE), "s3cret").unwrap();

        let target = make_stack(storage, "dev");
        let settings = settings(storage, &[]);
        let copied =
            copy_auth_from_stack(&settings, MAIN_STACK, &target, &BTreeMap::new(), false, true).unwrap();
        assert!(copied.access_key && copied.settings && copied.secret);
        assert_eq!(
            fs::read_to_string(target.cli_home_dir.join(ACCESS_KEY_FILE)).unwrap(),
            "key"
        );
        assert!(!needs_seed(&target.cli_home_dir));

        let again =
            copy_auth_from_stack(&settings, MAIN_STACK, &target, &BTreeMap::new(), false, true).unwrap();
        assert!(!again.any());
    }

    #[test]
    fn missing_required_source_fails() {
        let dir = tempdir().unwrap();
        let target = make_stack(dir.path(), "dev");
        let settings = settings(dir.path(), &[]);
        let err = copy_auth_from_stack(&settings, "ghost", &target, &BTreeMap::new(), false, true)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn auto_seed_policy() {
        let dir = tempdir().unwrap();
        let plain = settings(dir.path(), &[]);
        assert!(!auto_seed_enabled(&plain, MAIN_STACK, false));
        assert!(auto_seed_enabled(&plain, "dev", false));
        assert!(!auto_seed_enabled(&plain, "dev", true));

        let seeded = settings(dir.path(), &[("HAPPIER_STACK_AUTH_SEED_FROM", "dev-auth")]);
        assert!(auto_seed_enabled(&seeded, "dev", true));

        let off = settings(dir.path(), &[("HAPPIER_STACK_AUTO_AUTH_SEED", "0")]);
        assert!(!auto_seed_enabled(&off, "dev", false));

        let sandbox = settings(
            dir.path(),
            &[("HAPPIER_STACK_SANDBOX_DIR", dir.path().to_str().unwrap())],
        );
        assert!(!auto_seed_enabled(&sandbox, "dev", false));
    }
}
