//! Invocation-wide settings.
//!
//! Every command receives a [`Settings`] built once in `main`. It holds the
//! layered base environment (process env, canonical pointer, home config and
//! repo `.env`) and the directories derived from it. Nothing in the crate
//! mutates the real process environment; child processes get explicit maps.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::dotenv;

pub const ENV_PREFIX: &str = "HAPPIER_STACK_";
const LEGACY_PREFIXES: [&str; 2] = ["HAPPY_LOCAL_", "HAPPY_STACKS_"];

#[derive(Debug, Clone)]
pub struct Settings {
    /// The user's real home directory.
    pub user_home: PathBuf,
    /// Tool home (`~/.happier-stack` unless overridden).
    pub home_dir: PathBuf,
    /// Root under which every stack gets a directory.
    pub storage_dir: PathBuf,
    pub workspace_dir: PathBuf,
    /// Monorepo checkout the stack services run from.
    pub repo_dir: PathBuf,
    pub sandbox_dir: Option<PathBuf>,
    pub sandbox_allow_global: bool,
    /// Layered environment every stack resolution starts from.
    pub base_env: BTreeMap<String, String>,
}

impl Settings {
    /// Builds settings from the real process environment.
    pub fn from_process_env() -> Result<Self> {
        let user_home =
            dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
        Ok(Self::from_env(utf8_env(std::env::vars_os()), user_home))
    }

    /// Builds settings from an explicit environment map.
    pub fn from_env(process_env: BTreeMap<String, String>, user_home: PathBuf) -> Self {
        let mut env = process_env;

        if non_empty(&env, "HAPPIER_STACK_HOME_DIR").is_none() {
            let canonical_home = non_empty(&env, "HAPPIER_STACK_CANONICAL_HOME_DIR")
                .map(|raw| expand_home(raw, &user_home))
                .unwrap_or_else(|| user_home.join(".happier-stack"));
            let pointer = canonical_home.join(".env");
            if pointer.exists() {
                load_layer(&mut env, &pointer, Layer::FillMissing);
                load_layer(&mut env, &pointer, Layer::OverridePrefixed);
            }
        }

        let home_dir = non_empty(&env, "HAPPIER_STACK_HOME_DIR")
            .map(|raw| expand_home(raw, &user_home))
            .unwrap_or_else(|| user_home.join(".happier-stack"));
        env.entry("HAPPIER_STACK_HOME_DIR".to_string())
            .or_insert_with(|| home_dir.display().to_string());

        let sandboxed = non_empty(&env, "HAPPIER_STACK_SANDBOX_DIR").is_some();
        let home_env = home_dir.join(".env");
        let home_local = home_dir.join("env.local");
        let has_home_config = sandboxed || home_env.exists() || home_local.exists();
        if has_home_config {
            load_layer(&mut env, &home_env, Layer::FillMissing);
            load_layer(&mut env, &home_local, Layer::OverridePrefixed);
        }

        let workspace_dir = non_empty(&env, "HAPPIER_STACK_WORKSPACE_DIR")
            .map(|raw| expand_home(raw, &user_home))
            .unwrap_or_else(|| home_dir.join("workspace"));
        let repo_dir = match non_empty(&env, "HAPPIER_STACK_REPO_DIR") {
            Some(raw) => {
                let path = expand_home(raw, &user_home);
                if path.is_absolute() {
                    path
                } else {
                    workspace_dir.join(path)
                }
            }
            None => workspace_dir.join("happier"),
        };

        let repo_env = repo_dir.join(".env");
        if has_home_config {
            load_layer(&mut env, &repo_env, Layer::FillMissingUnprefixed);
        } else {
            load_layer(&mut env, &repo_env, Layer::FillMissing);
            load_layer(&mut env, &repo_dir.join("env.local"), Layer::OverridePrefixed);
        }

        env.retain(|key, _| !LEGACY_PREFIXES.iter().any(|p| key.starts_with(p)));
        env.entry("COREPACK_ENABLE_STRICT".to_string())
            .or_insert_with(|| "0".to_string());
        env.entry("NPM_CONFIG_PACKAGE_MANAGER_STRICT".to_string())
            .or_insert_with(|| "false".to_string());
        augment_path(&mut env);

        let storage_dir = non_empty(&env, "HAPPIER_STACK_STORAGE_DIR")
            .map(|raw| expand_home(raw, &user_home))
            .unwrap_or_else(|| user_home.join(".happier").join("stacks"));
        let sandbox_dir =
            non_empty(&env, "HAPPIER_STACK_SANDBOX_DIR").map(|raw| expand_home(raw, &user_home));
        let sandbox_allow_global = non_empty(&env, "HAPPIER_STACK_SANDBOX_ALLOW_GLOBAL")
            .map(is_truthy)
            .unwrap_or(false);

        Self {
            user_home,
            home_dir,
            storage_dir,
            workspace_dir,
            repo_dir,
            sandbox_dir,
            sandbox_allow_global,
            base_env: env,
        }
    }

    /// Returns a trimmed, non-empty value from the base environment.
    pub fn var(&self, key: &str) -> Option<&str> {
        non_empty(&self.base_env, key)
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandbox_dir.is_some()
    }

    /// Sandboxed runs must not touch global state (LaunchAgents, systemd units,
    /// other stacks' credentials) unless explicitly allowed.
    pub fn allows_global_side_effects(&self) -> bool {
        !self.is_sandboxed() || self.sandbox_allow_global
    }

    pub fn verbose(&self) -> bool {
        self.var("HAPPIER_STACK_VERBOSE").map(is_truthy).unwrap_or(false)
    }

    /// Default location of the services file.
    pub fn config_path(&self) -> PathBuf {
        self.home_dir.join("hstack.toml")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home_dir.join("cache")
    }
}

/// Keeps the variables whose key and value are valid UTF-8.
fn utf8_env(vars: impl IntoIterator<Item = (OsString, OsString)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                tracing::debug!("skipping non-UTF-8 value of {}", key);
                None
            }
            _ => None,
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
enum Layer {
    /// Set only keys that are absent or blank.
    FillMissing,
    /// Like `FillMissing`, but `HAPPIER_STACK_*` keys always win.
    OverridePrefixed,
    /// Like `FillMissing`, skipping `HAPPIER_STACK_*` keys entirely.
    FillMissingUnprefixed,
}

fn load_layer(env: &mut BTreeMap<String, String>, path: &Path, layer: Layer) {
    let parsed = match dotenv::read_env_file(path) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!("ignoring env file {}: {}", path.display(), err);
            return;
        }
    };
    for (key, value) in parsed {
        let prefixed = key.starts_with(ENV_PREFIX);
        let missing = env.get(&key).map(|v| v.is_empty()).unwrap_or(true);
        let apply = match layer {
            Layer::FillMissing => missing,
            Layer::OverridePrefixed => prefixed || missing,
            Layer::FillMissingUnprefixed => !prefixed && missing,
        };
        if apply {
            env.insert(key, value);
        }
    }
}

// LaunchAgents and systemd user units start with a minimal PATH.
fn augment_path(env: &mut BTreeMap<String, String>) {
    const WANT: [&str; 5] = [
        "/opt/homebrew/bin",
        "/opt/homebrew/sbin",
        "/usr/local/bin",
        "/usr/bin",
        "/bin",
    ];
    let current: Vec<String> = env
        .get("PATH")
        .map(|p| {
            p.split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let mut next: Vec<String> = WANT
        .iter()
        .filter(|p| !current.iter().any(|c| c == *p))
        .map(|p| p.to_string())
        .collect();
    next.extend(current);
    env.insert("PATH".to_string(), next.join(":"));
}

fn non_empty<'a>(env: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Accepts the usual spellings of "on".
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Expands a leading `~` against `user_home`.
pub fn expand_home(raw: &str, user_home: &Path) -> PathBuf {
    if raw == "~" {
        return user_home.to_path_buf();
    }
    match raw.strip_prefix("~/") {
        Some(rest) => user_home.join(rest),
        None => PathBuf::from(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_variables_are_skipped() {
        use std::os::unix::ffi::OsStringExt;

        let vars = vec![
            (OsString::from("HAPPIER_STACK_STACK"), OsString::from("exp1")),
            (OsString::from("BROKEN"), OsString::from_vec(vec![0x66, 0x6f, 0xff])),
            (OsString::from_vec(vec![0xfe, 0x41]), OsString::from("x")),
        ];
        let env = utf8_env(vars);
        assert_eq!(env.get("HAPPIER_STACK_STACK").map(String::as_str), Some("exp1"));
        assert!(!env.contains_key("BROKEN"));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn defaults_hang_off_user_home() {
        let dir = tempdir().unwrap();
        let settings = Settings::from_env(BTreeMap::new(), dir.path().to_path_buf());
        assert_eq!(settings.home_dir, dir.path().join(".happier-stack"));
        assert_eq!(settings.storage_dir, dir.path().join(".happier/stacks"));
        assert_eq!(
            settings.repo_dir,
            dir.path().join(".happier-stack/workspace/happier")
        );
        assert!(!settings.is_sandboxed());
    }

    #[test]
    fn home_env_fills_and_env_local_overrides_prefixed_keys() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        fs::write(home.join(".env"), "FOO=from-home\nHAPPIER_STACK_STORAGE_DIR=/a\n").unwrap();
        fs::write(
            home.join("env.local"),
            "HAPPIER_STACK_STORAGE_DIR=/b\nFOO=local\nBAR=local\n",
        )
        .unwrap();
        let env = env_of(&[
            ("HAPPIER_STACK_HOME_DIR", home.to_str().unwrap()),
            ("FOO", "from-process"),
        ]);
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        assert_eq!(settings.storage_dir, PathBuf::from("/b"));
        assert_eq!(settings.var("FOO"), Some("from-process"));
        assert_eq!(settings.var("BAR"), Some("local"));
    }

    #[test]
    fn repo_env_cannot_set_prefixed_keys_when_home_config_exists() {
        let dir = tempdir().unwrap();
        let home = dir.path().join("home");
        let repo = dir.path().join("repo");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&repo).unwrap();
        fs::write(home.join(".env"), "X=1\n").unwrap();
        fs::write(
            repo.join(".env"),
            "HAPPIER_STACK_STORAGE_DIR=/leak\nREPO_ONLY=yes\n",
        )
        .unwrap();
        let env = env_of(&[
            ("HAPPIER_STACK_HOME_DIR", home.to_str().unwrap()),
            ("HAPPIER_STACK_REPO_DIR", repo.to_str().unwrap()),
        ]);
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        assert_eq!(settings.storage_dir, dir.path().join(".happier/stacks"));
        assert_eq!(settings.var("REPO_ONLY"), Some("yes"));
    }

    #[test]
    fn canonical_pointer_redirects_home() {
        let dir = tempdir().unwrap();
        let canonical = dir.path().join(".happier-stack");
        fs::create_dir_all(&canonical).unwrap();
        fs::write(
            canonical.join(".env"),
            "HAPPIER_STACK_HOME_DIR=~/elsewhere\n",
        )
        .unwrap();
        let settings = Settings::from_env(BTreeMap::new(), dir.path().to_path_buf());
        assert_eq!(settings.home_dir, dir.path().join("elsewhere"));
    }

    #[test]
    fn legacy_prefixes_are_scrubbed() {
        let dir = tempdir().unwrap();
        let env = env_of(&[("HAPPY_LOCAL_PORT", "1"), ("HAPPY_STACKS_X", "2"), ("KEEP", "3")]);
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        assert!(settings.var("HAPPY_LOCAL_PORT").is_none());
        assert!(settings.var("HAPPY_STACKS_X").is_none());
        assert_eq!(settings.var("KEEP"), Some("3"));
    }

    #[test]
    fn sandbox_policy() {
        let dir = tempdir().unwrap();
        let env = env_of(&[("HAPPIER_STACK_SANDBOX_DIR", "/tmp/sbx")]);
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        assert!(settings.is_sandboxed());
        assert!(!settings.allows_global_side_effects());

        let env = env_of(&[
            ("HAPPIER_STACK_SANDBOX_DIR", "/tmp/sbx"),
            ("HAPPIER_STACK_SANDBOX_ALLOW_GLOBAL", "yes"),
        ]);
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        assert!(settings.allows_global_side_effects());
    }

    #[test]
    fn path_gains_standard_dirs_once() {
        let dir = tempdir().unwrap();
        let env = env_of(&[("PATH", "/usr/bin:/custom")]);
        let settings = Settings::from_env(env, dir.path().to_path_buf());
        let path = settings.var("PATH").unwrap();
        assert_eq!(path.matches("/usr/bin").count(), 1);
        assert!(path.ends_with("/usr/bin:/custom"));
    }
}
