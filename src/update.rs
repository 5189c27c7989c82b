//! Update check against the npm registry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::Settings;

const UPDATE_URL: &str = "https://registry.npmjs.org/-/package/@happier-dev/stack/dist-tags";
const UPDATE_TTL: Duration = Duration::from_secs(60 * 60 * 24);
const UPDATE_CACHE_FILE: &str = "update.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub current: String,
    pub latest: Option<String>,
    pub update_available: bool,
    pub checked_at: Option<DateTime<Utc>>,
    /// Where `latest` came from: `network`, `cache` or `disabled`.
    pub source: String,
}

#[derive(Debug, Deserialize)]
struct DistTags {
    latest: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateCache {
    checked_at: DateTime<Utc>,
    latest: String,
}

/// Current version plus the newest published one. With `allow_network`
/// false only the cache is consulted.
pub async fn check_for_update(settings: &Settings, allow_network: bool) -> UpdateStatus {
    let current = env!("CARGO_PKG_VERSION").to_string();
    let now = Utc::now();
    let cache_path = cache_path(settings);
    let cached = read_cache(&cache_path);
    let cache_is_fresh = cached.as_ref().is_some_and(|cache| {
        now.signed_duration_since(cache.checked_at)
            .to_std()
            .map(|age| age < UPDATE_TTL)
            .unwrap_or(true)
    });

    let network_allowed = allow_network && !update_check_disabled(settings);
    let (latest, checked_at, source) = if cache_is_fresh || !network_allowed {
        match cached {
            Some(cache) => (Some(cache.latest), Some(cache.checked_at), "cache"),
            None => (None, None, "disabled"),
        }
    } else {
        match fetch_latest_version(&update_url(settings)).await {
            Some(latest) => {
                write_cache(&cache_path, &latest, now);
                (Some(latest), Some(now), "network")
            }
            None => match cached {
                Some(cache) => (Some(cache.latest), Some(cache.checked_at), "cache"),
                None => (None, None, "network"),
            },
        }
    };

    let update_available = match (
        latest.as_deref().and_then(version_tuple),
        version_tuple(&current),
    ) {
        (Some(latest), Some(current)) => latest > current,
        _ => false,
    };

    UpdateStatus {
        current,
        latest: latest.and_then(|l| normalize_version(&l)),
        update_available,
        checked_at,
        source: source.to_string(),
    }
}

async fn fetch_latest_version(url: &str) -> Option<String> {
    let client = reqwest::Client::builder()
        .user_agent(format!("hstack/{}", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(3))
        .build()
        .ok()?;
    let response = client
        .get(url)
        .header("Accept", "application/json")
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        tracing::debug!("update check returned {}", response.status());
        return None;
    }
    let payload: DistTags = response.json().await.ok()?;
    Some(payload.latest)
}

fn update_check_disabled(settings: &Settings) -> bool {
    settings.var("HAPPIER_STACK_UPDATE_CHECK") == Some("0")
}

fn update_url(settings: &Settings) -> String {
    settings
        .var("HAPPIER_STACK_UPDATE_URL")
        .unwrap_or(UPDATE_URL)
        .to_string()
}

fn cache_path(settings: &Settings) -> PathBuf {
    settings.cache_dir().join(UPDATE_CACHE_FILE)
}

fn read_cache(path: &Path) -> Option<UpdateCache> {
    let data = fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn write_cache(path: &Path, latest: &str, checked_at: DateTime<Utc>) {
    let cache = UpdateCache {
        checked_at,
        latest: latest.to_string(),
    };
    if let Ok(serialized) = serde_json::to_string(&cache) {
        if let Err(err) = crate::dotenv::write_atomic(path, serialized.as_bytes(), None) {
            tracing::debug!("failed to write update cache: {}", err);
        }
    }
}

fn normalize_version(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('v');
    let no_build = trimmed.split('+').next().unwrap_or(trimmed);
    let no_pre = no_build.split('-').next().unwrap_or(no_build);
    if no_pre.is_empty() {
        None
    } else {
        Some(no_pre.to_string())
    }
}

fn version_tuple(raw: &str) -> Option<(u64, u64, u64)> {
    let normalized = normalize_version(raw)?;
    let mut parts = normalized.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}
