use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

const DEFAULT_SETTINGS_FILE: &str = "chat.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub database_url: String,
    pub history_page_size: u32,
    pub history_max_pages: u32,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub http_timeout_secs: u64,
    pub watch_min_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/chat.db".into(),
            history_page_size: 50,
            history_max_pages: 20,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            http_timeout_secs: 30,
            watch_min_interval_ms: 50,
        }
    }
}

impl ClientSettings {
    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        let initial = Duration::from_millis(self.reconnect_initial_ms.max(1));
        let max = Duration::from_millis(self.reconnect_max_ms).max(initial);
        (initial, max)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn watch_min_interval(&self) -> Duration {
        Duration::from_millis(self.watch_min_interval_ms)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Reads `path` when present, then applies environment overrides through
/// `lookup`. Unparseable values are ignored with a warning.
pub fn load_settings_from(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config: ignoring malformed settings file");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };

    if let Some(v) = lookup("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    override_parsed(&lookup, "APP__HISTORY_PAGE_SIZE", &mut settings.history_page_size);
    override_parsed(&lookup, "APP__HISTORY_MAX_PAGES", &mut settings.history_max_pages);
    override_parsed(&lookup, "APP__RECONNECT_INITIAL_MS", &mut settings.reconnect_initial_ms);
    override_parsed(&lookup, "APP__RECONNECT_MAX_MS", &mut settings.reconnect_max_ms);
    override_parsed(&lookup, "APP__HTTP_TIMEOUT_SECS", &mut settings.http_timeout_secs);

    settings
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = %raw, "config: ignoring unparseable override"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}
