use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::{ChatError, ChatResult};

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub history_path: String,
    pub send_path: String,
    pub me_path: String,
    pub socket_path: String,
    pub connect_timeout: Duration,
    pub auth_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".into(),
            history_path: "messages/history".into(),
            send_path: "messages/send".into(),
            me_path: "auth/me".into(),
            socket_path: "socket".into(),
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    history_path: Option<String>,
    send_path: Option<String>,
    me_path: Option<String>,
    socket_path: Option<String>,
    connect_timeout_secs: Option<u64>,
    auth_timeout_secs: Option<u64>,
}

/// Loads `client.toml` from the working directory (if present) and then
/// applies environment overrides.
pub fn load_settings() -> ClientSettings {
    let raw = fs::read_to_string(DEFAULT_SETTINGS_FILE).ok();
    load_settings_with(raw.as_deref(), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path) -> ChatResult<ClientSettings> {
    let raw = fs::read_to_string(path)
        .map_err(|err| ChatError::Config(format!("failed to read '{}': {err}", path.display())))?;
    Ok(load_settings_with(Some(&raw), |key| std::env::var(key).ok()))
}

pub fn load_settings_with(
    raw_file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Some(raw) = raw_file {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.server_url {
                    settings.server_url = v;
                }
                if let Some(v) = file_cfg.history_path {
                    settings.history_path = v;
                }
                if let Some(v) = file_cfg.send_path {
                    settings.send_path = v;
                }
                if let Some(v) = file_cfg.me_path {
                    settings.me_path = v;
                }
                if let Some(v) = file_cfg.socket_path {
                    settings.socket_path = v;
                }
                if let Some(v) = file_cfg.connect_timeout_secs {
                    settings.connect_timeout = Duration::from_secs(v);
                }
                if let Some(v) = file_cfg.auth_timeout_secs {
                    settings.auth_timeout = Duration::from_secs(v);
                }
            }
            Err(err) => warn!("config: ignoring malformed settings file: {err}"),
        }
    }

    if let Some(v) = env("CHAT_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("CHAT_HISTORY_PATH") {
        settings.history_path = v;
    }
    if let Some(v) = env("CHAT_SEND_PATH") {
        settings.send_path = v;
    }
    if let Some(v) = env("CHAT_SOCKET_PATH") {
        settings.socket_path = v;
    }
    if let Some(v) = env("CHAT_CONNECT_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.connect_timeout = Duration::from_secs(parsed);
        }
    }
    if let Some(v) = env("CHAT_AUTH_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.auth_timeout = Duration::from_secs(parsed);
        }
    }

    settings.server_url = normalize_base_url(&settings.server_url);
    settings
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

impl ClientSettings {
    /// `{server_url}/{path}` with surrounding slashes collapsed.
    pub fn endpoint(&self, path: &str) -> ChatResult<Url> {
        let joined = format!(
            "{}/{}",
            normalize_base_url(&self.server_url),
            path.trim_start_matches('/')
        );
        Url::parse(&joined)
            .map_err(|err| ChatError::Config(format!("invalid url '{joined}': {err}")))
    }

    /// WebSocket url of the live channel: http maps to ws, https to wss.
    pub fn socket_url(&self) -> ChatResult<Url> {
        let mut url = self.endpoint(&self.socket_path)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ChatError::Config(format!(
                    "server_url must start with http:// or https://, got {other}://"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| ChatError::Config(format!("cannot use scheme {scheme} for {url}")))?;
        Ok(url)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
