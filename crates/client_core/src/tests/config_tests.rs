use std::collections::HashMap;

use super::*;

fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn defaults_apply_without_file_or_env() {
    let settings = load_settings_with(None, env_from(&[]));
    assert_eq!(settings, ClientSettings::default());
}

#[test]
fn file_values_are_overridden_by_env() {
    let raw = r#"
        server_url = "https://chat.example.com///"
        history_path = "api/messages/history"
        auth_timeout_secs = 3
    "#;
    let settings = load_settings_with(
        Some(raw),
        env_from(&[("APP__SERVER_URL", "https://override.example.com/")]),
    );

    assert_eq!(settings.server_url, "https://override.example.com");
    assert_eq!(settings.history_path, "api/messages/history");
    assert_eq!(settings.auth_timeout, Duration::from_secs(3));
}

#[test]
fn malformed_file_falls_back_to_defaults() {
    let settings = load_settings_with(Some("server_url = ["), env_from(&[]));
    assert_eq!(settings.server_url, ClientSettings::default().server_url);
}

#[test]
fn unparsable_timeout_env_is_ignored() {
    let settings = load_settings_with(None, env_from(&[("CHAT_CONNECT_TIMEOUT_SECS", "soon")]));
    assert_eq!(settings.connect_timeout, Duration::from_secs(10));
}

#[test]
fn endpoint_joins_base_and_path() {
    let settings = ClientSettings {
        server_url: "http://localhost:5000/".into(),
        ..ClientSettings::default()
    };
    let url = settings.endpoint("/messages/history").expect("url");
    assert_eq!(url.as_str(), "http://localhost:5000/messages/history");
}

#[test]
fn socket_url_switches_scheme() {
    let settings = ClientSettings {
        server_url: "https://chat.example.com".into(),
        ..ClientSettings::default()
    };
    assert_eq!(
        settings.socket_url().expect("url").as_str(),
        "wss://chat.example.com/socket"
    );

    let settings = ClientSettings {
        server_url: "ftp://chat.example.com".into(),
        ..ClientSettings::default()
    };
    assert!(matches!(settings.socket_url(), Err(ChatError::Config(_))));
}
