//! Process Configuration
//!
//! A `Settings` value is built once at process entry and passed by reference;
//! nothing in this crate reaches for ambient global state. The relay URL is
//! baked in at compile time (`GREENLIGHT_RELAY_URL`) and can be overridden by
//! the environment variable of the same name.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use reqwest::Url;

/// Every variable with this prefix is stripped from the child environment
/// before the explicit export map is applied.
pub const ENV_PREFIX: &str = "GREENLIGHT_";

/// Agent identifier sent with every relay payload.
pub const AGENT_NAME: &str = "claude-code";

/// Process-wide configuration, initialised once in `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relay WebSocket URL, e.g. `wss://permit.example.com/ws/relay`.
    pub ws_url: String,
    /// Optional bearer token for the WebSocket dial.
    pub token: Option<String>,
    /// Build version string.
    pub version: String,
}

impl Settings {
    /// Build settings from the compile-time default and the environment.
    pub fn from_env() -> Self {
        let ws_url = std::env::var("GREENLIGHT_RELAY_URL")
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| option_env!("GREENLIGHT_RELAY_URL").map(str::to_string))
            .unwrap_or_default();
        let token = std::env::var("GREENLIGHT_TOKEN").ok().filter(|v| !v.is_empty());

        Self {
            ws_url,
            token,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Derive the HTTP base URL from the WebSocket URL by swapping the scheme
    /// and dropping the path, e.g. `wss://host/ws/relay` → `https://host`.
    pub fn server_base_url(&self) -> Result<String> {
        server_base_url(&self.ws_url)
    }
}

pub fn server_base_url(ws_url: &str) -> Result<String> {
    if ws_url.is_empty() {
        return Err(anyhow!("no relay server URL configured"));
    }
    let url = Url::parse(ws_url).with_context(|| format!("bad relay URL {ws_url:?}"))?;
    let scheme = match url.scheme() {
        "ws" => "http",
        _ => "https",
    };
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("relay URL {ws_url:?} has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

/// Append `relay_id` and `project` query parameters to the relay URL for
/// the WebSocket dial.
pub fn dial_url(ws_url: &str, relay_id: &str, project: &str) -> Result<String> {
    let mut url = Url::parse(ws_url).with_context(|| format!("bad relay URL {ws_url:?}"))?;
    url.query_pairs_mut()
        .append_pair("relay_id", relay_id)
        .append_pair("project", project);
    Ok(url.to_string())
}

// ========== Filesystem layout ==========

/// `~/.greenlight`
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".greenlight"))
}

/// Diagnostic log destination: `GREENLIGHT_LOG` override, else a PID-scoped
/// file in the temp directory. Logs never go to the terminal (§ raw mode).
pub fn log_path() -> PathBuf {
    if let Ok(path) = std::env::var("GREENLIGHT_LOG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    std::env::temp_dir().join(format!("greenlight-{}.log", std::process::id()))
}

/// Enrollment marker keyed by relay id.
pub fn enrollment_marker_path(relay_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("greenlight-enrolled-{relay_id}"))
}

/// Append-only rendezvous between the streamer and the host.
pub fn bridge_path(relay_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("greenlight-bridge-{relay_id}"))
}

/// Streamer PID file keyed by the hosted program's session id.
pub fn streamer_pid_path(session_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("greenlight-stream-{session_id}.pid"))
}

// ========== key=value config file ==========

/// Read a value from `~/.greenlight/config`. Missing file or key is not an
/// error; both resolve to `None`.
pub fn read_config_value(key: &str) -> Option<String> {
    let path = config_dir()?.join("config");
    config_value_from(&path, key)
}

/// Parse a `key=value` config file, skipping blanks and `#` comments.
pub fn config_value_from(path: &Path, key: &str) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            if k.trim() == key {
                return Some(v.trim().to_string());
            }
        }
    }
    None
}

/// Resolve the device id: flag > `GREENLIGHT_DEVICE_ID` > config file.
pub fn resolve_device_id(flag: Option<&str>) -> Option<String> {
    resolve("GREENLIGHT_DEVICE_ID", "device_id", flag)
}

/// Resolve the project: flag > `GREENLIGHT_PROJECT` > config file.
pub fn resolve_project(flag: Option<&str>) -> Option<String> {
    resolve("GREENLIGHT_PROJECT", "project", flag)
}

fn resolve(env_key: &str, config_key: &str, flag: Option<&str>) -> Option<String> {
    if let Some(v) = flag {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var(env_key) {
        if !v.is_empty() {
            return Some(v);
        }
    }
    read_config_value(config_key).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_base_url_wss() {
        assert_eq!(
            server_base_url("wss://permit.example.com/ws/relay").unwrap(),
            "https://permit.example.com"
        );
    }

    #[test]
    fn test_server_base_url_ws_with_port() {
        assert_eq!(
            server_base_url("ws://127.0.0.1:9121/relay").unwrap(),
            "http://127.0.0.1:9121"
        );
    }

    #[test]
    fn test_server_base_url_empty_is_error() {
        assert!(server_base_url("").is_err());
    }

    #[test]
    fn test_dial_url_appends_query() {
        let url = dial_url("wss://permit.example.com/ws/relay", "r-1", "proj").unwrap();
        assert_eq!(
            url,
            "wss://permit.example.com/ws/relay?relay_id=r-1&project=proj"
        );
    }

    #[test]
    fn test_dial_url_preserves_existing_query() {
        let url = dial_url("ws://localhost:9121/relay?v=2", "r-1", "p").unwrap();
        assert!(url.starts_with("ws://localhost:9121/relay?v=2&"));
        assert!(url.contains("relay_id=r-1"));
    }

    #[test]
    fn test_config_value_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "# comment\n\ndevice_id = abc-123\nproject=demo\n",
        )
        .unwrap();

        assert_eq!(config_value_from(&path, "device_id").unwrap(), "abc-123");
        assert_eq!(config_value_from(&path, "project").unwrap(), "demo");
        assert!(config_value_from(&path, "missing").is_none());
    }

    #[test]
    fn test_config_value_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(config_value_from(&dir.path().join("config"), "device_id").is_none());
    }
}
