use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::Deserialize;

/// GitHub OAuth application credentials.
pub static GITHUB_CLIENT_ID: Lazy<String> =
    Lazy::new(|| std::env::var("GITHUB_CLIENT_ID").unwrap_or_default());
pub static GITHUB_CLIENT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("GITHUB_CLIENT_SECRET").unwrap_or_default());

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parse a duration string like `30s`, `5m`, `1h` or `1500ms`. A bare number
/// is taken as seconds. Unparsable input falls back to 30 seconds.
pub fn parse_duration(input: &str) -> Duration {
    let trimmed = input.trim();
    let (digits, unit) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, "s"),
    };
    let value: u64 = match digits.parse() {
        Ok(v) => v,
        Err(_) => return DEFAULT_TIMEOUT,
    };
    match unit.trim() {
        "ms" => Duration::from_millis(value),
        "s" | "" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => DEFAULT_TIMEOUT,
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_backend() -> String {
    "sqlite".into()
}

fn default_database_path() -> String {
    "coordination.db".into()
}

fn default_workspace_root() -> String {
    "workspaces".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// `sqlite` for the persistent registries, `memory` for ephemeral runs.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            database_path: default_database_path(),
            workspace_root: default_workspace_root(),
        }
    }
}

fn default_buffer_size() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebsocketConfig {
    /// Per-subscriber event buffer. A subscriber whose buffer fills up is
    /// disconnected rather than allowed to stall the broadcaster.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub jwt_secret: Option<String>,
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Coordination server configuration, loaded from
/// `$HOME/.config/nexus/coordination.yaml` by default. Unknown keys are
/// ignored; every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub websocket: WebsocketConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        Path::new(&home)
            .join(".config")
            .join("nexus")
            .join("coordination.yaml")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_path())
    }

    /// Read the YAML file (missing file means defaults) and apply
    /// environment overrides on top.
    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<Config>(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(?err, path = %path.display(), "invalid config file, using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        };
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("NEXUS_COORD_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("NEXUS_COORD_PORT") {
            match port.parse() {
                Ok(parsed) => self.server.port = parsed,
                Err(_) => tracing::warn!(%port, "ignoring unparsable NEXUS_COORD_PORT"),
            }
        }
        if let Ok(secret) = std::env::var("NEXUS_JWT_SECRET") {
            if !secret.is_empty() {
                self.auth.jwt_secret = Some(secret);
            }
        }
        if let Ok(token) = std::env::var("NEXUS_AUTH_TOKEN") {
            if !token.is_empty() {
                self.auth.token = Some(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("30s"), Duration::from_secs(30));
        assert_eq!(parse_duration("5m"), Duration::from_secs(300));
        assert_eq!(parse_duration("1h"), Duration::from_secs(3600));
        assert_eq!(parse_duration("1500ms"), Duration::from_millis(1500));
        assert_eq!(parse_duration("45"), Duration::from_secs(45));
    }

    #[test]
    fn unparsable_duration_falls_back_to_thirty_seconds() {
        assert_eq!(parse_duration("soon"), Duration::from_secs(30));
        assert_eq!(parse_duration("10 fortnights"), Duration::from_secs(30));
    }

    #[test]
    fn config_ignores_unknown_keys() {
        let raw = r#"
server:
  host: 127.0.0.1
  port: 9090
  keepalive: whatever
experimental:
  flag: true
"#;
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.registry.backend, "sqlite");
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.websocket.buffer_size, 16);
        assert!(!config.auth.enabled);
    }
}
