use hdc_core::channel_ipc::DEFAULT_MAX_FRAME_BYTES;
use hdc_core::DEFAULT_TOAST_TTL_MS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "HDC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub agent_id: String,
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub channel_url: String,
    pub snapshot_db: PathBuf,
    pub log_dir: PathBuf,
    pub log_stdout: bool,
    pub toast_ttl_ms: u64,
    pub lookup_timeout_ms: u64,
    pub reconnect_max_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for DeskConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hdc");
        Self {
            agent_id: String::new(),
            api_base_url: "http://127.0.0.1:8080/".to_string(),
            api_token: None,
            channel_url: "ws://127.0.0.1:8080/realtime".to_string(),
            snapshot_db: data_dir.join("workspace.sqlite"),
            log_dir: data_dir.join("logs"),
            log_stdout: false,
            toast_ttl_ms: DEFAULT_TOAST_TTL_MS,
            lookup_timeout_ms: 5_000,
            reconnect_max_secs: 30,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl DeskConfig {
    /// Reads `path` if given, otherwise `~/.config/hdc/desk.toml` when it exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match default_config_path().filter(|path| path.exists()) {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `HDC_*` overrides. `lookup` receives the full variable name.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(value) = get("AGENT_ID") {
            self.agent_id = value;
        }
        if let Some(value) = get("API_BASE_URL") {
            self.api_base_url = value;
        }
        if let Some(value) = get("API_TOKEN") {
            self.api_token = Some(value);
        }
        if let Some(value) = get("CHANNEL_URL") {
            self.channel_url = value;
        }
        if let Some(value) = get("SNAPSHOT_DB") {
            self.snapshot_db = PathBuf::from(value);
        }
        if let Some(value) = get("LOG_DIR") {
            self.log_dir = PathBuf::from(value);
        }
        if let Some(value) = get("LOG_STDOUT") {
            self.log_stdout = parse_flag("HDC_LOG_STDOUT", &value)?;
        }
        if let Some(value) = get("TOAST_TTL_MS") {
            self.toast_ttl_ms = parse_number("HDC_TOAST_TTL_MS", &value)?;
        }
        if let Some(value) = get("LOOKUP_TIMEOUT_MS") {
            self.lookup_timeout_ms = parse_number("HDC_LOOKUP_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = get("RECONNECT_MAX_SECS") {
            self.reconnect_max_secs = parse_number("HDC_RECONNECT_MAX_SECS", &value)?;
        }
        if let Some(value) = get("MAX_FRAME_BYTES") {
            self.max_frame_bytes = parse_number("HDC_MAX_FRAME_BYTES", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Missing("agent_id"));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::Missing("api_base_url"));
        }
        if self.channel_url.trim().is_empty() {
            return Err(ConfigError::Missing("channel_url"));
        }
        if self.reconnect_max_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reconnect_max_secs".to_string(),
                value: "0".to_string(),
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_frame_bytes".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hdc").join("desk.toml"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = DeskConfig::from_toml(
            r#"
agent_id = "agent-7"
channel_url = "wss://push.example.test/agents"
"#,
        )
        .expect("parse");
        assert_eq!(config.agent_id, "agent-7");
        assert_eq!(config.channel_url, "wss://push.example.test/agents");
        assert_eq!(config.toast_ttl_ms, 4_000);
        assert!(!config.log_stdout);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = DeskConfig {
            agent_id: "from-file".to_string(),
            ..DeskConfig::default()
        };
        config
            .apply_env_overrides(env(&[
                ("HDC_AGENT_ID", "from-env"),
                ("HDC_LOG_STDOUT", "yes"),
                ("HDC_TOAST_TTL_MS", "1500"),
                ("HDC_API_TOKEN", "  "),
            ]))
            .expect("overrides");
        assert_eq!(config.agent_id, "from-env");
        assert!(config.log_stdout);
        assert_eq!(config.toast_ttl_ms, 1_500);
        assert_eq!(config.api_token, None);
    }

    #[test]
    fn malformed_env_number_is_reported() {
        let mut config = DeskConfig::default();
        let err = config
            .apply_env_overrides(env(&[("HDC_RECONNECT_MAX_SECS", "soon")]))
            .expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HDC_RECONNECT_MAX_SECS"));
    }

    #[test]
    fn validate_requires_agent_id() {
        let config = DeskConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("agent_id"))));

        let config = DeskConfig {
            agent_id: "agent-7".to_string(),
            ..DeskConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("desk.toml");
        std::fs::write(&path, "agent_id = \"agent-9\"\nlog_stdout = true\n").expect("write");
        let config = DeskConfig::load(Some(&path)).expect("load");
        assert_eq!(config.agent_id, "agent-9");
        assert!(config.log_stdout);

        let missing = DeskConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
