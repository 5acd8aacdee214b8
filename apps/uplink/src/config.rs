use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uplink_proto::constants::{MESSAGE_DELIMITER, WEBSOCKET_FRAGMENT_SIZE};

use crate::transport::TransportKind;

const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_MAX_MESSAGE_SUSPEND_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10_000;
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
const DEFAULT_DIALOG_GRACE_PERIOD: Duration = Duration::from_millis(400);
const DEFAULT_DIALOG_TEXT: &str = "Server connection lost, trying to reconnect...";
const DEFAULT_DIALOG_TEXT_GAVE_UP: &str = "Server connection lost.";
const DEFAULT_PUSH_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);
const DEFAULT_MAX_RECONNECT_ON_CLOSE: u32 = 10_000_000;
const DEFAULT_MAX_STREAMING_LENGTH: usize = 1_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Reconnect dialog and retry budget of the failure arbitrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub attempts: u32,
    #[serde(with = "millis")]
    pub interval: Duration,
    #[serde(with = "millis")]
    pub dialog_grace_period: Duration,
    /// `{0}` is replaced with the current attempt number.
    pub dialog_text: String,
    pub dialog_text_gave_up: String,
    pub dialog_modal: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RECONNECT_ATTEMPTS,
            interval: DEFAULT_RECONNECT_INTERVAL,
            dialog_grace_period: DEFAULT_DIALOG_GRACE_PERIOD,
            dialog_text: DEFAULT_DIALOG_TEXT.to_string(),
            dialog_text_gave_up: DEFAULT_DIALOG_TEXT_GAVE_UP.to_string(),
            dialog_modal: false,
        }
    }
}

impl ReconnectConfig {
    pub fn dialog_text(&self, attempt: u32) -> String {
        self.dialog_text.replace("{0}", &attempt.to_string())
    }

    pub fn dialog_text_gave_up(&self, attempt: u32) -> String {
        self.dialog_text_gave_up.replace("{0}", &attempt.to_string())
    }
}

/// Settings handed to the push transport when it opens. The transport layer
/// retries on its own per these values; the arbitrator's budget is separate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushOptions {
    pub transport: TransportKind,
    pub fallback_transport: TransportKind,
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
    pub max_reconnect_on_close: u32,
    pub track_message_length: bool,
    pub enable_protocol: bool,
    /// `None` disables the client-side inactivity timeout.
    #[serde(with = "opt_millis")]
    pub timeout: Option<Duration>,
    pub max_streaming_length: usize,
    pub message_delimiter: char,
    pub fragment_size: usize,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            transport: TransportKind::WebSocket,
            fallback_transport: TransportKind::LongPolling,
            reconnect_interval: DEFAULT_PUSH_RECONNECT_INTERVAL,
            max_reconnect_on_close: DEFAULT_MAX_RECONNECT_ON_CLOSE,
            track_message_length: true,
            enable_protocol: true,
            timeout: None,
            max_streaming_length: DEFAULT_MAX_STREAMING_LENGTH,
            message_delimiter: MESSAGE_DELIMITER,
            fragment_size: WEBSOCKET_FRAGMENT_SIZE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL every request type is derived from.
    pub service_url: String,
    pub ui_id: u32,
    /// `None` disables heartbeats.
    #[serde(with = "opt_millis")]
    pub heartbeat_interval: Option<Duration>,
    #[serde(with = "millis")]
    pub max_message_suspend_timeout: Duration,
    pub push_enabled: bool,
    /// Keep client-to-server traffic on plain requests even when push is
    /// full duplex.
    pub always_xhr_to_server: bool,
    pub reconnect: ReconnectConfig,
    pub push: PushOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            ui_id: 0,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            max_message_suspend_timeout: DEFAULT_MAX_MESSAGE_SUSPEND_TIMEOUT,
            push_enabled: false,
            always_xhr_to_server: false,
            reconnect: ReconnectConfig::default(),
            push: PushOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `UPLINK_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// File (when given) first, then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var("UPLINK_SERVICE_URL") {
            self.service_url = url;
        }
        if let Some(ui_id) = parse_env("UPLINK_UI_ID") {
            self.ui_id = ui_id;
        }
        if let Some(ms) = parse_env::<i64>("UPLINK_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval = u64::try_from(ms)
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
        }
        if let Some(ms) = parse_env("UPLINK_MAX_SUSPEND_MS") {
            self.max_message_suspend_timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = parse_bool_env("UPLINK_PUSH_ENABLED") {
            self.push_enabled = enabled;
        }
        if let Some(always) = parse_bool_env("UPLINK_ALWAYS_XHR") {
            self.always_xhr_to_server = always;
        }
        if let Some(transport) = parse_env("UPLINK_PUSH_TRANSPORT") {
            self.push.transport = transport;
        }
        if let Some(attempts) = parse_env("UPLINK_RECONNECT_ATTEMPTS") {
            self.reconnect.attempts = attempts;
        }
        if let Some(ms) = parse_env("UPLINK_RECONNECT_INTERVAL_MS") {
            self.reconnect.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env("UPLINK_DIALOG_GRACE_MS") {
            self.reconnect.dialog_grace_period = Duration::from_millis(ms);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.service_url)
            .map_err(|err| ConfigError::Invalid(format!("service_url: {err}")))?;
        if self.reconnect.attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.attempts must be at least 1".into(),
            ));
        }
        if self.push.fragment_size == 0 {
            return Err(ConfigError::Invalid("push.fragment_size must be positive".into()));
        }
        Ok(())
    }

    /// Resend timer for plain requests that never got an answer.
    pub fn resend_timeout(&self) -> Duration {
        self.max_message_suspend_timeout + Duration::from_millis(500)
    }
}

fn parse_env<T>(var: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = env::var(var).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(
                target: "uplink::config",
                var,
                error = %err,
                "ignoring unparsable environment override"
            );
            None
        }
    }
}

fn parse_bool_env(var: &str) -> Option<bool> {
    env::var(var)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Negative or missing values mean "disabled", matching the server's `-1`.
mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_i64(value.as_millis() as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        Ok(u64::try_from(ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "UPLINK_SERVICE_URL",
        "UPLINK_UI_ID",
        "UPLINK_HEARTBEAT_INTERVAL_MS",
        "UPLINK_PUSH_ENABLED",
        "UPLINK_RECONNECT_ATTEMPTS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_match_protocol() {
        let config = ClientConfig::default();
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(300)));
        assert_eq!(config.resend_timeout(), Duration::from_millis(5500));
        assert_eq!(config.reconnect.attempts, 10_000);
        assert_eq!(config.push.fragment_size, 4095);
        assert_eq!(config.push.transport, TransportKind::WebSocket);
        assert_eq!(config.push.timeout, None);
    }

    #[test]
    fn env_overrides_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("UPLINK_SERVICE_URL", "https://app.example.com/");
            env::set_var("UPLINK_UI_ID", "7");
            env::set_var("UPLINK_HEARTBEAT_INTERVAL_MS", "-1");
            env::set_var("UPLINK_PUSH_ENABLED", "true");
            env::set_var("UPLINK_RECONNECT_ATTEMPTS", "not-a-number");
        }
        let config = ClientConfig::from_env();
        clear_env();

        assert_eq!(config.service_url, "https://app.example.com/");
        assert_eq!(config.ui_id, 7);
        assert_eq!(config.heartbeat_interval, None);
        assert!(config.push_enabled);
        assert_eq!(config.reconnect.attempts, DEFAULT_RECONNECT_ATTEMPTS);
    }

    #[test]
    fn toml_file_round_trips_partial_tables() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = std::env::temp_dir().join(format!("uplink-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("uplink.toml");
        std::fs::write(
            &path,
            r#"
service_url = "http://localhost:9000/app/"
ui_id = 2
heartbeat_interval = 1000

[reconnect]
attempts = 3
dialog_text = "attempt {0}"

[push]
transport = "long-polling"
timeout = -1
"#,
        )
        .unwrap();

        let config = ClientConfig::load(Some(&path)).expect("load");
        assert_eq!(config.ui_id, 2);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.reconnect.attempts, 3);
        assert_eq!(config.reconnect.dialog_text(4), "attempt 4");
        assert_eq!(config.reconnect.interval, DEFAULT_RECONNECT_INTERVAL);
        assert_eq!(config.push.transport, TransportKind::LongPolling);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let mut config = ClientConfig::default();
        config.reconnect.attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
