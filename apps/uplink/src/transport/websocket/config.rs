use std::time::Duration;

use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for opening the websocket push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    pub connect_timeout: Duration,
    /// Rewrite `localhost` to `127.0.0.1` so the handshake never waits on
    /// an IPv6 attempt that the server does not listen on.
    pub normalize_localhost: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            normalize_localhost: true,
        }
    }
}

impl WebSocketConfig {
    /// ws(s) form of a push URL.
    pub fn build_url(&self, push_url: &Url) -> Url {
        let mut url = uplink_proto::params::to_websocket(push_url);
        if self.normalize_localhost && url.host_str() == Some("localhost") {
            // Only fails for cannot-be-a-base URLs, which ws URLs never are.
            let _ = url.set_host(Some("127.0.0.1"));
        }
        url
    }
}

#[derive(Debug, Default)]
pub struct WebSocketConfigBuilder {
    connect_timeout: Option<Duration>,
    normalize_localhost: Option<bool>,
}

impl WebSocketConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn normalize_localhost(mut self, normalize: bool) -> Self {
        self.normalize_localhost = Some(normalize);
        self
    }

    pub fn build(self) -> WebSocketConfig {
        let defaults = WebSocketConfig::default();
        WebSocketConfig {
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            normalize_localhost: self
                .normalize_localhost
                .unwrap_or(defaults.normalize_localhost),
        }
    }
}
