//! The init request that precedes a client: it creates the server-side UI
//! and returns its id, timing settings and the first UIDL message.

use std::time::Duration;

use serde::Deserialize;
use uplink_proto::{RequestType, UidlMessage};

use crate::config::ClientConfig;
use crate::runtime::RuntimeError;
use crate::transport::RequestChannel;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "v-uiId", default)]
    pub ui_id: Option<u32>,
    /// Seconds; zero or negative disables heartbeats.
    #[serde(rename = "heartbeatInterval", default)]
    pub heartbeat_interval: Option<i64>,
    #[serde(rename = "maxMessageSuspendTimeout", default)]
    pub max_message_suspend_timeout: Option<u64>,
    #[serde(default)]
    pub uidl: Option<UidlMessage>,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(rename = "appConfig")]
    app_config: AppConfig,
}

impl AppConfig {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let response: InitResponse = serde_json::from_str(body)?;
        Ok(response.app_config)
    }

    /// Server-provided values win over local defaults.
    pub fn apply(&self, config: &mut ClientConfig) {
        if let Some(ui_id) = self.ui_id {
            config.ui_id = ui_id;
        }
        if let Some(seconds) = self.heartbeat_interval {
            config.heartbeat_interval = u64::try_from(seconds)
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs);
        }
        if let Some(ms) = self.max_message_suspend_timeout {
            config.max_message_suspend_timeout = Duration::from_millis(ms);
        }
    }
}

/// Issues the init request and folds the answer into `config`. Returns the
/// initial message to hand to [`Client::start`](crate::client::Client::start).
pub async fn fetch_initial(
    requests: &dyn RequestChannel,
    config: &mut ClientConfig,
) -> Result<Option<UidlMessage>, RuntimeError> {
    let uri = uplink_proto::service_url(&config.service_url, RequestType::Init, None, None)
        .map_err(|err| RuntimeError::Bootstrap(err.to_string()))?;
    tracing::info!(target: "uplink::bootstrap", uri = %uri, "requesting initial state");
    let response = requests.get(uri).await?;
    if response.status != 200 {
        return Err(RuntimeError::Bootstrap(format!(
            "init request answered with status {}",
            response.status
        )));
    }
    let app_config =
        AppConfig::parse(&response.body).map_err(|err| RuntimeError::Bootstrap(err.to_string()))?;
    app_config.apply(config);
    tracing::debug!(
        target: "uplink::bootstrap",
        ui_id = config.ui_id,
        heartbeat = ?config.heartbeat_interval,
        "initial state received"
    );
    Ok(app_config.uidl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockRequestChannel;
    use crate::transport::HttpResponse;

    const INIT: &str = r#"{
        "appConfig": {
            "v-uiId": 5,
            "heartbeatInterval": -1,
            "maxMessageSuspendTimeout": 2000,
            "productionMode": false,
            "uidl": {"syncId": 0, "clientId": 0, "changes": []}
        }
    }"#;

    #[test]
    fn init_response_overrides_config() {
        let app = AppConfig::parse(INIT).expect("parse");
        let mut config = ClientConfig::default();
        app.apply(&mut config);
        assert_eq!(config.ui_id, 5);
        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.max_message_suspend_timeout, Duration::from_secs(2));
        assert_eq!(app.uidl.and_then(|m| m.sync_id), Some(0));
    }

    #[tokio::test]
    async fn fetch_uses_init_request_type() {
        let channel = MockRequestChannel::new();
        channel.push_response(Ok(HttpResponse::ok(INIT)));
        let mut config = ClientConfig::default();
        let initial = fetch_initial(&channel, &mut config).await.expect("fetch");
        assert!(initial.is_some());
        assert_eq!(channel.requests()[0].request_type().as_deref(), Some("init"));

        channel.push_response(Ok(HttpResponse::status(500)));
        assert!(matches!(
            fetch_initial(&channel, &mut config).await,
            Err(RuntimeError::Bootstrap(_))
        ));
    }
}
