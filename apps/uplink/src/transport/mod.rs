//! Wire-level channels. The core state machine never touches these directly;
//! the runtime driver performs its transmits through them and feeds the
//! results back.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

use crate::config::PushOptions;

pub mod http;
pub mod long_polling;
pub mod mock;
pub mod push;
pub mod websocket;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "websocket")]
    WebSocket,
    #[serde(rename = "long-polling")]
    LongPolling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::WebSocket => uplink_proto::constants::TRANSPORT_WEBSOCKET,
            TransportKind::LongPolling => uplink_proto::constants::TRANSPORT_LONG_POLLING,
        }
    }

    /// Whether client-to-server messages can travel over the same connection.
    pub fn is_full_duplex(self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }

    /// Whether outgoing messages must be split to fit the server's frame buffer.
    pub fn is_frame_limited(self) -> bool {
        matches!(self, TransportKind::WebSocket)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(TransportKind::WebSocket),
            "long-polling" | "long_polling" | "longpolling" => Ok(TransportKind::LongPolling),
            other => Err(TransportError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("network error: {0}")]
    Network(String),
    #[error("connection closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    #[error("no push transport registered for {0}")]
    Unsupported(TransportKind),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRequest {
    pub uri: Url,
    pub content_type: &'static str,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

/// One-shot request/response channel used for UIDL posts and heartbeats.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    async fn get(&self, uri: Url) -> Result<HttpResponse, TransportError>;
}

/// Push lifecycle as reported to the connection state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened(TransportKind),
    Reopened(TransportKind),
    Message(String),
    /// The connection dropped and the transport is retrying on its own.
    Reconnecting,
    Closed,
    Error(String),
    ClientTimeout,
}

/// Raw happenings on a single physical push connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    Closed(Option<String>),
}

/// A single open push connection. Dropping it closes the connection.
pub struct PushLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl PushLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
        task: Option<tokio::task::JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            task,
        }
    }
}

impl Drop for PushLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, uri: &Url, options: &PushOptions) -> Result<PushLink, TransportError>;
}

/// The channels a runtime needs: one request channel and the push
/// transports it may choose between.
#[derive(Clone)]
pub struct Transports {
    pub requests: Arc<dyn RequestChannel>,
    pub push: Vec<Arc<dyn PushTransport>>,
}

impl Transports {
    /// reqwest for plain requests, websocket with long-polling fallback for push.
    pub fn network(websocket: websocket::config::WebSocketConfig) -> Result<Self, TransportError> {
        let requests: Arc<dyn RequestChannel> = Arc::new(http::HttpChannel::new()?);
        let push: Vec<Arc<dyn PushTransport>> = vec![
            Arc::new(websocket::WebSocketTransport::new(websocket)),
            Arc::new(long_polling::LongPollingTransport::new(requests.clone())),
        ];
        Ok(Self { requests, push })
    }

    pub fn push_transport(&self, kind: TransportKind) -> Option<Arc<dyn PushTransport>> {
        self.push.iter().find(|t| t.kind() == kind).cloned()
    }
}
