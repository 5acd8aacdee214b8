use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::push::atmosphere_url;
use super::{LinkEvent, PushLink, PushTransport, TransportError, TransportKind};
use crate::config::PushOptions;

pub mod config;
use config::WebSocketConfig;

/// Full-duplex push over a single websocket.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, uri: &Url, options: &PushOptions) -> Result<PushLink, TransportError> {
        let url = self
            .config
            .build_url(&atmosphere_url(uri, TransportKind::WebSocket, options, None));
        tracing::debug!(target: "uplink::transport::websocket", url = %url, "connecting");

        let (ws_stream, _) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| TransportError::Timeout)??;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<LinkEvent>();
        let task = tokio::spawn(handle_websocket(ws_stream, rx_out, tx_in));
        Ok(PushLink::new(tx_out, rx_in, Some(task)))
    }
}

async fn handle_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<LinkEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx_out.recv().await {
            if let Err(err) = ws_sender.send(Message::Text(frame)).await {
                tracing::debug!(target: "uplink::transport::websocket", error = %err, "send failed");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let reason = loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                if tx_in.send(LinkEvent::Frame(text)).is_err() {
                    break None;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                if tx_in.send(LinkEvent::Frame(text)).is_err() {
                    break None;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| f.reason.into_owned()).filter(|r| !r.is_empty());
            }
            Some(Err(err)) => break Some(err.to_string()),
            None => break None,
            Some(Ok(_)) => {}
        }
    };

    tracing::debug!(target: "uplink::transport::websocket", ?reason, "websocket closed");
    let _ = tx_in.send(LinkEvent::Closed(reason));
    send_task.abort();
    let _ = send_task.await;
}
