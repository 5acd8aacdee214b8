use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;
use uplink_proto::constants::JSON_CONTENT_TYPE;
use uplink_proto::{DecodedMessage, MessageDecoder};

use super::push::atmosphere_url;
use super::{
    HttpRequest, LinkEvent, PushLink, PushTransport, RequestChannel, TransportError, TransportKind,
};
use crate::config::PushOptions;

/// Server-to-client push over repeated GETs. Each response carries whatever
/// the server queued since the previous one; the next GET goes out at once.
/// Frames written by the client are POSTed to the same tracked URL.
pub struct LongPollingTransport {
    requests: Arc<dyn RequestChannel>,
}

impl LongPollingTransport {
    pub fn new(requests: Arc<dyn RequestChannel>) -> Self {
        Self { requests }
    }
}

#[async_trait]
impl PushTransport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    async fn open(&self, uri: &Url, options: &PushOptions) -> Result<PushLink, TransportError> {
        let first = atmosphere_url(uri, TransportKind::LongPolling, options, None);
        tracing::debug!(target: "uplink::transport::long_polling", url = %first, "opening");
        let response = self.requests.get(first).await?;
        if response.status != 200 {
            return Err(TransportError::Network(format!(
                "push request answered with status {}",
                response.status
            )));
        }

        let tracking_id = tracking_id(&response.body, options);
        let url = atmosphere_url(uri, TransportKind::LongPolling, options, tracking_id.as_deref());

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<LinkEvent>();
        if !response.body.is_empty() {
            let _ = tx_in.send(LinkEvent::Frame(response.body));
        }
        let task = tokio::spawn(run(self.requests.clone(), url, rx_out, tx_in));
        Ok(PushLink::new(tx_out, rx_in, Some(task)))
    }
}

/// Tracking id from the protocol handshake, when the protocol is on.
fn tracking_id(body: &str, options: &PushOptions) -> Option<String> {
    if !options.enable_protocol {
        return None;
    }
    let mut decoder = MessageDecoder::new(options.track_message_length, true);
    decoder.ingest(body).ok()?.into_iter().find_map(|message| match message {
        DecodedMessage::Handshake(handshake) => Some(handshake.tracking_id),
        _ => None,
    })
}

async fn run(
    requests: Arc<dyn RequestChannel>,
    url: Url,
    rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<LinkEvent>,
) {
    let reason = tokio::select! {
        reason = poll(requests.as_ref(), &url, &tx_in) => reason,
        _ = send(requests.as_ref(), &url, rx_out) => None,
    };
    tracing::debug!(target: "uplink::transport::long_polling", ?reason, "long polling ended");
    let _ = tx_in.send(LinkEvent::Closed(reason));
}

async fn poll(
    requests: &dyn RequestChannel,
    url: &Url,
    tx_in: &mpsc::UnboundedSender<LinkEvent>,
) -> Option<String> {
    loop {
        match requests.get(url.clone()).await {
            Ok(response) if response.status == 200 => {
                if response.body.is_empty() {
                    tokio::task::yield_now().await;
                } else if tx_in.send(LinkEvent::Frame(response.body)).is_err() {
                    return None;
                }
            }
            Ok(response) => return Some(format!("poll answered with status {}", response.status)),
            Err(err) => return Some(err.to_string()),
        }
    }
}

async fn send(requests: &dyn RequestChannel, url: &Url, mut rx_out: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = rx_out.recv().await {
        let request = HttpRequest {
            uri: url.clone(),
            content_type: JSON_CONTENT_TYPE,
            body: frame,
        };
        match requests.post(request).await {
            Ok(response) if response.status == 200 => {}
            Ok(response) => tracing::warn!(
                target: "uplink::transport::long_polling",
                status = response.status,
                "push post rejected"
            ),
            Err(err) => tracing::warn!(
                target: "uplink::transport::long_polling",
                error = %err,
                "push post failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockRequestChannel;
    use crate::transport::HttpResponse;

    #[tokio::test]
    async fn polls_with_tracking_id_until_failure() {
        let channel = Arc::new(MockRequestChannel::new());
        channel.push_response(Ok(HttpResponse::ok("12|abc|60000|X|")));
        channel.push_response(Ok(HttpResponse::ok("5|hello")));
        channel.push_response(Err(TransportError::Timeout));

        let transport = LongPollingTransport::new(channel.clone());
        let uri = Url::parse("http://localhost/?v-r=push&v-uiId=0").unwrap();
        let mut link = transport.open(&uri, &PushOptions::default()).await.expect("open");

        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Frame("12|abc|60000|X|".into()))
        );
        assert_eq!(link.inbound.recv().await, Some(LinkEvent::Frame("5|hello".into())));
        assert!(matches!(link.inbound.recv().await, Some(LinkEvent::Closed(Some(_)))));

        let requests = channel.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.method == "GET"));
        let tracked = requests[1]
            .uri
            .query_pairs()
            .find(|(k, _)| k == "X-Atmosphere-tracking-id")
            .map(|(_, v)| v.into_owned());
        assert_eq!(tracked.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn rejected_open_is_an_error() {
        let channel = Arc::new(MockRequestChannel::new());
        channel.push_response(Ok(HttpResponse::status(501)));
        let transport = LongPollingTransport::new(channel);
        let uri = Url::parse("http://localhost/?v-r=push").unwrap();
        assert!(transport.open(&uri, &PushOptions::default()).await.is_err());
    }
}
