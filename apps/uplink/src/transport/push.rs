//! Keeps one push connection alive: picks the configured transport (falling
//! back when it cannot open), reconnects after drops and reports every step
//! as a [`TransportEvent`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;
use uplink_proto::constants::JSON_CONTENT_TYPE;

use super::{LinkEvent, PushLink, TransportError, TransportEvent, TransportKind, Transports};
use crate::config::PushOptions;

const TRACKING_ID_PARAMETER: &str = "X-Atmosphere-tracking-id";
const FRAMEWORK_PARAMETER: &str = "X-Atmosphere-Framework";
const TRANSPORT_PARAMETER: &str = "X-Atmosphere-Transport";
const TRACK_SIZE_PARAMETER: &str = "X-Atmosphere-TrackMessageSize";
const PROTOCOL_PARAMETER: &str = "X-atmo-protocol";
const CONTENT_TYPE_PARAMETER: &str = "Content-Type";
const FRAMEWORK_VERSION: &str = "3.1.2-javascript";

/// Push URL plus the query parameters the server-side push handler reads
/// to pick a transport and match requests to a tracked connection.
pub fn atmosphere_url(
    push_url: &Url,
    kind: TransportKind,
    options: &PushOptions,
    tracking_id: Option<&str>,
) -> Url {
    let mut url = push_url.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair(TRACKING_ID_PARAMETER, tracking_id.unwrap_or("0"));
        query.append_pair(FRAMEWORK_PARAMETER, FRAMEWORK_VERSION);
        query.append_pair(TRANSPORT_PARAMETER, kind.as_str());
        if options.track_message_length {
            query.append_pair(TRACK_SIZE_PARAMETER, "true");
        }
        if options.enable_protocol {
            query.append_pair(PROTOCOL_PARAMETER, "true");
        }
        query.append_pair(CONTENT_TYPE_PARAMETER, JSON_CONTENT_TYPE);
    }
    url
}

/// Handle on a running push supervisor. Dropping it closes the connection.
pub struct PushSupervisor {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    task: JoinHandle<()>,
}

impl PushSupervisor {
    pub fn spawn(transports: Transports, uri: Url, options: PushOptions) -> Self {
        let (outbound, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(transports, uri, options, out_rx, events_tx));
        Self {
            outbound,
            events,
            task,
        }
    }

    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

impl Drop for PushSupervisor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PumpEnd {
    Shutdown,
    ClientTimeout,
    Closed(Option<String>),
}

async fn supervise(
    transports: Transports,
    uri: Url,
    options: PushOptions,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let (kind, mut link) = match open_with_fallback(&transports, &uri, &options).await {
        Ok(opened) => opened,
        Err(err) => {
            tracing::warn!(target: "uplink::transport::push", error = %err, "push connection failed");
            let _ = events.send(TransportEvent::Error(err.to_string()));
            return;
        }
    };
    if events.send(TransportEvent::Opened(kind)).is_err() {
        return;
    }

    loop {
        let reason = match pump(&mut link, &mut out_rx, &events, options.timeout).await {
            PumpEnd::Shutdown => return,
            PumpEnd::ClientTimeout => {
                tracing::info!(target: "uplink::transport::push", "push connection idle, timing out");
                let _ = events.send(TransportEvent::ClientTimeout);
                return;
            }
            PumpEnd::Closed(reason) => reason,
        };
        drop(link);
        tracing::info!(target: "uplink::transport::push", %kind, ?reason, "push connection dropped");
        if events.send(TransportEvent::Reconnecting).is_err() {
            return;
        }
        match reconnect(&transports, kind, &uri, &options).await {
            Some(reopened) => {
                link = reopened;
                if events.send(TransportEvent::Reopened(kind)).is_err() {
                    return;
                }
            }
            None => {
                let _ = events.send(TransportEvent::Closed);
                return;
            }
        }
    }
}

async fn open_with_fallback(
    transports: &Transports,
    uri: &Url,
    options: &PushOptions,
) -> Result<(TransportKind, PushLink), TransportError> {
    let primary = options.transport;
    let err = match open(transports, primary, uri, options).await {
        Ok(link) => return Ok((primary, link)),
        Err(err) => err,
    };
    let fallback = options.fallback_transport;
    if fallback == primary {
        return Err(err);
    }
    tracing::info!(
        target: "uplink::transport::push",
        %primary,
        %fallback,
        error = %err,
        "primary push transport failed, trying fallback"
    );
    let link = open(transports, fallback, uri, options).await?;
    Ok((fallback, link))
}

async fn open(
    transports: &Transports,
    kind: TransportKind,
    uri: &Url,
    options: &PushOptions,
) -> Result<PushLink, TransportError> {
    let transport = transports
        .push_transport(kind)
        .ok_or(TransportError::Unsupported(kind))?;
    transport.open(uri, options).await
}

/// Retries on the transport that was last connected, every
/// `reconnect_interval`, up to `max_reconnect_on_close` times.
async fn reconnect(
    transports: &Transports,
    kind: TransportKind,
    uri: &Url,
    options: &PushOptions,
) -> Option<PushLink> {
    for attempt in 1..=options.max_reconnect_on_close {
        tokio::time::sleep(options.reconnect_interval).await;
        match open(transports, kind, uri, options).await {
            Ok(link) => return Some(link),
            Err(err) => {
                tracing::debug!(
                    target: "uplink::transport::push",
                    attempt,
                    error = %err,
                    "push reconnect failed"
                );
            }
        }
    }
    None
}

async fn pump(
    link: &mut PushLink,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<TransportEvent>,
    timeout: Option<Duration>,
) -> PumpEnd {
    loop {
        let idle = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            inbound = link.inbound.recv() => match inbound {
                Some(LinkEvent::Frame(frame)) => {
                    if events.send(TransportEvent::Message(frame)).is_err() {
                        return PumpEnd::Shutdown;
                    }
                }
                Some(LinkEvent::Closed(reason)) => return PumpEnd::Closed(reason),
                None => return PumpEnd::Closed(None),
            },
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    if link.outbound.send(frame).is_err() {
                        return PumpEnd::Closed(Some("link task ended".into()));
                    }
                }
                None => return PumpEnd::Shutdown,
            },
            _ = idle => return PumpEnd::ClientTimeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockPushTransport, MockRequestChannel};
    use std::sync::Arc;

    fn push_url() -> Url {
        Url::parse("http://localhost/app/?v-r=push&v-uiId=0").unwrap()
    }

    fn options() -> PushOptions {
        PushOptions {
            reconnect_interval: Duration::from_millis(100),
            max_reconnect_on_close: 2,
            ..PushOptions::default()
        }
    }

    #[test]
    fn atmosphere_parameters_follow_options() {
        let mut opts = PushOptions::default();
        let url = atmosphere_url(&push_url(), TransportKind::WebSocket, &opts, None);
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&(TRACKING_ID_PARAMETER.into(), "0".into())));
        assert!(pairs.contains(&(TRANSPORT_PARAMETER.into(), "websocket".into())));
        assert!(pairs.contains(&(TRACK_SIZE_PARAMETER.into(), "true".into())));

        opts.track_message_length = false;
        let url = atmosphere_url(&push_url(), TransportKind::LongPolling, &opts, Some("abc"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&(TRACKING_ID_PARAMETER.into(), "abc".into())));
        assert!(pairs.contains(&(TRANSPORT_PARAMETER.into(), "long-polling".into())));
        assert!(!pairs.iter().any(|(k, _)| k == TRACK_SIZE_PARAMETER));
        assert_eq!(pairs[0], ("v-r".into(), "push".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_when_primary_cannot_open() {
        let (ws, _ws_server) = MockPushTransport::new(TransportKind::WebSocket);
        ws.fail_next_opens(1);
        let (lp, mut lp_server) = MockPushTransport::new(TransportKind::LongPolling);
        let transports = Transports {
            requests: Arc::new(MockRequestChannel::new()),
            push: vec![Arc::new(ws), Arc::new(lp)],
        };

        let mut supervisor = PushSupervisor::spawn(transports, push_url(), options());
        assert_eq!(
            supervisor.next_event().await,
            Some(TransportEvent::Opened(TransportKind::LongPolling))
        );
        let mut peer = lp_server.accept().await.expect("peer");
        supervisor.send("hello".into()).unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("hello"));
        peer.send("5|world");
        assert_eq!(
            supervisor.next_event().await,
            Some(TransportEvent::Message("5|world".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_drop_then_gives_up() {
        let (ws, mut server) = MockPushTransport::new(TransportKind::WebSocket);
        let handle = ws.clone();
        let transports = Transports {
            requests: Arc::new(MockRequestChannel::new()),
            push: vec![Arc::new(ws)],
        };

        let mut supervisor = PushSupervisor::spawn(transports, push_url(), options());
        assert_eq!(
            supervisor.next_event().await,
            Some(TransportEvent::Opened(TransportKind::WebSocket))
        );
        let peer = server.accept().await.expect("peer");
        peer.close(Some("restart"));
        assert_eq!(supervisor.next_event().await, Some(TransportEvent::Reconnecting));
        assert_eq!(
            supervisor.next_event().await,
            Some(TransportEvent::Reopened(TransportKind::WebSocket))
        );

        let peer = server.accept().await.expect("second peer");
        handle.fail_next_opens(10);
        peer.close(None);
        assert_eq!(supervisor.next_event().await, Some(TransportEvent::Reconnecting));
        assert_eq!(supervisor.next_event().await, Some(TransportEvent::Closed));
        assert_eq!(supervisor.next_event().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_times_out() {
        let (ws, _server) = MockPushTransport::new(TransportKind::WebSocket);
        let transports = Transports {
            requests: Arc::new(MockRequestChannel::new()),
            push: vec![Arc::new(ws)],
        };
        let opts = PushOptions {
            timeout: Some(Duration::from_secs(30)),
            ..options()
        };

        let mut supervisor = PushSupervisor::spawn(transports, push_url(), opts);
        assert_eq!(
            supervisor.next_event().await,
            Some(TransportEvent::Opened(TransportKind::WebSocket))
        );
        assert_eq!(supervisor.next_event().await, Some(TransportEvent::ClientTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn no_transport_reports_error() {
        let transports = Transports {
            requests: Arc::new(MockRequestChannel::new()),
            push: Vec::new(),
        };
        let mut supervisor = PushSupervisor::spawn(transports, push_url(), options());
        assert!(matches!(
            supervisor.next_event().await,
            Some(TransportEvent::Error(_))
        ));
    }
}
