//! In-memory transports for tests and offline demos.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use super::{
    HttpRequest, HttpResponse, LinkEvent, PushLink, PushTransport, RequestChannel, TransportError,
    TransportKind,
};
use crate::config::PushOptions;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub uri: Url,
    pub body: Option<String>,
}

impl RecordedRequest {
    /// Value of the `v-r` query parameter.
    pub fn request_type(&self) -> Option<String> {
        self.uri
            .query_pairs()
            .find(|(key, _)| key == uplink_proto::constants::REQUEST_TYPE_PARAMETER)
            .map(|(_, value)| value.into_owned())
    }
}

type Responder = Box<dyn FnMut(&RecordedRequest) -> Result<HttpResponse, TransportError> + Send>;

/// Answers from a script first, then from a responder closure. Without a
/// responder every request gets an empty 200.
pub struct MockRequestChannel {
    log: Mutex<Vec<RecordedRequest>>,
    scripted: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    responder: Mutex<Option<Responder>>,
}

impl Default for MockRequestChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRequestChannel {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            responder: Mutex::new(None),
        }
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&RecordedRequest) -> Result<HttpResponse, TransportError> + Send + 'static,
    {
        let channel = Self::new();
        *channel.responder.lock() = Some(Box::new(responder));
        channel
    }

    pub fn push_response(&self, response: Result<HttpResponse, TransportError>) {
        self.scripted.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    fn answer(&self, request: RecordedRequest) -> Result<HttpResponse, TransportError> {
        self.log.lock().push(request.clone());
        if let Some(scripted) = self.scripted.lock().pop_front() {
            return scripted;
        }
        match self.responder.lock().as_mut() {
            Some(responder) => responder(&request),
            None => Ok(HttpResponse::ok("")),
        }
    }
}

#[async_trait]
impl RequestChannel for MockRequestChannel {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.answer(RecordedRequest {
            method: "POST",
            uri: request.uri,
            body: Some(request.body),
        })
    }

    async fn get(&self, uri: Url) -> Result<HttpResponse, TransportError> {
        self.answer(RecordedRequest {
            method: "GET",
            uri,
            body: None,
        })
    }
}

struct MockPushState {
    failures: u32,
    opened: u32,
}

/// Push transport whose connections surface as [`MockPushPeer`]s on the
/// paired [`MockPushServer`].
#[derive(Clone)]
pub struct MockPushTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockPushState>>,
    peers: mpsc::UnboundedSender<MockPushPeer>,
}

impl MockPushTransport {
    pub fn new(kind: TransportKind) -> (Self, MockPushServer) {
        let (peers, accept) = mpsc::unbounded_channel();
        let transport = Self {
            kind,
            state: Arc::new(Mutex::new(MockPushState {
                failures: 0,
                opened: 0,
            })),
            peers,
        };
        (transport, MockPushServer { accept })
    }

    /// The next `count` opens are refused.
    pub fn fail_next_opens(&self, count: u32) {
        self.state.lock().failures = count;
    }

    pub fn opened(&self) -> u32 {
        self.state.lock().opened
    }
}

#[async_trait]
impl PushTransport for MockPushTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, uri: &Url, _options: &PushOptions) -> Result<PushLink, TransportError> {
        {
            let mut state = self.state.lock();
            if state.failures > 0 {
                state.failures -= 1;
                return Err(TransportError::Network("connection refused".into()));
            }
            state.opened += 1;
        }
        let (outbound, received) = mpsc::unbounded_channel();
        let (sender, inbound) = mpsc::unbounded_channel();
        let peer = MockPushPeer {
            uri: uri.clone(),
            received,
            sender,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Network("mock server gone".into()))?;
        Ok(PushLink::new(outbound, inbound, None))
    }
}

pub struct MockPushServer {
    accept: mpsc::UnboundedReceiver<MockPushPeer>,
}

impl MockPushServer {
    pub async fn accept(&mut self) -> Option<MockPushPeer> {
        self.accept.recv().await
    }
}

/// Server end of one mock push connection.
pub struct MockPushPeer {
    pub uri: Url,
    received: mpsc::UnboundedReceiver<String>,
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl MockPushPeer {
    pub fn send(&self, frame: impl Into<String>) {
        let _ = self.sender.send(LinkEvent::Frame(frame.into()));
    }

    pub fn close(&self, reason: Option<&str>) {
        let _ = self.sender.send(LinkEvent::Closed(reason.map(str::to_string)));
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.received.recv().await
    }
}
