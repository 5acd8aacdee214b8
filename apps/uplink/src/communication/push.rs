//! Lifecycle of the single push connection.
//!
//! ```text
//! ConnectPending ──open──▶ Connected ──disconnect──▶ Disconnected
//!       │    ▲                 │
//!       │    └──reconnecting───┘
//!       └──disconnect──▶ DisconnectPending ──open──▶ (Connected ▶ Disconnected)
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use url::Url;
use uplink_proto::params::RequestType;
use uplink_proto::{DecodedMessage, Fragmenter, MessageDecoder, UidlRequest};

use super::{Io, Signal, Transmit};
use crate::config::PushOptions;
use crate::metrics;
use crate::transport::TransportKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    ConnectPending,
    Connected,
    DisconnectPending,
    Disconnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("push connection in unexpected state {0:?}")]
    InvalidState(ConnectionState),
    #[error("push connection already disconnecting or disconnected ({0:?})")]
    AlreadyDisconnected(ConnectionState),
    #[error("push connection is not bidirectional")]
    NotBidirectional,
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error("invalid push url: {0}")]
    Url(String),
}

/// Runs once the connection is really closed. Receives the io buffer so it
/// can queue follow-up work.
pub type DisconnectCallback = Box<dyn FnOnce(&mut Io) + Send>;

pub struct PushConnection {
    state: ConnectionState,
    transport: Option<TransportKind>,
    options: PushOptions,
    always_xhr_to_server: bool,
    uri: Option<Url>,
    pending_disconnect: Option<DisconnectCallback>,
    decoder: MessageDecoder,
}

impl fmt::Debug for PushConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushConnection")
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("uri", &self.uri.as_ref().map(Url::as_str))
            .field("pending_disconnect", &self.pending_disconnect.is_some())
            .finish()
    }
}

impl PushConnection {
    pub fn new(options: PushOptions, always_xhr_to_server: bool) -> Self {
        let decoder = MessageDecoder::new(options.track_message_length, options.enable_protocol);
        Self {
            state: ConnectionState::ConnectPending,
            transport: None,
            options,
            always_xhr_to_server,
            uri: None,
            pending_disconnect: None,
            decoder,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transport(&self) -> Option<TransportKind> {
        self.transport
    }

    pub fn uri(&self) -> Option<&Url> {
        self.uri.as_ref()
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::ConnectPending | ConnectionState::Connected
        )
    }

    /// Opens the connection to `service_url` with the push request type, the
    /// UI id and, once known, the push id.
    pub fn connect(
        &mut self,
        service_url: &str,
        ui_id: u32,
        push_id: Option<&str>,
        io: &mut Io,
    ) -> Result<(), PushError> {
        let uri = uplink_proto::service_url(service_url, RequestType::Push, Some(ui_id), push_id)
            .map_err(|err| PushError::Url(err.to_string()))?;
        tracing::info!(
            target: "uplink::push",
            uri = %uri,
            transport = %self.options.transport,
            "establishing push connection"
        );
        self.state = ConnectionState::ConnectPending;
        self.decoder.reset();
        self.uri = Some(uri.clone());
        io.transmit(Transmit::PushConnect {
            uri,
            options: self.options.clone(),
        });
        Ok(())
    }

    pub fn on_open(&mut self, transport: TransportKind, io: &mut Io) -> Result<(), PushError> {
        tracing::info!(target: "uplink::push", %transport, "push connection established");
        self.on_connect(transport, io)
    }

    pub fn on_reopen(&mut self, transport: TransportKind, io: &mut Io) -> Result<(), PushError> {
        tracing::info!(target: "uplink::push", %transport, "push connection re-established");
        self.on_connect(transport, io)
    }

    fn on_connect(&mut self, transport: TransportKind, io: &mut Io) -> Result<(), PushError> {
        self.transport = Some(transport);
        match self.state {
            ConnectionState::ConnectPending => {
                self.state = ConnectionState::Connected;
                io.signal(Signal::PushOk);
                Ok(())
            }
            ConnectionState::DisconnectPending => {
                // Connected first so the pending disconnect tears down for real.
                self.state = ConnectionState::Connected;
                match self.pending_disconnect.take() {
                    Some(on_done) => self.disconnect(on_done, io),
                    None => self.disconnect(Box::new(|_: &mut Io| {}), io),
                }
            }
            ConnectionState::Connected => {
                tracing::debug!(target: "uplink::push", "ignoring duplicate open");
                Ok(())
            }
            ConnectionState::Disconnected => Err(PushError::InvalidState(self.state)),
        }
    }

    /// Closes the connection. A connect still in progress finishes first and
    /// the close happens from its open callback.
    pub fn disconnect(&mut self, on_done: DisconnectCallback, io: &mut Io) -> Result<(), PushError> {
        match self.state {
            ConnectionState::ConnectPending => {
                tracing::debug!(target: "uplink::push", "disconnect deferred until connected");
                self.state = ConnectionState::DisconnectPending;
                self.pending_disconnect = Some(on_done);
                Ok(())
            }
            ConnectionState::Connected => {
                tracing::info!(target: "uplink::push", "closing push connection");
                io.transmit(Transmit::PushDisconnect);
                self.state = ConnectionState::Disconnected;
                on_done(io);
                Ok(())
            }
            state => Err(PushError::AlreadyDisconnected(state)),
        }
    }

    /// Whether client-to-server traffic may use this connection. Optimistic
    /// while the first connect is pending.
    pub fn is_bidirectional(&self) -> bool {
        if self.always_xhr_to_server {
            return false;
        }
        match self.state {
            ConnectionState::ConnectPending => true,
            ConnectionState::Connected => self.transport.is_some_and(TransportKind::is_full_duplex),
            _ => false,
        }
    }

    pub fn push(&mut self, payload: &UidlRequest, io: &mut Io) -> Result<(), PushError> {
        if !self.is_bidirectional() {
            return Err(PushError::NotBidirectional);
        }
        match self.state {
            ConnectionState::ConnectPending => {
                io.signal(Signal::PushNotConnected(payload.clone()));
                Ok(())
            }
            ConnectionState::Connected => {
                let json = payload
                    .to_json()
                    .map_err(|err| PushError::Encode(err.to_string()))?;
                tracing::trace!(target: "uplink::push", bytes = json.len(), "pushing message");
                if self.transport.is_some_and(TransportKind::is_frame_limited) {
                    for frame in Fragmenter::with_budget(&json, self.options.fragment_size) {
                        metrics::PUSH_FRAMES.with_label_values(&["sent"]).inc();
                        io.transmit(Transmit::PushFrame { frame });
                    }
                } else {
                    metrics::PUSH_FRAMES.with_label_values(&["sent"]).inc();
                    io.transmit(Transmit::PushFrame { frame: json });
                }
                Ok(())
            }
            state => Err(PushError::InvalidState(state)),
        }
    }

    pub fn on_message(&mut self, frame: &str, io: &mut Io) {
        metrics::PUSH_FRAMES.with_label_values(&["received"]).inc();
        let decoded = match self.decoder.ingest(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(target: "uplink::push", error = %err, "undecodable push frame");
                io.signal(Signal::PushInvalidContent(frame.to_string()));
                return;
            }
        };
        for message in decoded {
            match message {
                DecodedMessage::Handshake(handshake) => {
                    tracing::debug!(
                        target: "uplink::push",
                        tracking_id = %handshake.tracking_id,
                        "push handshake"
                    );
                }
                DecodedMessage::KeepAlive => {
                    tracing::trace!(target: "uplink::push", "push keep-alive");
                }
                DecodedMessage::Message(body) => match uplink_proto::parse_wrapped(&body) {
                    Ok(message) => io.signal(Signal::PushMessage(Box::new(message))),
                    Err(err) => {
                        tracing::error!(
                            target: "uplink::push",
                            error = %err,
                            "got invalid json from server"
                        );
                        io.signal(Signal::PushInvalidContent(body));
                    }
                },
            }
        }
    }

    pub fn on_error(&mut self, reason: &str, io: &mut Io) {
        tracing::error!(target: "uplink::push", reason, "push connection failed");
        self.state = ConnectionState::Disconnected;
        io.signal(Signal::PushError {
            transport: self.transport,
        });
    }

    pub fn on_close(&mut self, io: &mut Io) {
        if self.state == ConnectionState::Disconnected {
            tracing::debug!(target: "uplink::push", "close after disconnect");
            return;
        }
        self.state = ConnectionState::ConnectPending;
        io.signal(Signal::PushClosed);
    }

    pub fn on_client_timeout(&mut self, io: &mut Io) {
        self.state = ConnectionState::Disconnected;
        io.signal(Signal::PushClientTimeout);
    }

    pub fn on_reconnecting(&mut self, io: &mut Io) {
        if self.state == ConnectionState::Connected {
            tracing::info!(target: "uplink::push", "push connection lost, reconnecting");
            self.state = ConnectionState::ConnectPending;
            io.signal(Signal::PushReconnectPending);
        }
    }
}
