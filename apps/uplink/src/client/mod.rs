//! The client as one sans-IO state machine.
//!
//! [`Client`] owns every communication component and wires them together.
//! Callers feed it inputs (invocations, responses, transport events, time)
//! and drain its outputs with [`Client::poll_transmit`] and
//! [`Client::poll_event`]. Nothing here blocks or spawns.
//!
//! Each input call is one turn: component signals are handled in order, then
//! deferred tasks run until both queues are empty. `add_invocation` and
//! `flush` only queue work; the turn they belong to ends with
//! [`Client::end_turn`], so everything added before it goes out as one batch.

mod host;

use std::time::Instant;

use thiserror::Error;
use uplink_proto::{Invocation, ProtoError, RequestType, UidlMessage};

use crate::communication::arbitrator::FailureArbitrator;
use crate::communication::dispatcher::MessageDispatcher;
use crate::communication::heartbeat::{Heartbeat, HeartbeatOutcome};
use crate::communication::outbox::RpcOutbox;
use crate::communication::push::{ConnectionState, PushConnection};
use crate::communication::sequencer::{LockToken, ResponseSequencer};
use crate::communication::timer::earliest;
use crate::communication::tracker::RequestTracker;
use crate::communication::xhr::{XhrConnection, XhrOutcome};
use crate::communication::{Deferred, Io, RequestId, RequestIds, Signal, Transmit};
use crate::config::{ClientConfig, ConfigError};
use crate::event::ClientEvent;
use crate::lifecycle::{ConnectionIndicator, UiLifecycle, UiState};
use crate::transport::{HttpResponse, TransportError, TransportEvent};
use crate::tree::StateTree;

use host::{more_to_send, DispatchHost, RecoveryView, SequencerHost};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

pub struct Client {
    config: ClientConfig,
    lifecycle: UiLifecycle,
    indicator: ConnectionIndicator,
    csrf_token: Option<String>,
    push_id: Option<String>,
    ids: RequestIds,
    outbox: RpcOutbox,
    tracker: RequestTracker,
    dispatcher: MessageDispatcher,
    sequencer: ResponseSequencer,
    arbitrator: FailureArbitrator,
    heartbeat: Heartbeat,
    xhr: XhrConnection,
    push: Option<PushConnection>,
    tree: Box<dyn StateTree>,
    io: Io,
}

impl Client {
    pub fn new(config: ClientConfig, tree: Box<dyn StateTree>) -> Result<Self, ClientError> {
        config.validate()?;
        let ui_id = Some(config.ui_id);
        let uidl_uri = uplink_proto::service_url(&config.service_url, RequestType::Uidl, ui_id, None)?;
        let heartbeat_uri = uplink_proto::service_url(&config.service_url, RequestType::Heartbeat, ui_id, None)?;

        Ok(Self {
            lifecycle: UiLifecycle::default(),
            indicator: ConnectionIndicator::Connected,
            csrf_token: None,
            push_id: None,
            ids: RequestIds::default(),
            outbox: RpcOutbox::default(),
            tracker: RequestTracker::default(),
            dispatcher: MessageDispatcher::new(config.resend_timeout()),
            sequencer: ResponseSequencer::new(config.max_message_suspend_timeout),
            arbitrator: FailureArbitrator::new(config.reconnect.clone()),
            heartbeat: Heartbeat::new(heartbeat_uri, config.heartbeat_interval),
            xhr: XhrConnection::new(uidl_uri),
            push: None,
            tree,
            io: Io::default(),
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> UiState {
        self.lifecycle.state()
    }

    pub fn indicator(&self) -> ConnectionIndicator {
        self.indicator
    }

    pub fn last_seen_server_sync_id(&self) -> i64 {
        self.sequencer.last_seen_server_sync_id()
    }

    pub fn client_to_server_id(&self) -> i64 {
        self.dispatcher.client_to_server_id()
    }

    pub fn push_id(&self) -> Option<&str> {
        self.push_id.as_deref()
    }

    pub fn has_active_request(&self) -> bool {
        self.tracker.has_active_request()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.arbitrator.is_reconnecting()
    }

    pub fn push_connection(&self) -> Option<&PushConnection> {
        self.push.as_ref()
    }

    /// Applies the bootstrap message, if any, then opens push when enabled
    /// and starts the heartbeat.
    pub fn start(&mut self, initial: Option<UidlMessage>, now: Instant) {
        if self.lifecycle.state() != UiState::Initializing {
            tracing::warn!(target: "uplink::client", state = ?self.lifecycle.state(), "client already started");
            return;
        }
        tracing::info!(
            target: "uplink::client",
            service_url = %self.config.service_url,
            ui_id = self.config.ui_id,
            push = self.config.push_enabled,
            "starting client"
        );
        if let Some(message) = initial {
            self.receive_message(message, now);
            self.settle(now);
        }
        if self.config.push_enabled {
            self.set_push_enabled(true, now);
        }
        self.heartbeat.schedule(now);
        self.settle(now);
    }

    pub fn set_push_enabled(&mut self, enabled: bool, now: Instant) {
        if enabled && self.push.as_ref().is_none_or(|p| !p.is_active()) {
            let mut push = PushConnection::new(self.config.push.clone(), self.config.always_xhr_to_server);
            let connected = push.connect(
                &self.config.service_url,
                self.config.ui_id,
                self.push_id.as_deref(),
                &mut self.io,
            );
            match connected {
                Ok(()) => self.push = Some(push),
                Err(err) => {
                    tracing::error!(target: "uplink::client", error = %err, "cannot open push connection")
                }
            }
        } else if !enabled {
            if let Some(push) = self.push.as_mut().filter(|p| p.is_active()) {
                let done = Box::new(|io: &mut Io| io.signal(Signal::PushDisconnected));
                if let Err(err) = push.disconnect(done, &mut self.io) {
                    tracing::error!(target: "uplink::client", error = %err, "push disconnect failed");
                }
            }
        }
        self.settle(now);
    }

    pub fn add_invocation(&mut self, invocation: Invocation) {
        self.outbox.add(invocation, self.lifecycle.is_running());
    }

    /// Schedules everything queued so far to be sent when the turn ends.
    pub fn flush(&mut self) {
        self.outbox.flush(&mut self.io);
    }

    /// Runs the work deferred during the current turn.
    pub fn end_turn(&mut self, now: Instant) {
        self.settle(now);
    }

    pub fn handle_response(
        &mut self,
        request_id: RequestId,
        result: Result<HttpResponse, TransportError>,
        now: Instant,
    ) {
        if self.heartbeat.owns(request_id) {
            let outcome = self.heartbeat.on_response(request_id, result, now);
            let view = self.recovery_view();
            match outcome {
                Some(HeartbeatOutcome::Ok) => self.arbitrator.heartbeat_ok(&mut self.io),
                Some(HeartbeatOutcome::InvalidStatus(status)) => {
                    self.arbitrator
                        .heartbeat_invalid_status(status, &view, now, &mut self.io)
                }
                Some(HeartbeatOutcome::Error(_)) => self.arbitrator.heartbeat_error(&view, now, &mut self.io),
                None => {}
            }
        } else if self.xhr.owns(request_id) {
            let outcome = self.xhr.on_response(request_id, result);
            let view = self.recovery_view();
            match outcome {
                Some(XhrOutcome::Ok(message)) => {
                    self.arbitrator.xhr_ok(&mut self.io);
                    self.receive_message(*message, now);
                }
                Some(XhrOutcome::NetworkError { payload, .. }) => {
                    self.arbitrator.xhr_error(payload, &view, now, &mut self.io)
                }
                Some(XhrOutcome::InvalidStatus { status, payload }) => {
                    self.arbitrator
                        .xhr_invalid_status(status, payload, &view, now, &mut self.io)
                }
                Some(XhrOutcome::InvalidContent { body, .. }) => {
                    self.arbitrator.xhr_invalid_content(&body, &mut self.io)
                }
                None => {}
            }
        } else {
            tracing::debug!(
                target: "uplink::client",
                request_id = request_id.0,
                "response for a superseded request"
            );
        }
        self.settle(now);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        let Some(push) = self.push.as_mut() else {
            tracing::debug!(target: "uplink::client", ?event, "transport event without push connection");
            return;
        };
        let io = &mut self.io;
        let result = match event {
            TransportEvent::Opened(kind) => push.on_open(kind, io),
            TransportEvent::Reopened(kind) => push.on_reopen(kind, io),
            TransportEvent::Message(frame) => {
                push.on_message(&frame, io);
                Ok(())
            }
            TransportEvent::Reconnecting => {
                push.on_reconnecting(io);
                Ok(())
            }
            TransportEvent::Closed => {
                push.on_close(io);
                Ok(())
            }
            TransportEvent::Error(reason) => {
                push.on_error(&reason, io);
                Ok(())
            }
            TransportEvent::ClientTimeout => {
                push.on_client_timeout(io);
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::error!(target: "uplink::client", error = %err, "push state violation");
        }
        self.settle(now);
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.with_dispatch(now, |dispatcher, host| dispatcher.handle_timeout(host, now));
        self.with_sequencer(|sequencer, host| sequencer.handle_timeout(host, now));
        let view = self.recovery_view();
        self.arbitrator.handle_timeout(&view, now, &mut self.io);
        self.heartbeat.handle_timeout(&mut self.ids, now, &mut self.io);
        self.xhr.handle_timeout(now, &mut self.io);
        self.settle(now);
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        earliest([
            self.dispatcher.deadline(),
            self.sequencer.deadline(),
            self.arbitrator.poll_timeout(),
            self.heartbeat.deadline(),
            self.xhr.deadline(),
        ])
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.io.poll_transmit()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.io.poll_event()
    }

    pub fn suspend_response_handling(&mut self) -> LockToken {
        let token = LockToken::new();
        self.sequencer.suspend_response_handling(token);
        token
    }

    pub fn resume_response_handling(&mut self, token: LockToken, now: Instant) {
        self.with_sequencer(|sequencer, host| sequencer.resume_response_handling(token, host, now));
        self.settle(now);
    }

    pub fn online(&mut self, now: Instant) {
        let view = self.recovery_view();
        self.arbitrator.online(&view, now, &mut self.io);
        self.settle(now);
    }

    pub fn offline(&mut self, now: Instant) {
        let view = self.recovery_view();
        self.arbitrator.offline(&view, &mut self.io);
        self.settle(now);
    }

    pub fn before_unload(&mut self) {
        self.xhr.before_unload();
    }

    pub fn terminate(&mut self, now: Instant) {
        self.set_state(UiState::Terminated);
        self.settle(now);
    }

    fn recovery_view(&self) -> RecoveryView {
        RecoveryView {
            running: self.lifecycle.is_running(),
            active: self.tracker.has_active_request(),
            bidirectional: self.push.as_ref().is_some_and(PushConnection::is_bidirectional),
        }
    }

    fn with_dispatch<R>(
        &mut self,
        now: Instant,
        f: impl FnOnce(&mut MessageDispatcher, &mut DispatchHost<'_>) -> R,
    ) -> R {
        let Self {
            dispatcher,
            lifecycle,
            tracker,
            push,
            xhr,
            ids,
            outbox,
            tree,
            sequencer,
            arbitrator,
            csrf_token,
            io,
            ..
        } = self;
        let mut host = DispatchHost {
            lifecycle,
            tracker,
            connection_lost: arbitrator.has_given_up(),
            push,
            xhr,
            ids,
            outbox,
            tree: &**tree,
            last_seen: sequencer.last_seen_server_sync_id(),
            csrf_token: csrf_token.as_deref(),
            now,
            io,
        };
        f(dispatcher, &mut host)
    }

    fn with_sequencer<R>(&mut self, f: impl FnOnce(&mut ResponseSequencer, &mut SequencerHost<'_>) -> R) -> R {
        let Self {
            sequencer,
            dispatcher,
            tracker,
            outbox,
            lifecycle,
            tree,
            csrf_token,
            push_id,
            io,
            ..
        } = self;
        let mut host = SequencerHost {
            dispatcher,
            tracker,
            outbox,
            lifecycle,
            tree,
            csrf_token,
            push_id,
            io,
        };
        f(sequencer, &mut host)
    }

    fn receive_message(&mut self, message: UidlMessage, now: Instant) {
        if message.sync_id.is_none() && !message.session_expired() {
            tracing::error!(
                target: "uplink::client",
                "response didn't contain a server id, verify the server is up to date"
            );
        }
        match self.lifecycle.state() {
            UiState::Initializing => self.set_state(UiState::Running),
            UiState::Running => {}
            UiState::Terminated => {
                tracing::warn!(
                    target: "uplink::client",
                    "ignoring received message because the application has been stopped"
                );
                return;
            }
        }
        self.with_sequencer(|sequencer, host| sequencer.handle_message(message, host, now));
    }

    fn set_state(&mut self, next: UiState) {
        if !self.lifecycle.set_state(next) {
            return;
        }
        self.io.event(ClientEvent::Lifecycle { state: next });
        if next != UiState::Terminated {
            return;
        }
        tracing::info!(target: "uplink::client", "application stopped");
        if let Some(push) = self.push.as_mut().filter(|p| p.is_active()) {
            let done = Box::new(|io: &mut Io| io.signal(Signal::PushDisconnected));
            if let Err(err) = push.disconnect(done, &mut self.io) {
                tracing::error!(target: "uplink::client", error = %err, "push disconnect failed");
            }
        }
        let view = self.recovery_view();
        self.arbitrator.on_terminated(&view, &mut self.io);
        self.heartbeat.stop();
        self.outbox.clear();
    }

    fn set_indicator(&mut self, next: ConnectionIndicator) {
        // Loading never hides a connection problem.
        if next == ConnectionIndicator::Loading
            && matches!(
                self.indicator,
                ConnectionIndicator::Reconnecting | ConnectionIndicator::ConnectionLost
            )
        {
            return;
        }
        if self.indicator != next {
            self.indicator = next;
            self.io.event(ClientEvent::Indicator { indicator: next });
        }
    }

    fn end_request(&mut self) {
        let more = more_to_send(&self.dispatcher, &self.outbox, &self.lifecycle);
        self.tracker.end_request(more, &mut self.io);
    }

    fn send_invocations(&mut self, now: Instant) {
        self.with_dispatch(now, |dispatcher, host| dispatcher.send_invocations(host, now));
    }

    fn settle(&mut self, now: Instant) {
        loop {
            if let Some(signal) = self.io.poll_signal() {
                self.on_signal(signal, now);
            } else if let Some(task) = self.io.poll_deferred() {
                self.on_deferred(task, now);
            } else {
                break;
            }
        }
    }

    fn on_signal(&mut self, signal: Signal, now: Instant) {
        tracing::trace!(target: "uplink::client", ?signal, "signal");
        let view = self.recovery_view();
        match signal {
            Signal::PushOk => {
                self.arbitrator.push_ok(&view, &mut self.io);
                self.io.defer(Deferred::SendInvocations);
            }
            Signal::PushNotConnected(payload) => {
                self.arbitrator
                    .push_not_connected(payload, &view, now, &mut self.io)
            }
            Signal::PushReconnectPending => self.arbitrator.push_reconnect_pending(&view, now, &mut self.io),
            Signal::PushError { transport } => {
                self.arbitrator.push_error(transport, &mut self.io);
                self.fall_back_to_xhr();
            }
            Signal::PushClientTimeout => {
                self.arbitrator.push_client_timeout(&mut self.io);
                self.fall_back_to_xhr();
            }
            Signal::PushClosed => self.arbitrator.push_closed(),
            Signal::PushInvalidContent(body) => {
                self.arbitrator
                    .push_invalid_content(&body, &view, &mut self.io)
            }
            Signal::PushMessage(message) => self.receive_message(*message, now),
            Signal::PushDisconnected => {
                tracing::debug!(target: "uplink::client", "push connection closed for good");
                self.drop_push();
            }
            Signal::Resend(payload) => {
                if !self.lifecycle.is_running() {
                    tracing::warn!(
                        target: "uplink::client",
                        "trying to reconnect after application has been stopped"
                    );
                    return;
                }
                if !self.tracker.has_active_request() {
                    if let Err(err) = self.tracker.start_request(&mut self.io) {
                        tracing::error!(target: "uplink::client", error = %err, "cannot resend");
                        return;
                    }
                }
                self.with_dispatch(now, |dispatcher, host| dispatcher.transmit(payload, host, now));
            }
            Signal::HeartbeatProbe => self.heartbeat.send(&mut self.ids, &mut self.io),
            Signal::EndRequest => self.end_request(),
            Signal::PauseHeartbeat => self.heartbeat.pause(),
            Signal::ResumeHeartbeat => self.heartbeat.resume(now),
            Signal::Indicator(indicator) => self.set_indicator(indicator),
            Signal::Terminate => self.set_state(UiState::Terminated),
        }
    }

    /// A push connection that failed for good is dropped; requests continue
    /// over xhr.
    fn fall_back_to_xhr(&mut self) {
        if self.push.as_ref().is_none_or(|p| p.state() != ConnectionState::Disconnected) {
            return;
        }
        tracing::warn!(target: "uplink::client", "push connection failed, falling back to xhr");
        let abandoned = self.dispatcher.push_pending().is_some() && self.tracker.has_active_request();
        self.io.transmit(Transmit::PushDisconnect);
        self.drop_push();
        if abandoned {
            self.end_request();
        }
    }

    fn drop_push(&mut self) {
        self.push = None;
        if self.lifecycle.is_running() {
            self.io.defer(Deferred::SendInvocations);
        }
    }

    fn on_deferred(&mut self, task: Deferred, now: Instant) {
        match task {
            Deferred::FlushOutbox => {
                if self.outbox.take_scheduled_flush() {
                    self.send_invocations(now);
                }
            }
            Deferred::SendInvocations => self.send_invocations(now),
            Deferred::AfterServerUpdate(nodes) => {
                for node in nodes {
                    if self.tree.is_node_registered(node) {
                        self.tree.after_server_update(node);
                    }
                }
            }
            Deferred::ResponseHandlingEnded => {
                if !self.tracker.has_active_request()
                    && !self.arbitrator.is_reconnecting()
                    && !self.arbitrator.has_given_up()
                {
                    self.set_indicator(ConnectionIndicator::Connected);
                }
            }
        }
    }
}
