//! Split borrows of [`Client`](super::Client) handed to components that
//! need to reach their siblings while they run.

use std::time::Instant;

use uplink_proto::constants::CSRF_TOKEN_DEFAULT_VALUE;
use uplink_proto::{Invocation, UidlMessage, UidlRequest};

use crate::communication::arbitrator::RecoveryContext;
use crate::communication::dispatcher::{DispatchContext, MessageDispatcher, ResyncState};
use crate::communication::outbox::RpcOutbox;
use crate::communication::push::{ConnectionState, PushConnection, PushError};
use crate::communication::sequencer::{Applied, SequencerContext};
use crate::communication::tracker::{RequestTracker, TrackerError};
use crate::communication::xhr::XhrConnection;
use crate::communication::{Deferred, Io, RequestIds, Signal};
use crate::event::ClientEvent;
use crate::lifecycle::UiLifecycle;
use crate::tree::StateTree;

/// Whether ending the active request should immediately try another send.
pub(super) fn more_to_send(dispatcher: &MessageDispatcher, outbox: &RpcOutbox, lifecycle: &UiLifecycle) -> bool {
    dispatcher.has_queued_messages()
        || dispatcher.resync_state() == ResyncState::SendToServer
        || (lifecycle.is_running() && outbox.is_flush_pending())
}

#[derive(Clone, Copy, Debug)]
pub(super) struct RecoveryView {
    pub running: bool,
    pub active: bool,
    pub bidirectional: bool,
}

impl RecoveryContext for RecoveryView {
    fn is_ui_running(&self) -> bool {
        self.running
    }

    fn has_active_request(&self) -> bool {
        self.active
    }

    fn is_push_bidirectional(&self) -> bool {
        self.bidirectional
    }
}

pub(super) struct DispatchHost<'a> {
    pub lifecycle: &'a UiLifecycle,
    pub tracker: &'a mut RequestTracker,
    pub connection_lost: bool,
    pub push: &'a mut Option<PushConnection>,
    pub xhr: &'a mut XhrConnection,
    pub ids: &'a mut RequestIds,
    pub outbox: &'a mut RpcOutbox,
    pub tree: &'a dyn StateTree,
    pub last_seen: i64,
    pub csrf_token: Option<&'a str>,
    pub now: Instant,
    pub io: &'a mut Io,
}

impl DispatchContext for DispatchHost<'_> {
    fn is_ui_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    fn has_active_request(&self) -> bool {
        self.tracker.has_active_request()
    }

    fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }

    fn start_request(&mut self) -> Result<(), TrackerError> {
        self.tracker.start_request(self.io)
    }

    fn push_state(&self) -> Option<ConnectionState> {
        self.push.as_ref().map(PushConnection::state)
    }

    fn is_push_bidirectional(&self) -> bool {
        self.push.as_ref().is_some_and(PushConnection::is_bidirectional)
    }

    fn push(&mut self, payload: &UidlRequest) -> Result<(), PushError> {
        match self.push.as_mut() {
            Some(push) => push.push(payload, self.io),
            None => Err(PushError::NotBidirectional),
        }
    }

    fn post(&mut self, payload: &UidlRequest) {
        if let Err(err) = self.xhr.send(payload, self.ids, self.now, self.io) {
            tracing::error!(target: "uplink::client", error = %err, "failed to encode request");
        }
    }

    fn take_invocations(&mut self) -> Vec<Invocation> {
        self.outbox.take_all()
    }

    fn is_invocation_live(&self, invocation: &Invocation) -> bool {
        invocation
            .node_id()
            .is_none_or(|node| self.tree.is_node_registered(node))
    }

    fn last_seen_server_sync_id(&self) -> i64 {
        self.last_seen
    }

    fn csrf_token(&self) -> Option<String> {
        self.csrf_token
            .filter(|token| *token != CSRF_TOKEN_DEFAULT_VALUE)
            .map(str::to_string)
    }
}

pub(super) struct SequencerHost<'a> {
    pub dispatcher: &'a mut MessageDispatcher,
    pub tracker: &'a mut RequestTracker,
    pub outbox: &'a RpcOutbox,
    pub lifecycle: &'a UiLifecycle,
    pub tree: &'a mut Box<dyn StateTree>,
    pub csrf_token: &'a mut Option<String>,
    pub push_id: &'a mut Option<String>,
    pub io: &'a mut Io,
}

impl SequencerContext for SequencerHost<'_> {
    fn resync_state(&self) -> ResyncState {
        self.dispatcher.resync_state()
    }

    fn resync_completed(&mut self) {
        self.dispatcher.resync_completed();
    }

    fn set_client_to_server_message_id(&mut self, next_expected: i64, force: bool) {
        self.dispatcher.set_client_to_server_message_id(next_expected, force);
    }

    fn has_active_request(&self) -> bool {
        self.tracker.has_active_request()
    }

    fn end_request(&mut self) {
        let more = more_to_send(self.dispatcher, self.outbox, self.lifecycle);
        self.tracker.end_request(more, self.io);
    }

    fn apply(&mut self, message: &UidlMessage) -> Applied {
        if !self.lifecycle.is_running() {
            tracing::warn!(
                target: "uplink::client",
                "ignoring message because the application has been stopped"
            );
            return Applied::Halt;
        }

        if let Some(redirect) = &message.redirect {
            tracing::info!(target: "uplink::client", url = ?redirect.url, "redirecting");
            self.io.event(ClientEvent::Redirect {
                url: redirect.url.clone(),
            });
            self.io.signal(Signal::Terminate);
            return Applied::Halt;
        }

        if let Some(token) = &message.security_key {
            *self.csrf_token = Some(token.clone());
        }
        if let Some(push_id) = &message.push_id {
            *self.push_id = Some(push_id.clone());
        }

        if let Some(constants) = &message.constants {
            self.tree.import_constants(constants);
        }
        if let Some(changes) = &message.changes {
            let touched = self.tree.process_changes(changes);
            tracing::debug!(
                target: "uplink::client",
                changes = changes.len(),
                touched = touched.len(),
                "applied state tree changes"
            );
            if !touched.is_empty() {
                self.io.defer(Deferred::AfterServerUpdate(touched));
            }
        }
        if let Some(commands) = &message.execute {
            self.io.event(ClientEvent::Execute {
                commands: commands.clone(),
            });
        }
        if let Some(timings) = &message.timings {
            tracing::trace!(target: "uplink::client", %timings, "server timings");
        }

        if message.session_expired() {
            self.io.event(ClientEvent::SessionExpired);
            self.io.signal(Signal::Terminate);
            return Applied::Halt;
        }
        if let Some(error) = message.app_error() {
            self.io.event(ClientEvent::UnrecoverableError {
                caption: error.caption.clone(),
                message: error.message.clone(),
                details: error.details.clone(),
                url: error.url.clone(),
            });
            self.io.signal(Signal::Terminate);
            return Applied::Halt;
        }
        Applied::Continue
    }

    fn resynchronize(&mut self) {
        if self.dispatcher.request_resynchronize() {
            self.io.defer(Deferred::SendInvocations);
        }
    }

    fn reload(&mut self) {
        self.io.event(ClientEvent::Reload);
        self.io.signal(Signal::Terminate);
    }
}
