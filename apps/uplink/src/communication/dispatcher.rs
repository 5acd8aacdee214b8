//! Turns queued invocations into wire payloads and keeps at most one
//! client-to-server request outstanding.
//!
//! Plain requests stay queued until the server acknowledges them through the
//! `clientId` it expects next, and are re-sent if nothing answers within the
//! resend timeout. A bidirectional push connection reconnects by itself but
//! does not replay content, so the last pushed payload is kept in a single
//! slot until acknowledged.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use uplink_proto::{Invocation, UidlRequest};

use super::push::{ConnectionState, PushError};
use super::timer::Timer;
use super::tracker::TrackerError;
use crate::metrics;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncState {
    #[default]
    NotActive,
    SendToServer,
    WaitingForResponse,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingEntry {
    pub payload: UidlRequest,
    pub client_message_id: i64,
    pub server_sync_id_at_send: i64,
}

/// What the dispatcher needs from its siblings while sending.
pub trait DispatchContext {
    fn is_ui_running(&self) -> bool;

    fn has_active_request(&self) -> bool;

    /// Reconnecting was given up; sends wait for the network to come back.
    fn is_connection_lost(&self) -> bool;

    fn start_request(&mut self) -> Result<(), TrackerError>;

    /// `None` when push is disabled.
    fn push_state(&self) -> Option<ConnectionState>;

    fn is_push_bidirectional(&self) -> bool;

    fn push(&mut self, payload: &UidlRequest) -> Result<(), PushError>;

    fn post(&mut self, payload: &UidlRequest);

    fn take_invocations(&mut self) -> Vec<Invocation>;

    fn is_invocation_live(&self, invocation: &Invocation) -> bool;

    fn last_seen_server_sync_id(&self) -> i64;

    fn csrf_token(&self) -> Option<String>;
}

#[derive(Debug)]
pub struct MessageDispatcher {
    client_to_server_id: i64,
    resync: ResyncState,
    push_pending: Option<OutgoingEntry>,
    queue: VecDeque<OutgoingEntry>,
    resend_timer: Timer,
    resend_timeout: Duration,
}

impl MessageDispatcher {
    pub fn new(resend_timeout: Duration) -> Self {
        Self {
            client_to_server_id: 0,
            resync: ResyncState::NotActive,
            push_pending: None,
            queue: VecDeque::new(),
            resend_timer: Timer::default(),
            resend_timeout,
        }
    }

    pub fn client_to_server_id(&self) -> i64 {
        self.client_to_server_id
    }

    pub fn resync_state(&self) -> ResyncState {
        self.resync
    }

    /// The resynchronization response has arrived.
    pub fn resync_completed(&mut self) {
        self.resync = ResyncState::NotActive;
    }

    pub fn push_pending(&self) -> Option<&OutgoingEntry> {
        self.push_pending.as_ref()
    }

    pub fn queued(&self) -> impl Iterator<Item = &OutgoingEntry> {
        self.queue.iter()
    }

    pub fn has_queued_messages(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.resend_timer.deadline()
    }

    pub fn send_invocations<C: DispatchContext>(&mut self, ctx: &mut C, now: Instant) {
        if !ctx.is_ui_running() {
            tracing::warn!(
                target: "uplink::dispatcher",
                "trying to send RPC from not yet started or stopped application"
            );
            return;
        }
        if ctx.has_active_request() {
            tracing::trace!(target: "uplink::dispatcher", "request active, send postponed");
            return;
        }
        if ctx.is_connection_lost() {
            tracing::trace!(target: "uplink::dispatcher", "connection lost, send postponed");
            return;
        }
        if matches!(ctx.push_state(), Some(state) if state != ConnectionState::Connected) {
            tracing::trace!(target: "uplink::dispatcher", "push not connected, send postponed");
            return;
        }

        if let Some(entry) = self.push_pending.clone() {
            tracing::debug!(
                target: "uplink::dispatcher",
                client_id = entry.client_message_id,
                "re-sending unacknowledged push message"
            );
            if self.start_request(ctx) {
                self.transmit(entry.payload, ctx, now);
            }
            return;
        }

        if let Some(entry) = self.queue.front().cloned() {
            tracing::debug!(
                target: "uplink::dispatcher",
                client_id = entry.client_message_id,
                "sending queued message"
            );
            if self.start_request(ctx) {
                self.transmit(entry.payload, ctx, now);
            }
            return;
        }

        let invocations = ctx.take_invocations();
        let offered = invocations.len();
        let live: Vec<Invocation> = invocations
            .into_iter()
            .filter(|invocation| ctx.is_invocation_live(invocation))
            .collect();
        if offered > 0 && live.is_empty() {
            tracing::warn!(
                target: "uplink::dispatcher",
                offered,
                "all RPCs filtered out, not sending anything to the server"
            );
        }

        let resync = self.resync == ResyncState::SendToServer;
        if live.is_empty() && !resync {
            return;
        }

        let mut payload = UidlRequest::new(live);
        payload.csrf_token = ctx.csrf_token();
        if resync {
            tracing::info!(target: "uplink::dispatcher", "resynchronizing from server");
            metrics::RESYNCHRONIZATIONS.inc();
            self.resync = ResyncState::WaitingForResponse;
            self.queue.clear();
            self.resend_timer.cancel();
            payload.resynchronize = true;
        }

        if self.start_request(ctx) {
            self.transmit(payload, ctx, now);
        }
    }

    fn start_request<C: DispatchContext>(&self, ctx: &mut C) -> bool {
        match ctx.start_request() {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(target: "uplink::dispatcher", error = %err, "cannot send");
                false
            }
        }
    }

    /// Stamps and delivers a payload on the active channel. Also the entry
    /// point for recovery re-sends, which arrive already stamped with their
    /// client id and keep it.
    pub fn transmit<C: DispatchContext>(&mut self, mut payload: UidlRequest, ctx: &mut C, now: Instant) {
        let sync_id = ctx.last_seen_server_sync_id();
        payload.sync_id = Some(sync_id);
        let client_id = match payload.client_id {
            Some(id) => id,
            None => {
                let id = self.client_to_server_id;
                self.client_to_server_id += 1;
                payload.client_id = Some(id);
                id
            }
        };
        let entry = OutgoingEntry {
            payload,
            client_message_id: client_id,
            server_sync_id_at_send: sync_id,
        };

        if ctx.is_push_bidirectional() {
            tracing::debug!(target: "uplink::dispatcher", client_id, sync_id, "sending over push");
            metrics::REQUESTS_SENT.with_label_values(&["push", "uidl"]).inc();
            let result = ctx.push(&entry.payload);
            self.push_pending = Some(entry);
            if let Err(err) = result {
                tracing::error!(target: "uplink::dispatcher", error = %err, "push rejected payload");
            }
        } else {
            tracing::debug!(target: "uplink::dispatcher", client_id, sync_id, "sending over xhr");
            metrics::REQUESTS_SENT.with_label_values(&["xhr", "uidl"]).inc();
            ctx.post(&entry.payload);
            if !self.queue.iter().any(|e| e.client_message_id == client_id) {
                self.queue.push_back(entry);
            }
            self.resend_timer.schedule(now, self.resend_timeout);
        }
    }

    /// Reconciles with the client id the server expects next.
    pub fn set_client_to_server_message_id(&mut self, next_expected: i64, force: bool) {
        let local = self.client_to_server_id;
        if next_expected == local {
            if self
                .push_pending
                .as_ref()
                .is_some_and(|p| p.client_message_id < next_expected)
            {
                self.push_pending = None;
            }
            if self
                .queue
                .front()
                .is_some_and(|e| e.client_message_id == next_expected - 1)
            {
                self.queue.pop_front();
            }
            if self.queue.is_empty() {
                self.resend_timer.cancel();
            }
            return;
        }

        if force {
            tracing::debug!(
                target: "uplink::dispatcher",
                local,
                next_expected,
                "forced client id update"
            );
            self.client_to_server_id = next_expected;
            self.queue.clear();
            self.push_pending = None;
            self.resend_timer.cancel();
            return;
        }

        if next_expected > local {
            if local == 0 {
                tracing::debug!(
                    target: "uplink::dispatcher",
                    next_expected,
                    "adopting server's client id"
                );
            } else {
                tracing::warn!(
                    target: "uplink::dispatcher",
                    local,
                    next_expected,
                    "server expects a later client id than sent; adopting it"
                );
            }
            self.client_to_server_id = next_expected;
            self.queue.retain(|e| e.client_message_id >= next_expected);
            if self
                .push_pending
                .as_ref()
                .is_some_and(|p| p.client_message_id < next_expected)
            {
                self.push_pending = None;
            }
            if self.queue.is_empty() {
                self.resend_timer.cancel();
            }
        }
        // Lower: those messages are still on their way to the server.
    }

    /// Marks that a resynchronization must be sent. Returns whether one still
    /// needs to go out.
    pub fn request_resynchronize(&mut self) -> bool {
        match self.resync {
            ResyncState::NotActive => {
                tracing::info!(target: "uplink::dispatcher", "resynchronize from server requested");
                self.resync = ResyncState::SendToServer;
                true
            }
            ResyncState::SendToServer => true,
            ResyncState::WaitingForResponse => false,
        }
    }

    pub fn resynchronize<C: DispatchContext>(&mut self, ctx: &mut C, now: Instant) {
        if self.request_resynchronize() {
            self.send_invocations(ctx, now);
        }
    }

    pub fn handle_timeout<C: DispatchContext>(&mut self, ctx: &mut C, now: Instant) {
        if !self.resend_timer.fire(now) || !ctx.is_ui_running() || ctx.is_connection_lost() {
            return;
        }
        if ctx.has_active_request() {
            self.resend_timer.schedule(now, self.resend_timeout);
            return;
        }
        if let Some(entry) = self.queue.front().cloned() {
            tracing::warn!(
                target: "uplink::dispatcher",
                client_id = entry.client_message_id,
                "no response to message, re-sending"
            );
            if self.start_request(ctx) {
                self.transmit(entry.payload, ctx, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    struct FakeContext {
        running: bool,
        active: bool,
        lost: bool,
        push_state: Option<ConnectionState>,
        bidirectional: bool,
        pushed: Vec<String>,
        posted: Vec<UidlRequest>,
        invocations: Vec<Invocation>,
        dead_nodes: HashSet<i64>,
        last_seen: i64,
        csrf: Option<String>,
    }

    impl Default for FakeContext {
        fn default() -> Self {
            Self {
                running: true,
                active: false,
                lost: false,
                push_state: None,
                bidirectional: false,
                pushed: Vec::new(),
                posted: Vec::new(),
                invocations: Vec::new(),
                dead_nodes: HashSet::new(),
                last_seen: -1,
                csrf: None,
            }
        }
    }

    impl DispatchContext for FakeContext {
        fn is_ui_running(&self) -> bool {
            self.running
        }
        fn has_active_request(&self) -> bool {
            self.active
        }
        fn is_connection_lost(&self) -> bool {
            self.lost
        }
        fn start_request(&mut self) -> Result<(), TrackerError> {
            if self.active {
                return Err(TrackerError::AlreadyActive);
            }
            self.active = true;
            Ok(())
        }
        fn push_state(&self) -> Option<ConnectionState> {
            self.push_state
        }
        fn is_push_bidirectional(&self) -> bool {
            self.bidirectional
        }
        fn push(&mut self, payload: &UidlRequest) -> Result<(), PushError> {
            self.pushed.push(payload.to_json().unwrap());
            Ok(())
        }
        fn post(&mut self, payload: &UidlRequest) {
            self.posted.push(payload.clone());
        }
        fn take_invocations(&mut self) -> Vec<Invocation> {
            std::mem::take(&mut self.invocations)
        }
        fn is_invocation_live(&self, invocation: &Invocation) -> bool {
            invocation
                .node_id()
                .is_none_or(|node| !self.dead_nodes.contains(&node))
        }
        fn last_seen_server_sync_id(&self) -> i64 {
            self.last_seen
        }
        fn csrf_token(&self) -> Option<String> {
            self.csrf.clone()
        }
    }

    fn invocation(node: i64) -> Invocation {
        Invocation::from(json!({"node": node, "type": "event"}))
    }

    fn dispatcher() -> MessageDispatcher {
        MessageDispatcher::new(Duration::from_millis(5500))
    }

    #[test]
    fn nothing_is_sent_when_not_running_or_busy() {
        let now = Instant::now();
        let mut d = dispatcher();

        let mut ctx = FakeContext {
            running: false,
            invocations: vec![invocation(1)],
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);
        assert!(ctx.posted.is_empty());

        ctx.running = true;
        ctx.active = true;
        d.send_invocations(&mut ctx, now);
        assert!(ctx.posted.is_empty());

        ctx.active = false;
        ctx.push_state = Some(ConnectionState::ConnectPending);
        d.send_invocations(&mut ctx, now);
        assert!(ctx.posted.is_empty());
        assert_eq!(ctx.invocations.len(), 1, "invocations stay queued");
    }

    #[test]
    fn xhr_send_stamps_ids_and_arms_resend() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            invocations: vec![invocation(1), invocation(2)],
            last_seen: 4,
            csrf: Some("token".into()),
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);

        assert!(ctx.active);
        let sent = &ctx.posted[0];
        assert_eq!(sent.client_id, Some(0));
        assert_eq!(sent.sync_id, Some(4));
        assert_eq!(sent.csrf_token.as_deref(), Some("token"));
        assert_eq!(sent.rpc.len(), 2);
        assert_eq!(d.client_to_server_id(), 1);
        assert_eq!(d.queued().count(), 1);
        assert_eq!(d.deadline(), Some(now + Duration::from_millis(5500)));
    }

    #[test]
    fn acknowledgement_pops_queue_and_cancels_resend() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            invocations: vec![invocation(1)],
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);
        d.set_client_to_server_message_id(1, false);
        assert!(!d.has_queued_messages());
        assert_eq!(d.deadline(), None);
    }

    #[test]
    fn resend_timer_repeats_same_client_id() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            invocations: vec![invocation(1)],
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);

        let later = now + Duration::from_millis(5500);
        d.handle_timeout(&mut ctx, later);
        assert_eq!(ctx.posted.len(), 1, "request still active, only re-armed");
        assert_eq!(d.deadline(), Some(later + Duration::from_millis(5500)));

        ctx.active = false;
        let much_later = later + Duration::from_millis(5500);
        d.handle_timeout(&mut ctx, much_later);
        assert_eq!(ctx.posted.len(), 2);
        assert_eq!(ctx.posted[1].client_id, Some(0));
        assert_eq!(d.queued().count(), 1, "resend does not duplicate the entry");
        assert_eq!(d.client_to_server_id(), 1);
    }

    #[test]
    fn lost_connection_holds_sends_and_resends() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            invocations: vec![invocation(1)],
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);
        assert_eq!(ctx.posted.len(), 1);

        ctx.active = false;
        ctx.lost = true;
        ctx.invocations = vec![invocation(2)];
        d.send_invocations(&mut ctx, now);
        let expired = now + Duration::from_millis(5500);
        d.handle_timeout(&mut ctx, expired);
        assert_eq!(ctx.posted.len(), 1);
        assert!(!ctx.active);
        assert_eq!(d.deadline(), None, "no re-arm while the connection is lost");
        assert_eq!(ctx.invocations.len(), 1);

        ctx.lost = false;
        d.send_invocations(&mut ctx, expired);
        assert_eq!(ctx.posted.len(), 2);
        assert_eq!(ctx.posted[1].client_id, Some(0), "queued message goes first");
        assert_eq!(d.deadline(), Some(expired + Duration::from_millis(5500)));
    }

    #[test]
    fn push_pending_is_replayed_before_new_batch() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            push_state: Some(ConnectionState::Connected),
            bidirectional: true,
            invocations: vec![invocation(1)],
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);
        let first = ctx.pushed[0].clone();
        assert_eq!(d.push_pending().map(|p| p.client_message_id), Some(0));
        assert_eq!(d.deadline(), None, "push relies on the connection's own retry");

        // Connection dropped and came back; the request was abandoned.
        ctx.active = false;
        ctx.invocations = vec![invocation(2)];
        d.send_invocations(&mut ctx, now);

        assert_eq!(ctx.pushed.len(), 2);
        assert_eq!(ctx.pushed[1], first);
        assert_eq!(ctx.invocations.len(), 1, "new batch not built yet");

        d.set_client_to_server_message_id(1, false);
        assert!(d.push_pending().is_none());
    }

    #[test]
    fn server_ahead_is_adopted_and_behind_is_ignored() {
        let mut d = dispatcher();
        d.set_client_to_server_message_id(5, false);
        assert_eq!(d.client_to_server_id(), 5);
        d.set_client_to_server_message_id(3, false);
        assert_eq!(d.client_to_server_id(), 5);
        d.set_client_to_server_message_id(2, true);
        assert_eq!(d.client_to_server_id(), 2);
    }

    #[test]
    fn forced_update_drops_queue() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            invocations: vec![invocation(1)],
            ..FakeContext::default()
        };
        d.send_invocations(&mut ctx, now);
        d.set_client_to_server_message_id(7, true);
        assert!(!d.has_queued_messages());
        assert_eq!(d.deadline(), None);
    }

    #[test]
    fn resynchronize_sends_flagged_empty_payload() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext::default();
        d.resynchronize(&mut ctx, now);

        assert_eq!(ctx.posted.len(), 1);
        assert!(ctx.posted[0].resynchronize);
        assert!(ctx.posted[0].rpc.is_empty());
        assert_eq!(d.resync_state(), ResyncState::WaitingForResponse);
        assert!(!d.request_resynchronize());

        d.resync_completed();
        assert!(d.request_resynchronize());
        assert!(d.request_resynchronize());
        assert_eq!(d.resync_state(), ResyncState::SendToServer);
    }

    #[test]
    fn stale_invocations_are_filtered() {
        let now = Instant::now();
        let mut d = dispatcher();
        let mut ctx = FakeContext {
            invocations: vec![invocation(9)],
            ..FakeContext::default()
        };
        ctx.dead_nodes.insert(9);
        d.send_invocations(&mut ctx, now);
        assert!(ctx.posted.is_empty());
        assert!(!ctx.active);
    }
}
