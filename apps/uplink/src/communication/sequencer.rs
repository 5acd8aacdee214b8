use std::collections::HashSet;
use std::time::{Duration, Instant};

use uplink_proto::UidlMessage;
use uuid::Uuid;

use super::dispatcher::ResyncState;
use super::timer::Timer;
use crate::metrics;

/// Sync id before any message has been applied.
pub const UNDEFINED_SYNC_ID: i64 = -1;

/// Held by whoever needs server messages to wait, e.g. an animation that
/// must not be interrupted by a DOM update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Continue,
    /// Stop applying anything else this turn (redirect, termination).
    Halt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Applied,
    Buffered,
    Discarded,
    Halted,
}

pub trait SequencerContext {
    fn resync_state(&self) -> ResyncState;

    fn resync_completed(&mut self);

    fn set_client_to_server_message_id(&mut self, next_expected: i64, force: bool);

    fn has_active_request(&self) -> bool;

    fn end_request(&mut self);

    fn apply(&mut self, message: &UidlMessage) -> Applied;

    fn resynchronize(&mut self);

    fn reload(&mut self);
}

/// Applies server messages strictly in sync id order, holding back anything
/// that arrives early or while response handling is suspended.
#[derive(Debug)]
pub struct ResponseSequencer {
    last_seen: i64,
    pending: Vec<UidlMessage>,
    locks: HashSet<LockToken>,
    force_timer: Timer,
    force_timeout: Duration,
}

impl ResponseSequencer {
    pub fn new(force_timeout: Duration) -> Self {
        Self {
            last_seen: UNDEFINED_SYNC_ID,
            pending: Vec::new(),
            locks: HashSet::new(),
            force_timer: Timer::default(),
            force_timeout,
        }
    }

    pub fn last_seen_server_sync_id(&self) -> i64 {
        self.last_seen
    }

    pub fn expected_server_sync_id(&self) -> i64 {
        self.last_seen.saturating_add(1)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_locked(&self) -> bool {
        !self.locks.is_empty()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.force_timer.deadline()
    }

    pub fn is_next_expected(&self, sync_id: i64) -> bool {
        sync_id == -1 || sync_id == self.expected_server_sync_id() || self.last_seen == UNDEFINED_SYNC_ID
    }

    pub fn handle_message<C: SequencerContext>(&mut self, message: UidlMessage, ctx: &mut C, now: Instant) {
        if self.process(message, ctx, now) != Outcome::Halted {
            self.drain(ctx, now);
        }
        self.sync_force_timer(ctx.resync_state(), now);
    }

    fn process<C: SequencerContext>(&mut self, message: UidlMessage, ctx: &mut C, now: Instant) -> Outcome {
        let sync_id = message.server_sync_id();
        let resync = message.is_resynchronize();

        if !resync && ctx.resync_state() == ResyncState::WaitingForResponse {
            if message.requests_reload() {
                tracing::info!(
                    target: "uplink::sequencer",
                    sync_id,
                    "reload requested while resynchronizing"
                );
                ctx.reload();
                return Outcome::Halted;
            }
            tracing::debug!(
                target: "uplink::sequencer",
                sync_id,
                "holding message until the resynchronization response arrives"
            );
            self.buffer(message, now, false);
            return Outcome::Buffered;
        }
        if ctx.resync_state() == ResyncState::WaitingForResponse {
            ctx.resync_completed();
        }

        if resync && !self.is_next_expected(sync_id) {
            tracing::info!(
                target: "uplink::sequencer",
                sync_id,
                expected = self.expected_server_sync_id(),
                "resynchronization message overrides expected id"
            );
            self.last_seen = sync_id.saturating_sub(1);
            self.prune_stale();
        }

        let locked = self.is_locked();
        if locked || !self.is_next_expected(sync_id) {
            if locked {
                tracing::debug!(target: "uplink::sequencer", sync_id, "postponing message due to lock");
            } else if sync_id <= self.last_seen {
                tracing::warn!(
                    target: "uplink::sequencer",
                    sync_id,
                    last_seen = self.last_seen,
                    "ignoring message that was already seen"
                );
                metrics::MESSAGES_RECEIVED.with_label_values(&["stale"]).inc();
                if message.is_response() {
                    ctx.end_request();
                }
                return Outcome::Discarded;
            } else {
                tracing::debug!(
                    target: "uplink::sequencer",
                    sync_id,
                    expected = self.expected_server_sync_id(),
                    "postponing out of order message"
                );
            }
            self.buffer(message, now, true);
            return Outcome::Buffered;
        }

        // Client id first: a sync id change may start a resync that needs it.
        if let Some(next_expected) = message.client_id {
            ctx.set_client_to_server_message_id(next_expected, resync);
        }
        if sync_id != -1 {
            self.last_seen = sync_id;
        }
        metrics::MESSAGES_RECEIVED.with_label_values(&["applied"]).inc();
        tracing::debug!(target: "uplink::sequencer", sync_id, "handling message from server");

        match ctx.apply(&message) {
            Applied::Continue => {
                if message.is_response() {
                    ctx.end_request();
                }
                Outcome::Applied
            }
            Applied::Halt => Outcome::Halted,
        }
    }

    fn buffer(&mut self, message: UidlMessage, now: Instant, arm: bool) {
        self.pending.push(message);
        metrics::MESSAGES_RECEIVED.with_label_values(&["buffered"]).inc();
        metrics::PENDING_MESSAGES.set(self.pending.len() as i64);
        if arm && !self.force_timer.is_running() {
            self.force_timer.schedule(now, self.force_timeout);
        }
    }

    fn prune_stale(&mut self) {
        let expected = self.expected_server_sync_id();
        self.pending.retain(|m| {
            let id = m.server_sync_id();
            let keep = id == -1 || id >= expected;
            if !keep {
                tracing::debug!(target: "uplink::sequencer", sync_id = id, "removing old message");
            }
            keep
        });
        metrics::PENDING_MESSAGES.set(self.pending.len() as i64);
    }

    fn next_pending_index(&self, ctx: &impl SequencerContext) -> Option<usize> {
        let waiting = ctx.resync_state() == ResyncState::WaitingForResponse;
        self.pending.iter().position(|m| {
            if waiting {
                m.is_resynchronize()
            } else {
                self.is_next_expected(m.server_sync_id())
            }
        })
    }

    /// Applies buffered messages that are now next in line. Returns how many
    /// were taken out of the buffer.
    fn drain<C: SequencerContext>(&mut self, ctx: &mut C, now: Instant) -> usize {
        let mut handled = 0;
        while !self.is_locked() {
            let Some(index) = self.next_pending_index(ctx) else {
                break;
            };
            let message = self.pending.remove(index);
            metrics::PENDING_MESSAGES.set(self.pending.len() as i64);
            handled += 1;
            match self.process(message, ctx, now) {
                Outcome::Applied | Outcome::Discarded => {}
                Outcome::Buffered | Outcome::Halted => break,
            }
        }
        handled
    }

    /// Messages held back for a pending resynchronization are released by
    /// its response, not by the timer; only a lock keeps it running then.
    fn sync_force_timer(&mut self, resync: ResyncState, now: Instant) {
        let held_for_resync = resync == ResyncState::WaitingForResponse && !self.is_locked();
        if self.pending.is_empty() || held_for_resync {
            self.force_timer.cancel();
        } else if !self.force_timer.is_running() {
            self.force_timer.schedule(now, self.force_timeout);
        }
    }

    pub fn suspend_response_handling(&mut self, token: LockToken) {
        self.locks.insert(token);
    }

    pub fn resume_response_handling<C: SequencerContext>(&mut self, token: LockToken, ctx: &mut C, now: Instant) {
        self.locks.remove(&token);
        if self.is_locked() {
            return;
        }
        self.force_timer.cancel();
        if !self.pending.is_empty() {
            tracing::debug!(
                target: "uplink::sequencer",
                pending = self.pending.len(),
                "no more response handling locks, handling pending messages"
            );
            self.drain(ctx, now);
        }
        self.sync_force_timer(ctx.resync_state(), now);
    }

    pub fn handle_timeout<C: SequencerContext>(&mut self, ctx: &mut C, now: Instant) {
        if !self.force_timer.fire(now) {
            return;
        }
        self.force_handle_message(ctx, now);
    }

    /// Breaks a stall: drops stuck locks, and if the awaited message still
    /// has not arrived, discards the buffer and asks for a resynchronize.
    pub fn force_handle_message<C: SequencerContext>(&mut self, ctx: &mut C, now: Instant) {
        if ctx.resync_state() == ResyncState::WaitingForResponse {
            // The outstanding request is the resynchronization itself.
            if self.is_locked() {
                tracing::warn!(
                    target: "uplink::sequencer",
                    locks = self.locks.len(),
                    "response handling was never resumed, forcibly removing locks"
                );
                self.locks.clear();
            }
            self.sync_force_timer(ctx.resync_state(), now);
            return;
        }
        if ctx.has_active_request() {
            ctx.end_request();
        }
        if self.is_locked() {
            tracing::warn!(
                target: "uplink::sequencer",
                locks = self.locks.len(),
                "response handling was never resumed, forcibly removing locks"
            );
            self.locks.clear();
        } else {
            tracing::warn!(
                target: "uplink::sequencer",
                expected = self.expected_server_sync_id(),
                "gave up waiting for message from the server"
            );
        }

        if self.drain(ctx, now) == 0 && !self.pending.is_empty() {
            metrics::MESSAGES_RECEIVED
                .with_label_values(&["dropped"])
                .inc_by(self.pending.len() as u64);
            self.pending.clear();
            metrics::PENDING_MESSAGES.set(0);
            ctx.resynchronize();
        }
        self.sync_force_timer(ctx.resync_state(), now);
    }
}
