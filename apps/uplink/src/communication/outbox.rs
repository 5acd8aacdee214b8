use uplink_proto::Invocation;

use super::{Deferred, Io};

/// Collects invocations produced during a turn and hands them to the
/// dispatcher as one batch.
#[derive(Debug, Default)]
pub struct RpcOutbox {
    pending: Vec<Invocation>,
    flush_pending: bool,
    flush_scheduled: bool,
}

impl RpcOutbox {
    pub fn add(&mut self, invocation: Invocation, ui_running: bool) {
        if !ui_running {
            tracing::warn!(
                target: "uplink::outbox",
                "trying to invoke method on a UI that is not running"
            );
            return;
        }
        self.pending.push(invocation);
    }

    /// Requests a send at the end of the current turn. Repeated calls before
    /// then collapse into that one send.
    pub fn flush(&mut self, io: &mut Io) {
        if self.flush_scheduled || self.pending.is_empty() {
            return;
        }
        self.flush_pending = true;
        self.flush_scheduled = true;
        io.defer(Deferred::FlushOutbox);
    }

    /// Runs the deferred part of [`flush`](Self::flush). Returns whether the
    /// dispatcher should attempt a send.
    pub fn take_scheduled_flush(&mut self) -> bool {
        let scheduled = std::mem::replace(&mut self.flush_scheduled, false);
        scheduled && self.flush_pending
    }

    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Hands over everything queued and resets the flush state.
    pub fn take_all(&mut self) -> Vec<Invocation> {
        self.flush_pending = false;
        self.flush_scheduled = false;
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.flush_pending = false;
        self.flush_scheduled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(n: i64) -> Invocation {
        Invocation::from(json!({"node": n}))
    }

    #[test]
    fn add_is_ignored_when_not_running() {
        let mut outbox = RpcOutbox::default();
        outbox.add(invocation(1), false);
        assert!(outbox.is_empty());
    }

    #[test]
    fn repeated_flushes_schedule_once() {
        let mut outbox = RpcOutbox::default();
        let mut io = Io::default();
        outbox.add(invocation(1), true);
        outbox.flush(&mut io);
        outbox.add(invocation(2), true);
        outbox.flush(&mut io);
        outbox.flush(&mut io);

        assert_eq!(io.poll_deferred(), Some(Deferred::FlushOutbox));
        assert_eq!(io.poll_deferred(), None);
        assert!(outbox.take_scheduled_flush());
        assert_eq!(outbox.take_all(), vec![invocation(1), invocation(2)]);
        assert!(!outbox.is_flush_pending());
    }

    #[test]
    fn flush_of_empty_outbox_does_nothing() {
        let mut outbox = RpcOutbox::default();
        let mut io = Io::default();
        outbox.flush(&mut io);
        assert_eq!(io.poll_deferred(), None);
        assert!(!outbox.is_flush_pending());
    }

    #[test]
    fn clear_cancels_scheduled_flush() {
        let mut outbox = RpcOutbox::default();
        let mut io = Io::default();
        outbox.add(invocation(1), true);
        outbox.flush(&mut io);
        outbox.clear();
        assert!(!outbox.take_scheduled_flush());
        assert!(outbox.is_empty());
    }
}
