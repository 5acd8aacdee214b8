use thiserror::Error;

use super::{Deferred, Io, Signal};
use crate::lifecycle::ConnectionIndicator;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("trying to start a new request while another is active")]
    AlreadyActive,
}

/// Tracks the single outstanding client-to-server request.
#[derive(Debug, Default)]
pub struct RequestTracker {
    active: bool,
}

impl RequestTracker {
    pub fn has_active_request(&self) -> bool {
        self.active
    }

    pub fn start_request(&mut self, io: &mut Io) -> Result<(), TrackerError> {
        if self.active {
            return Err(TrackerError::AlreadyActive);
        }
        self.active = true;
        io.signal(Signal::Indicator(ConnectionIndicator::Loading));
        Ok(())
    }

    /// Ends the active request. `more_to_send` is true when invocations or
    /// unacknowledged messages are waiting for the request slot.
    pub fn end_request(&mut self, more_to_send: bool, io: &mut Io) {
        if !self.active {
            tracing::debug!(target: "uplink::tracker", "end_request without an active request");
        }
        self.active = false;
        if more_to_send {
            io.defer(Deferred::SendInvocations);
        }
        io.defer(Deferred::ResponseHandlingEnded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_request_at_a_time() {
        let mut tracker = RequestTracker::default();
        let mut io = Io::default();
        tracker.start_request(&mut io).expect("first");
        assert_eq!(tracker.start_request(&mut io), Err(TrackerError::AlreadyActive));
        assert_eq!(
            io.poll_signal(),
            Some(Signal::Indicator(ConnectionIndicator::Loading))
        );
        assert_eq!(io.poll_signal(), None);
    }

    #[test]
    fn ending_with_pending_work_schedules_send() {
        let mut tracker = RequestTracker::default();
        let mut io = Io::default();
        tracker.start_request(&mut io).expect("start");
        tracker.end_request(true, &mut io);
        assert!(!tracker.has_active_request());
        assert_eq!(io.poll_deferred(), Some(Deferred::SendInvocations));
        assert_eq!(io.poll_deferred(), Some(Deferred::ResponseHandlingEnded));
    }
}
