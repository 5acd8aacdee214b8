use std::time::{Duration, Instant};

use url::Url;

use super::timer::Timer;
use super::{Io, RequestId, RequestIds, Transmit};
use crate::metrics;
use crate::transport::{HttpResponse, TransportError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    InvalidStatus(u16),
    Error(String),
}

/// Periodic liveness ping that keeps the server-side UI from expiring. Also
/// serves as the reconnect probe when there is no payload to re-send.
#[derive(Debug)]
pub struct Heartbeat {
    uri: Url,
    interval: Option<Duration>,
    timer: Timer,
    in_flight: Option<RequestId>,
    paused: bool,
    stopped: bool,
}

impl Heartbeat {
    pub fn new(uri: Url, interval: Option<Duration>) -> Self {
        Self {
            uri,
            interval,
            timer: Timer::default(),
            in_flight: None,
            paused: false,
            stopped: false,
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn set_interval(&mut self, interval: Option<Duration>, now: Instant) {
        self.interval = interval;
        self.schedule(now);
    }

    pub fn schedule(&mut self, now: Instant) {
        match self.interval {
            Some(interval) if !self.paused && !self.stopped => {
                tracing::trace!(target: "uplink::heartbeat", ?interval, "scheduling heartbeat");
                self.timer.schedule(now, interval);
            }
            _ => self.timer.cancel(),
        }
    }

    pub fn send(&mut self, ids: &mut RequestIds, io: &mut Io) {
        if self.stopped {
            tracing::debug!(target: "uplink::heartbeat", "not sending heartbeat, stopped");
            return;
        }
        self.timer.cancel();
        let request_id = ids.next();
        self.in_flight = Some(request_id);
        metrics::REQUESTS_SENT
            .with_label_values(&["xhr", "heartbeat"])
            .inc();
        tracing::debug!(target: "uplink::heartbeat", request_id = request_id.0, "sending heartbeat");
        io.transmit(Transmit::Heartbeat {
            request_id,
            uri: self.uri.clone(),
        });
    }

    pub fn owns(&self, request_id: RequestId) -> bool {
        self.in_flight == Some(request_id)
    }

    /// Classifies the response to the outstanding heartbeat and schedules
    /// the next one. Returns `None` for responses to superseded requests.
    pub fn on_response(
        &mut self,
        request_id: RequestId,
        result: Result<HttpResponse, TransportError>,
        now: Instant,
    ) -> Option<HeartbeatOutcome> {
        if !self.owns(request_id) {
            return None;
        }
        self.in_flight = None;
        let outcome = match result {
            Ok(response) if response.status == 200 => HeartbeatOutcome::Ok,
            Ok(response) => HeartbeatOutcome::InvalidStatus(response.status),
            Err(err) => {
                tracing::warn!(target: "uplink::heartbeat", error = %err, "heartbeat failed");
                HeartbeatOutcome::Error(err.to_string())
            }
        };
        self.schedule(now);
        Some(outcome)
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.timer.cancel();
    }

    pub fn resume(&mut self, now: Instant) {
        self.paused = false;
        self.schedule(now);
    }

    /// Permanent; used once the UI has terminated.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.in_flight = None;
        self.timer.cancel();
    }

    pub fn handle_timeout(&mut self, ids: &mut RequestIds, now: Instant, io: &mut Io) {
        if self.timer.fire(now) {
            self.send(ids, io);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Heartbeat {
        let uri = Url::parse("http://localhost/?v-r=heartbeat&v-uiId=0").unwrap();
        Heartbeat::new(uri, Some(Duration::from_secs(300)))
    }

    #[test]
    fn fires_on_interval_and_reschedules_after_response() {
        let now = Instant::now();
        let mut hb = heartbeat();
        let mut ids = RequestIds::default();
        let mut io = Io::default();
        hb.schedule(now);
        assert_eq!(hb.deadline(), Some(now + Duration::from_secs(300)));

        let fire_at = now + Duration::from_secs(300);
        hb.handle_timeout(&mut ids, fire_at, &mut io);
        let Some(Transmit::Heartbeat { request_id, .. }) = io.poll_transmit() else {
            panic!("expected heartbeat transmit");
        };
        assert_eq!(hb.deadline(), None);

        let outcome = hb.on_response(request_id, Ok(HttpResponse::ok("")), fire_at);
        assert_eq!(outcome, Some(HeartbeatOutcome::Ok));
        assert_eq!(hb.deadline(), Some(fire_at + Duration::from_secs(300)));
    }

    #[test]
    fn classifies_failures() {
        let now = Instant::now();
        let mut hb = heartbeat();
        let mut ids = RequestIds::default();
        let mut io = Io::default();

        hb.send(&mut ids, &mut io);
        let id = RequestId(1);
        assert_eq!(
            hb.on_response(id, Ok(HttpResponse::status(410)), now),
            Some(HeartbeatOutcome::InvalidStatus(410))
        );

        hb.send(&mut ids, &mut io);
        assert!(matches!(
            hb.on_response(RequestId(2), Err(TransportError::Timeout), now),
            Some(HeartbeatOutcome::Error(_))
        ));
        assert_eq!(hb.on_response(RequestId(2), Ok(HttpResponse::ok("")), now), None);
    }

    #[test]
    fn pause_and_disable_keep_timer_off() {
        let now = Instant::now();
        let mut hb = heartbeat();
        hb.pause();
        hb.schedule(now);
        assert_eq!(hb.deadline(), None);
        hb.resume(now);
        assert!(hb.deadline().is_some());

        hb.set_interval(None, now);
        assert_eq!(hb.deadline(), None);
    }

    #[test]
    fn stopped_heartbeat_sends_nothing() {
        let mut hb = heartbeat();
        let mut ids = RequestIds::default();
        let mut io = Io::default();
        hb.stop();
        hb.send(&mut ids, &mut io);
        assert!(!io.has_transmits());
    }
}
