//! Shared recovery for the three failure sources.
//!
//! Heartbeat, push and plain requests all report into one arbitrator. While
//! recovering, exactly one source is the cause and drives the retries; a
//! failure from a higher ranked source takes over, lower ranked ones are
//! ignored. When the cause recovers everything is considered recovered.
//!
//! Retries are expressed as signals: [`Signal::Resend`] for a failed payload
//! and [`Signal::HeartbeatProbe`] when there is nothing to re-send.

use std::time::Instant;

use serde::Serialize;
use uplink_proto::{find_refresh_token, UidlRequest};

use super::timer::{earliest, Timer};
use super::{Deferred, Io, Signal};
use crate::config::ReconnectConfig;
use crate::event::{ClientEvent, DialogState};
use crate::lifecycle::ConnectionIndicator;
use crate::metrics;
use crate::transport::TransportKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSource {
    Heartbeat,
    Push,
    Xhr,
}

impl FailureSource {
    /// Heartbeat > Push > Xhr.
    fn rank(self) -> u8 {
        match self {
            FailureSource::Heartbeat => 3,
            FailureSource::Push => 2,
            FailureSource::Xhr => 1,
        }
    }

    pub fn outranks(self, other: FailureSource) -> bool {
        self.rank() > other.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureSource::Heartbeat => "heartbeat",
            FailureSource::Push => "push",
            FailureSource::Xhr => "xhr",
        }
    }
}

/// Read-only view of the client state the arbitrator consults.
pub trait RecoveryContext {
    fn is_ui_running(&self) -> bool;

    fn has_active_request(&self) -> bool;

    fn is_push_bidirectional(&self) -> bool;
}

#[derive(Debug)]
pub struct FailureArbitrator {
    config: ReconnectConfig,
    cause: Option<FailureSource>,
    attempt: u32,
    retry_timer: Timer,
    retry_payload: Option<UidlRequest>,
    dialog_timer: Timer,
    dialog: DialogState,
    gave_up: bool,
    resend_after_recovery: bool,
}

impl FailureArbitrator {
    pub fn new(config: ReconnectConfig) -> Self {
        let dialog = DialogState {
            modal: config.dialog_modal,
            ..DialogState::default()
        };
        Self {
            config,
            cause: None,
            attempt: 0,
            retry_timer: Timer::default(),
            retry_payload: None,
            dialog_timer: Timer::default(),
            dialog,
            gave_up: false,
            resend_after_recovery: false,
        }
    }

    pub fn cause(&self) -> Option<FailureSource> {
        self.cause
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_reconnecting(&self) -> bool {
        self.cause.is_some()
    }

    /// True between giving up and the next `online` event. Nothing is sent
    /// to the server meanwhile.
    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn dialog(&self) -> &DialogState {
        &self.dialog
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        earliest([self.retry_timer.deadline(), self.dialog_timer.deadline()])
    }

    pub fn report_failure<C: RecoveryContext>(
        &mut self,
        source: FailureSource,
        payload: Option<UidlRequest>,
        ctx: &C,
        now: Instant,
        io: &mut Io,
    ) {
        if !ctx.is_ui_running() {
            return;
        }
        if self.gave_up {
            tracing::debug!(
                target: "uplink::arbitrator",
                source = source.as_str(),
                "ignoring failure after giving up"
            );
            return;
        }

        match self.cause {
            None => {
                tracing::warn!(
                    target: "uplink::arbitrator",
                    source = source.as_str(),
                    "reconnecting because of failure"
                );
                self.cause = Some(source);
                self.attempt = 0;
                self.hide_dialog(io);
                self.dialog_timer.schedule(now, self.config.dialog_grace_period);
            }
            Some(cause) if source.outranks(cause) => {
                tracing::warn!(
                    target: "uplink::arbitrator",
                    source = source.as_str(),
                    previous = cause.as_str(),
                    "now reconnecting because of failure"
                );
                self.cause = Some(source);
            }
            Some(_) => {}
        }

        if self.cause != Some(source) {
            return;
        }

        self.attempt += 1;
        metrics::RECONNECT_ATTEMPTS
            .with_label_values(&[source.as_str()])
            .inc();
        tracing::info!(
            target: "uplink::arbitrator",
            source = source.as_str(),
            attempt = self.attempt,
            "reconnect attempt"
        );

        if self.attempt >= self.config.attempts {
            self.give_up(ctx, io);
            return;
        }

        io.signal(Signal::Indicator(ConnectionIndicator::Reconnecting));
        self.dialog.text = self.config.dialog_text(self.attempt);
        if self.dialog.visible {
            self.emit_dialog(io);
        }

        if self.attempt == 1 {
            Self::reconnect(payload, io);
        } else {
            self.retry_payload = payload;
            self.retry_timer.schedule(now, self.config.interval);
        }
    }

    fn reconnect(payload: Option<UidlRequest>, io: &mut Io) {
        match payload {
            Some(payload) => {
                tracing::debug!(target: "uplink::arbitrator", "re-sending last message to the server");
                io.signal(Signal::Resend(payload));
            }
            None => {
                tracing::debug!(target: "uplink::arbitrator", "trying to re-establish server connection");
                io.signal(Signal::HeartbeatProbe);
            }
        }
    }

    /// Stops retrying and holds every further send until `online` starts a
    /// fresh recovery.
    pub fn give_up<C: RecoveryContext>(&mut self, ctx: &C, io: &mut Io) {
        tracing::warn!(
            target: "uplink::arbitrator",
            attempt = self.attempt,
            "giving up reconnecting"
        );
        metrics::GIVE_UPS.inc();
        self.gave_up = true;
        self.cause = None;
        self.retry_timer.cancel();
        self.retry_payload = None;

        if ctx.has_active_request() {
            io.signal(Signal::EndRequest);
        }

        self.dialog_timer.cancel();
        self.dialog.visible = true;
        self.dialog.reconnecting = false;
        self.dialog.text = self.config.dialog_text_gave_up(self.attempt);
        self.emit_dialog(io);

        io.signal(Signal::Indicator(ConnectionIndicator::ConnectionLost));
        io.signal(Signal::PauseHeartbeat);
    }

    pub fn report_success(&mut self, source: FailureSource, io: &mut Io) {
        if self.cause != Some(source) {
            return;
        }
        tracing::info!(
            target: "uplink::arbitrator",
            source = source.as_str(),
            attempts = self.attempt,
            "re-established connection to server"
        );
        self.cause = None;
        self.attempt = 0;
        self.retry_timer.cancel();
        self.retry_payload = None;
        self.dialog_timer.cancel();
        self.hide_dialog(io);
        io.signal(Signal::Indicator(ConnectionIndicator::Connected));
        if std::mem::take(&mut self.resend_after_recovery) {
            io.defer(Deferred::SendInvocations);
        }
    }

    pub fn heartbeat_ok(&mut self, io: &mut Io) {
        if self.is_reconnecting() {
            self.report_success(FailureSource::Heartbeat, io);
        }
    }

    pub fn heartbeat_error<C: RecoveryContext>(&mut self, ctx: &C, now: Instant, io: &mut Io) {
        self.report_failure(FailureSource::Heartbeat, None, ctx, now, io);
    }

    pub fn heartbeat_invalid_status<C: RecoveryContext>(
        &mut self,
        status: u16,
        ctx: &C,
        now: Instant,
        io: &mut Io,
    ) {
        tracing::warn!(target: "uplink::arbitrator", status, "heartbeat request returned error status");
        match status {
            401 | 403 | 410 => Self::session_expired(io),
            // The UI is gone; reacting would only block the user.
            404 => {}
            _ => self.report_failure(FailureSource::Heartbeat, None, ctx, now, io),
        }
    }

    pub fn xhr_ok(&mut self, io: &mut Io) {
        if self.is_reconnecting() {
            self.report_success(FailureSource::Xhr, io);
        }
    }

    pub fn xhr_error<C: RecoveryContext>(&mut self, payload: UidlRequest, ctx: &C, now: Instant, io: &mut Io) {
        self.report_failure(FailureSource::Xhr, Some(payload), ctx, now, io);
    }

    pub fn xhr_invalid_status<C: RecoveryContext>(
        &mut self,
        status: u16,
        payload: UidlRequest,
        ctx: &C,
        now: Instant,
        io: &mut Io,
    ) {
        tracing::warn!(target: "uplink::arbitrator", status, "server returned error status for xhr");
        match status {
            401 | 403 => {
                io.signal(Signal::EndRequest);
                Self::session_expired(io);
            }
            // Other codes can be a proxy in front of a restarting server.
            _ => self.report_failure(FailureSource::Xhr, Some(payload), ctx, now, io),
        }
    }

    pub fn xhr_invalid_content(&mut self, body: &str, io: &mut Io) {
        io.signal(Signal::EndRequest);
        Self::invalid_content(body, io);
    }

    pub fn push_ok<C: RecoveryContext>(&mut self, ctx: &C, io: &mut Io) {
        if !self.is_reconnecting() {
            return;
        }
        self.report_success(FailureSource::Push, io);
        if ctx.has_active_request() {
            tracing::debug!(
                target: "uplink::arbitrator",
                "abandoning active request after push reconnect"
            );
            io.signal(Signal::EndRequest);
            if ctx.is_push_bidirectional() {
                io.defer(Deferred::SendInvocations);
            }
        }
    }

    pub fn push_not_connected<C: RecoveryContext>(
        &mut self,
        payload: UidlRequest,
        ctx: &C,
        now: Instant,
        io: &mut Io,
    ) {
        self.report_failure(FailureSource::Push, Some(payload), ctx, now, io);
    }

    pub fn push_reconnect_pending<C: RecoveryContext>(&mut self, ctx: &C, now: Instant, io: &mut Io) {
        tracing::info!(target: "uplink::arbitrator", "reopening push connection");
        if ctx.is_push_bidirectional() {
            self.report_failure(FailureSource::Push, None, ctx, now, io);
        }
        // Long polling gives no signal when it is back; a failing request
        // will start recovery instead.
    }

    pub fn push_invalid_content<C: RecoveryContext>(&mut self, body: &str, ctx: &C, io: &mut Io) {
        if ctx.is_push_bidirectional() {
            io.signal(Signal::EndRequest);
        }
        Self::invalid_content(body, io);
    }

    pub fn push_error(&mut self, transport: Option<TransportKind>, io: &mut Io) {
        let transport = transport.map(|t| t.as_str()).unwrap_or("unknown transport");
        io.event(ClientEvent::CommunicationError {
            details: format!("Push connection using {transport} failed!"),
            status: None,
        });
    }

    pub fn push_client_timeout(&mut self, io: &mut Io) {
        io.event(ClientEvent::CommunicationError {
            details: "Client unexpectedly disconnected. Ensure client timeout is disabled.".into(),
            status: None,
        });
    }

    pub fn push_closed(&mut self) {
        tracing::info!(target: "uplink::arbitrator", "push connection closed");
    }

    pub fn offline<C: RecoveryContext>(&mut self, ctx: &C, io: &mut Io) {
        tracing::info!(target: "uplink::arbitrator", "network offline");
        self.give_up(ctx, io);
    }

    pub fn online<C: RecoveryContext>(&mut self, ctx: &C, now: Instant, io: &mut Io) {
        tracing::info!(target: "uplink::arbitrator", "network online");
        if std::mem::take(&mut self.gave_up) {
            self.resend_after_recovery = true;
        }
        io.signal(Signal::ResumeHeartbeat);
        self.report_failure(FailureSource::Heartbeat, None, ctx, now, io);
    }

    pub fn on_terminated<C: RecoveryContext>(&mut self, ctx: &C, io: &mut Io) {
        if self.is_reconnecting() {
            self.give_up(ctx, io);
        }
        self.retry_timer.cancel();
        self.retry_payload = None;
    }

    pub fn handle_timeout<C: RecoveryContext>(&mut self, ctx: &C, now: Instant, io: &mut Io) {
        if self.dialog_timer.fire(now) {
            self.dialog.visible = true;
            self.dialog.reconnecting = true;
            self.emit_dialog(io);
        }
        if self.retry_timer.fire(now) {
            let payload = self.retry_payload.take();
            if ctx.is_ui_running() {
                Self::reconnect(payload, io);
            } else {
                tracing::warn!(
                    target: "uplink::arbitrator",
                    "trying to reconnect after application has been stopped, giving up"
                );
            }
        }
    }

    fn session_expired(io: &mut Io) {
        io.event(ClientEvent::SessionExpired);
        io.signal(Signal::Terminate);
    }

    fn invalid_content(body: &str, io: &mut Io) {
        if let Some(token) = find_refresh_token(body) {
            tracing::info!(target: "uplink::arbitrator", url = ?token.url, "refresh requested by response");
            io.event(ClientEvent::Redirect { url: token.url });
            return;
        }
        tracing::error!(target: "uplink::arbitrator", "invalid JSON response from server");
        io.event(ClientEvent::UnrecoverableError {
            caption: None,
            message: Some(format!("Invalid JSON response from server: {body}")),
            details: None,
            url: None,
        });
        io.signal(Signal::Terminate);
    }

    fn hide_dialog(&mut self, io: &mut Io) {
        if self.dialog.visible {
            self.dialog.visible = false;
            self.dialog.reconnecting = false;
            self.emit_dialog(io);
        }
    }

    fn emit_dialog(&self, io: &mut Io) {
        io.event(ClientEvent::ReconnectDialog {
            dialog: self.dialog.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct View {
        running: bool,
        active: bool,
        bidirectional: bool,
    }

    impl RecoveryContext for View {
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

    const RUNNING: View = View {
        running: true,
        active: false,
        bidirectional: false,
    };

    fn arbitrator(attempts: u32) -> FailureArbitrator {
        FailureArbitrator::new(ReconnectConfig {
            attempts,
            ..ReconnectConfig::default()
        })
    }

    fn signals(io: &mut Io) -> Vec<Signal> {
        std::iter::from_fn(|| io.poll_signal()).collect()
    }

    fn events(io: &mut Io) -> Vec<ClientEvent> {
        std::iter::from_fn(|| io.poll_event()).collect()
    }

    #[test]
    fn first_attempt_retries_immediately_then_waits() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        let payload = UidlRequest::new(Vec::new());

        arb.report_failure(FailureSource::Xhr, Some(payload.clone()), &RUNNING, now, &mut io);
        assert_eq!(
            signals(&mut io),
            vec![
                Signal::Indicator(ConnectionIndicator::Reconnecting),
                Signal::Resend(payload.clone()),
            ]
        );

        arb.report_failure(FailureSource::Xhr, Some(payload.clone()), &RUNNING, now, &mut io);
        assert_eq!(
            signals(&mut io),
            vec![Signal::Indicator(ConnectionIndicator::Reconnecting)]
        );
        let retry_at = now + Duration::from_millis(5000);
        assert_eq!(arb.poll_timeout(), Some(now + Duration::from_millis(400)));

        arb.handle_timeout(&RUNNING, retry_at, &mut io);
        assert_eq!(signals(&mut io), vec![Signal::Resend(payload)]);
    }

    #[test]
    fn higher_ranked_cause_wins_and_its_recovery_clears_all() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();

        arb.report_failure(FailureSource::Heartbeat, None, &RUNNING, now, &mut io);
        arb.report_failure(FailureSource::Heartbeat, None, &RUNNING, now, &mut io);
        assert_eq!(arb.attempt(), 2);

        arb.report_failure(
            FailureSource::Xhr,
            Some(UidlRequest::new(Vec::new())),
            &RUNNING,
            now,
            &mut io,
        );
        assert_eq!(arb.cause(), Some(FailureSource::Heartbeat));
        assert_eq!(arb.attempt(), 2);
        signals(&mut io);

        arb.heartbeat_ok(&mut io);
        assert_eq!(arb.cause(), None);
        assert_eq!(arb.attempt(), 0);
        assert_eq!(arb.poll_timeout(), None);
        assert_eq!(
            signals(&mut io),
            vec![Signal::Indicator(ConnectionIndicator::Connected)]
        );
    }

    #[test]
    fn lower_ranked_cause_is_promoted() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        arb.report_failure(FailureSource::Xhr, None, &RUNNING, now, &mut io);
        arb.report_failure(FailureSource::Push, None, &RUNNING, now, &mut io);
        assert_eq!(arb.cause(), Some(FailureSource::Push));
        assert_eq!(arb.attempt(), 2);

        arb.xhr_ok(&mut io);
        assert!(arb.is_reconnecting(), "xhr is no longer the cause");
    }

    #[test]
    fn gives_up_on_the_configured_attempt() {
        let now = Instant::now();
        let mut arb = arbitrator(3);
        let mut io = Io::default();
        let view = View {
            active: true,
            ..RUNNING
        };

        arb.report_failure(FailureSource::Heartbeat, None, &view, now, &mut io);
        arb.report_failure(FailureSource::Heartbeat, None, &view, now, &mut io);
        assert!(arb.is_reconnecting());
        signals(&mut io);

        arb.report_failure(FailureSource::Heartbeat, None, &view, now, &mut io);
        assert!(!arb.is_reconnecting());
        assert_eq!(
            signals(&mut io),
            vec![
                Signal::EndRequest,
                Signal::Indicator(ConnectionIndicator::ConnectionLost),
                Signal::PauseHeartbeat,
            ]
        );
        let dialog = arb.dialog();
        assert!(dialog.visible);
        assert!(!dialog.reconnecting);
        assert_eq!(dialog.text, "Server connection lost.");
        assert_eq!(arb.poll_timeout(), None);
    }

    #[test]
    fn failures_are_ignored_after_giving_up_until_online() {
        let now = Instant::now();
        let mut arb = arbitrator(1);
        let mut io = Io::default();
        let payload = UidlRequest::new(Vec::new());

        arb.report_failure(FailureSource::Xhr, Some(payload.clone()), &RUNNING, now, &mut io);
        assert!(arb.has_given_up());
        signals(&mut io);

        arb.report_failure(FailureSource::Heartbeat, None, &RUNNING, now, &mut io);
        arb.xhr_error(payload, &RUNNING, now, &mut io);
        assert!(signals(&mut io).is_empty());
        assert!(!arb.is_reconnecting());

        let mut arb = FailureArbitrator::new(ReconnectConfig::default());
        arb.offline(&RUNNING, &mut io);
        signals(&mut io);
        arb.online(&RUNNING, now, &mut io);
        assert!(!arb.has_given_up());
        assert!(arb.is_reconnecting());
        signals(&mut io);
        assert_eq!(io.poll_deferred(), None);

        arb.heartbeat_ok(&mut io);
        assert_eq!(
            signals(&mut io),
            vec![Signal::Indicator(ConnectionIndicator::Connected)]
        );
        assert_eq!(io.poll_deferred(), Some(Deferred::SendInvocations));
    }

    #[test]
    fn dialog_shows_only_after_grace_period() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        arb.report_failure(FailureSource::Heartbeat, None, &RUNNING, now, &mut io);
        assert!(events(&mut io).is_empty());

        arb.handle_timeout(&RUNNING, now + Duration::from_millis(400), &mut io);
        let shown = events(&mut io);
        assert!(matches!(
            shown.as_slice(),
            [ClientEvent::ReconnectDialog { dialog }] if dialog.visible && dialog.reconnecting
        ));

        arb.heartbeat_ok(&mut io);
        assert!(matches!(
            events(&mut io).as_slice(),
            [ClientEvent::ReconnectDialog { dialog }] if !dialog.visible
        ));
    }

    #[test]
    fn recovery_within_grace_period_never_shows_dialog() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        arb.report_failure(FailureSource::Heartbeat, None, &RUNNING, now, &mut io);
        arb.heartbeat_ok(&mut io);
        arb.handle_timeout(&RUNNING, now + Duration::from_secs(1), &mut io);
        assert!(events(&mut io).is_empty());
    }

    #[test]
    fn unauthorized_statuses_expire_the_session() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();

        arb.heartbeat_invalid_status(404, &RUNNING, now, &mut io);
        assert!(signals(&mut io).is_empty());

        arb.heartbeat_invalid_status(410, &RUNNING, now, &mut io);
        assert_eq!(events(&mut io), vec![ClientEvent::SessionExpired]);
        assert_eq!(signals(&mut io), vec![Signal::Terminate]);

        arb.xhr_invalid_status(401, UidlRequest::new(Vec::new()), &RUNNING, now, &mut io);
        assert_eq!(signals(&mut io), vec![Signal::EndRequest, Signal::Terminate]);
        assert!(!arb.is_reconnecting());

        arb.xhr_invalid_status(503, UidlRequest::new(Vec::new()), &RUNNING, now, &mut io);
        assert_eq!(arb.cause(), Some(FailureSource::Xhr));
    }

    #[test]
    fn invalid_content_redirects_on_refresh_marker() {
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        arb.xhr_invalid_content("<html>Vaadin-Refresh: /login</html>", &mut io);
        assert_eq!(
            events(&mut io),
            vec![ClientEvent::Redirect {
                url: Some("/login</html>".into())
            }]
        );
        assert_eq!(signals(&mut io), vec![Signal::EndRequest]);

        arb.xhr_invalid_content("<html>oops</html>", &mut io);
        assert!(matches!(
            events(&mut io).as_slice(),
            [ClientEvent::UnrecoverableError { .. }]
        ));
        assert_eq!(signals(&mut io), vec![Signal::EndRequest, Signal::Terminate]);
    }

    #[test]
    fn push_recovery_abandons_request_and_reflushes() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        let view = View {
            active: true,
            bidirectional: true,
            ..RUNNING
        };
        arb.push_reconnect_pending(&view, now, &mut io);
        assert_eq!(arb.cause(), Some(FailureSource::Push));
        signals(&mut io);

        arb.push_ok(&view, &mut io);
        assert_eq!(
            signals(&mut io),
            vec![
                Signal::Indicator(ConnectionIndicator::Connected),
                Signal::EndRequest,
            ]
        );
        assert_eq!(io.poll_deferred(), Some(Deferred::SendInvocations));
    }

    #[test]
    fn failures_are_ignored_once_stopped() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        let stopped = View {
            running: false,
            ..RUNNING
        };
        arb.report_failure(FailureSource::Heartbeat, None, &stopped, now, &mut io);
        assert!(!arb.is_reconnecting());
        assert!(signals(&mut io).is_empty());
    }

    #[test]
    fn online_resumes_with_a_heartbeat() {
        let now = Instant::now();
        let mut arb = arbitrator(10);
        let mut io = Io::default();
        arb.offline(&RUNNING, &mut io);
        signals(&mut io);

        arb.online(&RUNNING, now, &mut io);
        assert_eq!(
            signals(&mut io),
            vec![
                Signal::ResumeHeartbeat,
                Signal::Indicator(ConnectionIndicator::Reconnecting),
                Signal::HeartbeatProbe,
            ]
        );
    }
}
