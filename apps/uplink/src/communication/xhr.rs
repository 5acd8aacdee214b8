use std::time::{Duration, Instant};

use url::Url;
use uplink_proto::{parse_wrapped, UidlMessage, UidlRequest};

use super::timer::Timer;
use super::{Io, RequestId, RequestIds, Transmit};
use crate::transport::{HttpResponse, TransportError};

/// Delay before re-sending a request issued right after `beforeunload`.
pub const UNLOAD_PROBE_DELAY: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, PartialEq)]
pub enum XhrOutcome {
    Ok(Box<UidlMessage>),
    NetworkError { payload: UidlRequest, reason: String },
    InvalidStatus { status: u16, payload: UidlRequest },
    InvalidContent { payload: UidlRequest, body: String },
}

#[derive(Debug)]
struct InFlight {
    request_id: RequestId,
    payload: UidlRequest,
    body: String,
}

/// Plain request/response channel for UIDL payloads.
#[derive(Debug)]
pub struct XhrConnection {
    uri: Url,
    in_flight: Option<InFlight>,
    unloading: bool,
    probe_timer: Timer,
}

impl XhrConnection {
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            in_flight: None,
            unloading: false,
            probe_timer: Timer::default(),
        }
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.probe_timer.deadline()
    }

    pub fn owns(&self, request_id: RequestId) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|f| f.request_id == request_id)
    }

    pub fn send(
        &mut self,
        payload: &UidlRequest,
        ids: &mut RequestIds,
        now: Instant,
        io: &mut Io,
    ) -> Result<RequestId, serde_json::Error> {
        let body = payload.to_json()?;
        let request_id = ids.next();
        tracing::debug!(
            target: "uplink::xhr",
            request_id = request_id.0,
            client_id = ?payload.client_id,
            "posting uidl request"
        );
        io.transmit(Transmit::Uidl {
            request_id,
            uri: self.uri.clone(),
            body: body.clone(),
        });
        if self.unloading {
            self.probe_timer.schedule(now, UNLOAD_PROBE_DELAY);
        }
        self.in_flight = Some(InFlight {
            request_id,
            payload: payload.clone(),
            body,
        });
        Ok(request_id)
    }

    /// A navigation may be about to drop requests issued from now on.
    pub fn before_unload(&mut self) {
        self.unloading = true;
    }

    pub fn on_response(
        &mut self,
        request_id: RequestId,
        result: Result<HttpResponse, TransportError>,
    ) -> Option<XhrOutcome> {
        if !self.owns(request_id) {
            return None;
        }
        let InFlight { payload, .. } = self.in_flight.take()?;
        self.unloading = false;
        self.probe_timer.cancel();

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(target: "uplink::xhr", error = %err, "uidl request failed");
                return Some(XhrOutcome::NetworkError {
                    payload,
                    reason: err.to_string(),
                });
            }
        };
        if response.status != 200 {
            return Some(XhrOutcome::InvalidStatus {
                status: response.status,
                payload,
            });
        }
        match parse_wrapped(&response.body) {
            Ok(message) => Some(XhrOutcome::Ok(Box::new(message))),
            Err(err) => {
                tracing::warn!(target: "uplink::xhr", error = %err, "response is not a uidl message");
                Some(XhrOutcome::InvalidContent {
                    payload,
                    body: response.body,
                })
            }
        }
    }

    pub fn handle_timeout(&mut self, now: Instant, io: &mut Io) {
        if !self.probe_timer.fire(now) {
            return;
        }
        if let Some(flight) = &self.in_flight {
            tracing::info!(
                target: "uplink::xhr",
                request_id = flight.request_id.0,
                "no response after beforeunload, re-sending request"
            );
            io.transmit(Transmit::Uidl {
                request_id: flight.request_id,
                uri: self.uri.clone(),
                body: flight.body.clone(),
            });
        }
    }
}
