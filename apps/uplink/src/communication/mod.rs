//! The sans-IO communication core. Every component here is synchronous and
//! driven by explicit calls carrying `now`. Work that leaves the core is
//! written into an [`Io`] buffer: transmits for the network, events for the
//! host, signals for sibling components and deferred end-of-turn tasks.

use std::collections::VecDeque;

use url::Url;
use uplink_proto::{UidlMessage, UidlRequest};

use crate::config::PushOptions;
use crate::event::ClientEvent;
use crate::lifecycle::ConnectionIndicator;
use crate::transport::TransportKind;
use crate::tree::NodeId;

pub mod arbitrator;
pub mod dispatcher;
pub mod heartbeat;
pub mod outbox;
pub mod push;
pub mod sequencer;
pub mod timer;
pub mod tracker;
pub mod xhr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Hands out request ids shared by every plain-channel sender so responses
/// can be routed back unambiguously.
#[derive(Debug, Default)]
pub struct RequestIds {
    next: u64,
}

impl RequestIds {
    pub fn next(&mut self) -> RequestId {
        self.next += 1;
        RequestId(self.next)
    }
}

/// Network work for the driver.
#[derive(Clone, Debug, PartialEq)]
pub enum Transmit {
    Uidl {
        request_id: RequestId,
        uri: Url,
        body: String,
    },
    Heartbeat {
        request_id: RequestId,
        uri: Url,
    },
    PushConnect {
        uri: Url,
        options: PushOptions,
    },
    PushFrame {
        frame: String,
    },
    PushDisconnect,
}

/// Notifications between components, handled in order before the current
/// call returns.
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    PushOk,
    PushNotConnected(UidlRequest),
    PushReconnectPending,
    PushError { transport: Option<TransportKind> },
    PushClientTimeout,
    PushClosed,
    PushInvalidContent(String),
    PushMessage(Box<UidlMessage>),
    PushDisconnected,
    /// Re-send a payload that failed, on whichever channel is now active.
    Resend(UidlRequest),
    HeartbeatProbe,
    EndRequest,
    PauseHeartbeat,
    ResumeHeartbeat,
    Indicator(ConnectionIndicator),
    Terminate,
}

/// Work that runs once the current synchronous turn has finished, before
/// any timer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Deferred {
    FlushOutbox,
    SendInvocations,
    AfterServerUpdate(Vec<NodeId>),
    ResponseHandlingEnded,
}

#[derive(Debug, Default)]
pub struct Io {
    transmits: VecDeque<Transmit>,
    events: VecDeque<ClientEvent>,
    signals: VecDeque<Signal>,
    deferred: VecDeque<Deferred>,
}

impl Io {
    pub fn transmit(&mut self, transmit: Transmit) {
        self.transmits.push_back(transmit);
    }

    pub fn event(&mut self, event: ClientEvent) {
        self.events.push_back(event);
    }

    pub fn signal(&mut self, signal: Signal) {
        self.signals.push_back(signal);
    }

    pub fn defer(&mut self, task: Deferred) {
        self.deferred.push_back(task);
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn poll_signal(&mut self) -> Option<Signal> {
        self.signals.pop_front()
    }

    pub fn poll_deferred(&mut self) -> Option<Deferred> {
        self.deferred.pop_front()
    }

    pub fn has_transmits(&self) -> bool {
        !self.transmits.is_empty()
    }
}
