//! Tokio driver for a [`Client`]. The driver task owns the client, performs
//! its transmits, sleeps until its next deadline and feeds every result back
//! in. Hosts talk to it through a cloneable [`ClientHandle`].

use std::time::Instant;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uplink_proto::constants::{HEARTBEAT_CONTENT_TYPE, JSON_CONTENT_TYPE};
use uplink_proto::{Invocation, UidlMessage};

use crate::client::Client;
use crate::communication::sequencer::LockToken;
use crate::communication::{RequestId, Transmit};
use crate::event::ClientEvent;
use crate::lifecycle::UiState;
use crate::telemetry::preview;
use crate::transport::push::PushSupervisor;
use crate::transport::{HttpRequest, HttpResponse, TransportError, Transports};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("client runtime has stopped")]
    Stopped,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
}

#[derive(Debug)]
enum Command {
    Invoke(Invocation),
    Flush,
    Online,
    Offline,
    BeforeUnload,
    SetPushEnabled(bool),
    Suspend(oneshot::Sender<LockToken>),
    Resume(LockToken),
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientHandle {
    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.commands.send(command).map_err(|_| RuntimeError::Stopped)
    }

    /// Queues an invocation. Everything queued before the driver next wakes
    /// up goes out in one batch.
    pub fn invoke(&self, invocation: Invocation) -> Result<(), RuntimeError> {
        self.send(Command::Invoke(invocation))
    }

    pub fn flush(&self) -> Result<(), RuntimeError> {
        self.send(Command::Flush)
    }

    pub fn online(&self) -> Result<(), RuntimeError> {
        self.send(Command::Online)
    }

    pub fn offline(&self) -> Result<(), RuntimeError> {
        self.send(Command::Offline)
    }

    pub fn before_unload(&self) -> Result<(), RuntimeError> {
        self.send(Command::BeforeUnload)
    }

    pub fn set_push_enabled(&self, enabled: bool) -> Result<(), RuntimeError> {
        self.send(Command::SetPushEnabled(enabled))
    }

    /// Holds back server messages until the returned token is resumed.
    pub async fn suspend_response_handling(&self) -> Result<LockToken, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Suspend(tx))?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    pub fn resume_response_handling(&self, token: LockToken) -> Result<(), RuntimeError> {
        self.send(Command::Resume(token))
    }

    pub fn shutdown(&self) -> Result<(), RuntimeError> {
        self.send(Command::Shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// Starts driving `client`. Subscribe through the handle before awaiting
/// anything to observe the events of the first turn.
pub fn spawn(
    client: Client,
    transports: Transports,
    initial: Option<UidlMessage>,
) -> (ClientHandle, JoinHandle<()>) {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let handle = ClientHandle {
        commands,
        events: events.clone(),
    };
    let driver = Driver {
        client,
        transports,
        events,
        push: None,
    };
    let task = tokio::spawn(driver.run(command_rx, initial));
    (handle, task)
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

type Response = (RequestId, Result<HttpResponse, TransportError>);

struct Driver {
    client: Client,
    transports: Transports,
    events: broadcast::Sender<ClientEvent>,
    push: Option<PushSupervisor>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, initial: Option<UidlMessage>) {
        let (responses_tx, mut responses) = mpsc::unbounded_channel::<Response>();
        // Let the host subscribe before the first events go out.
        tokio::task::yield_now().await;
        self.client.start(initial, now());

        loop {
            self.drain(&responses_tx);
            if self.client.state() == UiState::Terminated {
                tracing::info!(target: "uplink::runtime", "client terminated, stopping driver");
                break;
            }

            let deadline = self.client.poll_timeout();
            let timer = async {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending::<()>().await,
                }
            };
            let push = self.push.as_mut();
            let push_event = async move {
                match push {
                    Some(push) => push.next_event().await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.apply(command) {
                        break;
                    }
                    while let Ok(command) = commands.try_recv() {
                        if !self.apply(command) {
                            return;
                        }
                    }
                    self.client.end_turn(now());
                }
                Some((request_id, result)) = responses.recv() => {
                    self.client.handle_response(request_id, result, now());
                }
                event = push_event => match event {
                    Some(event) => self.client.handle_transport_event(event, now()),
                    None => {
                        tracing::debug!(target: "uplink::runtime", "push supervisor finished");
                        self.push = None;
                    }
                },
                _ = timer => self.client.handle_timeout(now()),
            }
        }
    }

    /// Returns false once the driver should stop.
    fn apply(&mut self, command: Command) -> bool {
        let at = now();
        match command {
            Command::Invoke(invocation) => self.client.add_invocation(invocation),
            Command::Flush => self.client.flush(),
            Command::Online => self.client.online(at),
            Command::Offline => self.client.offline(at),
            Command::BeforeUnload => self.client.before_unload(),
            Command::SetPushEnabled(enabled) => self.client.set_push_enabled(enabled, at),
            Command::Suspend(reply) => {
                let token = self.client.suspend_response_handling();
                if reply.send(token).is_err() {
                    self.client.resume_response_handling(token, at);
                }
            }
            Command::Resume(token) => self.client.resume_response_handling(token, at),
            Command::Shutdown => {
                self.client.terminate(at);
                self.drain_events();
                return false;
            }
        }
        true
    }

    fn drain(&mut self, responses: &mpsc::UnboundedSender<Response>) {
        while let Some(transmit) = self.client.poll_transmit() {
            self.perform(transmit, responses);
        }
        self.drain_events();
    }

    fn drain_events(&mut self) {
        while let Some(event) = self.client.poll_event() {
            tracing::trace!(target: "uplink::runtime", ?event, "client event");
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    fn perform(&mut self, transmit: Transmit, responses: &mpsc::UnboundedSender<Response>) {
        match transmit {
            Transmit::Uidl {
                request_id,
                uri,
                body,
            } => {
                tracing::trace!(target: "uplink::runtime", body = %preview(&body, 200), "uidl request");
                let request = HttpRequest {
                    uri,
                    content_type: JSON_CONTENT_TYPE,
                    body,
                };
                self.post(request_id, request, responses);
            }
            Transmit::Heartbeat { request_id, uri } => {
                let request = HttpRequest {
                    uri,
                    content_type: HEARTBEAT_CONTENT_TYPE,
                    body: String::new(),
                };
                self.post(request_id, request, responses);
            }
            Transmit::PushConnect { uri, options } => {
                self.push = Some(PushSupervisor::spawn(self.transports.clone(), uri, options));
            }
            Transmit::PushFrame { frame } => match &self.push {
                Some(push) => {
                    if let Err(err) = push.send(frame) {
                        tracing::warn!(target: "uplink::runtime", error = %err, "push frame dropped");
                    }
                }
                None => tracing::warn!(target: "uplink::runtime", "push frame without a connection"),
            },
            Transmit::PushDisconnect => {
                self.push = None;
            }
        }
    }

    fn post(&self, request_id: RequestId, request: HttpRequest, responses: &mpsc::UnboundedSender<Response>) {
        let requests = self.transports.requests.clone();
        let responses = responses.clone();
        tokio::spawn(async move {
            let result = requests.post(request).await;
            let _ = responses.send((request_id, result));
        });
    }
}
