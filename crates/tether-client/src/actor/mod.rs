//! Connection actor: one persistent, auto-reconnecting connection per
//! endpoint, multiplexed into channels.
//!
//! All connection state (the live client/closer pair and the channel
//! registry) is owned by a single control loop. Callers never touch it
//! directly; they send commands through a mailbox and wait for the reply,
//! racing the actor's [`Scope`] so a stopping actor answers promptly with
//! [`ActorError::ShuttingDown`] instead of leaving them blocked.
//!
//! Commands are serviced strictly in arrival order, and reconnection only
//! ever runs inside the loop, so at most one reconnect is in flight. A stop
//! request is the one exception to that order: it is observed ahead of any
//! commands still queued, and those are then answered, in order, with
//! [`ActorError::ShuttingDown`].

mod control;
mod registry;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;
use uuid::Uuid;

use tether_core::{EndpointId, Scope};

use crate::conn::{Closer, Connection};
use crate::dial::DialConfig;
use crate::error::ActorError;
use crate::ticket::{ChannelHandle, ChannelTarget, ChannelTicket};

use control::ControlLoop;

/// Lifecycle of a connection actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Disconnected,
    Connected,
    Reconnecting,
    ShuttingDown,
}

/// Snapshot published by the control loop after every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorStatus {
    pub state: ActorState,
    /// Number of successful connects so far; the initial connect is 1.
    pub generation: u64,
    pub open_channels: usize,
}

impl ActorStatus {
    const fn initial() -> Self {
        Self {
            state: ActorState::Disconnected,
            generation: 0,
            open_channels: 0,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ActorError>>;

pub(crate) enum Command {
    ReconnectNeeded(EndpointId),
    GetClient(Reply<Arc<Connection>>),
    GetCloser(Reply<Arc<dyn Closer>>),
    OpenChannel(ChannelTicket),
    CloseChannel(Uuid, oneshot::Sender<bool>),
}

impl Command {
    /// Answer without servicing; the actor is stopping.
    fn reject(self) {
        match self {
            Self::ReconnectNeeded(_) => {}
            Self::GetClient(reply) => {
                let _ = reply.send(Err(ActorError::ShuttingDown));
            }
            Self::GetCloser(reply) => {
                let _ = reply.send(Err(ActorError::ShuttingDown));
            }
            Self::OpenChannel(ticket) => {
                let _ = ticket.complete(Err(ActorError::ShuttingDown));
            }
            // Every channel is closed during teardown; a dropped reply reads
            // as ShuttingDown.
            Self::CloseChannel(..) => {}
        }
    }
}

/// Handle to a running connection actor. Cheap to clone; every clone talks
/// to the same control loop.
#[derive(Clone)]
pub struct ConnectionActor {
    endpoint: EndpointId,
    name: Arc<str>,
    mailbox: mpsc::Sender<Command>,
    scope: Scope,
    status: watch::Receiver<ActorStatus>,
}

impl ConnectionActor {
    /// Connect to `config.endpoint` and start the control loop.
    ///
    /// The initial connect happens before this returns; if it exhausts its
    /// retry budget (or hits a non-retryable identity failure) construction
    /// fails and nothing is left running. The actor's scope is attached
    /// under `parent` until final shutdown.
    pub async fn create(
        config: DialConfig,
        parent: Option<&Scope>,
        name: impl Into<String>,
    ) -> Result<Self, ActorError> {
        let name: Arc<str> = Arc::from(name.into());

        if let Err(e) = config.validate() {
            if let ActorError::Invariant(violation) = &e {
                (config.invariant_hook)(violation);
            }
            return Err(e);
        }

        let span = config.span.clone().unwrap_or_else(|| {
            tracing::info_span!(
                "connection_actor",
                endpoint = %config.endpoint,
                name = %name
            )
        });

        let (status_tx, status_rx) = watch::channel(ActorStatus::initial());
        let (mailbox_tx, mailbox_rx) = mpsc::channel(config.settings.mailbox_capacity);

        let mut control = ControlLoop::new(&config, parent.cloned(), Arc::clone(&name), status_tx);
        let scope = control.scope().clone();

        if let Err(e) = control.connect().instrument(span.clone()).await {
            control.finish().instrument(span).await;
            return Err(e);
        }

        if let Some(tower) = &config.notifications {
            let (slot_tx, slot_rx) = mpsc::channel(1);
            let subscription = tower.subscribe(slot_tx);
            control.set_subscription(tower.clone(), subscription);
            tokio::spawn(
                control::forward_notifications(slot_rx, mailbox_tx.clone(), scope.clone())
                    .instrument(span.clone()),
            );
        }

        tokio::spawn(control.run(mailbox_rx).instrument(span));

        Ok(Self {
            endpoint: config.endpoint,
            name,
            mailbox: mailbox_tx,
            scope,
            status: status_rx,
        })
    }

    pub const fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actor's own scope. Stopping it shuts the actor down.
    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn status(&self) -> ActorStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ActorStatus> {
        self.status.clone()
    }

    /// Current client handle.
    pub async fn get_client(&self) -> Result<Arc<Connection>, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetClient(tx)).await?;
        self.reply(rx).await
    }

    /// Current closer handle, paired with the client from the same connect.
    pub async fn get_closer(&self) -> Result<Arc<dyn Closer>, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::GetCloser(tx)).await?;
        self.reply(rx).await
    }

    /// Open a new channel, reconnecting first if there is no live client.
    pub async fn request_channel(&self, target: ChannelTarget) -> Result<ChannelHandle, ActorError> {
        let (ticket, pending) = ChannelTicket::new(target);
        self.submit(ticket).await?;
        pending.wait(&self.scope).await
    }

    /// Hand a caller-built ticket to the control loop. The caller waits on
    /// its own `PendingChannel`, which it should race against [`Self::scope`].
    pub async fn submit(&self, ticket: ChannelTicket) -> Result<(), ActorError> {
        self.send(Command::OpenChannel(ticket)).await
    }

    /// Close one channel and drop it from the registry. Returns `false` if
    /// the channel was already gone (for example after a reconnect).
    pub async fn close_channel(&self, handle: &ChannelHandle) -> Result<bool, ActorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::CloseChannel(handle.id(), tx)).await?;
        tokio::select! {
            biased;
            closed = rx => closed.map_err(|_| ActorError::ShuttingDown),
            () = self.scope.stopped() => Err(ActorError::ShuttingDown),
        }
    }

    /// Queue a reconnect-needed notification, exactly as if it had arrived
    /// through the subscribed tower.
    pub async fn notify_reconnect_needed(&self, endpoint: EndpointId) -> Result<(), ActorError> {
        self.send(Command::ReconnectNeeded(endpoint)).await
    }

    /// Ask the actor to stop. Idempotent; returns `true` for the call that
    /// initiated shutdown.
    pub fn shutdown(&self) -> bool {
        self.scope.request_stop()
    }

    /// Wait until shutdown has completed: channels closed, connection
    /// closed, scope detached from its parent.
    pub async fn wait(&self) {
        self.scope.done().await;
    }

    async fn send(&self, command: Command) -> Result<(), ActorError> {
        if self.scope.is_stop_requested() {
            return Err(ActorError::ShuttingDown);
        }
        tokio::select! {
            sent = self.mailbox.send(command) => sent.map_err(|_| ActorError::ShuttingDown),
            () = self.scope.stopped() => Err(ActorError::ShuttingDown),
        }
    }

    async fn reply<T>(&self, rx: oneshot::Receiver<Result<T, ActorError>>) -> Result<T, ActorError> {
        tokio::select! {
            biased;
            reply = rx => reply.unwrap_or(Err(ActorError::ShuttingDown)),
            () = self.scope.stopped() => Err(ActorError::ShuttingDown),
        }
    }
}

impl std::fmt::Debug for ConnectionActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionActor")
            .field("endpoint", &self.endpoint)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
