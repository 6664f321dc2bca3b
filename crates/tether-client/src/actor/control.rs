//! The serialized control loop behind a [`super::ConnectionActor`].

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use tether_core::{ConnectionConfig, EndpointId, ReconnectTower, Scope, SubscriptionId};

use crate::conn::Connection;
use crate::dial::{DialConfig, Dialed, Dialer, InvariantHook};
use crate::error::{ActorError, DialError, InvariantViolation};
use crate::requests::{InboundRequest, discard_requests_except_keepalives};
use crate::ticket::{ChannelHandle, ChannelTarget, ChannelTicket};

use super::registry::ChannelRegistry;
use super::{ActorState, ActorStatus, Command};

/// Owns every piece of mutable connection state. Runs on a single task, so
/// nothing here needs locking.
pub(super) struct ControlLoop {
    endpoint: EndpointId,
    name: Arc<str>,
    dialer: Arc<dyn Dialer>,
    settings: ConnectionConfig,
    accept_new_identity_once: bool,
    invariant_hook: InvariantHook,

    parent: Option<Scope>,
    /// Lives for the whole actor; detached from `parent` only at shutdown.
    scope: Scope,
    /// Child of `scope`, replaced on every reconnect. Named streams and
    /// their request drains live under it.
    generation_scope: Scope,

    session: Option<Dialed>,
    channels: ChannelRegistry,
    last_connect: Option<Instant>,
    generation: u64,
    state: ActorState,
    status: watch::Sender<ActorStatus>,
    subscription: Option<(ReconnectTower, SubscriptionId)>,
}

impl ControlLoop {
    pub(super) fn new(
        config: &DialConfig,
        parent: Option<Scope>,
        name: Arc<str>,
        status: watch::Sender<ActorStatus>,
    ) -> Self {
        let scope = parent.as_ref().map_or_else(Scope::new, Scope::child);
        let generation_scope = scope.child();
        Self {
            endpoint: config.endpoint.clone(),
            name,
            dialer: Arc::clone(&config.dialer),
            settings: config.settings.clone(),
            accept_new_identity_once: config.accept_new_identity_once,
            invariant_hook: Arc::clone(&config.invariant_hook),
            parent,
            scope,
            generation_scope,
            session: None,
            channels: ChannelRegistry::default(),
            last_connect: None,
            generation: 0,
            state: ActorState::Disconnected,
            status,
            subscription: None,
        }
    }

    pub(super) const fn scope(&self) -> &Scope {
        &self.scope
    }

    pub(super) fn set_subscription(&mut self, tower: ReconnectTower, id: SubscriptionId) {
        self.subscription = Some((tower, id));
    }

    /// Service commands one at a time until the actor scope stops or an
    /// unrecoverable condition ends the loop, then tear everything down.
    pub(super) async fn run(mut self, mut mailbox: mpsc::Receiver<Command>) {
        info!(name = %self.name, "Connection actor running");
        let scope = self.scope.clone();
        loop {
            let command = tokio::select! {
                biased;
                () = scope.stopped() => break,
                command = mailbox.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            if self.handle(command).await.is_break() {
                break;
            }
        }
        // A stop overtakes whatever is still queued. Those commands are
        // answered in arrival order, all with ShuttingDown.
        mailbox.close();
        let mut rejected = 0_usize;
        while let Ok(command) = mailbox.try_recv() {
            command.reject();
            rejected += 1;
        }
        if rejected > 0 {
            debug!(rejected, "Rejected queued commands at shutdown");
        }
        self.finish().await;
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::ReconnectNeeded(endpoint) => self.on_reconnect_needed(endpoint).await,
            Command::GetClient(reply) => {
                let client = self
                    .session
                    .as_ref()
                    .map(|s| Arc::clone(&s.conn))
                    .ok_or_else(|| ActorError::NotConnected(self.endpoint.clone()));
                let _ = reply.send(client);
                ControlFlow::Continue(())
            }
            Command::GetCloser(reply) => {
                let closer = self
                    .session
                    .as_ref()
                    .map(|s| Arc::clone(&s.closer))
                    .ok_or_else(|| ActorError::NotConnected(self.endpoint.clone()));
                let _ = reply.send(closer);
                ControlFlow::Continue(())
            }
            Command::OpenChannel(ticket) => self.open_channel(ticket).await,
            Command::CloseChannel(id, reply) => {
                let closed = self.channels.close(id).await;
                self.publish();
                let _ = reply.send(closed);
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_reconnect_needed(&mut self, endpoint: EndpointId) -> ControlFlow<()> {
        if endpoint != self.endpoint {
            self.violation(&InvariantViolation::IdentityMismatch {
                expected: self.endpoint.clone(),
                got: endpoint,
            });
            return ControlFlow::Break(());
        }

        let debounce = self.settings.reconnect_debounce();
        if let Some(at) = self.last_connect
            && at.elapsed() < debounce
        {
            debug!("Reconnect notification within debounce window, ignoring");
            return ControlFlow::Continue(());
        }

        match self.reconnect().await {
            Ok(()) => ControlFlow::Continue(()),
            Err(ActorError::ShuttingDown) => ControlFlow::Break(()),
            Err(e) => {
                error!(error = %e, "Reconnect failed, staying disconnected");
                ControlFlow::Continue(())
            }
        }
    }

    /// Initial connect, run by `create` before the loop starts.
    pub(super) async fn connect(&mut self) -> Result<(), ActorError> {
        self.set_state(ActorState::Reconnecting);
        match self.connect_with_retry().await {
            Ok(dialed) => {
                self.install(dialed);
                Ok(())
            }
            Err(e) => {
                self.set_state(ActorState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tear down the current generation and dial a fresh one.
    async fn reconnect(&mut self) -> Result<(), ActorError> {
        info!(generation = self.generation, "Reconnecting");
        self.set_state(ActorState::Reconnecting);
        self.retire_session().await;
        self.connect().await
    }

    /// Close every channel, replace the generation scope and close the old
    /// connection. Errors from the old connection are only logged.
    async fn retire_session(&mut self) {
        self.channels.close_all().await;

        let old = std::mem::replace(&mut self.generation_scope, Scope::new());
        old.request_stop();
        old.mark_done();
        self.scope.remove_child(&old);
        self.scope.add_child(&self.generation_scope);

        if let Some(session) = self.session.take()
            && let Err(e) = session.closer.close().await
        {
            debug!(error = %e, "Closing replaced connection failed");
        }
        self.publish();
    }

    /// Up to `reconnect_attempts` dials with a fixed pause between them.
    ///
    /// Refusals and handshake failures are retried. An unknown remote
    /// identity ends the sequence at once, unless the one-time accept
    /// allowance is still unused: then the allowance is spent and the dial
    /// is repeated immediately with acceptance enabled, without consuming
    /// an attempt.
    async fn connect_with_retry(&mut self) -> Result<Dialed, ActorError> {
        let attempts = self.settings.reconnect_attempts;
        let pause = self.settings.reconnect_pause();
        let mut accept_new_identity = false;
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < attempts {
            attempt += 1;
            let dialed = tokio::select! {
                biased;
                () = self.scope.stopped() => return Err(ActorError::ShuttingDown),
                dialed = self.dialer.dial(&self.endpoint, accept_new_identity) => dialed,
            };

            match dialed {
                Ok(dialed) => {
                    info!(attempt, remote = %dialed.conn.metadata().remote_addr(), "Connected");
                    return Ok(dialed);
                }
                Err(e) if e.is_identity() => {
                    if !self.accept_new_identity_once {
                        error!(error = %e, "Remote identity rejected");
                        return Err(ActorError::Dial {
                            endpoint: self.endpoint.clone(),
                            source: e,
                        });
                    }
                    warn!(error = %e, "Unknown remote identity, accepting it once");
                    self.accept_new_identity_once = false;
                    accept_new_identity = true;
                    attempt -= 1;
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Dial failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::select! {
                            biased;
                            () = self.scope.stopped() => return Err(ActorError::ShuttingDown),
                            () = tokio::time::sleep(pause) => {}
                        }
                    }
                }
            }
        }

        Err(ActorError::ReconnectExhausted {
            endpoint: self.endpoint.clone(),
            attempts,
            source: last_error
                .unwrap_or_else(|| DialError::Handshake("no dial attempted".to_string())),
        })
    }

    fn install(&mut self, dialed: Dialed) {
        self.session = Some(dialed);
        self.last_connect = Some(Instant::now());
        self.generation += 1;
        self.set_state(ActorState::Connected);
    }

    /// Serve one channel ticket. Reconnects first when there is no live
    /// client; a failed reconnect fails only this ticket.
    async fn open_channel(&mut self, ticket: ChannelTicket) -> ControlFlow<()> {
        if ticket.is_abandoned() {
            debug!(target = %ticket.target(), "Dropping abandoned channel request");
            return ControlFlow::Continue(());
        }

        let conn = match self.session.as_ref().map(|s| Arc::clone(&s.conn)) {
            Some(conn) => conn,
            None => {
                info!(target = %ticket.target(), "No live connection, reconnecting for channel");
                if let Err(e) = self.connect().await {
                    let stop = e.is_shutting_down();
                    if !stop {
                        warn!(error = %e, "Reconnect for channel request failed");
                    }
                    let _ = ticket.complete(Err(e));
                    return if stop {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    };
                }
                match self.session.as_ref() {
                    Some(session) => Arc::clone(&session.conn),
                    None => {
                        let _ = ticket.complete(Err(ActorError::NotConnected(self.endpoint.clone())));
                        return ControlFlow::Continue(());
                    }
                }
            }
        };

        let target = ticket.target().clone();
        let result = self.open_on(&conn, target).await;

        if let Err(Ok(handle)) = ticket.complete(result) {
            debug!(channel = %handle.id(), "Requester gone, closing new channel");
            self.channels.close(handle.id()).await;
            self.publish();
        }
        ControlFlow::Continue(())
    }

    async fn open_on(&mut self, conn: &Connection, target: ChannelTarget) -> Result<ChannelHandle, ActorError> {
        let (channel, drain) = match &target {
            ChannelTarget::Forward(addr) => {
                let channel = conn.dial("tcp", addr.trim()).await;
                (channel, None)
            }
            ChannelTarget::NamedStream => {
                match conn
                    .open_channel(&self.settings.stream_channel_name, &[], &self.generation_scope)
                    .await
                {
                    Ok((channel, inbound)) => (Ok(channel), Some(self.spawn_drain(inbound))),
                    Err(e) => (Err(e), None),
                }
            }
        };

        let channel = channel.map_err(|e| {
            warn!(target = %target, error = %e, "Channel open failed");
            ActorError::Channel(e)
        })?;

        let id = self.channels.insert(Arc::clone(&channel), drain);
        if let Some(timeout) = self.settings.channel_idle_timeout() {
            channel.set_idle_timeout(timeout);
        }
        self.publish();
        debug!(channel = %id, target = %target, "Channel opened");
        Ok(ChannelHandle::new(id, target, channel))
    }

    /// Start the keepalive-aware request drain for a named stream under the
    /// current generation scope.
    fn spawn_drain(&self, inbound: mpsc::Receiver<InboundRequest>) -> CancellationToken {
        let cancel = CancellationToken::new();
        let drain = tokio::spawn(
            discard_requests_except_keepalives(inbound, cancel.clone(), self.generation_scope.clone())
                .in_current_span(),
        );
        tokio::spawn(supervise_drain(drain).in_current_span());
        cancel
    }

    fn violation(&self, violation: &InvariantViolation) {
        (self.invariant_hook)(violation);
        error!(%violation, "Invariant violated, shutting down");
    }

    fn set_state(&mut self, state: ActorState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(ActorStatus {
            state: self.state,
            generation: self.generation,
            open_channels: self.channels.len(),
        });
    }

    /// Final teardown. Runs exactly once, after the loop exits or when the
    /// initial connect fails.
    pub(super) async fn finish(mut self) {
        self.set_state(ActorState::ShuttingDown);
        if let Some((tower, id)) = self.subscription.take() {
            tower.unsubscribe(id);
        }

        let closed = self.channels.close_all().await;
        self.generation_scope.request_stop();
        self.generation_scope.mark_done();

        if let Some(session) = self.session.take()
            && let Err(e) = session.closer.close().await
        {
            debug!(error = %e, "Closing connection at shutdown failed");
        }

        self.scope.request_stop();
        if let Some(parent) = &self.parent {
            parent.remove_child(&self.scope);
        }
        self.publish();
        self.scope.mark_done();
        info!(closed, "Connection actor stopped");
    }
}

/// Forward tower notifications into the actor's mailbox, preserving their
/// order relative to other commands.
pub(super) async fn forward_notifications(
    mut slot: mpsc::Receiver<EndpointId>,
    mailbox: mpsc::Sender<Command>,
    scope: Scope,
) {
    loop {
        let endpoint = tokio::select! {
            biased;
            () = scope.stopped() => break,
            endpoint = slot.recv() => match endpoint {
                Some(endpoint) => endpoint,
                None => break,
            },
        };
        if mailbox.send(Command::ReconnectNeeded(endpoint)).await.is_err() {
            break;
        }
    }
}

async fn supervise_drain(drain: JoinHandle<usize>) {
    match drain.await {
        Ok(handled) => debug!(handled, "Request drain exited"),
        Err(e) if e.is_panic() => error!(error = %e, "Request drain panicked"),
        Err(_) => {}
    }
}
