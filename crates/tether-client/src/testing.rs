//! In-memory collaborators for exercising the client without a network.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use tether_core::{EndpointId, Scope};

use crate::conn::{ConnMetadata, Connection};
use crate::dial::{Dialed, Dialer};
use crate::error::{ConnError, DialError, OpenChannelError};
use crate::requests::{InboundRequest, RequestReply};
use crate::transport::{Channel, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A channel that loops sent bytes back to `recv`.
#[derive(Debug, Default)]
pub struct MockChannel {
    closed: AtomicBool,
    hang_on_close: AtomicBool,
    idle_timeout: Mutex<Option<Duration>>,
    buffered: Mutex<VecDeque<Vec<u8>>>,
    readable: Notify,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Make `close` never return.
    pub fn hang_on_close(&self) {
        self.hang_on_close.store(true, Ordering::SeqCst);
    }

    /// Idle timeout last applied through [`Channel::set_idle_timeout`].
    pub fn idle_timeout(&self) -> Option<Duration> {
        *lock(&self.idle_timeout)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_one();
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn send(&self, data: &[u8]) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        lock(&self.buffered).push_back(data.to_vec());
        self.readable.notify_one();
        Ok(())
    }

    /// Waits for a frame; `Ok(None)` once the buffer is empty and the
    /// channel is closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, ConnError> {
        loop {
            let frame = lock(&self.buffered).pop_front();
            if let Some(frame) = frame {
                return Ok(Some(frame));
            }
            if self.is_closed() {
                return Ok(None);
            }
            self.readable.notified().await;
        }
    }

    async fn close(&self) -> Result<(), ConnError> {
        if self.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.mark_closed();
        Ok(())
    }

    fn set_idle_timeout(&self, timeout: Duration) {
        *lock(&self.idle_timeout) = Some(timeout);
    }
}

#[derive(Default)]
struct TransportLog {
    reject: Option<OpenChannelError>,
    dialed: Vec<String>,
    opened: Vec<String>,
    channels: Vec<Arc<MockChannel>>,
    request_senders: Vec<mpsc::Sender<InboundRequest>>,
}

/// Transport that records what was asked of it.
#[derive(Default)]
pub struct MockTransport {
    log: Mutex<TransportLog>,
    shutdowns: AtomicUsize,
    hold_requests: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plausible session metadata for `user`.
    pub fn metadata(user: &str) -> ConnMetadata {
        ConnMetadata::new(
            user.to_string(),
            vec![0xde, 0xad, 0xbe, 0xef],
            b"SSH-2.0-tether".to_vec(),
            b"SSH-2.0-mock".to_vec(),
            SocketAddr::from(([127, 0, 0, 1], 50_000)),
            SocketAddr::from(([10, 0, 0, 5], 22)),
        )
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    /// Make `send_request` wait forever.
    pub fn hold_requests(&self) {
        self.hold_requests.store(true, Ordering::SeqCst);
    }

    /// Refuse every later named-channel open with `error`.
    pub fn reject_channels(&self, error: OpenChannelError) {
        lock(&self.log).reject = Some(error);
    }

    /// Addresses passed to `dial`, in order.
    pub fn dialed(&self) -> Vec<String> {
        lock(&self.log).dialed.clone()
    }

    /// Channel names passed to `open_channel`, in order.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.log).opened.clone()
    }

    /// Every channel handed out so far.
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.log).channels.clone()
    }

    /// Sender feeding the request stream of the most recent named channel.
    pub fn request_sender(&self) -> Option<mpsc::Sender<InboundRequest>> {
        lock(&self.log).request_senders.last().cloned()
    }

    fn track(&self, channel: &Arc<MockChannel>) {
        lock(&self.log).channels.push(Arc::clone(channel));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_request(
        &self,
        _name: &str,
        _want_reply: bool,
        payload: &[u8],
    ) -> Result<RequestReply, ConnError> {
        if self.hold_requests.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(RequestReply::accepted(payload.to_vec()))
    }

    async fn open_channel(
        &self,
        name: &str,
        _data: &[u8],
        scope: &Scope,
    ) -> Result<(Arc<dyn Channel>, mpsc::Receiver<InboundRequest>), ConnError> {
        let (tx, rx) = mpsc::channel(8);
        {
            let mut log = lock(&self.log);
            log.opened.push(name.to_string());
            if let Some(reject) = &log.reject {
                return Err(ConnError::Rejected(reject.clone()));
            }
            log.request_senders.push(tx);
        }

        let channel = Arc::new(MockChannel::new());
        self.track(&channel);

        let scope = scope.clone();
        let watched = Arc::clone(&channel);
        tokio::spawn(async move {
            scope.stopped().await;
            watched.mark_closed();
        });

        Ok((channel as Arc<dyn Channel>, rx))
    }

    async fn dial(&self, _network: &str, addr: &str) -> Result<Arc<dyn Channel>, ConnError> {
        lock(&self.log).dialed.push(addr.to_string());
        let channel = Arc::new(MockChannel::new());
        self.track(&channel);
        Ok(channel as Arc<dyn Channel>)
    }

    async fn shutdown(&self) -> Result<(), ConnError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`ScriptedDialer`] does on one attempt.
#[derive(Debug, Clone)]
pub enum DialOutcome {
    Connect,
    Refuse,
    /// Fails with an unknown-identity error unless the attempt is allowed
    /// to accept a new identity, in which case it connects.
    UnknownIdentity,
    Fail(String),
}

/// Dialer that follows a queued script, connecting once the script runs out.
/// Every successful attempt gets a fresh [`MockTransport`].
#[derive(Default)]
pub struct ScriptedDialer {
    script: Mutex<VecDeque<DialOutcome>>,
    accept_flags: Mutex<Vec<bool>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    always_refuse: AtomicBool,
}

impl ScriptedDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for the next attempts.
    pub fn script(&self, outcomes: impl IntoIterator<Item = DialOutcome>) {
        lock(&self.script).extend(outcomes);
    }

    /// Queue `n` refusals.
    pub fn refuse(&self, n: usize) {
        self.script(std::iter::repeat_n(DialOutcome::Refuse, n));
    }

    /// Refuse every attempt once the script is exhausted, instead of
    /// connecting.
    pub fn refuse_forever(&self, refuse: bool) {
        self.always_refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        lock(&self.accept_flags).len()
    }

    /// `accept_new_identity` as passed to each attempt, in order.
    pub fn accept_flags(&self) -> Vec<bool> {
        lock(&self.accept_flags).clone()
    }

    /// Transports behind every connection produced so far.
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        lock(&self.transports).clone()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        lock(&self.transports).last().cloned()
    }

    fn connect(&self, endpoint: &EndpointId) -> Dialed {
        let transport = Arc::new(MockTransport::new());
        lock(&self.transports).push(Arc::clone(&transport));
        let conn = Connection::new(MockTransport::metadata(endpoint.user()), transport);
        Dialed::new(Arc::new(conn))
    }
}

#[async_trait]
impl Dialer for ScriptedDialer {
    async fn dial(
        &self,
        endpoint: &EndpointId,
        accept_new_identity: bool,
    ) -> Result<Dialed, DialError> {
        lock(&self.accept_flags).push(accept_new_identity);
        let next = lock(&self.script).pop_front();
        let outcome = next.unwrap_or_else(|| {
            if self.always_refuse.load(Ordering::SeqCst) {
                DialOutcome::Refuse
            } else {
                DialOutcome::Connect
            }
        });

        match outcome {
            DialOutcome::Connect => Ok(self.connect(endpoint)),
            DialOutcome::UnknownIdentity if accept_new_identity => Ok(self.connect(endpoint)),
            DialOutcome::UnknownIdentity => Err(DialError::classify(format!(
                "ssh: handshake failed: knownhosts: key is unknown for {}",
                endpoint.host_port()
            ))),
            DialOutcome::Refuse => Err(DialError::classify(format!(
                "dial tcp {}: connect: connection refused",
                endpoint.host_port()
            ))),
            DialOutcome::Fail(message) => Err(DialError::Handshake(message)),
        }
    }
}
