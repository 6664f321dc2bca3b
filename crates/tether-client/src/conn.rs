//! Established connections and their immutable session metadata.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_core::Scope;

use crate::error::ConnError;
use crate::requests::{InboundRequest, RequestReply};
use crate::transport::{Channel, Transport};

/// Identity of an established session. Fixed once the handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnMetadata {
    user: String,
    session_id: Vec<u8>,
    client_version: Vec<u8>,
    server_version: Vec<u8>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl ConnMetadata {
    pub const fn new(
        user: String,
        session_id: Vec<u8>,
        client_version: Vec<u8>,
        server_version: Vec<u8>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            user,
            session_id,
            client_version,
            server_version,
            local_addr,
            remote_addr,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Session hash negotiated during key exchange.
    pub fn session_id(&self) -> Vec<u8> {
        self.session_id.clone()
    }

    pub fn client_version(&self) -> Vec<u8> {
        self.client_version.clone()
    }

    pub fn server_version(&self) -> Vec<u8> {
        self.server_version.clone()
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Anything that can tear down a live connection.
#[async_trait]
pub trait Closer: Send + Sync + 'static {
    async fn close(&self) -> Result<(), ConnError>;
}

/// A live client connection: metadata plus uniform request and channel
/// operations over a [`Transport`].
///
/// The connection owns a [`Scope`]; closing the connection stops and then
/// completes that scope, which is what [`Connection::done`] and
/// [`Connection::wait`] observe.
pub struct Connection {
    meta: ConnMetadata,
    transport: Arc<dyn Transport>,
    scope: Scope,
}

impl Connection {
    pub fn new(meta: ConnMetadata, transport: Arc<dyn Transport>) -> Self {
        Self {
            meta,
            transport,
            scope: Scope::new(),
        }
    }

    /// Like [`Connection::new`], with the connection's scope attached under
    /// `parent` so stopping the parent closes the connection's channels.
    pub fn with_parent(meta: ConnMetadata, transport: Arc<dyn Transport>, parent: &Scope) -> Self {
        Self {
            meta,
            transport,
            scope: parent.child(),
        }
    }

    pub const fn metadata(&self) -> &ConnMetadata {
        &self.meta
    }

    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn is_closed(&self) -> bool {
        self.scope.is_stop_requested()
    }

    /// Send a named out-of-band request, failing with [`ConnError::Closed`]
    /// if the connection is torn down while waiting.
    pub async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<RequestReply, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        tokio::select! {
            reply = self.transport.send_request(name, want_reply, payload) => {
                let reply = reply?;
                Ok(if want_reply { reply } else { RequestReply::default() })
            }
            () = self.scope.stopped() => Err(ConnError::Closed),
        }
    }

    /// Open a named logical channel under `scope`.
    ///
    /// The returned request stream **must** be drained, e.g. with
    /// [`crate::requests::discard_requests_except_keepalives`].
    pub async fn open_channel(
        &self,
        name: &str,
        data: &[u8],
        scope: &Scope,
    ) -> Result<(Arc<dyn Channel>, mpsc::Receiver<InboundRequest>), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        tokio::select! {
            opened = self.transport.open_channel(name, data, scope) => opened,
            () = self.scope.stopped() => Err(ConnError::Closed),
        }
    }

    /// Open a direct network-forward channel to `addr`.
    pub async fn dial(&self, network: &str, addr: &str) -> Result<Arc<dyn Channel>, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        tokio::select! {
            dialed = self.transport.dial(network, addr) => dialed,
            () = self.scope.stopped() => Err(ConnError::Closed),
        }
    }

    /// Close the connection. Idempotent: only the first call tears the
    /// transport down; later calls return immediately.
    pub async fn close(&self) -> Result<(), ConnError> {
        if !self.scope.request_stop() {
            return Ok(());
        }
        debug!(remote = %self.meta.remote_addr, "Closing connection");
        let result = self.transport.shutdown().await;
        if let Err(e) = &result {
            warn!(remote = %self.meta.remote_addr, error = %e, "Transport shutdown failed");
        }
        self.scope.mark_done();
        result
    }

    /// Resolves once the connection is shutting down.
    pub async fn done(&self) {
        self.scope.stopped().await;
    }

    /// Block until shutdown has fully completed.
    pub async fn wait(&self) {
        self.scope.done().await;
    }
}

#[async_trait]
impl Closer for Connection {
    async fn close(&self) -> Result<(), ConnError> {
        Self::close(self).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("meta", &self.meta)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
