//! Contracts implemented by the secure-transport collaborator.
//!
//! The client core never speaks the wire protocol. It drives an
//! already-handshaken [`Transport`] and the [`Channel`]s it multiplexes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tether_core::Scope;

use crate::error::ConnError;
use crate::requests::{InboundRequest, RequestReply};

/// A raw, post-handshake transport connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send a named out-of-band request. When `want_reply` is false the
    /// returned reply is ignored by callers.
    async fn send_request(
        &self,
        name: &str,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<RequestReply, ConnError>;

    /// Open a named logical channel. The channel should close itself when
    /// `scope` is asked to stop. The returned stream carries inbound
    /// out-of-band requests and must be drained by the caller.
    async fn open_channel(
        &self,
        name: &str,
        data: &[u8],
        scope: &Scope,
    ) -> Result<(Arc<dyn Channel>, mpsc::Receiver<InboundRequest>), ConnError>;

    /// Open a direct network-forward channel to `addr`.
    async fn dial(&self, network: &str, addr: &str) -> Result<Arc<dyn Channel>, ConnError>;

    /// Tear down the underlying network connection.
    async fn shutdown(&self) -> Result<(), ConnError>;
}

/// One multiplexed data channel.
#[async_trait]
pub trait Channel: Send + Sync + fmt::Debug + 'static {
    async fn send(&self, data: &[u8]) -> Result<(), ConnError>;

    /// Next chunk of inbound data; `Ok(None)` once the peer closed the channel.
    async fn recv(&self) -> Result<Option<Vec<u8>>, ConnError>;

    async fn close(&self) -> Result<(), ConnError>;

    /// Best-effort: close the channel after `timeout` without traffic.
    fn set_idle_timeout(&self, timeout: Duration);
}
