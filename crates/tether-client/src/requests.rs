//! Inbound out-of-band requests and the helpers that drain them.
//!
//! Every request stream handed out by a transport must be serviced
//! continuously; an undrained stream stalls the whole connection.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use tether_core::Scope;

/// Requests whose name starts with this prefix are keepalive checks.
pub const KEEPALIVE_PREFIX: &str = "keepalive";

/// Answer to an out-of-band request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestReply {
    pub ok: bool,
    pub payload: Vec<u8>,
}

impl RequestReply {
    pub const fn rejected() -> Self {
        Self {
            ok: false,
            payload: Vec::new(),
        }
    }

    pub const fn accepted(payload: Vec<u8>) -> Self {
        Self { ok: true, payload }
    }
}

/// A request received from the remote side.
#[derive(Debug)]
pub struct InboundRequest {
    pub name: String,
    pub want_reply: bool,
    pub payload: Vec<u8>,
    reply_tx: Option<oneshot::Sender<RequestReply>>,
}

impl InboundRequest {
    /// Build a request plus the receiver its reply will arrive on.
    pub fn new(
        name: impl Into<String>,
        want_reply: bool,
        payload: Vec<u8>,
    ) -> (Self, oneshot::Receiver<RequestReply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (
            Self {
                name: name.into(),
                want_reply,
                payload,
                reply_tx: Some(reply_tx),
            },
            reply_rx,
        )
    }

    pub fn is_keepalive(&self) -> bool {
        self.name.starts_with(KEEPALIVE_PREFIX)
    }

    /// Send the reply. A no-op when the peer did not ask for one or has
    /// stopped waiting.
    pub fn reply(mut self, reply: RequestReply) {
        if !self.want_reply {
            return;
        }
        if let Some(tx) = self.reply_tx.take() {
            let _ = tx.send(reply);
        }
    }
}

/// Consume and reject every request until the stream ends or `scope` stops.
pub async fn discard_requests(mut inbound: mpsc::Receiver<InboundRequest>, scope: Scope) -> usize {
    let mut handled = 0;
    loop {
        tokio::select! {
            req = inbound.recv() => match req {
                Some(req) => {
                    trace!(name = %req.name, "Rejecting inbound request");
                    req.reply(RequestReply::rejected());
                    handled += 1;
                }
                None => break,
            },
            () = scope.stopped() => break,
        }
    }
    handled
}

/// Like [`discard_requests`], but answers keepalive requests affirmatively so
/// the remote side keeps the channel alive. Also stops when `cancel` fires.
pub async fn discard_requests_except_keepalives(
    mut inbound: mpsc::Receiver<InboundRequest>,
    cancel: CancellationToken,
    scope: Scope,
) -> usize {
    let mut handled = 0;
    loop {
        tokio::select! {
            req = inbound.recv() => match req {
                Some(req) => {
                    if req.is_keepalive() {
                        trace!(name = %req.name, "Acknowledging keepalive");
                        req.reply(RequestReply::accepted(Vec::new()));
                    } else {
                        trace!(name = %req.name, "Rejecting inbound request");
                        req.reply(RequestReply::rejected());
                    }
                    handled += 1;
                }
                None => break,
            },
            () = cancel.cancelled() => break,
            () = scope.stopped() => break,
        }
    }
    debug!(handled, "Request drain finished");
    handled
}
