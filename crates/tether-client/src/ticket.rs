//! Single-use channel request tickets.
//!
//! A caller builds a [`ChannelTicket`], hands it to the connection actor and
//! waits on the matching [`PendingChannel`]. The actor is the only writer:
//! completing a ticket consumes it, so a ticket can never be answered twice.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::oneshot;
use uuid::Uuid;

use tether_core::Scope;

use crate::error::ActorError;
use crate::transport::Channel;

/// What kind of channel to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTarget {
    /// Direct network forward to a `host:port`.
    Forward(String),
    /// A named logical stream on the connection itself.
    NamedStream,
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward(addr) => write!(f, "forward:{addr}"),
            Self::NamedStream => f.write_str("named-stream"),
        }
    }
}

/// An open channel, as handed back to the caller that requested it.
#[derive(Clone)]
pub struct ChannelHandle {
    id: Uuid,
    target: ChannelTarget,
    channel: Arc<dyn Channel>,
}

impl ChannelHandle {
    pub(crate) fn new(id: Uuid, target: ChannelTarget, channel: Arc<dyn Channel>) -> Self {
        Self {
            id,
            target,
            channel,
        }
    }

    /// Registry key the actor tracks this channel under.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    pub const fn target(&self) -> &ChannelTarget {
        &self.target
    }

    pub fn channel(&self) -> Arc<dyn Channel> {
        Arc::clone(&self.channel)
    }
}

impl Deref for ChannelHandle {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.id)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

pub type ChannelResult = Result<ChannelHandle, ActorError>;

/// Request for one new channel. Consumed when completed.
#[derive(Debug)]
pub struct ChannelTicket {
    target: ChannelTarget,
    done: oneshot::Sender<ChannelResult>,
}

/// The issuer's side of a [`ChannelTicket`].
#[derive(Debug)]
pub struct PendingChannel {
    rx: oneshot::Receiver<ChannelResult>,
}

impl ChannelTicket {
    pub fn new(target: ChannelTarget) -> (Self, PendingChannel) {
        let (done, rx) = oneshot::channel();
        (Self { target, done }, PendingChannel { rx })
    }

    pub const fn target(&self) -> &ChannelTarget {
        &self.target
    }

    /// Whether the issuer has stopped waiting.
    pub fn is_abandoned(&self) -> bool {
        self.done.is_closed()
    }

    /// Write the result and signal the issuer. Hands the result back if the
    /// issuer is gone, so an opened channel can be cleaned up.
    pub fn complete(self, result: ChannelResult) -> Result<(), ChannelResult> {
        self.done.send(result)
    }
}

impl PendingChannel {
    /// Wait for the actor's answer, giving up with
    /// [`ActorError::ShuttingDown`] once `scope` stops or the ticket is
    /// dropped unanswered.
    pub async fn wait(self, scope: &Scope) -> ChannelResult {
        let mut rx = self.rx;
        tokio::select! {
            biased;
            result = &mut rx => result.unwrap_or(Err(ActorError::ShuttingDown)),
            () = scope.stopped() => {
                // An answer written just before the stop still wins.
                rx.try_recv().unwrap_or(Err(ActorError::ShuttingDown))
            }
        }
    }
}
