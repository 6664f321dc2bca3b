//! `tether` Client Library
//!
//! Keeps one persistent, auto-reconnecting connection per remote endpoint
//! and multiplexes it into channels:
//!
//! - **Actor**: serialized control loop owning the live client, its closer
//!   and every open channel
//! - **Tickets**: single-use channel requests answered by the actor
//! - **Connections**: uniform request/channel operations over a pluggable
//!   secure transport
//! - **Requests**: helpers that drain inbound out-of-band requests

pub mod actor;
pub mod conn;
pub mod dial;
pub mod error;
pub mod requests;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod ticket;
pub mod transport;

pub use actor::{ActorState, ActorStatus, ConnectionActor};
pub use conn::{Closer, ConnMetadata, Connection};
pub use dial::{DialConfig, Dialed, Dialer, InvariantHook, abort_on_violation};
pub use error::{
    ActorError, ConnError, DialError, InvariantViolation, OpenChannelError, RejectionReason,
};
pub use requests::{
    InboundRequest, KEEPALIVE_PREFIX, RequestReply, discard_requests,
    discard_requests_except_keepalives,
};
pub use ticket::{ChannelHandle, ChannelResult, ChannelTarget, ChannelTicket, PendingChannel};
pub use transport::{Channel, Transport};
