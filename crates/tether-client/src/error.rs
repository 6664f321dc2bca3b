//! Error types for the tether client.

use std::fmt;

use tether_core::EndpointId;

/// Why the remote side refused to open a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Prohibited,
    ConnectionFailed,
    UnknownChannelType,
    ResourceShortage,
    /// A reason code outside the well-known set.
    Other(u32),
}

impl RejectionReason {
    pub const fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Prohibited,
            2 => Self::ConnectionFailed,
            3 => Self::UnknownChannelType,
            4 => Self::ResourceShortage,
            other => Self::Other(other),
        }
    }

    pub const fn code(self) -> u32 {
        match self {
            Self::Prohibited => 1,
            Self::ConnectionFailed => 2,
            Self::UnknownChannelType => 3,
            Self::ResourceShortage => 4,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prohibited => f.write_str("administratively prohibited"),
            Self::ConnectionFailed => f.write_str("connect failed"),
            Self::UnknownChannelType => f.write_str("unknown channel type"),
            Self::ResourceShortage => f.write_str("resource shortage"),
            Self::Other(code) => write!(f, "unknown reason {code}"),
        }
    }
}

/// Structured rejection of a channel-open request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rejected: {reason} ({message})")]
pub struct OpenChannelError {
    pub reason: RejectionReason,
    pub message: String,
}

/// Errors from an established connection or one of its channels.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The connection (or channel) was torn down.
    #[error("Connection closed")]
    Closed,

    #[error("Channel open {0}")]
    Rejected(#[from] OpenChannelError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single connect-and-handshake attempt.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    /// Transient network refusal; worth retrying.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The remote identity is unknown or has changed. Never retried unless
    /// the one-shot auto-accept allowance is still available.
    #[error("Remote identity not accepted: {0}")]
    UnknownIdentity(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DialError {
    /// Classify a collaborator's error text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("connection refused") {
            Self::Refused(message)
        } else if IDENTITY_MARKERS.iter().any(|marker| lower.contains(marker)) {
            Self::UnknownIdentity(message)
        } else {
            Self::Handshake(message)
        }
    }

    pub const fn is_identity(&self) -> bool {
        matches!(self, Self::UnknownIdentity(_))
    }

    pub const fn is_retryable(&self) -> bool {
        !self.is_identity()
    }
}

const IDENTITY_MARKERS: &[&str] = &[
    "unknown host",
    "host key mismatch",
    "host key has changed",
    "not in known_hosts",
    "knownhosts",
];

/// Programming errors that must never be retried or swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A reconnect notification named a different endpoint than the actor's.
    IdentityMismatch {
        expected: EndpointId,
        got: EndpointId,
    },
    /// A required dial setting was left unset or malformed.
    MissingConfig(String),
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdentityMismatch { expected, got } => write!(
                f,
                "reconnect notification for {got} delivered to actor for {expected}"
            ),
            Self::MissingConfig(what) => write!(f, "required configuration missing: {what}"),
        }
    }
}

/// Errors surfaced by the connection actor to its callers.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    /// The actor is stopping or stopped.
    #[error("shutting down")]
    ShuttingDown,

    #[error("Not connected to {0}")]
    NotConnected(EndpointId),

    #[error("Dial to {endpoint} failed: {source}")]
    Dial {
        endpoint: EndpointId,
        #[source]
        source: DialError,
    },

    #[error("Reconnect to {endpoint} failed after {attempts} attempts: {source}")]
    ReconnectExhausted {
        endpoint: EndpointId,
        attempts: u32,
        #[source]
        source: DialError,
    },

    #[error("Channel error: {0}")]
    Channel(#[from] ConnError),

    #[error("Configuration error: {0}")]
    Config(#[from] tether_core::Error),

    #[error("Invariant violated: {0}")]
    Invariant(InvariantViolation),
}

impl ActorError {
    pub const fn is_shutting_down(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }
}
