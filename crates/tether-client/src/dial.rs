//! The dial collaborator contract and the configuration a connection actor
//! is created from.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use tether_core::{ConnectionConfig, EndpointId, ReconnectTower};

use crate::conn::{Closer, Connection};
use crate::error::{ActorError, DialError, InvariantViolation};

/// Performs one connect-and-handshake attempt.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Dial `endpoint`. When `accept_new_identity` is set, an unknown remote
    /// identity should be recorded and accepted instead of refused.
    async fn dial(
        &self,
        endpoint: &EndpointId,
        accept_new_identity: bool,
    ) -> Result<Dialed, DialError>;
}

/// Result of a successful dial: the client handle and its closer, always
/// produced together.
#[derive(Clone)]
pub struct Dialed {
    pub conn: Arc<Connection>,
    pub closer: Arc<dyn Closer>,
}

impl Dialed {
    /// Use the connection itself as the closer.
    pub fn new(conn: Arc<Connection>) -> Self {
        let closer = Arc::clone(&conn) as Arc<dyn Closer>;
        Self { conn, closer }
    }

    pub fn with_closer(conn: Arc<Connection>, closer: Arc<dyn Closer>) -> Self {
        Self { conn, closer }
    }
}

impl fmt::Debug for Dialed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialed")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

/// Called when an invariant is violated. The default logs and aborts the
/// process; if a custom hook returns, the actor shuts down.
pub type InvariantHook = Arc<dyn Fn(&InvariantViolation) + Send + Sync>;

/// Default [`InvariantHook`]: log loudly, then abort.
pub fn abort_on_violation() -> InvariantHook {
    Arc::new(|violation: &InvariantViolation| {
        error!(%violation, "Unrecoverable invariant violation, aborting");
        std::process::abort();
    })
}

/// Everything a connection actor needs to reach its endpoint.
#[derive(Clone)]
pub struct DialConfig {
    pub endpoint: EndpointId,
    pub dialer: Arc<dyn Dialer>,
    pub settings: ConnectionConfig,
    /// Accept an unknown remote identity once, on first use.
    pub accept_new_identity_once: bool,
    pub notifications: Option<ReconnectTower>,
    pub invariant_hook: InvariantHook,
    pub span: Option<tracing::Span>,
}

impl DialConfig {
    pub fn new(endpoint: EndpointId, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            endpoint,
            dialer,
            settings: ConnectionConfig::default(),
            accept_new_identity_once: false,
            notifications: None,
            invariant_hook: abort_on_violation(),
            span: None,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ConnectionConfig) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn accept_new_identity_once(mut self, accept: bool) -> Self {
        self.accept_new_identity_once = accept;
        self
    }

    /// Subscribe the actor to reconnect-needed notifications from `tower`.
    #[must_use]
    pub fn with_notifications(mut self, tower: ReconnectTower) -> Self {
        self.notifications = Some(tower);
        self
    }

    #[must_use]
    pub fn on_invariant_violation(mut self, hook: InvariantHook) -> Self {
        self.invariant_hook = hook;
        self
    }

    /// Run the actor's control loop inside `span` instead of a default one.
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Check the fields a dial cannot proceed without.
    pub fn validate(&self) -> Result<(), ActorError> {
        if self.endpoint.user().trim().is_empty() {
            return Err(ActorError::Invariant(InvariantViolation::MissingConfig(
                "endpoint user".to_string(),
            )));
        }
        if let Err(e) = self.endpoint.host_and_port() {
            return Err(ActorError::Invariant(InvariantViolation::MissingConfig(
                format!("endpoint host:port ({e})"),
            )));
        }
        self.settings.validate()?;
        Ok(())
    }
}

impl fmt::Debug for DialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialConfig")
            .field("endpoint", &self.endpoint)
            .field("settings", &self.settings)
            .field("accept_new_identity_once", &self.accept_new_identity_once)
            .field("notifications", &self.notifications)
            .finish_non_exhaustive()
    }
}
