//! `tether` Core Library
//!
//! Leaf primitives shared by the tether client crates:
//! - Hierarchical cancellation scopes
//! - Reconnect-needed notification fan-out
//! - Endpoint identity and address parsing
//! - Configuration resolution and hierarchy
//! - Common error types and tracing setup

pub mod config;
pub mod endpoint;
pub mod error;
pub mod scope;
pub mod tower;
pub mod tracing_init;

pub use config::{Config, ConnectionConfig, LoggingConfig};
pub use endpoint::EndpointId;
pub use error::{Error, Result};
pub use scope::{Scope, ScopeState};
pub use tower::{PublishReport, ReconnectTower, SubscriptionId, Tower};
