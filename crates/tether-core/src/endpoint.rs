//! Endpoint identity: the (user, host:port, nickname) triple an actor serves.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a remote endpoint. Immutable once a connection actor owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    user: String,
    host_port: String,
    nickname: String,
}

impl EndpointId {
    pub fn new(
        user: impl Into<String>,
        host_port: impl Into<String>,
        nickname: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            host_port: host_port.into(),
            nickname: nickname.into(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Host and port split out of `host_port`.
    pub fn host_and_port(&self) -> Result<(String, u16)> {
        split_host_port(&self.host_port)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host_port)?;
        if !self.nickname.is_empty() {
            write!(f, " ({})", self.nickname)?;
        }
        Ok(())
    }
}

/// Split `host:port` into its parts.
///
/// An empty host means the loopback address. IPv6 hosts must be bracketed
/// (`[::1]:22`); the brackets are stripped from the returned host.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| Error::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = addr.trim();
    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing ']' in address"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port in address"))?;
        (host, port)
    } else {
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port in address"))?;
        if host.contains(':') {
            return Err(invalid("too many colons in address"));
        }
        (host, port)
    };

    if port.is_empty() {
        return Err(invalid("no port found"));
    }
    let port: u16 = port
        .parse()
        .map_err(|e| invalid(&format!("bad port: {e}")))?;
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Ok((host.to_string(), port))
}
