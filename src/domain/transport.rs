// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! A transport is a byte pipe to one remote peer. It knows nothing about
//! frames, sessions or links; the protocol-driving provider feeds what it
//! receives into the protocol engine and writes what the engine produces.
//!
//! Inbound traffic and connection loss are reported as [`TransportEvent`]s on
//! a channel handed over at connect time. The receiving provider processes
//! them on its own serialized queue, never on the transport's I/O task.
//!
//! Concrete implementations live under `src/transport/`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{ProviderError, Result};

/// Address of a remote peer, e.g. `amqp://broker-a:5672`.
///
/// Remote URIs are immutable, cheap to clone, and safe to share across
/// threads. Accessors parse on demand and never fail; missing parts come back
/// empty or `None`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteUri(pub Arc<str>);

impl<T> From<T> for RemoteUri
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        // ---
        RemoteUri(value.into())
    }
}

impl RemoteUri {
    // ---

    /// The full URI text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme without the `://` separator, or `""`.
    pub fn scheme(&self) -> &str {
        self.0.split_once("://").map(|(scheme, _)| scheme).unwrap_or("")
    }

    /// `host[:port]` part.
    pub fn authority(&self) -> &str {
        // ---
        let rest = self.0.split_once("://").map(|(_, rest)| rest).unwrap_or(&self.0);
        let end = rest.find(['/', '?']).unwrap_or(rest.len());
        let authority = &rest[..end];
        authority.rsplit_once('@').map(|(_, host)| host).unwrap_or(authority)
    }

    /// Host part of the authority.
    pub fn host(&self) -> &str {
        // ---
        let authority = self.authority();
        match authority.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => authority,
        }
    }

    /// Explicit port, if one is present.
    pub fn port(&self) -> Option<u16> {
        self.authority()
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    /// `key=value` pairs of the query string, in order.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        // ---
        let Some((_, query)) = self.0.split_once('?') else {
            return Vec::new();
        };

        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect()
    }

    /// The URI with any query string removed.
    pub fn without_query(&self) -> RemoteUri {
        // ---
        match self.0.split_once('?') {
            Some((base, _)) => RemoteUri::from(base),
            None => self.clone(),
        }
    }
}

impl fmt::Display for RemoteUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that happened on the wire.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Bytes received from the peer.
    Data(Bytes),
    /// The connection failed.
    Error(ProviderError),
    /// The peer closed the connection.
    Closed,
}

/// Sink for transport events, owned by the provider that connected.
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Byte pipe to a single remote peer.
///
/// Implementations must ensure that:
/// - events are delivered in the order they happened on the wire
/// - at most one terminal event (`Error` or `Closed`) is delivered
/// - no event is delivered after `close()` returns
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---

    /// The peer this transport connects to.
    fn remote(&self) -> &RemoteUri;

    /// Establish the connection and start reporting events to `events`.
    async fn connect(&self, events: TransportEvents) -> Result<()>;

    /// Whether the connection is currently up.
    fn is_connected(&self) -> bool;

    /// Write bytes to the peer.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Close the connection and release associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;
